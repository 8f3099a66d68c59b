use std::path::{Path, PathBuf};

use tracing::info;

use crate::archive::{ARCHIVE_FILE_NAME, archive_dir};
use crate::bridge::RemoteFs;
use crate::error::Result;
use crate::object_store::{ObjectStore, upload_local_file};
use crate::paths::{ObjectPath, RemotePath};

/// Local artifact → object store → shared filesystem.
///
/// Both hops are idempotent: the upload is skipped when the content-derived
/// key exists, and the copy is skipped when the destination exists.
pub struct Stager<'a> {
    store: &'a dyn ObjectStore,
    remote: RemoteFs<'a>,
    scratch_dir: Option<PathBuf>,
}

impl<'a> Stager<'a> {
    pub fn new(store: &'a dyn ObjectStore, remote: RemoteFs<'a>) -> Self {
        Self {
            store,
            remote,
            scratch_dir: None,
        }
    }

    /// Builds directory archives under `dir` instead of the system temp dir.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn remote(&self) -> &RemoteFs<'a> {
        &self.remote
    }

    /// Uploads a file, or a zip of a directory, and returns its object path.
    /// The directory archive lives in a temporary directory that is removed
    /// before this returns, whether or not the upload succeeded.
    pub async fn upload_local(&self, local: &Path) -> Result<ObjectPath> {
        if local.is_dir() {
            let scratch = match &self.scratch_dir {
                Some(dir) => {
                    std::fs::create_dir_all(dir)?;
                    tempfile::Builder::new()
                        .prefix(".kris-archive-")
                        .tempdir_in(dir)?
                }
                None => tempfile::tempdir()?,
            };
            let archive = scratch.path().join(ARCHIVE_FILE_NAME);
            info!(dir = %local.display(), "compressing");
            archive_dir(local, &archive)?;
            upload_local_file(self.store, &archive).await
        } else {
            upload_local_file(self.store, local).await
        }
    }

    /// Makes `local` available on the shared filesystem.
    pub async fn stage(&self, local: &Path) -> Result<RemotePath> {
        let object = self.upload_local(local).await?;
        self.remote.mirror(&object).await
    }

    /// Resolves an `s3://` argument and mirrors it.
    pub async fn stage_object(&self, raw: &str) -> Result<RemotePath> {
        let object = self.remote.buckets().resolve(raw)?;
        self.remote.mirror(&object).await
    }
}
