//! Mirroring object-store paths onto the shared job filesystem.

use tracing::{debug, info};

use crate::api::{JobClass, JobClient, JobStatus, JobStatusKind};
use crate::buckets::BucketRegistry;
use crate::error::{KrisError, Result};
use crate::paths::{ObjectPath, RemotePath, is_object_path};

/// Copies objects onto the shared filesystem through service copy jobs.
pub struct RemoteFs<'a> {
    client: &'a JobClient,
    buckets: &'a BucketRegistry,
}

impl<'a> RemoteFs<'a> {
    pub fn new(client: &'a JobClient, buckets: &'a BucketRegistry) -> Self {
        Self { client, buckets }
    }

    pub fn client(&self) -> &'a JobClient {
        self.client
    }

    pub fn buckets(&self) -> &'a BucketRegistry {
        self.buckets
    }

    /// Whether `path` is already populated on the shared filesystem.
    pub async fn exists(&self, path: &RemotePath) -> Result<bool> {
        self.client
            .path_exists(&path.absolute(self.client.remote_home()))
            .await
    }

    /// Mirrors `object` to its deterministic [`RemotePath`], skipping the copy
    /// when the destination already exists.
    pub async fn mirror(&self, object: &ObjectPath) -> Result<RemotePath> {
        let remote = object.remote_path();
        if self.exists(&remote).await? {
            debug!(%remote, "already on shared filesystem");
            return Ok(remote);
        }

        info!(%object, %remote, "copying to shared filesystem");
        let status = self.copy(object, &object.to_string(), remote.as_str()).await?;
        require_complete(&status)?;
        Ok(remote)
    }

    /// Copies between an `s3://` path and a shared-filesystem path, in either
    /// direction, and waits for the copy job.
    pub async fn transfer(&self, src: &str, dst: &str) -> Result<JobStatus> {
        let (src, dst, object) = match (is_object_path(src), is_object_path(dst)) {
            (true, false) => {
                let object = self.buckets.resolve(src)?;
                (object.to_string(), dst.to_string(), object)
            }
            (false, true) => {
                let object = self.buckets.resolve(dst)?;
                (src.to_string(), object.to_string(), object)
            }
            _ => {
                return Err(KrisError::InvalidRequest(
                    "exactly one of SRC and DST must be an s3:// path".to_string(),
                ));
            }
        };
        let status = self.copy(&object, &src, &dst).await?;
        require_complete(&status)?;
        Ok(status)
    }

    async fn copy(&self, object: &ObjectPath, src: &str, dst: &str) -> Result<JobStatus> {
        let bucket = self.buckets.bucket_for(object)?;
        self.client.set_s3_credentials(bucket).await?;
        let job = self.client.copy(src, dst).await?;
        debug!(job = %job.job_name, src, dst, "copy job started");
        self.client.wait_for_job(&job.job_name, JobClass::Service).await
    }
}

/// `Complete` is the only success; anything else is never silently accepted.
pub(crate) fn require_complete(status: &JobStatus) -> Result<()> {
    match status.kind() {
        JobStatusKind::Complete => Ok(()),
        JobStatusKind::Failed => Err(KrisError::RemoteJobFailed {
            job_name: status.job_name.clone(),
        }),
        _ => Err(KrisError::AmbiguousRemoteStatus {
            operation: format!("job {}", status.job_name),
            last_status: status.to_string(),
        }),
    }
}
