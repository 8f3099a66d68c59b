use std::fmt;

use serde::{Deserialize, Serialize};

pub const S3_SCHEME: &str = "s3://";

/// Prefix of every object key written by [`crate::object_store::upload_local_file`].
pub const OBJECT_KEY_PREFIX: &str = "kris";

/// Directory, relative to the remote home, that mirrors object-store buckets.
pub const REMOTE_MIRROR_ROOT: &str = ".kris/s3";

pub fn is_object_path(raw: &str) -> bool {
    raw.starts_with(S3_SCHEME)
}

/// Fully-qualified object: `s3://{bucket_id}/{key}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectPath {
    pub bucket_id: String,
    pub key: String,
}

impl ObjectPath {
    pub fn new(bucket_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            key: key.into(),
        }
    }

    /// Content-derived object for a file: `kris/{digest}_{basename}`.
    pub fn for_content(bucket_id: impl Into<String>, digest: &str, basename: &str) -> Self {
        Self::new(bucket_id, format!("{OBJECT_KEY_PREFIX}/{digest}_{basename}"))
    }

    /// Where this object is mirrored on the shared filesystem.
    pub fn remote_path(&self) -> RemotePath {
        RemotePath(format!(
            "{REMOTE_MIRROR_ROOT}/{}/{}",
            self.bucket_id, self.key
        ))
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{S3_SCHEME}{}/{}", self.bucket_id, self.key)
    }
}

/// Path on the shared job filesystem, relative to the remote home directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemotePath(String);

impl RemotePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Absolute form under `home`, as seen by a running job.
    pub fn absolute(&self, home: &str) -> String {
        format!("{}/{}", home.trim_end_matches('/'), self.0)
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
