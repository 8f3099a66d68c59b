//! Content-addressed uploads to an S3-compatible bucket.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info};

use crate::buckets::BucketConfig;
use crate::digest::file_checksum;
use crate::error::{KrisError, Result};
use crate::paths::ObjectPath;

const CREDENTIALS_PROVIDER: &str = "kris-config";

/// Minimal object-store surface the staging pipeline needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket_id(&self) -> &str;

    /// HEAD request; `Ok(false)` only for "not found".
    async fn exists(&self, key: &str) -> Result<bool>;

    async fn put_file(&self, key: &str, path: &Path) -> Result<()>;
}

/// Uploads `path` under its content-derived key unless that key already
/// exists, and returns the object path either way.
pub async fn upload_local_file(store: &dyn ObjectStore, path: &Path) -> Result<ObjectPath> {
    if !path.is_file() {
        return Err(KrisError::InvalidRequest(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    let basename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            KrisError::InvalidRequest(format!("{} has no usable file name", path.display()))
        })?;
    let digest = file_checksum(path)?;
    let object = ObjectPath::for_content(store.bucket_id(), &digest, basename);

    if store.exists(&object.key).await? {
        debug!(%object, "object already uploaded");
        return Ok(object);
    }

    info!(local = %path.display(), %object, "uploading to object store");
    store.put_file(&object.key, path).await?;
    Ok(object)
}

/// S3 bucket with static credentials and path-style addressing.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    bucket_id: String,
    client: S3Client,
}

impl S3ObjectStore {
    pub fn new(bucket: &BucketConfig, endpoint_template: &str, region: &str) -> Self {
        let credentials = Credentials::new(
            bucket.access_key_id.clone(),
            bucket.secret_access_key.clone(),
            None,
            None,
            CREDENTIALS_PROVIDER,
        );
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .endpoint_url(bucket.endpoint_url(endpoint_template))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self {
            bucket_id: bucket.bucket_id.clone(),
            client: S3Client::from_conf(config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket_id(&self) -> &str {
        &self.bucket_id
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket_id)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(err) => Err(KrisError::ObjectStore(format!(
                "head s3://{}/{key}: {}",
                self.bucket_id,
                DisplayErrorContext(&err)
            ))),
        }
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| KrisError::ObjectStore(format!("read {}: {e}", path.display())))?;
        self.client
            .put_object()
            .bucket(&self.bucket_id)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                KrisError::ObjectStore(format!(
                    "put s3://{}/{key}: {}",
                    self.bucket_id,
                    DisplayErrorContext(&err)
                ))
            })?;
        Ok(())
    }
}

/// In-process bucket that counts uploads.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    bucket_id: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    uploads: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new(bucket_id: impl Into<String>) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            ..Self::default()
        }
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket_id(&self) -> &str {
        &self.bucket_id
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(key))
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path).await?;
        self.objects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_string(), bytes);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
