//! Named object-store credential sets and `s3://` path resolution.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KrisError, Result};
use crate::paths::{ObjectPath, S3_SCHEME};

pub const DEFAULT_BUCKET_ALIAS: &str = "default";

/// Suffix the service gives every bucket id.
const BUCKET_ID_SUFFIX: &str = "-bucket";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub bucket_id: String,
    pub namespace: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Overrides the endpoint derived from the namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
}

impl BucketConfig {
    /// Endpoint for this bucket; `template` may contain `{namespace}`.
    pub fn endpoint_url(&self, template: &str) -> String {
        self.endpoint_url
            .clone()
            .unwrap_or_else(|| template.replace("{namespace}", &self.namespace))
    }
}

impl fmt::Debug for BucketConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketConfig")
            .field("bucket_id", &self.bucket_id)
            .field("namespace", &self.namespace)
            .field("access_key_id", &crate::redact::REDACTED)
            .field("secret_access_key", &crate::redact::REDACTED)
            .field("endpoint_url", &self.endpoint_url)
            .finish()
    }
}

/// Buckets keyed by alias, as loaded from `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketRegistry {
    buckets: BTreeMap<String, BucketConfig>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.buckets.contains_key(alias)
    }

    pub fn get(&self, alias: &str) -> Result<&BucketConfig> {
        self.buckets
            .get(alias)
            .ok_or_else(|| KrisError::UnknownBucket(alias.to_string()))
    }

    pub fn default_bucket(&self) -> Result<&BucketConfig> {
        self.get(DEFAULT_BUCKET_ALIAS)
    }

    pub fn by_bucket_id(&self, bucket_id: &str) -> Option<(&str, &BucketConfig)> {
        self.buckets
            .iter()
            .find(|(_, bucket)| bucket.bucket_id == bucket_id)
            .map(|(alias, bucket)| (alias.as_str(), bucket))
    }

    pub fn insert(&mut self, alias: impl Into<String>, bucket: BucketConfig) {
        self.buckets.insert(alias.into(), bucket);
    }

    /// Bucket that owns an already resolved object path.
    pub fn bucket_for(&self, path: &ObjectPath) -> Result<&BucketConfig> {
        self.by_bucket_id(&path.bucket_id)
            .map(|(_, bucket)| bucket)
            .ok_or_else(|| KrisError::UnknownBucket(path.bucket_id.clone()))
    }

    /// Resolves an `s3://` string to exactly one configured bucket.
    ///
    /// The first segment is tried as an alias, then as a configured bucket id.
    /// A segment that looks like a bucket id but matches nothing is an error;
    /// anything else is a key inside the `default` bucket. The key must not
    /// be empty: a bare bucket is not an object.
    pub fn resolve(&self, raw: &str) -> Result<ObjectPath> {
        let rest = raw
            .strip_prefix(S3_SCHEME)
            .ok_or_else(|| KrisError::PathResolution {
                path: raw.to_string(),
                reason: format!("path should start with \"{S3_SCHEME}\""),
            })?;

        let (first, tail) = rest.split_once('/').unwrap_or((rest, ""));

        let object = |bucket: &BucketConfig, key: &str| {
            if key.trim_matches('/').is_empty() {
                return Err(KrisError::PathResolution {
                    path: raw.to_string(),
                    reason: "no object key after the bucket".to_string(),
                });
            }
            Ok(ObjectPath::new(&bucket.bucket_id, key))
        };

        if let Some(bucket) = self.buckets.get(first) {
            return object(bucket, tail);
        }
        if let Some((_, bucket)) = self.by_bucket_id(first) {
            return object(bucket, tail);
        }
        if first.ends_with(BUCKET_ID_SUFFIX) {
            return Err(KrisError::PathResolution {
                path: raw.to_string(),
                reason: format!("bucket {first} is not configured"),
            });
        }

        let bucket = self
            .default_bucket()
            .map_err(|_| KrisError::PathResolution {
                path: raw.to_string(),
                reason: format!("no \"{DEFAULT_BUCKET_ALIAS}\" bucket configured"),
            })?;
        object(bucket, rest)
    }
}
