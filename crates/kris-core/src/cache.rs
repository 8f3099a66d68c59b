//! Content-addressed memo table persisted as a flat JSON file.
//!
//! Keys are MD5 digests of a local file, values are whatever the caller
//! computed from that content (a built image id, for instance). Entries are
//! never evicted. Each `put` reloads the file, inserts, and replaces the file
//! with a temp-then-rename write; two processes writing at once may still lose
//! an entry.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::digest::file_checksum;
use crate::error::{KrisError, Result};

pub const IMAGE_CACHE_FILE: &str = "image_cache.json";

/// Cache of requirements-file digest to built image identifier.
pub type ImageCache = ContentCache<String>;

#[derive(Debug, Clone)]
pub struct ContentCache<V> {
    path: PathBuf,
    _value: PhantomData<V>,
}

impl<V> ContentCache<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    /// Opens the cache at `path`, creating an empty table if none exists yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let cache = Self {
            path: path.into(),
            _value: PhantomData,
        };
        if !cache.path.exists() {
            cache.store(&BTreeMap::new())?;
        }
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has(&self, key_source: &Path) -> Result<bool> {
        Ok(self.lookup(key_source)?.is_some())
    }

    /// Value cached for the content of `key_source`, or [`KrisError::CacheMiss`].
    pub fn get(&self, key_source: &Path) -> Result<V> {
        let key = file_checksum(key_source)?;
        self.load()?
            .remove(&key)
            .ok_or(KrisError::CacheMiss { key })
    }

    pub fn lookup(&self, key_source: &Path) -> Result<Option<V>> {
        let key = file_checksum(key_source)?;
        let hit = self.load()?.remove(&key);
        debug!(cache = %self.path.display(), key, hit = hit.is_some(), "cache lookup");
        Ok(hit)
    }

    pub fn put(&self, key_source: &Path, value: V) -> Result<()> {
        let key = file_checksum(key_source)?;
        let mut table = self.load()?;
        table.insert(key, value);
        self.store(&table)
    }

    fn load(&self) -> Result<BTreeMap<String, V>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, table: &BTreeMap<String, V>) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let mut tmp = NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut tmp, table)?;
        tmp.write_all(b"\n")?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
