use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tempfile::NamedTempFile;
use toml_edit::{DocumentMut, Item as TomlItem, Table as TomlTable};

use crate::buckets::{BucketConfig, BucketRegistry};
use crate::cache::IMAGE_CACHE_FILE;
use crate::error::{KrisError, Result};
use crate::poll::{PollPolicy, PollSettings};

pub const CONFIG_TOML_FILE: &str = "config.toml";
pub const DEFAULT_API_URL: &str = "https://api.aicloud.sbercloud.ru/public/v1";
pub const DEFAULT_BASE_IMAGE: &str = "registry.aicloud.sbcp.ru/horovod-tf2";
pub const DEFAULT_REMOTE_HOME: &str = "/home/jovyan";
pub const DEFAULT_S3_ENDPOINT: &str = "https://{namespace}.s3pd02.sbercloud.ru";
pub const DEFAULT_S3_REGION: &str = "us-east-1";
pub const AGENT_BINARY_NAME: &str = "kris-agent";
const SCRATCH_DIR: &str = "tmp";

/// Where the config file and local data (caches) live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrisHome {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
}

impl KrisHome {
    /// Honors `KRIS_HOME` when set, otherwise `~/.config/kris/config.toml`
    /// for configuration and `~/.kris` for data.
    pub fn find() -> std::io::Result<Self> {
        if let Ok(val) = std::env::var("KRIS_HOME")
            && !val.is_empty()
        {
            return Ok(Self::at(PathBuf::from(val)));
        }

        let home = dirs::home_dir().ok_or_else(|| {
            std::io::Error::new(ErrorKind::NotFound, "Could not find home directory")
        })?;
        Ok(Self {
            config_file: home.join(".config").join("kris").join(CONFIG_TOML_FILE),
            data_dir: home.join(".kris"),
        })
    }

    /// Single directory holding both the config file and data.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            config_file: dir.join(CONFIG_TOML_FILE),
            data_dir: dir,
        }
    }

    pub fn image_cache_file(&self) -> PathBuf {
        self.data_dir.join(IMAGE_CACHE_FILE)
    }

    /// Parent of the temporary directories that hold project archives.
    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join(SCRATCH_DIR)
    }
}

/// On-disk shape of `config.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigToml {
    pub api_url: Option<String>,
    pub base_image: Option<String>,
    pub remote_home: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_region: Option<String>,
    pub agent_path: Option<PathBuf>,
    #[serde(default)]
    pub poll: PollSettings,
    #[serde(default)]
    pub buckets: BucketRegistry,
}

/// Resolved configuration, constructed once at startup and passed down.
#[derive(Debug, Clone)]
pub struct Config {
    pub home: KrisHome,
    pub api_url: String,
    pub base_image: String,
    pub remote_home: String,
    pub s3_endpoint: String,
    pub s3_region: String,
    pub agent_path: Option<PathBuf>,
    pub poll: PollPolicy,
    pub buckets: BucketRegistry,
}

impl Config {
    pub fn load(home: KrisHome) -> Result<Self> {
        let cfg = load_config_as_toml(&home.config_file)?;
        Ok(Self::from_toml(cfg, home))
    }

    pub fn from_toml(cfg: ConfigToml, home: KrisHome) -> Self {
        Self {
            api_url: cfg.api_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            base_image: cfg
                .base_image
                .unwrap_or_else(|| DEFAULT_BASE_IMAGE.to_string()),
            remote_home: cfg
                .remote_home
                .unwrap_or_else(|| DEFAULT_REMOTE_HOME.to_string()),
            s3_endpoint: cfg
                .s3_endpoint
                .unwrap_or_else(|| DEFAULT_S3_ENDPOINT.to_string()),
            s3_region: cfg
                .s3_region
                .unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
            agent_path: cfg.agent_path,
            poll: cfg.poll.policy(),
            buckets: cfg.buckets,
            home,
        }
    }

    /// Local agent binary to stage with every run: `agent_path` from the
    /// config file, else `kris-agent` next to the running executable. Either
    /// way it has to be a Linux build, see [`crate::agent::AGENT_BUILD_HINT`].
    pub fn agent_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.agent_path {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| KrisError::Config("cannot locate the kris executable".into()))?;
        Ok(dir.join(AGENT_BINARY_NAME))
    }

    /// Registers a new bucket alias and persists it to `config.toml`.
    pub fn add_bucket(&mut self, alias: &str, bucket: BucketConfig) -> Result<()> {
        if self.buckets.contains(alias) {
            return Err(KrisError::Config(format!("bucket {alias} already exists")));
        }
        write_bucket(&self.home.config_file, alias, &bucket)?;
        self.buckets.insert(alias, bucket);
        Ok(())
    }
}

/// Reads `config.toml`, returning defaults when the file does not exist.
pub fn load_config_as_toml(config_path: &Path) -> Result<ConfigToml> {
    match std::fs::read_to_string(config_path) {
        Ok(contents) => toml::from_str(&contents).map_err(|e| {
            tracing::error!("Failed to parse {}: {e}", config_path.display());
            KrisError::from(e)
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!("{} not found, using defaults", config_path.display());
            Ok(ConfigToml::default())
        }
        Err(e) => Err(e.into()),
    }
}

/// Adds `[buckets.<alias>]` to the file, keeping existing formatting.
fn write_bucket(config_path: &Path, alias: &str, bucket: &BucketConfig) -> Result<()> {
    let mut doc = match std::fs::read_to_string(config_path) {
        Ok(contents) => contents
            .parse::<DocumentMut>()
            .map_err(|e| KrisError::Config(format!("{}: {e}", config_path.display())))?,
        Err(e) if e.kind() == ErrorKind::NotFound => DocumentMut::new(),
        Err(e) => return Err(e.into()),
    };

    if !doc.contains_key("buckets") {
        let mut table = TomlTable::new();
        table.set_implicit(true);
        doc["buckets"] = TomlItem::Table(table);
    }

    let mut entry = TomlTable::new();
    entry.set_implicit(false);
    entry["bucket_id"] = toml_edit::value(bucket.bucket_id.clone());
    entry["namespace"] = toml_edit::value(bucket.namespace.clone());
    entry["access_key_id"] = toml_edit::value(bucket.access_key_id.clone());
    entry["secret_access_key"] = toml_edit::value(bucket.secret_access_key.clone());
    if let Some(url) = &bucket.endpoint_url {
        entry["endpoint_url"] = toml_edit::value(url.clone());
    }

    let buckets = doc["buckets"]
        .as_table_mut()
        .ok_or_else(|| KrisError::Config("`buckets` must be a table".into()))?;
    buckets.insert(alias, TomlItem::Table(entry));

    let parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(doc.to_string().as_bytes())?;
    tmp.flush()?;
    tmp.persist(config_path).map_err(|e| e.error)?;
    Ok(())
}
