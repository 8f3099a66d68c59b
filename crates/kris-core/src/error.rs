use std::io;

use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KrisError>;

#[derive(Error, Debug)]
pub enum KrisError {
    /// Network-level failure that outlived the retry budget.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The API answered with a status that is never retried, or kept
    /// answering with a retryable one until the budget ran out.
    #[error("unexpected status {status}: {message}")]
    UnexpectedStatus { status: StatusCode, message: String },

    /// The access token was rejected again right after re-authenticating.
    #[error("access token expired and re-authentication did not help")]
    AuthExpired,

    /// The remote job reached the terminal `Failed` status.
    #[error("remote job {job_name} failed")]
    RemoteJobFailed { job_name: String },

    /// Polling gave up, or the job ended in a status that is neither
    /// `Complete` nor `Failed`. Never a success.
    #[error("could not determine the outcome of {operation} (last status: {last_status})")]
    AmbiguousRemoteStatus {
        operation: String,
        last_status: String,
    },

    #[error("cannot resolve {path}: {reason}")]
    PathResolution { path: String, reason: String },

    #[error("no cache entry for {key}")]
    CacheMiss { key: String },

    #[error("not authorized; run `kris auth` first")]
    NotAuthorized,

    #[error("bucket \"{0}\" is not configured")]
    UnknownBucket(String),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("secret store error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl KrisError {
    /// True when the remote side reported a definite failure, as opposed to
    /// the client being unable to tell what happened.
    pub fn is_definite_failure(&self) -> bool {
        matches!(self, KrisError::RemoteJobFailed { .. })
    }

}
