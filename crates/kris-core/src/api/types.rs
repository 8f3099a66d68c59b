//! Request and response types for the job service API.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------- Auth ----------

/// Request body for `POST /auth` (no `Authorization` header).
#[derive(Debug, Clone, Serialize)]
pub struct AuthRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub token: AuthToken,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

// ---------- Jobs ----------

/// Request body for `POST /jobs`.
#[derive(Debug, Clone, Serialize)]
pub struct RunJobRequest {
    /// Absolute path on the shared filesystem, followed by its arguments.
    pub script: String,
    pub base_image: String,
    pub n_workers: u32,
    pub n_gpus: u32,
    pub warm_cache: bool,
    #[serde(rename = "type")]
    pub kind: String,
    /// Required by the API, ignored by it; arguments travel in `script`.
    pub flags: serde_json::Map<String, serde_json::Value>,
}

/// Any job-starting response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobCreated {
    pub job_name: String,
}

/// Response from `POST /service/image`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageBuildStarted {
    pub job_name: String,
    pub image: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageBuildRequest {
    pub from_image: String,
    pub requirements_file: String,
}

/// Which family of endpoints a job lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobClass {
    /// GPU compute job: `/jobs`.
    User,
    /// Copy, build-image and listing jobs: `/service/jobs`.
    Service,
}

impl JobClass {
    pub fn prefix(self) -> &'static str {
        match self {
            JobClass::User => "",
            JobClass::Service => "/service",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatusKind {
    Queued,
    Pending,
    Running,
    Complete,
    Failed,
    Unknown,
}

impl JobStatusKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Queued" => JobStatusKind::Queued,
            "Pending" => JobStatusKind::Pending,
            "Running" => JobStatusKind::Running,
            "Complete" | "Completed" => JobStatusKind::Complete,
            "Failed" => JobStatusKind::Failed,
            _ => JobStatusKind::Unknown,
        }
    }
}

/// Response from `GET {prefix}/jobs/{id}`; also the element of job listings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobStatus {
    pub job_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub pending_at: i64,
    #[serde(default)]
    pub running_at: i64,
    #[serde(default)]
    pub completed_at: i64,
}

impl JobStatus {
    pub fn kind(&self) -> JobStatusKind {
        JobStatusKind::parse(&self.status)
    }

    /// Service jobs end on `Complete` or `Failed`; user jobs once they carry a
    /// completion timestamp or fail.
    pub fn is_finished(&self, class: JobClass) -> bool {
        match class {
            JobClass::Service => {
                matches!(self.kind(), JobStatusKind::Complete | JobStatusKind::Failed)
            }
            JobClass::User => self.completed_at > 0 || self.kind() == JobStatusKind::Failed,
        }
    }

    /// Lifecycle stages with a non-zero timestamp, in order.
    pub fn stages(&self) -> Vec<(&'static str, i64)> {
        [
            ("Created", self.created_at),
            ("Pending", self.pending_at),
            ("Running", self.running_at),
            ("Completed", self.completed_at),
        ]
        .into_iter()
        .filter(|(_, at)| *at != 0)
        .collect()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.status.is_empty() {
            f.write_str("<no status>")
        } else {
            f.write_str(&self.status)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobList {
    #[serde(default)]
    pub jobs: Vec<JobStatus>,
}

/// Endpoint family to read logs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Job,
    Service,
    Image,
}

impl LogSource {
    pub fn prefix(self) -> &'static str {
        match self {
            LogSource::Job => "/jobs",
            LogSource::Service => "/service/jobs",
            LogSource::Image => "/service/image",
        }
    }
}

impl From<JobClass> for LogSource {
    fn from(class: JobClass) -> Self {
        match class {
            JobClass::User => LogSource::Job,
            JobClass::Service => LogSource::Service,
        }
    }
}

// ---------- Object storage ----------

/// Request body for `POST /s3/credentials`.
#[derive(Debug, Clone, Serialize)]
pub struct S3CredentialsRequest {
    pub s3_namespace: String,
    pub access_key_id: String,
    pub security_key: String,
}

/// Request body for `POST /s3/copy`; exactly one side is an `s3://` path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyRequest {
    pub src: String,
    pub dst: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageListRequest {
    pub path: String,
}

/// Response from `GET /service/storage/list/{job}/json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageListing {
    #[serde(default)]
    pub ls: Vec<StorageEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageEntry {
    #[serde(default)]
    pub size: serde_json::Value,
}

impl StorageListing {
    /// The service reports a missing path as a single entry of size `"No"`.
    pub fn is_missing(&self) -> bool {
        matches!(self.ls.as_slice(), [entry] if entry.size.as_str() == Some("No"))
    }
}

// ---------- Errors ----------

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub error_message: Option<String>,
}
