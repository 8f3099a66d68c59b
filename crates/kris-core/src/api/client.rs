//! HTTP client for the job service API.

use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::time::Instant;
use tokio_stream::wrappers::SplitStream;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use super::types::*;
use crate::backoff::{FibonacciBackoff, Jitter};
use crate::buckets::BucketConfig;
use crate::config::DEFAULT_REMOTE_HOME;
use crate::credentials::{CredentialStore, UserCredentials};
use crate::error::{KrisError, Result};
use crate::paths::RemotePath;
use crate::poll::{PollPolicy, Progress, poll_until};
use crate::redact::{redact, redact_header};

const AUTH_PATH: &str = "/auth";
const API_KEY_HEADER: &str = "X-Api-Key";
const AUTHORIZATION_HEADER: &str = "Authorization";
const CONNECT_TIMEOUT_SECS: u64 = 10;
const REQUEST_TIMEOUT_SECS: u64 = 60;
const JOB_TYPE: &str = "pytorch";
const LOGS_SUFFIX: &str = "/logs";

/// `error_message` the API returns when the access token must be refreshed.
pub const ACCESS_TOKEN_EXPIRED: &str = "access_token expired";

/// First log line of a job that has not started yet.
pub const JOB_IN_QUEUE: &str = "Job in queue.";

/// Lazily decoded job log; empty lines are dropped and every item ends with `\n`.
/// Bytes that are not UTF-8 come through as U+FFFD.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Transport-level retry of 5xx, 429 and network failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fibonacci unit: delays are `unit * 1, 1, 2, 3, 5, ...`.
    pub unit: Duration,
    pub max_elapsed: Duration,
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(1),
            max_elapsed: Duration::from_secs(60),
            jitter: Jitter::Full,
        }
    }
}

/// A GPU job to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Command line relative to the remote home directory.
    pub script: String,
    pub base_image: String,
    pub n_workers: u32,
    pub n_gpus: u32,
}

/// Job service client.
///
/// Every call carries the API key. Every call but `/auth` also carries the
/// current access token, which is refreshed at most once per call when the
/// service reports it expired. Credentials are read once at construction and
/// written back to the store whenever a new token is issued.
pub struct JobClient {
    base_url: String,
    http: Client,
    store: Arc<dyn CredentialStore>,
    credentials: RwLock<UserCredentials>,
    retry: RetryPolicy,
    poll: PollPolicy,
    remote_home: String,
}

impl JobClient {
    pub fn new(
        base_url: impl Into<String>,
        store: Arc<dyn CredentialStore>,
        credentials: UserCredentials,
    ) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            http,
            store,
            credentials: RwLock::new(credentials),
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            remote_home: DEFAULT_REMOTE_HOME.to_string(),
        })
    }

    /// Client for the stored user; fails with [`KrisError::NotAuthorized`]
    /// when nobody has logged in yet.
    pub fn from_store(base_url: impl Into<String>, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let credentials = UserCredentials::require(store.as_ref())?;
        Self::new(base_url, store, credentials)
    }

    /// Stores new credentials after proving them with a first token.
    pub async fn login(
        base_url: impl Into<String>,
        store: Arc<dyn CredentialStore>,
        credentials: UserCredentials,
    ) -> Result<Self> {
        let client = Self::new(base_url, store, credentials)?;
        client.authenticate().await?;
        Ok(client)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_remote_home(mut self, remote_home: impl Into<String>) -> Self {
        self.remote_home = remote_home.into();
        self
    }

    pub fn remote_home(&self) -> &str {
        &self.remote_home
    }

    /// Fetches a fresh access token and persists it.
    pub async fn authenticate(&self) -> Result<()> {
        let (body, mut credentials) = {
            let credentials = self.read_credentials();
            let body = serde_json::to_value(AuthRequest {
                email: credentials.email.clone(),
                password: credentials.password.clone(),
            })?;
            (body, credentials)
        };

        let response = self
            .send_with_retry(&Method::POST, AUTH_PATH, Some(&body))
            .await?;
        let status = response.status();
        let text = response.text().await?;
        log_response(status, &text);
        if !status.is_success() {
            return Err(KrisError::UnexpectedStatus {
                status,
                message: error_message(&text),
            });
        }
        let auth: AuthResponse = serde_json::from_str(&text)?;

        credentials.access_token = Some(auth.token.access_token);
        credentials.save(self.store.as_ref())?;
        *self
            .credentials
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = credentials;
        info!("access token refreshed");
        Ok(())
    }

    pub async fn list_jobs(&self, class: JobClass) -> Result<Vec<JobStatus>> {
        let path = format!("{}/jobs", class.prefix());
        let list: JobList = self.request_json(Method::GET, &path, None).await?;
        Ok(list.jobs)
    }

    pub async fn status(&self, job_name: &str, class: JobClass) -> Result<JobStatus> {
        let path = format!("{}/jobs/{job_name}", class.prefix());
        self.request_json(Method::GET, &path, None).await
    }

    /// Opens the job's log as a line stream. The stream ends when the server
    /// closes the connection.
    pub async fn logs(&self, job_name: &str, source: LogSource) -> Result<LogStream> {
        let path = format!("{}/{job_name}/logs", source.prefix());
        let response = self.send(Method::GET, &path, None).await?;
        debug!(status = %response.status(), path, "< log stream opened");

        let bytes = response.bytes_stream().map_err(std::io::Error::other);
        let lines = SplitStream::new(StreamReader::new(bytes).split(b'\n'));
        Ok(lines
            .filter_map(|line| async move {
                match line {
                    Ok(line) => decode_log_line(&line).map(Ok),
                    Err(e) => Some(Err(KrisError::from(e))),
                }
            })
            .boxed())
    }

    /// Submits a GPU job. `spec.script` is resolved against the remote home.
    pub async fn run(&self, spec: &JobSpec) -> Result<JobCreated> {
        let request = RunJobRequest {
            script: format!("{}/{}", self.remote_home.trim_end_matches('/'), spec.script),
            base_image: spec.base_image.clone(),
            n_workers: spec.n_workers,
            n_gpus: spec.n_gpus,
            warm_cache: false,
            kind: JOB_TYPE.to_string(),
            flags: serde_json::Map::from_iter([(
                "invisible".to_string(),
                Value::String("flag".to_string()),
            )]),
        };
        self.post("/jobs", &request).await
    }

    pub async fn build_image(
        &self,
        from_image: &str,
        requirements: &RemotePath,
    ) -> Result<ImageBuildStarted> {
        let request = ImageBuildRequest {
            from_image: from_image.to_string(),
            requirements_file: requirements.absolute(&self.remote_home),
        };
        self.post("/service/image", &request).await
    }

    /// Lets the service read and write `bucket` for subsequent copies.
    pub async fn set_s3_credentials(&self, bucket: &BucketConfig) -> Result<()> {
        let request = S3CredentialsRequest {
            s3_namespace: bucket.namespace.clone(),
            access_key_id: bucket.access_key_id.clone(),
            security_key: bucket.secret_access_key.clone(),
        };
        let _: Value = self.post("/s3/credentials", &request).await?;
        Ok(())
    }

    /// Starts a copy service job between the object store and the shared
    /// filesystem.
    pub async fn copy(&self, src: &str, dst: &str) -> Result<JobCreated> {
        let request = CopyRequest {
            src: src.to_string(),
            dst: dst.to_string(),
        };
        self.post("/s3/copy", &request).await
    }

    /// Lists an absolute path on the shared filesystem through a service job.
    pub async fn list_storage(&self, path: &str) -> Result<StorageListing> {
        let request = StorageListRequest {
            path: path.to_string(),
        };
        let job: JobCreated = self.post("/service/storage/list", &request).await?;
        let status = self.wait_for_job(&job.job_name, JobClass::Service).await?;
        if status.kind() == JobStatusKind::Failed {
            return Err(KrisError::RemoteJobFailed {
                job_name: job.job_name,
            });
        }
        let path = format!("/service/storage/list/{}/json", job.job_name);
        self.request_json(Method::GET, &path, None).await
    }

    /// Whether an absolute path exists on the shared filesystem.
    pub async fn path_exists(&self, path: &str) -> Result<bool> {
        Ok(!self.list_storage(path).await?.is_missing())
    }

    /// Polls the job until it is finished and returns its final status, which
    /// may be `Failed`. Gives up with [`KrisError::AmbiguousRemoteStatus`] when
    /// the poll budget runs out.
    pub async fn wait_for_job(&self, job_name: &str, class: JobClass) -> Result<JobStatus> {
        let operation = format!("job {job_name}");
        poll_until(self.poll, &operation, || self.check_status(job_name, class)).await
    }

    /// Waits until the job has produced output past the queue banner, then
    /// returns the whole log, first line included.
    pub async fn wait_for_logs(&self, job_name: &str) -> Result<LogStream> {
        let operation = format!("logs of {job_name}");
        poll_until(self.poll.without_deadline(), &operation, || {
            self.check_logs(job_name)
        })
        .await
    }

    async fn check_status(&self, job_name: &str, class: JobClass) -> Result<Progress<JobStatus>> {
        let status = self.status(job_name, class).await?;
        if status.is_finished(class) {
            Ok(Progress::Ready(status))
        } else {
            Ok(Progress::Pending(status.to_string()))
        }
    }

    async fn check_logs(&self, job_name: &str) -> Result<Progress<LogStream>> {
        let mut lines = self.logs(job_name, LogSource::Job).await?;
        match lines.next().await {
            None => Ok(Progress::Pending("no output yet".to_string())),
            Some(Err(e)) => Err(e),
            Some(Ok(first)) if first.starts_with(JOB_IN_QUEUE) => {
                Ok(Progress::Pending(first.trim_end().to_string()))
            }
            Some(Ok(first)) => Ok(Progress::Ready(
                futures::stream::once(futures::future::ready(Ok(first)))
                    .chain(lines)
                    .boxed(),
            )),
        }
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body)?;
        self.request_json(Method::POST, path, Some(&body)).await
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T> {
        let response = self.send(method, path, body).await?;
        let status = response.status();
        let text = response.text().await?;
        log_response(status, &text);
        Ok(serde_json::from_str(&text)?)
    }

    /// Sends a call, re-authenticating at most once when the token expired.
    /// Returns only successful responses.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let mut reauthenticated = false;
        loop {
            let response = self.send_with_retry(&method, path, body).await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let text = response.text().await?;
            log_response(status, &text);
            let message = error_message(&text);
            if message == ACCESS_TOKEN_EXPIRED && path != AUTH_PATH {
                if reauthenticated {
                    return Err(KrisError::AuthExpired);
                }
                warn!("access token expired, re-authenticating");
                self.authenticate().await?;
                reauthenticated = true;
                continue;
            }
            return Err(KrisError::UnexpectedStatus { status, message });
        }
    }

    /// Sends a call, retrying network failures, 5xx and 429 with Fibonacci
    /// backoff until the retry budget is spent. The last response is returned
    /// as-is, whatever its status.
    async fn send_with_retry(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let started = Instant::now();
        let mut backoff = FibonacciBackoff::new(self.retry.unit).with_jitter(self.retry.jitter);

        loop {
            let outcome = self.send_once(method, path, body).await;
            let retryable = match &outcome {
                Ok(response) => is_retryable_status(response.status()),
                Err(e) => !e.is_builder(),
            };
            if !retryable {
                return Ok(outcome?);
            }

            let delay = backoff.next_delay();
            if started.elapsed() + delay > self.retry.max_elapsed {
                return Ok(outcome?);
            }
            match &outcome {
                Ok(response) => {
                    warn!(%method, path, status = %response.status(), ?delay, "retrying request")
                }
                Err(e) => warn!(%method, path, error = %e, ?delay, "retrying request"),
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let (api_key, access_token) = {
            let credentials = self.read_credentials();
            (credentials.api_key, credentials.access_token)
        };

        let mut builder = self
            .http
            .request(method.clone(), self.url(path))
            .header(API_KEY_HEADER, &api_key);
        let token = access_token.unwrap_or_default();
        let mut logged_headers = vec![(API_KEY_HEADER, redact_header(API_KEY_HEADER, &api_key))];
        if path != AUTH_PATH {
            builder = builder.header(AUTHORIZATION_HEADER, &token);
            logged_headers.push((
                AUTHORIZATION_HEADER,
                redact_header(AUTHORIZATION_HEADER, &token),
            ));
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        // Log streams stay open for as long as the job runs.
        if !path.ends_with(LOGS_SUFFIX) {
            builder = builder.timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS));
        }

        match body {
            Some(body) => debug!("> {method} {path} {logged_headers:?} {}", redact(body)),
            None => debug!("> {method} {path} {logged_headers:?} <empty body>"),
        }
        builder.send().await
    }

    fn read_credentials(&self) -> UserCredentials {
        self.credentials
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn error_message(text: &str) -> String {
    serde_json::from_str::<ApiErrorBody>(text)
        .ok()
        .and_then(|body| body.error_message)
        .unwrap_or_else(|| text.trim().to_string())
}

/// One `\n`-separated chunk of a log; `None` for blank lines.
fn decode_log_line(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.is_empty() {
        return None;
    }
    Some(format!("{}\n", String::from_utf8_lossy(raw)))
}

fn log_response(status: StatusCode, text: &str) {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => debug!("< {status} {}", redact(&value)),
        Err(_) => debug!("< {status} <{} bytes of non-JSON body>", text.len()),
    }
}
