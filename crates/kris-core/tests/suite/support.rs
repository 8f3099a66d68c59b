use std::sync::Arc;
use std::time::Duration;

use kris_core::api::{JobClient, RetryPolicy};
use kris_core::backoff::Jitter;
use kris_core::buckets::{BucketConfig, BucketRegistry};
use kris_core::credentials::{MemoryCredentialStore, UserCredentials};
use kris_core::poll::PollPolicy;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const BUCKET_ID: &str = "b-1234";
pub const NAMESPACE: &str = "ns-1";
pub const FIRST_TOKEN: &str = "token-1";

pub fn credentials() -> UserCredentials {
    let mut credentials =
        UserCredentials::new("me@example.com".into(), "pw".into(), "api-key".into());
    credentials.access_token = Some(FIRST_TOKEN.into());
    credentials
}

/// Client with millisecond-scale retry and poll timings.
pub fn fast_client(server: &MockServer, store: Arc<MemoryCredentialStore>) -> JobClient {
    JobClient::new(server.uri(), store, credentials())
        .expect("client")
        .with_retry_policy(RetryPolicy {
            unit: Duration::from_millis(10),
            max_elapsed: Duration::from_millis(300),
            jitter: Jitter::None,
        })
        .with_poll_policy(PollPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            max_elapsed: Some(Duration::from_millis(500)),
        })
}

pub fn registry() -> BucketRegistry {
    let mut registry = BucketRegistry::new();
    registry.insert(
        "default",
        BucketConfig {
            bucket_id: BUCKET_ID.into(),
            namespace: NAMESPACE.into(),
            access_key_id: "AK".into(),
            secret_access_key: "SK".into(),
            endpoint_url: None,
        },
    );
    registry
}

pub async fn mount_service_job(server: &MockServer, job_name: &str, status: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/service/jobs/{job_name}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "job_name": job_name,
            "status": status,
            "error_message": "",
        })))
        .mount(server)
        .await;
}

/// Storage listing service job that reports every path as missing.
pub async fn mount_empty_storage(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/service/storage/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_name": "ls-1"})))
        .mount(server)
        .await;
    mount_service_job(server, "ls-1", "Complete").await;
    Mock::given(method("GET"))
        .and(path("/service/storage/list/ls-1/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ls": [{"size": "No"}]})))
        .mount(server)
        .await;
}

pub async fn mount_s3_credentials(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/s3/credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(server)
        .await;
}
