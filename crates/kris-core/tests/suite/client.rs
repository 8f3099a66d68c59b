use std::sync::Arc;

use futures::TryStreamExt;
use kris_core::KrisError;
use kris_core::api::{ACCESS_TOKEN_EXPIRED, JobClass, LogSource};
use kris_core::credentials::{MemoryCredentialStore, UserCredentials};
use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::support::{FIRST_TOKEN, fast_client, mount_service_job};

fn expired() -> ResponseTemplate {
    ResponseTemplate::new(401).set_body_json(json!({"error_message": ACCESS_TOKEN_EXPIRED}))
}

async fn mount_auth(server: &MockServer, token: &str, times: u64) {
    Mock::given(method("POST"))
        .and(path("/auth"))
        .and(header("X-Api-Key", "api-key"))
        .and(body_partial_json(json!({"email": "me@example.com"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": {"access_token": token, "refresh_token": "r"}
        })))
        .expect(times)
        .mount(server)
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_token_is_refreshed_once_and_persisted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jobs"))
        .and(header("Authorization", FIRST_TOKEN))
        .respond_with(expired())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs"))
        .and(header("Authorization", "token-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobs": [{"job_name": "lm-1", "status": "Running", "created_at": 10}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_auth(&server, "token-2", 1).await;

    let store = Arc::new(MemoryCredentialStore::new());
    let client = fast_client(&server, store.clone());
    let jobs = client.list_jobs(JobClass::User).await.expect("list");

    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_name, "lm-1");
    let saved = UserCredentials::require(store.as_ref()).expect("saved");
    assert_eq!(saved.access_token.as_deref(), Some("token-2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_expiry_in_one_call_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jobs/lm-1"))
        .respond_with(expired())
        .expect(2)
        .mount(&server)
        .await;
    mount_auth(&server, "token-2", 1).await;

    let client = fast_client(&server, Arc::new(MemoryCredentialStore::new()));
    let err = client
        .status("lm-1", JobClass::User)
        .await
        .expect_err("should fail");
    assert!(matches!(err, KrisError::AuthExpired), "{err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/service/jobs/copy-1"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    mount_service_job(&server, "copy-1", "Complete").await;

    let client = fast_client(&server, Arc::new(MemoryCredentialStore::new()));
    let status = client
        .status("copy-1", JobClass::Service)
        .await
        .expect("status");
    assert_eq!(status.status, "Complete");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jobs/missing"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({"error_message": "no such job"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server, Arc::new(MemoryCredentialStore::new()));
    let err = client
        .status("missing", JobClass::User)
        .await
        .expect_err("should fail");
    match err {
        KrisError::UnexpectedStatus { status, message } => {
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(message, "no such job");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_budget_is_bounded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jobs"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = fast_client(&server, Arc::new(MemoryCredentialStore::new()));
    let err = client
        .list_jobs(JobClass::User)
        .await
        .expect_err("should fail");
    assert!(
        matches!(err, KrisError::UnexpectedStatus { status, .. } if status == StatusCode::INTERNAL_SERVER_ERROR),
        "{err:?}"
    );
    let attempts = server.received_requests().await.expect("recorded").len();
    assert!(attempts > 1, "expected retries, saw {attempts} attempt(s)");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn logs_wait_past_queue_banner() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jobs/lm-1/logs"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Job in queue.\n"))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs/lm-1/logs"))
        .respond_with(ResponseTemplate::new(200).set_body_string("epoch 1\n\nepoch 2\n"))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server, Arc::new(MemoryCredentialStore::new()));
    let lines: Vec<String> = client
        .wait_for_logs("lm-1")
        .await
        .expect("logs")
        .try_collect()
        .await
        .expect("lines");
    assert_eq!(lines, vec!["epoch 1\n".to_string(), "epoch 2\n".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn image_logs_use_service_prefix() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/service/image/img-1/logs"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Step 1/3\nStep 2/3"))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server, Arc::new(MemoryCredentialStore::new()));
    let lines: Vec<String> = client
        .logs("img-1", LogSource::Image)
        .await
        .expect("logs")
        .try_collect()
        .await
        .expect("lines");
    assert_eq!(lines, vec!["Step 1/3\n".to_string(), "Step 2/3\n".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn service_job_wait_returns_terminal_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/service/jobs/copy-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "job_name": "copy-1", "status": "Running"
        })))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_service_job(&server, "copy-1", "Failed").await;

    let client = fast_client(&server, Arc::new(MemoryCredentialStore::new()));
    let status = client
        .wait_for_job("copy-1", JobClass::Service)
        .await
        .expect("terminal status");
    assert_eq!(status.status, "Failed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_prefixes_remote_home() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/jobs"))
        .and(header("Authorization", FIRST_TOKEN))
        .and(body_partial_json(json!({
            "script": "/home/jovyan/agent archive.zip main.py 0",
            "base_image": "img",
            "n_workers": 2,
            "n_gpus": 4,
            "type": "pytorch",
            "flags": {"invisible": "flag"},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_name": "lm-7"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server, Arc::new(MemoryCredentialStore::new()));
    let created = client
        .run(&kris_core::api::JobSpec {
            script: "agent archive.zip main.py 0".into(),
            base_image: "img".into(),
            n_workers: 2,
            n_gpus: 4,
        })
        .await
        .expect("run");
    assert_eq!(created.job_name, "lm-7");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undecodable_log_bytes_do_not_end_the_stream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jobs/lm-1/logs"))
        .respond_with(
            ResponseTemplate::new(200).set_body_bytes(b"epoch 1\nloss \xff 0.3\nepoch 2\n".to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server, Arc::new(MemoryCredentialStore::new()));
    let lines: Vec<String> = client
        .logs("lm-1", LogSource::Job)
        .await
        .expect("logs")
        .try_collect()
        .await
        .expect("lines");
    assert_eq!(
        lines,
        vec![
            "epoch 1\n".to_string(),
            "loss \u{FFFD} 0.3\n".to_string(),
            "epoch 2\n".to_string(),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undecodable_first_log_line_still_starts_the_job_log() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jobs/lm-1/logs"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\xfe\xff warmup\ndone\n".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server, Arc::new(MemoryCredentialStore::new()));
    let lines: Vec<String> = client
        .wait_for_logs("lm-1")
        .await
        .expect("logs")
        .try_collect()
        .await
        .expect("lines");
    assert_eq!(
        lines,
        vec!["\u{FFFD}\u{FFFD} warmup\n".to_string(), "done\n".to_string()]
    );
}
