use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use kris_core::KrisError;
use kris_core::bridge::RemoteFs;
use kris_core::credentials::MemoryCredentialStore;
use kris_core::object_store::{MemoryObjectStore, ObjectStore};
use kris_core::staging::Stager;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::support::{
    BUCKET_ID, NAMESPACE, fast_client, mount_empty_storage, mount_s3_credentials,
    mount_service_job, registry,
};

fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(dir.path().join("src")).expect("mkdir");
    std::fs::write(dir.path().join("src/train.py"), "print('hi')\n").expect("write");
    std::fs::write(dir.path().join("README"), "demo\n").expect("write");
    dir
}

async fn mount_copy(server: &MockServer, job_name: &str, times: u64) {
    Mock::given(method("POST"))
        .and(path("/s3/copy"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_name": job_name})))
        .expect(times)
        .mount(server)
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn staging_twice_copies_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/service/storage/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_name": "ls-1"})))
        .expect(2)
        .mount(&server)
        .await;
    mount_service_job(&server, "ls-1", "Complete").await;
    // Missing on the first check, present afterwards.
    Mock::given(method("GET"))
        .and(path("/service/storage/list/ls-1/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ls": [{"size": "No"}]})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/service/storage/list/ls-1/json"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"ls": [{"name": "x", "size": 512}]})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/s3/credentials"))
        .and(body_partial_json(json!({"s3_namespace": NAMESPACE})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    mount_copy(&server, "copy-1", 1).await;
    mount_service_job(&server, "copy-1", "Complete").await;

    let client = fast_client(&server, Arc::new(MemoryCredentialStore::new()));
    let buckets = registry();
    let store = MemoryObjectStore::new(BUCKET_ID);
    let stager = Stager::new(&store, RemoteFs::new(&client, &buckets));
    let dir = project();

    let first = stager.stage(dir.path()).await.expect("first stage");
    let second = stager.stage(dir.path()).await.expect("second stage");

    assert_eq!(first, second);
    assert!(
        first
            .as_str()
            .starts_with(&format!(".kris/s3/{BUCKET_ID}/kris/")),
        "{first}"
    );
    assert!(first.as_str().ends_with("_archive.zip"), "{first}");
    assert_eq!(store.upload_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_copy_is_reported() {
    let server = MockServer::start().await;
    mount_empty_storage(&server).await;
    mount_s3_credentials(&server).await;
    mount_copy(&server, "copy-9", 1).await;
    mount_service_job(&server, "copy-9", "Failed").await;

    let client = fast_client(&server, Arc::new(MemoryCredentialStore::new()));
    let buckets = registry();
    let store = MemoryObjectStore::new(BUCKET_ID);
    let stager = Stager::new(&store, RemoteFs::new(&client, &buckets));

    let err = stager
        .stage_object("s3://default/data/train.csv")
        .await
        .expect_err("copy failed");
    match err {
        KrisError::RemoteJobFailed { job_name } => assert_eq!(job_name, "copy-9"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stuck_copy_is_ambiguous() {
    let server = MockServer::start().await;
    mount_empty_storage(&server).await;
    mount_s3_credentials(&server).await;
    mount_copy(&server, "copy-2", 1).await;
    mount_service_job(&server, "copy-2", "Running").await;

    let client = fast_client(&server, Arc::new(MemoryCredentialStore::new()));
    let buckets = registry();
    let store = MemoryObjectStore::new(BUCKET_ID);
    let stager = Stager::new(&store, RemoteFs::new(&client, &buckets));

    let err = stager
        .stage_object("s3://default/data/train.csv")
        .await
        .expect_err("never finishes");
    assert!(
        matches!(err, KrisError::AmbiguousRemoteStatus { .. }),
        "{err:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transfer_copies_in_either_direction() {
    let server = MockServer::start().await;
    mount_s3_credentials(&server).await;
    Mock::given(method("POST"))
        .and(path("/s3/copy"))
        .and(body_partial_json(json!({
            "src": format!("s3://{BUCKET_ID}/out/model.pt"),
            "dst": "results/model.pt",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_name": "copy-3"})))
        .expect(1)
        .mount(&server)
        .await;
    mount_service_job(&server, "copy-3", "Complete").await;

    let client = fast_client(&server, Arc::new(MemoryCredentialStore::new()));
    let buckets = registry();
    let remote = RemoteFs::new(&client, &buckets);

    let status = remote
        .transfer("s3://default/out/model.pt", "results/model.pt")
        .await
        .expect("transfer");
    assert_eq!(status.job_name, "copy-3");

    let err = remote
        .transfer("a.txt", "b.txt")
        .await
        .expect_err("no s3 side");
    assert!(matches!(err, KrisError::InvalidRequest(_)), "{err:?}");
}

/// Bucket that accepts nothing.
struct RejectingStore;

#[async_trait]
impl ObjectStore for RejectingStore {
    fn bucket_id(&self) -> &str {
        BUCKET_ID
    }

    async fn exists(&self, _key: &str) -> kris_core::Result<bool> {
        Ok(false)
    }

    async fn put_file(&self, key: &str, _path: &Path) -> kris_core::Result<()> {
        Err(KrisError::ObjectStore(format!("put {key}: access denied")))
    }
}

fn entries(dir: &Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir)
        .expect("read scratch")
        .map(|entry| entry.expect("entry").path())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn archive_scratch_is_removed_after_upload() {
    let server = MockServer::start().await;
    let client = fast_client(&server, Arc::new(MemoryCredentialStore::new()));
    let buckets = registry();
    let dir = project();
    let scratch = tempfile::tempdir().expect("tempdir");

    let store = MemoryObjectStore::new(BUCKET_ID);
    let stager = Stager::new(&store, RemoteFs::new(&client, &buckets))
        .with_scratch_dir(scratch.path());
    let object = stager.upload_local(dir.path()).await.expect("upload");
    assert!(object.key.ends_with("_archive.zip"), "{}", object.key);
    assert_eq!(store.upload_count(), 1);
    assert_eq!(entries(scratch.path()), Vec::<std::path::PathBuf>::new());

    let rejecting = RejectingStore;
    let stager = Stager::new(&rejecting, RemoteFs::new(&client, &buckets))
        .with_scratch_dir(scratch.path());
    let err = stager
        .upload_local(dir.path())
        .await
        .expect_err("upload rejected");
    assert!(matches!(err, KrisError::ObjectStore(_)), "{err:?}");
    assert_eq!(entries(scratch.path()), Vec::<std::path::PathBuf>::new());
    assert!(
        server
            .received_requests()
            .await
            .expect("recorded")
            .is_empty()
    );
}
