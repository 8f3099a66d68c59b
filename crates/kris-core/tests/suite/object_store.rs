use std::path::{Path, PathBuf};

use kris_core::KrisError;
use kris_core::buckets::BucketConfig;
use kris_core::config::DEFAULT_S3_REGION;
use kris_core::digest::file_checksum;
use kris_core::object_store::{ObjectStore, S3ObjectStore, upload_local_file};
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::support::{BUCKET_ID, NAMESPACE};

fn store(server: &MockServer) -> S3ObjectStore {
    let bucket = BucketConfig {
        bucket_id: BUCKET_ID.into(),
        namespace: NAMESPACE.into(),
        access_key_id: "AK".into(),
        secret_access_key: "SK".into(),
        endpoint_url: Some(server.uri()),
    };
    S3ObjectStore::new(&bucket, "https://{namespace}.unused.example", DEFAULT_S3_REGION)
}

/// A small file and its path-style request path in the bucket.
fn weights(dir: &Path) -> (PathBuf, String) {
    let file = dir.join("weights.bin");
    std::fs::write(&file, b"\x00\x01\x02\x03").expect("write");
    let digest = file_checksum(&file).expect("digest");
    (file, format!("/{BUCKET_ID}/kris/{digest}_weights.bin"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_object_is_uploaded() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let (file, key) = weights(dir.path());
    Mock::given(method("HEAD"))
        .and(path(key.as_str()))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(key.as_str()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = store(&server);
    let object = upload_local_file(&store, &file).await.expect("upload");
    assert_eq!(format!("/{}/{}", object.bucket_id, object.key), key);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn existing_object_is_not_uploaded_again() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let (file, key) = weights(dir.path());
    Mock::given(method("HEAD"))
        .and(path(key.as_str()))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = store(&server);
    let object = upload_local_file(&store, &file).await.expect("upload");
    assert!(store.exists(&object.key).await.expect("head"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn denied_head_is_an_error_and_nothing_is_uploaded() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let (file, key) = weights(dir.path());
    Mock::given(method("HEAD"))
        .and(path(key.as_str()))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = store(&server);
    let err = upload_local_file(&store, &file)
        .await
        .expect_err("head was denied");
    assert!(matches!(err, KrisError::ObjectStore(_)), "{err:?}");
}
