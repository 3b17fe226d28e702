//! Artifact cache over HTTP (mockito server)
//!
//! - A valid cached copy is served without touching the network
//! - Truncated or corrupted copies are re-downloaded
//! - Retries are bounded and exhaustion is reported

use splatforge::cache::{Artifact, ArtifactCache, HttpSource, Requirement};
use splatforge::error::ArtifactError;
use splatforge::system::integrity;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn http_cache(artifacts_dir: &Path, attempts: u32) -> ArtifactCache {
    let source = HttpSource::new(Duration::from_secs(10)).unwrap();
    ArtifactCache::new(artifacts_dir, Arc::new(source))
        .with_max_attempts(attempts)
        .with_backoff(Duration::ZERO)
}

fn tree(url: String, artifacts_dir: &Path, checksum: Option<String>) -> Artifact {
    Artifact {
        identifier: "vocab-tree".to_string(),
        remote_location: url,
        local_path: artifacts_dir.join("vocab_tree.bin"),
        expected_min_size_bytes: 4096,
        checksum,
        requirement: Requirement::Required,
    }
}

#[tokio::test]
async fn test_truncated_copy_is_redownloaded_once() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/vocab_tree.bin")
        .with_status(200)
        .with_body(vec![3u8; 8192])
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let artifacts = dir.path().join("artifacts");
    fs::create_dir_all(&artifacts).unwrap();
    // An interrupted earlier download.
    fs::write(artifacts.join("vocab_tree.bin"), vec![3u8; 100]).unwrap();

    let mut cache = http_cache(&artifacts, 3);
    cache.register(tree(format!("{}/vocab_tree.bin", server.url()), &artifacts, None));

    let first = cache.fetch("vocab-tree").await.unwrap();
    assert_eq!(fs::metadata(&first).unwrap().len(), 8192);

    // Second fetch is served from disk; the mock expects exactly one request.
    let second = cache.fetch("vocab-tree").await.unwrap();
    assert_eq!(first, second);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_checksum_mismatch_triggers_download() {
    let body = vec![5u8; 4096];
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/vocab_tree.bin")
        .with_status(200)
        .with_body(body.clone())
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let artifacts = dir.path().join("artifacts");
    fs::create_dir_all(&artifacts).unwrap();

    let reference = dir.path().join("reference.bin");
    fs::write(&reference, &body).unwrap();
    let checksum = integrity::sha256_file(&reference).unwrap();

    // Right size, wrong content.
    fs::write(artifacts.join("vocab_tree.bin"), vec![6u8; 4096]).unwrap();

    let mut cache = http_cache(&artifacts, 2);
    let artifact = tree(format!("{}/vocab_tree.bin", server.url()), &artifacts, Some(checksum));
    assert!(!artifact.is_valid());
    cache.register(artifact);

    let path = cache.fetch("vocab-tree").await.unwrap();
    assert_eq!(fs::read(path).unwrap(), body);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/vocab_tree.bin")
        .with_status(503)
        .expect(3)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let artifacts = dir.path().join("artifacts");
    let mut cache = http_cache(&artifacts, 3);
    cache.register(tree(format!("{}/vocab_tree.bin", server.url()), &artifacts, None));

    let err = cache.fetch("vocab-tree").await.unwrap_err();
    assert!(matches!(err, ArtifactError::Exhausted { attempts: 3, .. }));
    assert!(!artifacts.join("vocab_tree.bin").exists());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_short_response_is_rejected() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/vocab_tree.bin")
        .with_status(200)
        .with_body(vec![1u8; 10])
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let artifacts = dir.path().join("artifacts");
    let mut cache = http_cache(&artifacts, 2);
    cache.register(tree(format!("{}/vocab_tree.bin", server.url()), &artifacts, None));

    assert!(matches!(
        cache.fetch("vocab-tree").await,
        Err(ArtifactError::Exhausted { attempts: 2, .. })
    ));
    assert!(!artifacts.join("vocab_tree.bin").exists());
}

#[tokio::test]
async fn test_unknown_identifier() {
    let dir = tempfile::tempdir().unwrap();
    let cache = http_cache(dir.path(), 1);
    assert!(matches!(
        cache.fetch("nope").await,
        Err(ArtifactError::UnknownArtifact(_))
    ));
}
