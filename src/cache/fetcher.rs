//! Artifact download sources.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Something that can place a remote file at a local path.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Download `url` to `dest`, returning the number of bytes written.
    async fn download(&self, url: &str, dest: &Path) -> Result<u64, String>;
}

/// HTTP(S) source backed by reqwest.
///
/// The body is streamed into `<dest>.part` and renamed on completion, so an
/// interrupted download never leaves a file at `dest`.
#[derive(Clone)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("splatforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;
        Ok(HttpSource { client })
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

#[async_trait]
impl ArtifactSource for HttpSource {
    async fn download(&self, url: &str, dest: &Path) -> Result<u64, String> {
        log::debug!("[Cache] [HTTP] GET {}", url);

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("HTTP {} from {}", response.status(), url));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
        }

        let part = part_path(dest);
        let mut file = tokio::fs::File::create(&part)
            .await
            .map_err(|e| format!("Failed to create {}: {}", part.display(), e))?;

        let mut written: u64 = 0;
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(format!("Failed to read response body: {}", e));
                }
            };
            file.write_all(&chunk)
                .await
                .map_err(|e| format!("Failed to write {}: {}", part.display(), e))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| format!("Failed to flush {}: {}", part.display(), e))?;
        drop(file);

        tokio::fs::rename(&part, dest)
            .await
            .map_err(|e| format!("Failed to move {} into place: {}", part.display(), e))?;

        log::debug!("[Cache] [HTTP] {} bytes written to {}", written, dest.display());
        Ok(written)
    }
}
