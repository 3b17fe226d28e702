//! Object storage collaborator used to fetch inputs and upload packages.
//!
//! Provider clients live outside this crate; `LocalDirStore` maps prefixes
//! onto a mounted directory (network filesystem, bucket mount, ...).

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::PipelineConfig;
use crate::error::{ConfigError, StorageError};
use crate::system::integrity;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Copy every object under `prefix` into `dest`. Returns the file count.
    async fn fetch_prefix(&self, prefix: &str, dest: &Path) -> Result<usize, StorageError>;

    /// Copy every file below `src` to `prefix`. Returns the file count.
    async fn upload_dir(&self, src: &Path, prefix: &str) -> Result<usize, StorageError>;
}

/// Object store backed by a directory tree.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
    parallel: usize,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>, parallel: usize) -> Self {
        LocalDirStore {
            root: root.into(),
            parallel: parallel.max(1),
        }
    }

    /// `None` when `storage.root` is empty.
    pub fn from_config(config: &PipelineConfig) -> Result<Option<Self>, ConfigError> {
        let root = config.str("storage.root")?;
        if root.is_empty() {
            return Ok(None);
        }
        Ok(Some(LocalDirStore::new(
            root,
            config.u64("workers.upload")? as usize,
        )))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn prefix_dir(&self, prefix: &str) -> PathBuf {
        let mut dir = self.root.clone();
        for part in prefix.split('/').filter(|p| !p.is_empty() && *p != "..") {
            dir.push(part);
        }
        dir
    }

    /// Copy `files` (relative to `from`) under `to`, at most `parallel` at a time.
    async fn copy_tree(&self, from: &Path, to: &Path, files: Vec<PathBuf>) -> Result<usize, StorageError> {
        let semaphore = Arc::new(Semaphore::new(self.parallel));
        let mut copies = JoinSet::new();

        for file in files {
            let relative = file.strip_prefix(from).unwrap_or(&file).to_path_buf();
            let target = to.join(relative);
            let sem = Arc::clone(&semaphore);

            copies.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(&file, &target).await
            });
        }

        let mut count = 0;
        while let Some(result) = copies.join_next().await {
            match result {
                Ok(Ok(_)) => count += 1,
                Ok(Err(e)) => return Err(StorageError::IoError(e)),
                Err(join_err) => {
                    return Err(StorageError::IoError(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("copy task aborted: {}", join_err),
                    )))
                }
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl ObjectStore for LocalDirStore {
    async fn fetch_prefix(&self, prefix: &str, dest: &Path) -> Result<usize, StorageError> {
        let source = self.prefix_dir(prefix);
        if !source.is_dir() {
            return Err(StorageError::PrefixNotFound(prefix.to_string()));
        }
        let files = integrity::list_files(&source)?;
        log::info!(
            "[Storage] [FETCH] {} object(s) from '{}' into {}",
            files.len(),
            prefix,
            dest.display()
        );
        self.copy_tree(&source, dest, files).await
    }

    async fn upload_dir(&self, src: &Path, prefix: &str) -> Result<usize, StorageError> {
        let files = integrity::list_files(src)?;
        let target = self.prefix_dir(prefix);
        log::info!(
            "[Storage] [UPLOAD] {} file(s) from {} to '{}'",
            files.len(),
            src.display(),
            prefix
        );
        self.copy_tree(src, &target, files).await
    }
}
