//! Artifact cache with integrity verification and bounded re-download.
//!
//! A cached artifact is only handed out after it passes `Artifact::validate`.
//! Fetches of one identifier are serialized so two callers never write the
//! same file at once.

pub mod artifact;
pub mod fetcher;

pub use artifact::{Artifact, Requirement, VOCAB_TREE};
pub use fetcher::{ArtifactSource, HttpSource};

use crate::config::PipelineConfig;
use crate::error::{ArtifactError, ConfigError};
use crate::system::integrity;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);

pub struct ArtifactCache {
    artifacts_dir: PathBuf,
    registry: HashMap<String, Artifact>,
    source: Arc<dyn ArtifactSource>,
    max_attempts: u32,
    backoff: Duration,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ArtifactCache {
    pub fn new(artifacts_dir: impl Into<PathBuf>, source: Arc<dyn ArtifactSource>) -> Self {
        ArtifactCache {
            artifacts_dir: artifacts_dir.into(),
            registry: HashMap::new(),
            source,
            max_attempts: 3,
            backoff: DEFAULT_BACKOFF,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Build a cache holding the artifacts the configuration needs.
    pub fn from_config(
        config: &PipelineConfig,
        artifacts_dir: &Path,
        source: Arc<dyn ArtifactSource>,
    ) -> Result<Self, ConfigError> {
        let attempts = config.u64("artifact.retries")?;
        let attempts = u32::try_from(attempts).map_err(|_| ConfigError::InvalidValue {
            key: "artifact.retries".to_string(),
            value: attempts.to_string(),
            reason: format!("at most {} attempts", u32::MAX),
        })?;
        let mut cache = ArtifactCache::new(artifacts_dir, source).with_max_attempts(attempts);
        if let Some(requirement) = artifact::vocab_tree_requirement(config)? {
            cache.register(artifact::vocab_tree(config, artifacts_dir, requirement)?);
        }
        Ok(cache)
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Delay before retry `n` is `n * backoff`.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn register(&mut self, artifact: Artifact) {
        self.registry.insert(artifact.identifier.clone(), artifact);
    }

    pub fn artifact(&self, identifier: &str) -> Option<&Artifact> {
        self.registry.get(identifier)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.registry.values()
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    async fn lock_for(&self, identifier: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(identifier.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Return a validated local copy, downloading it if needed.
    pub async fn fetch(&self, identifier: &str) -> Result<PathBuf, ArtifactError> {
        let artifact = self
            .registry
            .get(identifier)
            .ok_or_else(|| ArtifactError::UnknownArtifact(identifier.to_string()))?;

        let lock = self.lock_for(identifier).await;
        let _guard = lock.lock().await;

        match artifact.validate() {
            Ok(()) => {
                log::debug!("[Cache] [FETCH] '{}' served from cache", identifier);
                return Ok(artifact.local_path.clone());
            }
            Err(reason) => {
                log::info!("[Cache] [FETCH] '{}' needs download: {}", identifier, reason);
            }
        }

        if let Some(parent) = artifact.local_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            if attempt > 1 && !self.backoff.is_zero() {
                tokio::time::sleep(self.backoff * (attempt - 1)).await;
            }

            log::info!(
                "[Cache] [DOWNLOAD] '{}' attempt {}/{} from {}",
                identifier,
                attempt,
                self.max_attempts,
                artifact.remote_location
            );

            match self
                .source
                .download(&artifact.remote_location, &artifact.local_path)
                .await
            {
                Ok(bytes) => match artifact.validate() {
                    Ok(()) => {
                        log::info!(
                            target: "parsed",
                            "[Cache] [DOWNLOAD] '{}' ready ({} bytes)",
                            identifier,
                            bytes
                        );
                        return Ok(artifact.local_path.clone());
                    }
                    Err(e) => {
                        log::warn!("[Cache] [DOWNLOAD] Attempt {} rejected: {}", attempt, e);
                        let _ = fs::remove_file(&artifact.local_path);
                        last_error = e.to_string();
                    }
                },
                Err(e) => {
                    log::warn!("[Cache] [DOWNLOAD] Attempt {} failed: {}", attempt, e);
                    last_error = e;
                }
            }
        }

        Err(ArtifactError::Exhausted {
            id: identifier.to_string(),
            attempts: self.max_attempts,
            last_error,
        })
    }

    /// Fetch an artifact the caller can run without.
    ///
    /// Failure is logged as a degraded-mode warning and reported as `None`.
    pub async fn fetch_optional(&self, identifier: &str) -> Option<PathBuf> {
        match self.fetch(identifier).await {
            Ok(path) => Some(path),
            Err(e) => {
                log::warn!(
                    "[Cache] [DEGRADED] Optional artifact '{}' unavailable, continuing without it: {}",
                    identifier,
                    e
                );
                None
            }
        }
    }

    /// Warm the cache before the pipeline starts.
    ///
    /// Required artifacts propagate their error; optional ones only warn.
    pub async fn prefetch(&self) -> Result<(), ArtifactError> {
        let mut identifiers: Vec<(String, Requirement)> = self
            .registry
            .values()
            .map(|a| (a.identifier.clone(), a.requirement))
            .collect();
        identifiers.sort_by(|a, b| a.0.cmp(&b.0));

        for (identifier, requirement) in identifiers {
            match requirement {
                Requirement::Required => {
                    self.fetch(&identifier).await?;
                }
                Requirement::Optional => {
                    self.fetch_optional(&identifier).await;
                }
            }
        }
        Ok(())
    }

    /// Bytes currently held in the artifacts directory.
    pub fn usage_bytes(&self) -> u64 {
        integrity::dir_size(&self.artifacts_dir)
    }
}
