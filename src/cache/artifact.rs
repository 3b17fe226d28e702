//! Remote reference artifacts and their integrity rules.

use crate::config::PipelineConfig;
use crate::error::{ArtifactError, ConfigError};
use crate::system::integrity;
use std::fs;
use std::path::{Path, PathBuf};

/// Identifier of the retrieval/loop-closure vocabulary tree.
pub const VOCAB_TREE: &str = "vocab-tree";

/// Whether a failed fetch may be degraded around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Optional,
    Required,
}

/// A large remote file kept in `cache/artifacts/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub identifier: String,
    pub remote_location: String,
    pub local_path: PathBuf,
    pub expected_min_size_bytes: u64,
    /// Lowercase hex SHA-256; `None` means the size check alone decides.
    pub checksum: Option<String>,
    pub requirement: Requirement,
}

impl Artifact {
    /// Check the cached copy: present, at least the minimum size, matching checksum.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        let integrity_error = |reason: String| ArtifactError::Integrity {
            id: self.identifier.clone(),
            reason,
        };

        let metadata = fs::metadata(&self.local_path)
            .map_err(|_| integrity_error("not present in cache".to_string()))?;

        if metadata.len() < self.expected_min_size_bytes {
            return Err(integrity_error(format!(
                "{} bytes, expected at least {}",
                metadata.len(),
                self.expected_min_size_bytes
            )));
        }

        if let Some(expected) = &self.checksum {
            let actual = integrity::sha256_file(&self.local_path)?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(integrity_error(format!(
                    "sha256 {} does not match expected {}",
                    actual, expected
                )));
            }
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Whether the current configuration needs the vocabulary tree, and how badly.
///
/// `vocab_tree` matching cannot run without it; sequential loop closure
/// degrades to plain sequential matching.
pub fn vocab_tree_requirement(config: &PipelineConfig) -> Result<Option<Requirement>, ConfigError> {
    match config.str("matching.strategy")? {
        "vocab_tree" => Ok(Some(Requirement::Required)),
        "sequential" if config.bool("matching.loop_detection")? => {
            Ok(Some(Requirement::Optional))
        }
        _ => Ok(None),
    }
}

/// Build the vocabulary tree artifact from configuration.
pub fn vocab_tree(
    config: &PipelineConfig,
    artifacts_dir: &Path,
    requirement: Requirement,
) -> Result<Artifact, ConfigError> {
    let url = config.str("artifact.vocab_tree_url")?.to_string();
    let file_name = url
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("vocab_tree.bin")
        .to_string();
    let checksum = config.str("artifact.vocab_tree_sha256")?.trim().to_lowercase();

    Ok(Artifact {
        identifier: VOCAB_TREE.to_string(),
        remote_location: url,
        local_path: artifacts_dir.join(file_name),
        expected_min_size_bytes: config.u64("artifact.vocab_tree_min_bytes")?,
        checksum: if checksum.is_empty() { None } else { Some(checksum) },
        requirement,
    })
}
