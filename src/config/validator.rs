//! Config validation: per-value type checks and cross-key contradictions.

use super::keys::{KeySpec, ValueKind};
use super::{PipelineConfig, Provenance};
use crate::error::ConfigError;
use crate::models::CapabilityProfile;

/// Accepted spellings of a boolean value.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Check that `raw` parses as the key's declared type.
pub fn validate_value(spec: &KeySpec, raw: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: spec.name.to_string(),
        value: raw.to_string(),
        reason,
    };

    match spec.kind {
        ValueKind::Bool => {
            parse_bool(raw).ok_or_else(|| invalid("expected true or false".to_string()))?;
        }
        ValueKind::Int => {
            raw.trim()
                .parse::<u64>()
                .map_err(|_| invalid("expected a non-negative integer".to_string()))?;
        }
        ValueKind::Float => {
            let value = raw
                .trim()
                .parse::<f64>()
                .map_err(|_| invalid("expected a number".to_string()))?;
            if !value.is_finite() || value < 0.0 {
                return Err(invalid("expected a finite, non-negative number".to_string()));
            }
        }
        ValueKind::Str => {}
        ValueKind::Enum(choices) => {
            if !choices.contains(&raw.trim()) {
                return Err(invalid(format!("expected one of: {}", choices.join(", "))));
            }
        }
    }

    Ok(())
}

/// Minimum values for keys where zero is meaningless.
const POSITIVE_KEYS: &[&str] = &[
    "features.max_per_image",
    "train.iterations",
    "train.gaussian_capacity",
    "artifact.retries",
    "workers.upload",
];

/// Reject contradictory settings and downgrade GPU use the host cannot honour.
///
/// Returns the reconciled snapshot; downgrades are logged.
pub fn reconcile(
    mut config: PipelineConfig,
    profile: &CapabilityProfile,
) -> Result<PipelineConfig, ConfigError> {
    for key in POSITIVE_KEYS {
        if config.u64(key)? == 0 {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
    }

    if config.f64("train.target_file_size_mb")? <= 0.0 {
        return Err(ConfigError::InvalidValue {
            key: "train.target_file_size_mb".to_string(),
            value: config.str("train.target_file_size_mb")?.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }

    if config.bool("dense.enabled")? && !profile.gpu_usable() {
        return Err(ConfigError::ConflictDetected(
            "dense.enabled=true requires a usable accelerator, none was detected".to_string(),
        ));
    }

    if config.bool("upload.enabled")? {
        if config.str("upload.prefix")?.is_empty() {
            return Err(ConfigError::ConflictDetected(
                "upload.enabled=true but upload.prefix is empty".to_string(),
            ));
        }
        if config.str("storage.root")?.is_empty() {
            return Err(ConfigError::ConflictDetected(
                "upload.enabled=true but storage.root is empty".to_string(),
            ));
        }
    }

    if !config.str("input.prefix")?.is_empty() && config.str("storage.root")?.is_empty() {
        return Err(ConfigError::ConflictDetected(
            "input.prefix is set but storage.root is empty".to_string(),
        ));
    }

    if config.str("matching.strategy")? == "vocab_tree"
        && config.str("artifact.vocab_tree_url")?.is_empty()
    {
        return Err(ConfigError::ConflictDetected(
            "matching.strategy=vocab_tree requires artifact.vocab_tree_url".to_string(),
        ));
    }

    if config.bool("features.use_gpu")? && !profile.gpu_usable() {
        let source = config.get("features.use_gpu")?.provenance;
        log::warn!(
            "[Config] [VALIDATE] features.use_gpu=true ({}) but no usable accelerator; running feature stages on CPU",
            source.as_str()
        );
        config.set_derived("features.use_gpu", "false");
    }

    Ok(config)
}

/// Whether a value came from the user rather than a default.
pub fn is_explicit(provenance: Provenance) -> bool {
    matches!(
        provenance,
        Provenance::Override | Provenance::Env | Provenance::File
    )
}
