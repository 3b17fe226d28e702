//! Layered configuration: override > environment > file > detected > compiled default.
//!
//! # Module Structure
//!
//! - `keys`: the recognized key table with defaults and documentation
//! - `loader`: `key=value` parsing and backed-up persistence
//! - `presets`: named presets expanding into overrides
//! - `validator`: type checks and cross-key contradictions
//!
//! # Resolution Flow
//!
//! 1. `main` reads the process environment once and hands it to `ConfigStore::load`
//! 2. Capability detection records detected defaults (`record_capabilities`)
//! 3. Presets and `--set` flags become overrides
//! 4. `snapshot()` resolves every key into an immutable `PipelineConfig`
//! 5. `validator::reconcile` rejects contradictions against the capability profile

pub mod keys;
pub mod loader;
pub mod presets;
pub mod validator;

use crate::error::ConfigError;
use crate::models::CapabilityProfile;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Which layer a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Override,
    Env,
    File,
    /// Derived from the capability profile.
    Detected,
    Default,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Override => "override",
            Provenance::Env => "env",
            Provenance::File => "file",
            Provenance::Detected => "detected",
            Provenance::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedValue {
    pub value: String,
    pub provenance: Provenance,
}

/// Immutable, fully resolved configuration for one run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    values: BTreeMap<String, ResolvedValue>,
}

impl PipelineConfig {
    pub fn get(&self, key: &str) -> Result<&ResolvedValue, ConfigError> {
        self.values
            .get(key)
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))
    }

    pub fn str(&self, key: &str) -> Result<&str, ConfigError> {
        Ok(self.get(key)?.value.as_str())
    }

    pub fn bool(&self, key: &str) -> Result<bool, ConfigError> {
        let raw = self.str(key)?;
        validator::parse_bool(raw).ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason: "expected true or false".to_string(),
        })
    }

    pub fn u64(&self, key: &str) -> Result<u64, ConfigError> {
        let raw = self.str(key)?;
        raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason: "expected a non-negative integer".to_string(),
        })
    }

    pub fn f64(&self, key: &str) -> Result<f64, ConfigError> {
        let raw = self.str(key)?;
        raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason: "expected a number".to_string(),
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &ResolvedValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Replace a value after validation (e.g. a GPU downgrade).
    pub(crate) fn set_derived(&mut self, key: &str, value: &str) {
        self.values.insert(
            key.to_string(),
            ResolvedValue {
                value: value.to_string(),
                provenance: Provenance::Detected,
            },
        );
    }

    /// Render as a persisted `key=value` file.
    pub fn to_file_contents(&self) -> String {
        let mut out = format!(
            "# splatforge configuration snapshot ({})\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        for spec in keys::KEYS {
            if let Some(resolved) = self.values.get(spec.name) {
                out.push_str(&format!("# {}\n{}={}\n", spec.doc, spec.name, resolved.value));
            }
        }
        out
    }
}

/// Layered configuration store. One instance per invocation, passed explicitly.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    file_path: Option<PathBuf>,
    file: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
    detected: BTreeMap<String, String>,
    overrides: BTreeMap<String, String>,
}

impl ConfigStore {
    /// A store holding compiled defaults only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the file and environment layers.
    ///
    /// `env_vars` is the process environment captured once by the caller; only
    /// `SPLATFORGE_*` variables naming a recognized key are used.
    pub fn load<I>(file_path: Option<&Path>, env_vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut store = ConfigStore::new();

        if let Some(path) = file_path {
            let values = loader::load_file(path)?;
            for (key, value) in values {
                let spec = keys::spec(&key).ok_or_else(|| ConfigError::NotFound(key.clone()))?;
                validator::validate_value(spec, &value)?;
                store.file.insert(key, value);
            }
            log::info!(
                "[Config] [LOAD] {} value(s) from {}",
                store.file.len(),
                path.display()
            );
            store.file_path = Some(path.to_path_buf());
        }

        let env: BTreeMap<String, String> = env_vars
            .into_iter()
            .filter(|(name, _)| name.starts_with("SPLATFORGE_"))
            .collect();
        for spec in keys::KEYS {
            if let Some(value) = env.get(&keys::env_var_name(spec.name)) {
                validator::validate_value(spec, value)?;
                store.env.insert(spec.name.to_string(), value.clone());
            }
        }
        if !store.env.is_empty() {
            log::info!("[Config] [LOAD] {} value(s) from environment", store.env.len());
        }

        Ok(store)
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// Set a command-line override. Unknown keys and ill-typed values are rejected.
    pub fn set_override(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let spec = keys::spec(key).ok_or_else(|| ConfigError::NotFound(key.to_string()))?;
        validator::validate_value(spec, value)?;
        self.overrides.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Expand a preset into overrides. Later `set_override` calls win.
    pub fn apply_preset(&mut self, name: &str) -> Result<(), ConfigError> {
        let preset =
            presets::get_preset(name).ok_or_else(|| ConfigError::UnknownPreset(name.to_string()))?;
        for (key, value) in &preset.overrides {
            self.set_override(key, value)?;
        }
        log::info!(
            "[Config] [PRESET] Applied '{}' ({} override(s))",
            preset.name,
            preset.overrides.len()
        );
        Ok(())
    }

    /// Record a default derived from detection, below file and environment.
    pub fn record_detected(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let spec = keys::spec(key).ok_or_else(|| ConfigError::NotFound(key.to_string()))?;
        validator::validate_value(spec, value)?;
        self.detected.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Record the defaults implied by the detected host.
    pub fn record_capabilities(&mut self, profile: &CapabilityProfile) -> Result<(), ConfigError> {
        if !profile.gpu_usable() {
            self.record_detected("features.use_gpu", "false")?;
        }
        Ok(())
    }

    /// Resolve one key. Total over recognized keys.
    pub fn resolve(&self, key: &str) -> Result<ResolvedValue, ConfigError> {
        let spec = keys::spec(key).ok_or_else(|| ConfigError::NotFound(key.to_string()))?;

        let layers = [
            (&self.overrides, Provenance::Override),
            (&self.env, Provenance::Env),
            (&self.file, Provenance::File),
            (&self.detected, Provenance::Detected),
        ];
        for (layer, provenance) in layers {
            if let Some(value) = layer.get(key) {
                return Ok(ResolvedValue {
                    value: value.clone(),
                    provenance,
                });
            }
        }

        Ok(ResolvedValue {
            value: spec.default.to_string(),
            provenance: Provenance::Default,
        })
    }

    /// Resolve every key into an immutable snapshot.
    pub fn snapshot(&self) -> Result<PipelineConfig, ConfigError> {
        let mut values = BTreeMap::new();
        for spec in keys::KEYS {
            let resolved = self.resolve(spec.name)?;
            validator::validate_value(spec, &resolved.value)?;
            values.insert(spec.name.to_string(), resolved);
        }
        Ok(PipelineConfig { values })
    }

    /// Write the resolved snapshot to `path`, backing up any existing file first.
    pub fn persist(&self, path: &Path) -> Result<Option<PathBuf>, ConfigError> {
        let snapshot = self.snapshot()?;
        let backup = loader::write_with_backup(path, &snapshot.to_file_contents())?;
        log::info!("[Config] [PERSIST] Snapshot written to {}", path.display());
        Ok(backup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_is_total_over_keys() {
        let store = ConfigStore::new();
        for spec in keys::KEYS {
            let resolved = store.resolve(spec.name).unwrap();
            assert_eq!(resolved.value, spec.default);
            assert_eq!(resolved.provenance, Provenance::Default);
        }
    }

    #[test]
    fn test_unknown_key_not_found() {
        let store = ConfigStore::new();
        assert!(matches!(
            store.resolve("train.speed"),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_precedence_override_env_file_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("splatforge.conf");
        fs::write(
            &path,
            "train.iterations=1000\nmatching.overlap=4\nfeatures.max_per_image=2048\n",
        )
        .unwrap();

        let env = vec![
            ("SPLATFORGE_TRAIN_ITERATIONS".to_string(), "2000".to_string()),
            ("SPLATFORGE_MATCHING_OVERLAP".to_string(), "6".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let mut store = ConfigStore::load(Some(&path), env).unwrap();
        store.set_override("train.iterations", "3000").unwrap();

        let iterations = store.resolve("train.iterations").unwrap();
        assert_eq!(iterations.value, "3000");
        assert_eq!(iterations.provenance, Provenance::Override);

        let overlap = store.resolve("matching.overlap").unwrap();
        assert_eq!(overlap.value, "6");
        assert_eq!(overlap.provenance, Provenance::Env);

        let features = store.resolve("features.max_per_image").unwrap();
        assert_eq!(features.provenance, Provenance::File);

        let strategy = store.resolve("matching.strategy").unwrap();
        assert_eq!(strategy.provenance, Provenance::Default);
    }

    #[test]
    fn test_detected_sits_below_file() {
        let mut store = ConfigStore::new();
        store.record_capabilities(&CapabilityProfile::cpu_only()).unwrap();
        let resolved = store.resolve("features.use_gpu").unwrap();
        assert_eq!(resolved.value, "false");
        assert_eq!(resolved.provenance, Provenance::Detected);

        store.set_override("features.use_gpu", "true").unwrap();
        assert_eq!(store.resolve("features.use_gpu").unwrap().value, "true");
    }

    #[test]
    fn test_invalid_env_value_rejected() {
        let env = vec![("SPLATFORGE_MATCHING_STRATEGY".to_string(), "random".to_string())];
        assert!(matches!(
            ConfigStore::load(None, env),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("splatforge.conf");
        fs::write(&path, "train.speed=fast\n").unwrap();
        assert!(matches!(
            ConfigStore::load(Some(&path), Vec::new()),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_preset_then_set_override() {
        let mut store = ConfigStore::new();
        store.apply_preset("fast").unwrap();
        store.set_override("train.iterations", "9000").unwrap();
        assert_eq!(store.resolve("train.iterations").unwrap().value, "9000");
        assert_eq!(store.resolve("matching.overlap").unwrap().value, "5");
        assert!(matches!(
            store.apply_preset("ultra"),
            Err(ConfigError::UnknownPreset(_))
        ));
    }

    #[test]
    fn test_persist_round_trips_through_file_layer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("splatforge.conf");
        fs::write(&path, "train.iterations=1234\n").unwrap();

        let mut store = ConfigStore::load(Some(&path), Vec::new()).unwrap();
        store.set_override("matching.strategy", "exhaustive").unwrap();
        let backup = store.persist(&path).unwrap();
        assert!(backup.is_some());

        let reloaded = ConfigStore::load(Some(&path), Vec::new()).unwrap();
        assert_eq!(reloaded.resolve("matching.strategy").unwrap().value, "exhaustive");
        assert_eq!(reloaded.resolve("train.iterations").unwrap().value, "1234");
        assert_eq!(
            reloaded.resolve("matching.strategy").unwrap().provenance,
            Provenance::File
        );
    }
}
