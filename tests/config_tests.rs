//! Configuration resolution end to end
//!
//! - Every recognized key resolves; unrecognized keys never do
//! - Layer precedence across file, environment, presets and overrides
//! - Contradictions against the detected host
//! - Persisted snapshots reload to the same values

use proptest::prelude::*;
use splatforge::config::{keys, loader, presets, validator, ConfigStore, Provenance};
use splatforge::error::ConfigError;
use splatforge::models::{ArchitectureTag, CapabilityProfile, RuntimeVariant};
use std::fs;
use tempfile::tempdir;

fn gpu_host() -> CapabilityProfile {
    CapabilityProfile {
        accelerator_present: true,
        driver_version: Some("550.54".to_string()),
        toolkit_version: Some("12.4".to_string()),
        device_name: Some("NVIDIA A100".to_string()),
        device_count: 1,
        architecture_tag: ArchitectureTag::Sm80,
        runtime_variant: RuntimeVariant::Cu124,
    }
}

proptest! {
    #[test]
    fn unrecognized_keys_are_not_found(key in "[a-z]{1,8}\\.[a-z_]{1,12}") {
        prop_assume!(keys::spec(&key).is_none());
        let store = ConfigStore::new();
        prop_assert!(matches!(store.resolve(&key), Err(ConfigError::NotFound(_))));
    }
}

#[test]
fn test_every_key_resolves_with_defaults_only() {
    let config = ConfigStore::new().snapshot().unwrap();
    for spec in keys::KEYS {
        let resolved = config.get(spec.name).unwrap();
        assert_eq!(resolved.provenance, Provenance::Default, "{}", spec.name);
    }
    assert_eq!(config.entries().count(), keys::KEYS.len());
}

#[test]
fn test_preset_then_set_flag_precedence() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("splatforge.conf");
    fs::write(&path, "# capture rig\ntrain.iterations=12000\nmatching.overlap=8\n").unwrap();

    let env = vec![("SPLATFORGE_MATCHING_OVERLAP".to_string(), "12".to_string())];
    let mut store = ConfigStore::load(Some(&path), env).unwrap();
    store.apply_preset("fast").unwrap();
    let (key, value) = loader::parse_assignment("train.iterations = 9000").unwrap();
    store.set_override(&key, &value).unwrap();

    let config = store.snapshot().unwrap();
    assert_eq!(config.u64("train.iterations").unwrap(), 9000);
    // The preset sets overlap as an override, above the environment.
    assert_eq!(config.u64("matching.overlap").unwrap(), 5);
    assert_eq!(config.get("matching.overlap").unwrap().provenance, Provenance::Override);
    assert_eq!(config.str("features.detector").unwrap(), "sift");
}

#[test]
fn test_every_preset_expands_to_valid_overrides() {
    for preset in presets::available_presets() {
        let mut store = ConfigStore::new();
        store
            .apply_preset(preset.name)
            .unwrap_or_else(|e| panic!("preset {} invalid: {}", preset.name, e));
        validator::reconcile(store.snapshot().unwrap(), &gpu_host())
            .unwrap_or_else(|e| panic!("preset {} contradicts itself: {}", preset.name, e));
    }
}

#[test]
fn test_unknown_preset_and_bad_values() {
    let mut store = ConfigStore::new();
    assert!(matches!(
        store.apply_preset("ultra"),
        Err(ConfigError::UnknownPreset(_))
    ));
    assert!(matches!(
        store.set_override("matching.strategy", "random"),
        Err(ConfigError::InvalidValue { .. })
    ));
    assert!(matches!(
        store.set_override("train.iterations", "-5"),
        Err(ConfigError::InvalidValue { .. })
    ));
    assert!(loader::parse_assignment("no-equals-sign").is_err());
}

#[test]
fn test_malformed_file_reports_line() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("splatforge.conf");
    fs::write(&path, "train.iterations=100\nthis line is wrong\n").unwrap();
    assert!(matches!(
        ConfigStore::load(Some(&path), Vec::new()),
        Err(ConfigError::ParseFailed { line: 2, .. })
    ));
}

#[test]
fn test_dense_without_accelerator_is_rejected() {
    let mut store = ConfigStore::new();
    store.set_override("dense.enabled", "true").unwrap();
    let err = validator::reconcile(store.snapshot().unwrap(), &CapabilityProfile::cpu_only())
        .unwrap_err();
    assert!(matches!(err, ConfigError::ConflictDetected(_)));

    assert!(validator::reconcile(store.snapshot().unwrap(), &gpu_host()).is_ok());
}

#[test]
fn test_gpu_request_downgraded_on_cpu_host() {
    let mut store = ConfigStore::new();
    store.set_override("features.use_gpu", "true").unwrap();
    let config = validator::reconcile(store.snapshot().unwrap(), &CapabilityProfile::cpu_only())
        .unwrap();
    assert!(!config.bool("features.use_gpu").unwrap());
    assert_eq!(config.get("features.use_gpu").unwrap().provenance, Provenance::Detected);
}

#[test]
fn test_detected_defaults_sit_below_the_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("splatforge.conf");
    fs::write(&path, "features.use_gpu=true\n").unwrap();

    let mut from_file = ConfigStore::load(Some(&path), Vec::new()).unwrap();
    from_file.record_capabilities(&CapabilityProfile::cpu_only()).unwrap();
    assert_eq!(from_file.resolve("features.use_gpu").unwrap().provenance, Provenance::File);

    let mut defaults = ConfigStore::new();
    defaults.record_capabilities(&CapabilityProfile::cpu_only()).unwrap();
    let resolved = defaults.resolve("features.use_gpu").unwrap();
    assert_eq!(resolved.value, "false");
    assert_eq!(resolved.provenance, Provenance::Detected);
}

#[test]
fn test_upload_requires_prefix_and_storage() {
    let mut store = ConfigStore::new();
    store.set_override("upload.enabled", "true").unwrap();
    assert!(validator::reconcile(store.snapshot().unwrap(), &gpu_host()).is_err());

    store.set_override("upload.prefix", "scenes/garden").unwrap();
    assert!(validator::reconcile(store.snapshot().unwrap(), &gpu_host()).is_err());

    store.set_override("storage.root", "/mnt/bucket").unwrap();
    assert!(validator::reconcile(store.snapshot().unwrap(), &gpu_host()).is_ok());
}

#[test]
fn test_persisted_snapshot_reloads_identically() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("splatforge.conf");

    let mut store = ConfigStore::new();
    store.apply_preset("high-quality").unwrap();
    assert!(store.persist(&path).unwrap().is_none());

    let reloaded = ConfigStore::load(Some(&path), Vec::new()).unwrap();
    let original = store.snapshot().unwrap();
    let restored = reloaded.snapshot().unwrap();
    for spec in keys::KEYS {
        assert_eq!(
            original.str(spec.name).unwrap(),
            restored.str(spec.name).unwrap(),
            "{}",
            spec.name
        );
    }

    // A second persist keeps the previous file as a backup.
    let backup = reloaded.persist(&path).unwrap().unwrap();
    assert!(backup.is_file());
}
