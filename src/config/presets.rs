//! Named presets. Each expands deterministically into configuration overrides.

use lazy_static::lazy_static;
use std::collections::HashMap;

lazy_static! {
    static ref PRESETS: HashMap<&'static str, PresetDefinition> = {
        let mut presets = HashMap::new();

        presets.insert(
            "fast",
            PresetDefinition::new(
                "fast",
                "Quick preview (fewer features, 7k iterations)",
                &[
                    ("features.max_per_image", "4096"),
                    ("matching.overlap", "5"),
                    ("dense.enabled", "false"),
                    ("train.iterations", "7000"),
                    ("train.gaussian_capacity", "500000"),
                    ("train.target_file_size_mb", "25.0"),
                    ("train.quality_target_psnr", "26.0"),
                ],
            ),
        );

        presets.insert(
            "balanced",
            PresetDefinition::new(
                "balanced",
                "Reasonable default for most captures",
                &[
                    ("features.max_per_image", "8192"),
                    ("matching.overlap", "10"),
                    ("train.iterations", "15000"),
                    ("train.gaussian_capacity", "1000000"),
                    ("train.strategy", "adaptive"),
                ],
            ),
        );

        presets.insert(
            "high-quality",
            PresetDefinition::new(
                "high-quality",
                "Maximum fidelity (dense features, MCMC, 30k iterations)",
                &[
                    ("features.detector", "sift_dsp"),
                    ("features.max_per_image", "16384"),
                    ("matching.overlap", "20"),
                    ("train.iterations", "30000"),
                    ("train.gaussian_capacity", "2500000"),
                    ("train.strategy", "mcmc"),
                    ("train.target_file_size_mb", "80.0"),
                    ("train.quality_target_psnr", "29.5"),
                ],
            ),
        );

        presets.insert(
            "mobile",
            PresetDefinition::new(
                "mobile",
                "Web delivery on phones (8 MB target, compression-focused)",
                &[
                    ("train.iterations", "12000"),
                    ("train.gaussian_capacity", "300000"),
                    ("train.target_file_size_mb", "8.0"),
                    ("train.quality_target_psnr", "27.0"),
                    ("train.strategy", "compression_focused"),
                    ("package.compress", "true"),
                ],
            ),
        );

        presets.insert(
            "desktop",
            PresetDefinition::new(
                "desktop",
                "Web delivery on desktop browsers (35 MB target)",
                &[
                    ("train.iterations", "20000"),
                    ("train.gaussian_capacity", "1000000"),
                    ("train.target_file_size_mb", "35.0"),
                    ("train.quality_target_psnr", "28.5"),
                    ("train.strategy", "adaptive"),
                ],
            ),
        );

        presets.insert(
            "premium",
            PresetDefinition::new(
                "premium",
                "High-end web viewing (80 MB target, MCMC)",
                &[
                    ("train.iterations", "30000"),
                    ("train.gaussian_capacity", "2500000"),
                    ("train.target_file_size_mb", "80.0"),
                    ("train.quality_target_psnr", "29.5"),
                    ("train.strategy", "mcmc"),
                ],
            ),
        );

        presets
    };
}

/// Preset definition.
#[derive(Debug, Clone)]
pub struct PresetDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub overrides: Vec<(&'static str, &'static str)>,
}

impl PresetDefinition {
    fn new(
        name: &'static str,
        description: &'static str,
        overrides: &[(&'static str, &'static str)],
    ) -> Self {
        PresetDefinition {
            name,
            description,
            overrides: overrides.to_vec(),
        }
    }
}

/// Get preset by name (case-insensitive).
pub fn get_preset(name: &str) -> Option<PresetDefinition> {
    PRESETS.get(name.to_lowercase().as_str()).cloned()
}

/// All presets, sorted by name.
pub fn available_presets() -> Vec<PresetDefinition> {
    let mut presets: Vec<_> = PRESETS.values().cloned().collect();
    presets.sort_by_key(|p| p.name);
    presets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys;

    #[test]
    fn test_available_presets() {
        let names: Vec<_> = available_presets().iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec!["balanced", "desktop", "fast", "high-quality", "mobile", "premium"]
        );
    }

    #[test]
    fn test_preset_lookup_is_case_insensitive() {
        let preset = get_preset("FAST").expect("fast preset");
        assert_eq!(preset.name, "fast");
        assert!(preset.overrides.contains(&("train.iterations", "7000")));
    }

    #[test]
    fn test_every_preset_key_is_recognized() {
        for preset in available_presets() {
            for (key, _) in &preset.overrides {
                assert!(keys::spec(key).is_some(), "{}: {}", preset.name, key);
            }
        }
    }

    #[test]
    fn test_mobile_matches_web_targets() {
        let preset = get_preset("mobile").unwrap();
        assert!(preset.overrides.contains(&("train.gaussian_capacity", "300000")));
        assert!(preset.overrides.contains(&("train.target_file_size_mb", "8.0")));
    }
}
