//! Trainer invocation, strategy resolution and pre-training estimates.

use std::fmt;
use std::path::Path;

use crate::config::PipelineConfig;
use crate::error::ConfigError;
use crate::models::CapabilityProfile;
use crate::pipeline::tools::ToolInvocation;

/// Below this target size the adaptive strategy favours compression.
pub const COMPRESSION_BELOW_MB: f64 = 25.0;
/// Above this target size the adaptive strategy favours quality.
pub const QUALITY_ABOVE_MB: f64 = 100.0;
/// Gaussian ceiling applied by the compression strategy.
pub const COMPRESSION_CAPACITY_CAP: u64 = 500_000;

/// Densification strategy as configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainStrategy {
    Adaptive,
    Mcmc,
    Default,
    CompressionFocused,
}

impl TrainStrategy {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "adaptive" => Ok(TrainStrategy::Adaptive),
            "mcmc" => Ok(TrainStrategy::Mcmc),
            "default" => Ok(TrainStrategy::Default),
            "compression_focused" => Ok(TrainStrategy::CompressionFocused),
            other => Err(ConfigError::InvalidValue {
                key: "train.strategy".to_string(),
                value: other.to_string(),
                reason: "expected adaptive, mcmc, default or compression_focused".to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrainStrategy::Adaptive => "adaptive",
            TrainStrategy::Mcmc => "mcmc",
            TrainStrategy::Default => "default",
            TrainStrategy::CompressionFocused => "compression_focused",
        }
    }

    /// Concrete strategy for a target size. Only `Adaptive` depends on it.
    pub fn resolve(&self, target_file_size_mb: f64) -> TrainStrategy {
        match self {
            TrainStrategy::Adaptive if target_file_size_mb < COMPRESSION_BELOW_MB => {
                TrainStrategy::CompressionFocused
            }
            TrainStrategy::Adaptive if target_file_size_mb > QUALITY_ABOVE_MB => {
                TrainStrategy::Mcmc
            }
            TrainStrategy::Adaptive => TrainStrategy::Default,
            concrete => *concrete,
        }
    }
}

impl fmt::Display for TrainStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rough pre-training estimate, logged so operators can abort early.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsEstimate {
    pub training_minutes: u64,
    pub file_size_mb: f64,
    pub psnr_range: (f64, f64),
    pub memory_gb: f64,
    pub web_rating: &'static str,
}

/// Training parameters resolved once from configuration.
#[derive(Debug, Clone)]
pub struct TrainingSettings {
    pub program: String,
    pub iterations: u64,
    pub configured: TrainStrategy,
    pub strategy: TrainStrategy,
    pub gaussian_capacity: u64,
    pub target_file_size_mb: f64,
    pub quality_target_psnr: f64,
    pub compress: bool,
}

impl TrainingSettings {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        let configured = TrainStrategy::parse(config.str("train.strategy")?)?;
        let target_file_size_mb = config.f64("train.target_file_size_mb")?;
        let strategy = configured.resolve(target_file_size_mb);

        let mut gaussian_capacity = config.u64("train.gaussian_capacity")?;
        if configured == TrainStrategy::Adaptive && strategy == TrainStrategy::CompressionFocused {
            gaussian_capacity = gaussian_capacity.min(COMPRESSION_CAPACITY_CAP);
        }

        Ok(TrainingSettings {
            program: config.str("tools.trainer")?.to_string(),
            iterations: config.u64("train.iterations")?,
            configured,
            strategy,
            gaussian_capacity,
            target_file_size_mb,
            quality_target_psnr: config.f64("train.quality_target_psnr")?,
            compress: config.bool("package.compress")?,
        })
    }

    /// Estimate from gsplat benchmark rules of thumb: about 1.2 minutes per
    /// 1k iterations, 236 MB and 2 GB of GPU memory per million gaussians.
    /// Multi-GPU runs divide time and memory by up to four devices.
    pub fn estimate(&self, profile: &CapabilityProfile) -> MetricsEstimate {
        let millions = self.gaussian_capacity as f64 / 1_000_000.0;
        let devices = if profile.gpu_usable() {
            profile.device_count.clamp(1, 4) as f64
        } else {
            1.0
        };

        let minutes = self.iterations as f64 / 1000.0 * 1.2 / devices;

        let mut size_mb = millions * 236.0;
        if self.compress {
            size_mb *= 0.07;
        }
        size_mb = size_mb.min(self.target_file_size_mb * 1.5);

        let psnr_range = match self.strategy {
            TrainStrategy::Mcmc if self.gaussian_capacity >= 2_000_000 => (29.2, 29.7),
            TrainStrategy::CompressionFocused => (27.5, 28.5),
            _ => (28.0, 29.0),
        };

        MetricsEstimate {
            training_minutes: minutes as u64,
            file_size_mb: size_mb,
            psnr_range,
            memory_gb: 3.0 + millions * 2.0 / devices,
            web_rating: web_rating(self.target_file_size_mb, self.quality_target_psnr),
        }
    }

    pub fn invocation(
        &self,
        program: String,
        sparse_model: &Path,
        images: &Path,
        output: &Path,
    ) -> ToolInvocation {
        ToolInvocation::new(program)
            .path_flag("--colmap_path", sparse_model)
            .path_flag("--images_path", images)
            .path_flag("--output_path", output)
            .flag("--iterations", self.iterations)
            .flag("--strategy", self.strategy)
            .flag("--gaussian_capacity", self.gaussian_capacity)
            .flag("--target_file_size_mb", self.target_file_size_mb)
            .flag("--quality_target_psnr", self.quality_target_psnr)
    }

    /// Facts a recorded training run is validated against.
    pub fn facts(&self) -> Vec<(String, String)> {
        vec![
            ("train.iterations".to_string(), self.iterations.to_string()),
            ("train.strategy".to_string(), self.strategy.to_string()),
            (
                "train.gaussian_capacity".to_string(),
                self.gaussian_capacity.to_string(),
            ),
            (
                "train.target_file_size_mb".to_string(),
                self.target_file_size_mb.to_string(),
            ),
            (
                "train.quality_target_psnr".to_string(),
                self.quality_target_psnr.to_string(),
            ),
        ]
    }
}

/// Small files score high on loading, high PSNR on quality; the average
/// is bucketed into a rating.
fn web_rating(target_file_size_mb: f64, quality_target_psnr: f64) -> &'static str {
    let size_score = 1.0 - (target_file_size_mb / 100.0).min(1.0);
    let quality_score = (quality_target_psnr - 25.0) / 10.0;
    let overall = (size_score + quality_score) / 2.0;

    if overall > 0.8 {
        "excellent (fast loading, high quality)"
    } else if overall > 0.6 {
        "good (balanced loading and quality)"
    } else if overall > 0.4 {
        "fair (slower loading or lower quality)"
    } else {
        "poor (large files or low quality)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;

    fn settings(pairs: &[(&str, &str)]) -> TrainingSettings {
        let mut store = ConfigStore::new();
        for (k, v) in pairs {
            store.set_override(k, v).unwrap();
        }
        TrainingSettings::from_config(&store.snapshot().unwrap()).unwrap()
    }

    #[test]
    fn test_adaptive_resolution_by_target_size() {
        assert_eq!(
            TrainStrategy::Adaptive.resolve(8.0),
            TrainStrategy::CompressionFocused
        );
        assert_eq!(TrainStrategy::Adaptive.resolve(50.0), TrainStrategy::Default);
        assert_eq!(TrainStrategy::Adaptive.resolve(100.0), TrainStrategy::Default);
        assert_eq!(TrainStrategy::Adaptive.resolve(150.0), TrainStrategy::Mcmc);
        assert_eq!(TrainStrategy::Mcmc.resolve(8.0), TrainStrategy::Mcmc);
    }

    #[test]
    fn test_adaptive_compression_caps_capacity() {
        let s = settings(&[
            ("train.target_file_size_mb", "10"),
            ("train.gaussian_capacity", "2000000"),
        ]);
        assert_eq!(s.strategy, TrainStrategy::CompressionFocused);
        assert_eq!(s.gaussian_capacity, COMPRESSION_CAPACITY_CAP);

        let explicit = settings(&[
            ("train.strategy", "compression_focused"),
            ("train.gaussian_capacity", "2000000"),
        ]);
        assert_eq!(explicit.gaussian_capacity, 2_000_000);
    }

    #[test]
    fn test_estimate_single_device() {
        let s = settings(&[
            ("train.iterations", "20000"),
            ("train.gaussian_capacity", "1000000"),
            ("train.target_file_size_mb", "35"),
            ("package.compress", "true"),
        ]);
        let estimate = s.estimate(&CapabilityProfile::cpu_only());
        assert_eq!(estimate.training_minutes, 24);
        assert!((estimate.file_size_mb - 236.0 * 0.07).abs() < 1e-9);
        assert!((estimate.memory_gb - 5.0).abs() < 1e-9);
        assert_eq!(estimate.psnr_range, (28.0, 29.0));
    }

    #[test]
    fn test_estimate_size_is_capped_by_target() {
        let s = settings(&[
            ("train.gaussian_capacity", "1000000"),
            ("train.target_file_size_mb", "50"),
            ("package.compress", "false"),
        ]);
        let estimate = s.estimate(&CapabilityProfile::cpu_only());
        assert!((estimate.file_size_mb - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_premium_psnr_range() {
        let s = settings(&[
            ("train.strategy", "mcmc"),
            ("train.gaussian_capacity", "2500000"),
        ]);
        let estimate = s.estimate(&CapabilityProfile::cpu_only());
        assert_eq!(estimate.psnr_range, (29.2, 29.7));
    }

    #[test]
    fn test_web_rating_buckets() {
        assert!(web_rating(5.0, 33.0).starts_with("excellent"));
        assert!(web_rating(35.0, 28.5).starts_with("fair"));
        assert!(web_rating(200.0, 25.0).starts_with("poor"));
    }

    #[test]
    fn test_trainer_arguments() {
        let s = settings(&[("train.iterations", "7000"), ("train.strategy", "mcmc")]);
        let inv = s.invocation(
            "gsplat-train".to_string(),
            Path::new("/w/sparse/0"),
            Path::new("/in"),
            Path::new("/w/model"),
        );
        assert_eq!(inv.flag_value("--colmap_path"), Some("/w/sparse/0"));
        assert_eq!(inv.flag_value("--iterations"), Some("7000"));
        assert_eq!(inv.flag_value("--strategy"), Some("mcmc"));
        assert_eq!(inv.flag_value("--output_path"), Some("/w/model"));
    }
}
