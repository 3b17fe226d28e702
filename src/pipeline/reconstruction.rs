//! Reconstruction tool invocations: feature extraction, matching, mapping, MVS.
//!
//! Translates resolved configuration into subcommand arguments. Nothing here
//! runs a process.

use std::fmt;
use std::path::Path;

use crate::config::PipelineConfig;
use crate::error::ConfigError;
use crate::pipeline::tools::ToolInvocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureDetector {
    Sift,
    /// SIFT with domain-size pooling.
    SiftDsp,
}

impl FeatureDetector {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "sift" => Ok(FeatureDetector::Sift),
            "sift_dsp" => Ok(FeatureDetector::SiftDsp),
            other => Err(ConfigError::InvalidValue {
                key: "features.detector".to_string(),
                value: other.to_string(),
                reason: "expected sift or sift_dsp".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingStrategy {
    Exhaustive,
    Sequential,
    VocabTree,
    Spatial,
}

impl MatchingStrategy {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "exhaustive" => Ok(MatchingStrategy::Exhaustive),
            "sequential" => Ok(MatchingStrategy::Sequential),
            "vocab_tree" => Ok(MatchingStrategy::VocabTree),
            "spatial" => Ok(MatchingStrategy::Spatial),
            other => Err(ConfigError::InvalidValue {
                key: "matching.strategy".to_string(),
                value: other.to_string(),
                reason: "expected exhaustive, sequential, vocab_tree or spatial".to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchingStrategy::Exhaustive => "exhaustive",
            MatchingStrategy::Sequential => "sequential",
            MatchingStrategy::VocabTree => "vocab_tree",
            MatchingStrategy::Spatial => "spatial",
        }
    }

    pub fn subcommand(&self) -> &'static str {
        match self {
            MatchingStrategy::Exhaustive => "exhaustive_matcher",
            MatchingStrategy::Sequential => "sequential_matcher",
            MatchingStrategy::VocabTree => "vocab_tree_matcher",
            MatchingStrategy::Spatial => "spatial_matcher",
        }
    }
}

impl fmt::Display for MatchingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn flag_bool(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// Thread count handed to tools; `workers.threads = 0` means every core.
pub fn worker_threads(config: &PipelineConfig) -> Result<usize, ConfigError> {
    match config.u64("workers.threads")? {
        0 => Ok(num_cpus::get()),
        n => Ok(n as usize),
    }
}

/// Tool settings for one run, resolved once from configuration.
#[derive(Debug, Clone)]
pub struct ReconstructionSettings {
    pub program: String,
    pub detector: FeatureDetector,
    pub max_features: u64,
    pub single_camera: bool,
    pub matching: MatchingStrategy,
    pub overlap: u64,
    pub loop_detection: bool,
    pub threads: usize,
}

impl ReconstructionSettings {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        Ok(ReconstructionSettings {
            program: config.str("tools.reconstruction")?.to_string(),
            detector: FeatureDetector::parse(config.str("features.detector")?)?,
            max_features: config.u64("features.max_per_image")?,
            single_camera: config.bool("features.single_camera")?,
            matching: MatchingStrategy::parse(config.str("matching.strategy")?)?,
            overlap: config.u64("matching.overlap")?,
            loop_detection: config.bool("matching.loop_detection")?,
            threads: worker_threads(config)?,
        })
    }

    pub fn extract_features(
        &self,
        database: &Path,
        images: &Path,
        use_gpu: bool,
    ) -> ToolInvocation {
        let mut inv = ToolInvocation::new(&self.program)
            .arg("feature_extractor")
            .path_flag("--database_path", database)
            .path_flag("--image_path", images)
            .flag("--ImageReader.single_camera", flag_bool(self.single_camera))
            .flag("--SiftExtraction.max_num_features", self.max_features)
            .flag("--SiftExtraction.num_threads", self.threads)
            .flag("--SiftExtraction.use_gpu", flag_bool(use_gpu));
        if self.detector == FeatureDetector::SiftDsp {
            inv = inv
                .flag("--SiftExtraction.estimate_affine_shape", 1)
                .flag("--SiftExtraction.domain_size_pooling", 1);
        }
        inv
    }

    /// Matching subcommand. `vocab_tree` is the cached tree for loop closure
    /// or vocab-tree matching; without it sequential matching runs without
    /// loop detection.
    pub fn match_features(
        &self,
        database: &Path,
        use_gpu: bool,
        vocab_tree: Option<&Path>,
    ) -> ToolInvocation {
        let mut inv = ToolInvocation::new(&self.program)
            .arg(self.matching.subcommand())
            .path_flag("--database_path", database)
            .flag("--SiftMatching.use_gpu", flag_bool(use_gpu))
            .flag("--SiftMatching.num_threads", self.threads);

        match self.matching {
            MatchingStrategy::Sequential => {
                inv = inv.flag("--SequentialMatching.overlap", self.overlap);
                match vocab_tree {
                    Some(tree) if self.loop_detection => {
                        inv = inv
                            .flag("--SequentialMatching.loop_detection", 1)
                            .path_flag("--SequentialMatching.vocab_tree_path", tree);
                    }
                    _ => {
                        inv = inv.flag("--SequentialMatching.loop_detection", 0);
                    }
                }
            }
            MatchingStrategy::VocabTree => {
                if let Some(tree) = vocab_tree {
                    inv = inv.path_flag("--VocabTreeMatching.vocab_tree_path", tree);
                }
            }
            MatchingStrategy::Exhaustive | MatchingStrategy::Spatial => {}
        }
        inv
    }

    pub fn map(&self, database: &Path, images: &Path, sparse_dir: &Path) -> ToolInvocation {
        ToolInvocation::new(&self.program)
            .arg("mapper")
            .path_flag("--database_path", database)
            .path_flag("--image_path", images)
            .path_flag("--output_path", sparse_dir)
            .flag("--Mapper.num_threads", self.threads)
    }

    pub fn undistort(&self, images: &Path, model_dir: &Path, dense_dir: &Path) -> ToolInvocation {
        ToolInvocation::new(&self.program)
            .arg("image_undistorter")
            .path_flag("--image_path", images)
            .path_flag("--input_path", model_dir)
            .path_flag("--output_path", dense_dir)
            .flag("--output_type", "COLMAP")
    }

    pub fn patch_match(&self, dense_dir: &Path) -> ToolInvocation {
        ToolInvocation::new(&self.program)
            .arg("patch_match_stereo")
            .path_flag("--workspace_path", dense_dir)
            .flag("--workspace_format", "COLMAP")
            .flag("--PatchMatchStereo.geom_consistency", "true")
    }

    pub fn fuse(&self, dense_dir: &Path, fused: &Path) -> ToolInvocation {
        ToolInvocation::new(&self.program)
            .arg("stereo_fusion")
            .path_flag("--workspace_path", dense_dir)
            .flag("--workspace_format", "COLMAP")
            .flag("--input_type", "geometric")
            .path_flag("--output_path", fused)
    }
}
