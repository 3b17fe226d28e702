//! Recognized configuration keys with compiled defaults and documentation.
//!
//! Every key resolves: this table is the bottom layer of resolution.

/// Value type of a configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    /// Non-negative integer.
    Int,
    Float,
    Str,
    /// One of a closed set of lowercase strings.
    Enum(&'static [&'static str]),
}

impl ValueKind {
    pub fn describe(&self) -> String {
        match self {
            ValueKind::Bool => "bool".to_string(),
            ValueKind::Int => "integer".to_string(),
            ValueKind::Float => "number".to_string(),
            ValueKind::Str => "string".to_string(),
            ValueKind::Enum(choices) => choices.join(" | "),
        }
    }
}

/// One documented configuration key.
#[derive(Debug, Clone, Copy)]
pub struct KeySpec {
    pub name: &'static str,
    pub default: &'static str,
    pub kind: ValueKind,
    pub doc: &'static str,
    /// Web/runtime impact notes shown by `config --explain`.
    pub impact: &'static str,
}

pub const DETECTORS: &[&str] = &["sift", "sift_dsp"];
pub const MATCHERS: &[&str] = &["exhaustive", "sequential", "vocab_tree", "spatial"];
pub const TRAIN_STRATEGIES: &[&str] = &["adaptive", "mcmc", "default", "compression_focused"];

pub const DEFAULT_VOCAB_TREE_URL: &str =
    "https://demuc.de/colmap/vocab_tree_flickr100K_words256K.bin";

pub static KEYS: &[KeySpec] = &[
    KeySpec {
        name: "features.detector",
        default: "sift",
        kind: ValueKind::Enum(DETECTORS),
        doc: "Feature detector model used for extraction",
        impact: "sift_dsp enables domain-size pooling: more robust descriptors, slower extraction",
    },
    KeySpec {
        name: "features.max_per_image",
        default: "8192",
        kind: ValueKind::Int,
        doc: "Maximum number of features extracted per image",
        impact: "Higher values improve matching on textured scenes at the cost of memory",
    },
    KeySpec {
        name: "features.use_gpu",
        default: "true",
        kind: ValueKind::Bool,
        doc: "Run feature extraction and matching on the accelerator",
        impact: "Downgraded to false with a warning when no usable accelerator is present",
    },
    KeySpec {
        name: "features.single_camera",
        default: "true",
        kind: ValueKind::Bool,
        doc: "Assume all images share one camera model",
        impact: "Disable for mixed-device captures",
    },
    KeySpec {
        name: "matching.strategy",
        default: "sequential",
        kind: ValueKind::Enum(MATCHERS),
        doc: "Feature matching strategy",
        impact: "sequential suits video frames; exhaustive is quadratic in image count",
    },
    KeySpec {
        name: "matching.overlap",
        default: "10",
        kind: ValueKind::Int,
        doc: "Neighbouring images matched per image in sequential mode",
        impact: "Larger overlap finds more matches for slow camera motion",
    },
    KeySpec {
        name: "matching.loop_detection",
        default: "true",
        kind: ValueKind::Bool,
        doc: "Enable loop closure in sequential matching (uses the vocab-tree artifact)",
        impact: "Runs without loop detection in degraded mode if the artifact is unavailable",
    },
    KeySpec {
        name: "dense.enabled",
        default: "false",
        kind: ValueKind::Bool,
        doc: "Run dense multi-view stereo after sparse reconstruction",
        impact: "Requires an accelerator; adds a fused point cloud to the package",
    },
    KeySpec {
        name: "train.iterations",
        default: "30000",
        kind: ValueKind::Int,
        doc: "Number of training iterations",
        impact: "More iterations = better quality but longer training (about 1.2 min per 1k)",
    },
    KeySpec {
        name: "train.strategy",
        default: "adaptive",
        kind: ValueKind::Enum(TRAIN_STRATEGIES),
        doc: "Densification strategy",
        impact: "adaptive picks compression, balanced or mcmc from the target file size",
    },
    KeySpec {
        name: "train.gaussian_capacity",
        default: "1000000",
        kind: ValueKind::Int,
        doc: "Maximum number of gaussians",
        impact: "Directly affects file size (about 236 MB per 1M uncompressed) and GPU memory",
    },
    KeySpec {
        name: "train.target_file_size_mb",
        default: "50.0",
        kind: ValueKind::Float,
        doc: "Target exported model size in megabytes",
        impact: "Drives adaptive strategy selection",
    },
    KeySpec {
        name: "train.quality_target_psnr",
        default: "28.0",
        kind: ValueKind::Float,
        doc: "Target PSNR of the trained model",
        impact: "Higher targets need more iterations and gaussians",
    },
    KeySpec {
        name: "workers.threads",
        default: "0",
        kind: ValueKind::Int,
        doc: "Threads given to external tools (0 = all cores)",
        impact: "Lower it to share the host with other jobs",
    },
    KeySpec {
        name: "workers.upload",
        default: "2",
        kind: ValueKind::Int,
        doc: "Parallel transfers used by the object store",
        impact: "Only affects the upload stage",
    },
    KeySpec {
        name: "cache.max_size_gb",
        default: "20",
        kind: ValueKind::Int,
        doc: "Soft limit for cache/ usage reported by status",
        impact: "Exceeding it is reported as degraded; run cleanup to reclaim space",
    },
    KeySpec {
        name: "artifact.vocab_tree_url",
        default: DEFAULT_VOCAB_TREE_URL,
        kind: ValueKind::Str,
        doc: "Download location of the vocabulary tree used for loop closure",
        impact: "Point at a mirror when the default host is unreachable",
    },
    KeySpec {
        name: "artifact.vocab_tree_min_bytes",
        default: "1000000",
        kind: ValueKind::Int,
        doc: "Minimum byte size for a cached vocabulary tree to be considered valid",
        impact: "Smaller files are treated as truncated and re-downloaded",
    },
    KeySpec {
        name: "artifact.vocab_tree_sha256",
        default: "",
        kind: ValueKind::Str,
        doc: "Optional SHA-256 of the vocabulary tree (empty = size check only)",
        impact: "Pins the artifact to an exact build",
    },
    KeySpec {
        name: "artifact.retries",
        default: "3",
        kind: ValueKind::Int,
        doc: "Total download attempts per artifact fetch, the first one included",
        impact: "Each attempt is re-validated before the next",
    },
    KeySpec {
        name: "tools.reconstruction",
        default: "colmap",
        kind: ValueKind::Str,
        doc: "Structure-from-motion executable",
        impact: "Must provide feature_extractor, *_matcher, mapper and MVS subcommands",
    },
    KeySpec {
        name: "tools.trainer",
        default: "gsplat-train",
        kind: ValueKind::Str,
        doc: "Gaussian splatting trainer executable",
        impact: "Invoked with --colmap_path/--output_path and training parameters",
    },
    KeySpec {
        name: "env.python",
        default: "python3",
        kind: ValueKind::Str,
        doc: "Interpreter used to create the training environment",
        impact: "Needs the venv module",
    },
    KeySpec {
        name: "env.trainer_package",
        default: "gsplat",
        kind: ValueKind::Str,
        doc: "Package installed into the training environment",
        impact: "Pin a version with e.g. gsplat==1.4.0",
    },
    KeySpec {
        name: "accelerator.required",
        default: "true",
        kind: ValueKind::Bool,
        doc: "Abort detection when no accelerator driver is present",
        impact: "Set false for CPU-only dry runs",
    },
    KeySpec {
        name: "preflight.min_memory_gb",
        default: "8",
        kind: ValueKind::Int,
        doc: "Minimum available system memory",
        impact: "Checked before any phase starts",
    },
    KeySpec {
        name: "preflight.min_disk_gb",
        default: "20",
        kind: ValueKind::Int,
        doc: "Minimum free disk space in the workspace",
        impact: "Checked before any phase starts",
    },
    KeySpec {
        name: "stages.gpu_fallback",
        default: "true",
        kind: ValueKind::Bool,
        doc: "Retry a failed GPU feature stage once with the GPU disabled",
        impact: "Recovers from accelerator out-of-memory at the cost of speed",
    },
    KeySpec {
        name: "package.compress",
        default: "true",
        kind: ValueKind::Bool,
        doc: "Also ship a gzip copy of the exported splat model",
        impact: "Roughly halves transfer size for web delivery",
    },
    KeySpec {
        name: "upload.enabled",
        default: "false",
        kind: ValueKind::Bool,
        doc: "Upload the run package to object storage",
        impact: "Requires upload.prefix and storage.root",
    },
    KeySpec {
        name: "upload.prefix",
        default: "",
        kind: ValueKind::Str,
        doc: "Object storage prefix receiving the run package",
        impact: "The run id is appended as a sub-prefix",
    },
    KeySpec {
        name: "input.prefix",
        default: "",
        kind: ValueKind::Str,
        doc: "Object storage prefix to fetch input images from (empty = use input/ as is)",
        impact: "Fetched before the image count check",
    },
    KeySpec {
        name: "storage.root",
        default: "",
        kind: ValueKind::Str,
        doc: "Mounted directory backing the object store",
        impact: "Prefixes map to sub-directories of this root",
    },
];

/// Look up a recognized key.
pub fn spec(name: &str) -> Option<&'static KeySpec> {
    KEYS.iter().find(|k| k.name == name)
}

/// Environment variable carrying a key: `SPLATFORGE_` + key with `.` as `_`, upper-cased.
pub fn env_var_name(key: &str) -> String {
    format!("SPLATFORGE_{}", key.replace('.', "_").to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_key_names_are_unique() {
        let names: HashSet<_> = KEYS.iter().map(|k| k.name).collect();
        assert_eq!(names.len(), KEYS.len());
    }

    #[test]
    fn test_enum_defaults_are_members() {
        for key in KEYS {
            if let ValueKind::Enum(choices) = key.kind {
                assert!(choices.contains(&key.default), "{}", key.name);
            }
        }
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(env_var_name("train.iterations"), "SPLATFORGE_TRAIN_ITERATIONS");
        assert_eq!(env_var_name("features.max_per_image"), "SPLATFORGE_FEATURES_MAX_PER_IMAGE");
    }

    #[test]
    fn test_unknown_key() {
        assert!(spec("train.speed").is_none());
        assert!(spec("matching.strategy").is_some());
    }
}
