//! Unified error type hierarchy for splatforge
//!
//! Provides structured error handling with DetectionError, ResourceError,
//! ConfigError, PhaseError, ArtifactError, StageError and the top-level AppError
//! rendered by the binary's single reporter.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::pipeline::Stage;

/// Capability detection errors. Only a missing mandatory driver is fatal.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Accelerator driver not found: {0}")]
    DriverMissing(String),

    #[error("IO error during capability detection: {0}")]
    IoError(#[from] io::Error),
}

/// Preflight resource shortages found before any phase starts.
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Insufficient memory: {available_gb} GB available, {required_gb} GB required")]
    InsufficientMemory { available_gb: u64, required_gb: u64 },

    #[error("Insufficient disk space at {path}: {available_gb} GB free, {required_gb} GB required")]
    InsufficientDisk {
        path: String,
        available_gb: u64,
        required_gb: u64,
    },
}

/// Configuration file parsing, resolution and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown configuration key: {0}")]
    NotFound(String),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Conflicting settings detected: {0}")]
    ConflictDetected(String),

    #[error("Malformed config line {line}: {reason}")]
    ParseFailed { line: usize, reason: String },

    #[error("Unknown preset: {0}")]
    UnknownPreset(String),

    #[error("IO error during config operations: {0}")]
    IoError(#[from] io::Error),
}

/// Provisioning phase failures.
#[derive(Error, Debug)]
pub enum PhaseError {
    #[error("Phase '{phase}' failed: {reason}")]
    Failed {
        phase: String,
        reason: String,
        diagnostics: Vec<String>,
    },

    #[error("Phase ledger error: {0}")]
    Ledger(String),

    #[error("IO error during provisioning: {0}")]
    IoError(#[from] io::Error),
}

impl PhaseError {
    /// Name of the phase that failed, if the error is tied to one.
    pub fn phase(&self) -> Option<&str> {
        match self {
            PhaseError::Failed { phase, .. } => Some(phase),
            _ => None,
        }
    }
}

/// Artifact fetch and integrity errors.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Unknown artifact: {0}")]
    UnknownArtifact(String),

    #[error("Download of '{id}' failed: {reason}")]
    Download { id: String, reason: String },

    #[error("Artifact '{id}' failed integrity check: {reason}")]
    Integrity { id: String, reason: String },

    #[error("Artifact '{id}' unavailable after {attempts} attempt(s): {last_error}")]
    Exhausted {
        id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("IO error during artifact caching: {0}")]
    IoError(#[from] io::Error),
}

/// Errors raised while launching an external tool.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to launch '{program}': {reason}")]
    Launch { program: String, reason: String },

    #[error("IO error while running '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Object storage collaborator errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object storage is not configured: {0}")]
    NotConfigured(String),

    #[error("Prefix '{0}' not found in object storage")]
    PrefixNotFound(String),

    #[error("IO error during object storage transfer: {0}")]
    IoError(#[from] io::Error),
}

/// Stage failures. Always fatal to the current run.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Insufficient input: found {found} image(s), at least {required} required")]
    InsufficientInput { found: usize, required: usize },

    #[error("{stage}: precondition failed: {reason}")]
    Precondition { stage: Stage, reason: String },

    #[error("{stage}: {source}")]
    Launch {
        stage: Stage,
        #[source]
        source: ToolError,
    },

    #[error("{stage}: '{tool}' exited with {}", exit_label(.exit_code))]
    ToolFailed {
        stage: Stage,
        tool: String,
        exit_code: Option<i32>,
        diagnostics: Vec<String>,
    },

    #[error("{stage}: expected output missing or invalid: {}", .path.display())]
    MissingOutput {
        stage: Stage,
        path: PathBuf,
        diagnostics: Vec<String>,
    },

    #[error("{stage}: required artifact unavailable: {source}")]
    Artifact {
        stage: Stage,
        #[source]
        source: ArtifactError,
    },

    #[error("{stage}: object storage transfer failed: {source}")]
    Storage {
        stage: Stage,
        #[source]
        source: StorageError,
    },

    #[error("{stage}: IO error: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: io::Error,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

impl StageError {
    /// The stage this error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            StageError::InsufficientInput { .. } => Stage::AcquireInput,
            StageError::Precondition { stage, .. }
            | StageError::Launch { stage, .. }
            | StageError::ToolFailed { stage, .. }
            | StageError::MissingOutput { stage, .. }
            | StageError::Artifact { stage, .. }
            | StageError::Storage { stage, .. }
            | StageError::Io { stage, .. } => *stage,
        }
    }

    /// The external tool's last diagnostic lines, when a tool was involved.
    pub fn diagnostics(&self) -> &[String] {
        match self {
            StageError::ToolFailed { diagnostics, .. }
            | StageError::MissingOutput { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }

    pub(crate) fn io(stage: Stage, source: io::Error) -> Self {
        StageError::Io { stage, source }
    }
}

/// A pipeline run that halted on a stage error.
///
/// Carries the location of the best-effort partial package, if one was written.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct PipelineFailure {
    #[source]
    pub error: StageError,
    pub partial_output: Option<PathBuf>,
}

/// Global error type rendered by the top-level reporter.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Detection(#[from] DetectionError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Pipeline(#[from] PipelineFailure),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AppError {
    /// Where the run stopped, for the headline of the final report.
    pub fn failed_step(&self) -> String {
        match self {
            AppError::Detection(_) => "capability detection".to_string(),
            AppError::Resource(_) => "resource preflight".to_string(),
            AppError::Config(_) => "configuration".to_string(),
            AppError::Phase(e) => match e.phase() {
                Some(phase) => format!("phase '{}'", phase),
                None => "provisioning".to_string(),
            },
            AppError::Artifact(_) => "artifact cache".to_string(),
            AppError::Pipeline(f) => format!("stage {}", f.error.stage()),
            AppError::Io(_) => "workspace I/O".to_string(),
        }
    }

    /// Get a user-facing error message suitable for terminal display
    pub fn user_message(&self) -> String {
        format!("Failed at {}: {}", self.failed_step(), self)
    }

    /// Last diagnostic lines from the external tool involved, if any.
    pub fn diagnostics(&self) -> &[String] {
        match self {
            AppError::Pipeline(f) => f.error.diagnostics(),
            AppError::Phase(PhaseError::Failed { diagnostics, .. }) => diagnostics,
            _ => &[],
        }
    }

    /// A suggested next action for the user.
    pub fn remediation(&self) -> String {
        match self {
            AppError::Detection(_) => {
                "Install the GPU driver (nvidia-smi must work), or set accelerator.required=false to run CPU-only".to_string()
            }
            AppError::Resource(ResourceError::InsufficientMemory { .. }) => {
                "Use a host with more memory, or re-run with --preset fast".to_string()
            }
            AppError::Resource(ResourceError::InsufficientDisk { .. }) => {
                "Free disk space in the workspace or run `splatforge cleanup`".to_string()
            }
            AppError::Config(ConfigError::NotFound(_)) => {
                "Run `splatforge config` to list recognized keys".to_string()
            }
            AppError::Config(_) => {
                "Fix the offending value in the config file, environment or --set flags".to_string()
            }
            AppError::Phase(_) => {
                "Inspect the phase output in logs/ and re-run; completed phases are skipped".to_string()
            }
            AppError::Artifact(_) => {
                "Check network access to the artifact URL, or choose a matching strategy that does not need it".to_string()
            }
            AppError::Pipeline(f) => match &f.error {
                StageError::InsufficientInput { required, .. } => {
                    format!("Provide at least {} images in the input directory", required)
                }
                StageError::Artifact { .. } => {
                    "Re-run with matching.strategy=sequential or exhaustive".to_string()
                }
                StageError::ToolFailed { .. } | StageError::MissingOutput { .. } => {
                    "Re-run with a reduced-quality preset (e.g. --preset fast); completed stages are resumed".to_string()
                }
                _ => "Inspect logs/ for details and re-run; completed stages are resumed".to_string(),
            },
            AppError::Io(_) => "Check workspace permissions and free space".to_string(),
        }
    }

    /// Process exit code for this error class.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Detection(_) => 3,
            AppError::Resource(_) => 4,
            AppError::Config(_) => 5,
            AppError::Phase(_) => 6,
            AppError::Artifact(_) => 7,
            AppError::Pipeline(_) => 8,
            AppError::Io(_) => 1,
        }
    }
}

/// Top-level result type for operations that may fail.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_error_display() {
        let err = DetectionError::DriverMissing("nvidia-smi not found".to_string());
        assert_eq!(
            err.to_string(),
            "Accelerator driver not found: nvidia-smi not found"
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::NotFound("train.speed".to_string());
        assert_eq!(err.to_string(), "Unknown configuration key: train.speed");
    }

    #[test]
    fn test_stage_error_names_stage() {
        let err = StageError::ToolFailed {
            stage: Stage::SparseReconstruct,
            tool: "colmap".to_string(),
            exit_code: Some(1),
            diagnostics: vec!["No good initial image pair found.".to_string()],
        };
        assert_eq!(err.stage(), Stage::SparseReconstruct);
        assert!(err.to_string().contains("SPARSE_RECONSTRUCT"));
        assert!(err.to_string().contains("exit code 1"));
        assert_eq!(err.diagnostics().len(), 1);
    }

    #[test]
    fn test_insufficient_input_belongs_to_acquire() {
        let err = StageError::InsufficientInput {
            found: 2,
            required: 3,
        };
        assert_eq!(err.stage(), Stage::AcquireInput);
    }

    #[test]
    fn test_app_error_report_contains_stage_and_remediation() {
        let err = AppError::from(PipelineFailure {
            error: StageError::ToolFailed {
                stage: Stage::TrainModel,
                tool: "gsplat-train".to_string(),
                exit_code: Some(137),
                diagnostics: vec!["CUDA out of memory".to_string()],
            },
            partial_output: None,
        });
        assert!(err.user_message().contains("stage TRAIN_MODEL"));
        assert!(err.remediation().contains("--preset fast"));
        assert_eq!(err.diagnostics(), ["CUDA out of memory".to_string()]);
        assert_eq!(err.exit_code(), 8);
    }

    #[test]
    fn test_phase_error_names_phase() {
        let err = AppError::from(PhaseError::Failed {
            phase: "environment".to_string(),
            reason: "pip exited with 1".to_string(),
            diagnostics: Vec::new(),
        });
        assert_eq!(err.failed_step(), "phase 'environment'");
    }
}
