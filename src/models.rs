//! Core data types for splatforge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::pipeline::Stage;

/// GPU compute architecture tag used to pick compiled kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchitectureTag {
    /// Pascal (P100, GTX 10xx)
    Sm60,
    /// Volta (V100). Safe default for unrecognized devices.
    Sm70,
    /// Turing (T4, RTX 20xx)
    Sm75,
    /// Ampere datacenter (A100, A30)
    Sm80,
    /// Ampere workstation/consumer (A10, A40, RTX 30xx, RTX A6000)
    Sm86,
    /// Ada Lovelace (L4, L40, RTX 40xx)
    Sm89,
    /// Hopper (H100, H200, GH200)
    Sm90,
    /// Blackwell (B100, B200)
    Sm100,
}

impl ArchitectureTag {
    /// Architecture assumed when the device is not in the mapping table.
    pub const SAFE_DEFAULT: ArchitectureTag = ArchitectureTag::Sm70;

    pub fn as_str(&self) -> &'static str {
        match self {
            ArchitectureTag::Sm60 => "sm60",
            ArchitectureTag::Sm70 => "sm70",
            ArchitectureTag::Sm75 => "sm75",
            ArchitectureTag::Sm80 => "sm80",
            ArchitectureTag::Sm86 => "sm86",
            ArchitectureTag::Sm89 => "sm89",
            ArchitectureTag::Sm90 => "sm90",
            ArchitectureTag::Sm100 => "sm100",
        }
    }

    /// Compute capability in the `major.minor` form build tools expect.
    pub fn compute_capability(&self) -> &'static str {
        match self {
            ArchitectureTag::Sm60 => "6.0",
            ArchitectureTag::Sm70 => "7.0",
            ArchitectureTag::Sm75 => "7.5",
            ArchitectureTag::Sm80 => "8.0",
            ArchitectureTag::Sm86 => "8.6",
            ArchitectureTag::Sm89 => "8.9",
            ArchitectureTag::Sm90 => "9.0",
            ArchitectureTag::Sm100 => "10.0",
        }
    }
}

impl fmt::Display for ArchitectureTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime package variant matching the installed compute toolkit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeVariant {
    Cpu,
    Cu118,
    Cu121,
    Cu124,
}

impl RuntimeVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeVariant::Cpu => "cpu",
            RuntimeVariant::Cu118 => "cu118",
            RuntimeVariant::Cu121 => "cu121",
            RuntimeVariant::Cu124 => "cu124",
        }
    }

    pub fn is_accelerated(&self) -> bool {
        !matches!(self, RuntimeVariant::Cpu)
    }
}

impl fmt::Display for RuntimeVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detected compute capabilities of the host. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    pub accelerator_present: bool,
    pub driver_version: Option<String>,
    pub toolkit_version: Option<String>,
    pub device_name: Option<String>,
    pub device_count: u32,
    pub architecture_tag: ArchitectureTag,
    pub runtime_variant: RuntimeVariant,
}

impl CapabilityProfile {
    /// Profile of a host without any accelerator.
    pub fn cpu_only() -> Self {
        CapabilityProfile {
            accelerator_present: false,
            driver_version: None,
            toolkit_version: None,
            device_name: None,
            device_count: 0,
            architecture_tag: ArchitectureTag::SAFE_DEFAULT,
            runtime_variant: RuntimeVariant::Cpu,
        }
    }

    /// Whether GPU-backed external tool paths may be used.
    pub fn gpu_usable(&self) -> bool {
        self.accelerator_present && self.runtime_variant.is_accelerated()
    }
}

/// Lifecycle of a provisioning phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Succeeded => "succeeded",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        }
    }
}

/// Size and content hash of one file covered by a validity marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

/// Persisted assertion that a phase or stage output is complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityMarker {
    pub completed_at: DateTime<Utc>,
    /// Free-form facts the phase/stage was validated against (e.g. runtime variant).
    pub facts: Vec<(String, String)>,
    pub files: Vec<FileFingerprint>,
}

impl ValidityMarker {
    pub fn new(files: Vec<FileFingerprint>) -> Self {
        ValidityMarker {
            completed_at: Utc::now(),
            facts: Vec::new(),
            files,
        }
    }

    pub fn with_fact(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.facts.push((key.into(), value.into()));
        self
    }

    pub fn fact(&self, key: &str) -> Option<&str> {
        self.facts
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Ledger entry of one provisioning phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: String,
    pub status: PhaseStatus,
    pub marker: Option<ValidityMarker>,
    pub error: Option<String>,
}

impl PhaseRecord {
    pub fn pending(name: impl Into<String>) -> Self {
        PhaseRecord {
            name: name.into(),
            status: PhaseStatus::Pending,
            marker: None,
            error: None,
        }
    }
}

/// Result of one pipeline stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Succeeded,
    Skipped,
    Degraded,
    Failed,
    NotRun,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Succeeded => "succeeded",
            StageStatus::Skipped => "skipped",
            StageStatus::Degraded => "degraded",
            StageStatus::Failed => "failed",
            StageStatus::NotRun => "not-run",
        }
    }

    /// Whether the next stage may start after this outcome.
    pub fn allows_progress(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Skipped | StageStatus::Degraded
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: Stage,
    pub status: StageStatus,
    pub duration_ms: u64,
    pub detail: Option<String>,
}

/// Audit entry appended at the end of every pipeline execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub input_count: usize,
    pub stage_outcomes: Vec<StageOutcome>,
    pub output_location: Option<PathBuf>,
    pub succeeded: bool,
}

impl RunRecord {
    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stage_outcomes.iter().find(|o| o.stage == stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_variant_ordering_is_monotonic() {
        assert!(RuntimeVariant::Cpu < RuntimeVariant::Cu118);
        assert!(RuntimeVariant::Cu118 < RuntimeVariant::Cu121);
        assert!(RuntimeVariant::Cu121 < RuntimeVariant::Cu124);
    }

    #[test]
    fn test_cpu_only_profile_has_defined_tags() {
        let profile = CapabilityProfile::cpu_only();
        assert_eq!(profile.architecture_tag, ArchitectureTag::SAFE_DEFAULT);
        assert_eq!(profile.runtime_variant, RuntimeVariant::Cpu);
        assert!(!profile.gpu_usable());
    }

    #[test]
    fn test_marker_facts() {
        let marker = ValidityMarker::new(Vec::new()).with_fact("runtime", "cu121");
        assert_eq!(marker.fact("runtime"), Some("cu121"));
        assert_eq!(marker.fact("missing"), None);
    }

    #[test]
    fn test_stage_status_progress() {
        assert!(StageStatus::Skipped.allows_progress());
        assert!(StageStatus::Degraded.allows_progress());
        assert!(!StageStatus::Failed.allows_progress());
    }

    #[test]
    fn test_architecture_tag_serializes_lowercase() {
        let json = serde_json::to_string(&ArchitectureTag::Sm86).unwrap();
        assert_eq!(json, "\"sm86\"");
    }
}
