//! Workspace status report
//!
//! Read-only summary of phase validity, cache usage and the most recent run.
//! Nothing here executes a phase or a tool.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::config::PipelineConfig;
use crate::hardware;
use crate::models::{CapabilityProfile, PhaseStatus, RunRecord};
use crate::orchestrator::PhaseSummary;
use crate::pipeline::history;
use crate::system::integrity;
use crate::system::paths::WorkspaceLayout;

const GIB: u64 = 1024 * 1024 * 1024;

/// Status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Every phase valid, cache within limits, last run (if any) succeeded
    Ready,
    /// Usable, but the cache is over its limit or the last run failed
    Degraded,
    /// Some phase has never completed or no longer validates
    Incomplete,
    /// A phase failed on its last attempt
    Failed,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ready => "Ready",
            HealthStatus::Degraded => "Degraded",
            HealthStatus::Incomplete => "Incomplete",
            HealthStatus::Failed => "Failed",
        }
    }

    pub fn needs_fix(&self) -> bool {
        matches!(self, HealthStatus::Incomplete | HealthStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: HealthStatus,
    pub workspace: String,
    pub phases: Vec<(String, PhaseStatus)>,
    pub capability: Option<CapabilityProfile>,
    pub cache_usage_bytes: u64,
    pub cache_limit_bytes: u64,
    pub last_run: Option<RunRecord>,
    pub message: String,
}

pub struct StatusReporter;

impl StatusReporter {
    pub fn collect(
        layout: &WorkspaceLayout,
        config: &PipelineConfig,
        phases: &PhaseSummary,
    ) -> StatusReport {
        let cache_usage_bytes = integrity::dir_size(&layout.cache_dir());
        let cache_limit_bytes = config
            .u64("cache.max_size_gb")
            .map(|gb| gb.saturating_mul(GIB))
            .unwrap_or(u64::MAX);

        let last_run = history::last(&layout.run_history()).unwrap_or_else(|e| {
            log::warn!("[Status] Could not read run history: {}", e);
            None
        });

        let statuses: Vec<PhaseStatus> = phases.statuses.iter().map(|(_, s)| *s).collect();
        let (status, message) = if statuses.contains(&PhaseStatus::Failed) {
            (
                HealthStatus::Failed,
                "A provisioning phase failed; run `splatforge run` after fixing it".to_string(),
            )
        } else if statuses
            .iter()
            .any(|s| !matches!(s, PhaseStatus::Succeeded | PhaseStatus::Skipped))
        {
            (
                HealthStatus::Incomplete,
                "Provisioning incomplete; `splatforge run` will finish it".to_string(),
            )
        } else if cache_usage_bytes > cache_limit_bytes {
            (
                HealthStatus::Degraded,
                "Cache exceeds cache.max_size_gb; run `splatforge cleanup`".to_string(),
            )
        } else if last_run.as_ref().map(|r| !r.succeeded).unwrap_or(false) {
            (
                HealthStatus::Degraded,
                "Last run failed; completed stages will be resumed".to_string(),
            )
        } else {
            (HealthStatus::Ready, "Workspace is ready".to_string())
        };

        StatusReport {
            status,
            workspace: layout.root().display().to_string(),
            phases: phases.statuses.clone(),
            capability: hardware::read_snapshot(&layout.capability_snapshot()),
            cache_usage_bytes,
            cache_limit_bytes,
            last_run,
            message,
        }
    }
}

impl StatusReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Workspace: {}", self.workspace);
        let _ = writeln!(out, "Status:    {} ({})", self.status.as_str(), self.message);

        let _ = writeln!(out, "\nPhases:");
        for (name, status) in &self.phases {
            let _ = writeln!(out, "  {:<12} {}", name, status.as_str());
        }

        match &self.capability {
            Some(profile) => {
                let _ = writeln!(
                    out,
                    "\nAccelerator: {} x{} ({}, runtime {})",
                    profile.device_name.as_deref().unwrap_or("none"),
                    profile.device_count,
                    profile.architecture_tag,
                    profile.runtime_variant
                );
            }
            None => {
                let _ = writeln!(out, "\nAccelerator: not detected yet");
            }
        }

        let _ = writeln!(
            out,
            "Cache:       {:.2} GB of {} GB",
            self.cache_usage_bytes as f64 / GIB as f64,
            self.cache_limit_bytes / GIB
        );

        match &self.last_run {
            Some(run) => {
                let _ = writeln!(
                    out,
                    "\nLast run {} at {}: {} ({} images)",
                    run.run_id,
                    run.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    if run.succeeded { "succeeded" } else { "failed" },
                    run.input_count
                );
                for outcome in &run.stage_outcomes {
                    let _ = writeln!(
                        out,
                        "  {:<20} {:<10} {}",
                        outcome.stage.as_str(),
                        outcome.status.as_str(),
                        outcome.detail.as_deref().unwrap_or("")
                    );
                }
                if let Some(location) = &run.output_location {
                    let _ = writeln!(out, "  output: {}", location.display());
                }
            }
            None => {
                let _ = writeln!(out, "\nNo runs recorded");
            }
        }
        out
    }
}
