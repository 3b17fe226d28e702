//! Provisioning phases.
//!
//! - **host-prep** (`prep`): workspace layout and capability snapshot
//! - **environment** (`environment`): training environment for the detected runtime
//! - **tool-check** (`toolcheck`): reconstruction tool and trainer respond
//!
//! Each phase returns a `ValidityMarker` describing what it produced; the
//! runner skips a phase on later runs only while that marker still holds.

pub mod environment;
pub mod prep;
pub mod toolcheck;

pub use environment::EnvironmentPhase;
pub use prep::HostPrepPhase;
pub use toolcheck::ToolCheckPhase;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::error::PhaseError;
use crate::models::{CapabilityProfile, ValidityMarker};
use crate::pipeline::tools::{ToolInvocation, ToolOutput, ToolRunner};
use crate::system::paths::WorkspaceLayout;

/// Everything a phase may read. Phases never mutate configuration.
#[derive(Clone)]
pub struct PhaseContext {
    pub layout: WorkspaceLayout,
    pub config: PipelineConfig,
    pub profile: CapabilityProfile,
    pub runner: Arc<dyn ToolRunner>,
}

impl PhaseContext {
    /// Run a tool for `phase`, turning launch errors and non-zero exits into `PhaseError`.
    pub(crate) async fn run_tool(
        &self,
        phase: &str,
        invocation: &ToolInvocation,
    ) -> Result<ToolOutput, PhaseError> {
        let output = self
            .runner
            .run(invocation)
            .await
            .map_err(|e| PhaseError::Failed {
                phase: phase.to_string(),
                reason: e.to_string(),
                diagnostics: Vec::new(),
            })?;

        if !output.success() {
            return Err(PhaseError::Failed {
                phase: phase.to_string(),
                reason: format!(
                    "'{}' exited with {}",
                    invocation.label(),
                    output
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string())
                ),
                diagnostics: output.tail,
            });
        }
        Ok(output)
    }
}

#[async_trait]
pub trait Phase: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce the phase's product and describe it.
    async fn execute(&self, ctx: &PhaseContext) -> Result<ValidityMarker, PhaseError>;

    /// Phase-specific content check, on top of the marker's file fingerprints.
    fn is_valid(&self, ctx: &PhaseContext, marker: &ValidityMarker) -> bool;
}

/// The provisioning sequence, in execution order.
pub fn default_phases() -> Vec<Box<dyn Phase>> {
    vec![
        Box::new(HostPrepPhase),
        Box::new(EnvironmentPhase::default()),
        Box::new(ToolCheckPhase),
    ]
}

pub(crate) fn failed(phase: &str, reason: impl Into<String>) -> PhaseError {
    PhaseError::Failed {
        phase: phase.to_string(),
        reason: reason.into(),
        diagnostics: Vec::new(),
    }
}
