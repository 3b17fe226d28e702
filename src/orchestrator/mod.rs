//! Provisioning orchestration: ordered, idempotent, fail-fast phases.
//!
//! `PhaseRunner::run` walks the phases in order. A phase whose recorded
//! marker still matches the files on disk *and* passes the phase's own
//! check is skipped; anything else executes. The first failure halts the
//! sequence without rolling back earlier phases.

pub mod phases;
pub mod state;

pub use phases::{default_phases, Phase, PhaseContext};
pub use state::PhaseLedger;

use std::fs;
use std::io;
use std::path::Path;

use crate::error::PhaseError;
use crate::models::PhaseStatus;
use crate::system::integrity;
use crate::system::paths::WorkspaceLayout;

/// Status of every phase after a `run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSummary {
    pub statuses: Vec<(String, PhaseStatus)>,
}

impl PhaseSummary {
    pub fn status(&self, name: &str) -> Option<PhaseStatus> {
        self.statuses
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| *s)
    }

    pub fn executed(&self) -> usize {
        self.statuses
            .iter()
            .filter(|(_, s)| *s == PhaseStatus::Succeeded)
            .count()
    }
}

pub struct PhaseRunner {
    ctx: PhaseContext,
}

impl PhaseRunner {
    pub fn new(ctx: PhaseContext) -> Self {
        PhaseRunner { ctx }
    }

    pub fn context(&self) -> &PhaseContext {
        &self.ctx
    }

    /// Whether a recorded phase may be skipped.
    fn still_valid(&self, phase: &dyn Phase, ledger: &PhaseLedger) -> bool {
        let record = match ledger.get(phase.name()) {
            Some(record) => record,
            None => return false,
        };
        if !matches!(record.status, PhaseStatus::Succeeded | PhaseStatus::Skipped) {
            return false;
        }
        let marker = match &record.marker {
            Some(marker) => marker,
            None => return false,
        };
        if !integrity::marker_matches(self.ctx.layout.root(), marker) {
            log::info!(
                "[Provision] [{}] Recorded product changed on disk, re-running",
                phase.name()
            );
            return false;
        }
        phase.is_valid(&self.ctx, marker)
    }

    pub async fn run(&self, phases: &[Box<dyn Phase>]) -> Result<PhaseSummary, PhaseError> {
        self.ctx.layout.ensure()?;
        let mut ledger = PhaseLedger::load(&self.ctx.layout.phase_ledger())?;
        let mut statuses = Vec::with_capacity(phases.len());

        for phase in phases {
            let name = phase.name();

            if self.still_valid(phase.as_ref(), &ledger) {
                log::info!(target: "parsed", "[Provision] [{}] Skipped (still valid)", name);
                ledger.mark_skipped(name);
                ledger.save()?;
                statuses.push((name.to_string(), PhaseStatus::Skipped));
                continue;
            }

            log::info!(target: "parsed", "[Provision] [{}] Running", name);
            ledger.mark_running(name);
            ledger.save()?;

            match phase.execute(&self.ctx).await {
                Ok(marker) => {
                    ledger.mark_succeeded(name, marker);
                    ledger.save()?;
                    log::info!(target: "parsed", "[Provision] [{}] Succeeded", name);
                    statuses.push((name.to_string(), PhaseStatus::Succeeded));
                }
                Err(e) => {
                    log::error!("[Provision] [{}] Failed: {}", name, e);
                    ledger.mark_failed(name, e.to_string());
                    ledger.save()?;
                    return Err(e);
                }
            }
        }

        Ok(PhaseSummary { statuses })
    }

    /// Check every phase without executing anything.
    pub fn verify(&self, phases: &[Box<dyn Phase>]) -> Result<PhaseSummary, PhaseError> {
        let ledger = PhaseLedger::load(&self.ctx.layout.phase_ledger())?;
        let statuses = phases
            .iter()
            .map(|phase| {
                let status = if self.still_valid(phase.as_ref(), &ledger) {
                    PhaseStatus::Succeeded
                } else {
                    ledger
                        .get(phase.name())
                        .map(|r| match r.status {
                            PhaseStatus::Failed => PhaseStatus::Failed,
                            _ => PhaseStatus::Pending,
                        })
                        .unwrap_or(PhaseStatus::Pending)
                };
                (phase.name().to_string(), status)
            })
            .collect();
        Ok(PhaseSummary { statuses })
    }
}

fn remove_dir_contents(dir: &Path) -> io::Result<u64> {
    if !dir.exists() {
        return Ok(0);
    }
    let freed = integrity::dir_size(dir);
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(freed)
}

/// Delete build byproducts and stage scratch space. Returns bytes freed.
///
/// Phase markers, the environment, artifacts and packaged outputs are kept;
/// the stage ledger goes with the stage outputs it describes.
pub fn cleanup(layout: &WorkspaceLayout) -> io::Result<u64> {
    let mut freed = remove_dir_contents(&layout.build_dir())?;
    freed += remove_dir_contents(&layout.work_dir())?;

    let stage_ledger = layout.stage_ledger();
    if stage_ledger.exists() {
        fs::remove_file(&stage_ledger)?;
    }

    log::info!(
        target: "parsed",
        "[Provision] [CLEANUP] Freed {:.1} MB",
        freed as f64 / (1024.0 * 1024.0)
    );
    Ok(freed)
}
