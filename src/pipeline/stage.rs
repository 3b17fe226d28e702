//! Reconstruction stage state machine.
//!
//! Stages run strictly in declared order. `DenseReconstruct` and `Upload` are
//! optional and may be bypassed; `Failed` is reachable from every live state.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    AcquireInput,
    ExtractFeatures,
    MatchFeatures,
    SparseReconstruct,
    DenseReconstruct,
    TrainModel,
    PackageResults,
    Upload,
    Done,
    Failed,
}

impl Stage {
    /// Working stages in execution order.
    pub const ORDER: [Stage; 8] = [
        Stage::AcquireInput,
        Stage::ExtractFeatures,
        Stage::MatchFeatures,
        Stage::SparseReconstruct,
        Stage::DenseReconstruct,
        Stage::TrainModel,
        Stage::PackageResults,
        Stage::Upload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::AcquireInput => "ACQUIRE_INPUT",
            Stage::ExtractFeatures => "EXTRACT_FEATURES",
            Stage::MatchFeatures => "MATCH_FEATURES",
            Stage::SparseReconstruct => "SPARSE_RECONSTRUCT",
            Stage::DenseReconstruct => "DENSE_RECONSTRUCT",
            Stage::TrainModel => "TRAIN_MODEL",
            Stage::PackageResults => "PACKAGE_RESULTS",
            Stage::Upload => "UPLOAD",
            Stage::Done => "DONE",
            Stage::Failed => "FAILED",
        }
    }

    /// Whether the stage can be bypassed by configuration.
    pub fn is_optional(&self) -> bool {
        matches!(self, Stage::DenseReconstruct | Stage::Upload)
    }

    /// Whether a completed run of this stage is recorded in the stage ledger.
    ///
    /// Packaging and upload always execute; their products are per-run.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Stage::ExtractFeatures
                | Stage::MatchFeatures
                | Stage::SparseReconstruct
                | Stage::DenseReconstruct
                | Stage::TrainModel
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    /// All states reachable in one step from this one.
    pub fn valid_next_stages(&self) -> Vec<Stage> {
        match self {
            Stage::AcquireInput => vec![Stage::ExtractFeatures, Stage::Failed],
            Stage::ExtractFeatures => vec![Stage::MatchFeatures, Stage::Failed],
            Stage::MatchFeatures => vec![Stage::SparseReconstruct, Stage::Failed],
            Stage::SparseReconstruct => {
                vec![Stage::DenseReconstruct, Stage::TrainModel, Stage::Failed]
            }
            Stage::DenseReconstruct => vec![Stage::TrainModel, Stage::Failed],
            Stage::TrainModel => vec![Stage::PackageResults, Stage::Failed],
            Stage::PackageResults => vec![Stage::Upload, Stage::Done, Stage::Failed],
            Stage::Upload => vec![Stage::Done, Stage::Failed],
            Stage::Done | Stage::Failed => vec![],
        }
    }

    pub fn can_transition_to(&self, next: Stage) -> bool {
        self.valid_next_stages().contains(&next)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the current stage of one run and rejects out-of-order moves.
#[derive(Debug, Clone)]
pub struct StageCursor {
    current: Stage,
    history: Vec<Stage>,
}

impl StageCursor {
    pub fn new() -> Self {
        StageCursor {
            current: Stage::AcquireInput,
            history: vec![Stage::AcquireInput],
        }
    }

    pub fn current(&self) -> Stage {
        self.current
    }

    pub fn history(&self) -> &[Stage] {
        &self.history
    }

    pub fn transition_to(&mut self, next: Stage) -> Result<(), String> {
        if !self.current.can_transition_to(next) {
            return Err(format!(
                "Invalid stage transition: {} -> {}",
                self.current, next
            ));
        }
        self.current = next;
        self.history.push(next);
        Ok(())
    }
}

impl Default for StageCursor {
    fn default() -> Self {
        Self::new()
    }
}
