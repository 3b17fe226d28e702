//! Reconstruction pipeline driver.
//!
//! Stages run strictly in order through `StageCursor`. A resumable stage is
//! skipped only while its ledger entry still validates; the first stage that
//! executes invalidates every later entry, so everything downstream re-runs.
//! Any stage error halts the run, salvages a partial package and is returned
//! together with the run record that was appended to the history.

pub mod history;
pub mod packaging;
pub mod reconstruction;
pub mod stage;
pub mod storage;
pub mod tools;
pub mod training;
pub mod validity;

pub use stage::{Stage, StageCursor};

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::cache::{artifact::VOCAB_TREE, ArtifactCache};
use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineFailure, StageError, StorageError};
use crate::models::{CapabilityProfile, RunRecord, StageOutcome, StageStatus, ValidityMarker};
use crate::system::integrity;
use crate::system::paths::WorkspaceLayout;
use packaging::{FailureNote, Packager};
use reconstruction::{MatchingStrategy, ReconstructionSettings};
use storage::ObjectStore;
use tools::{resolve_program, ToolInvocation, ToolOutput, ToolRunner};
use training::TrainingSettings;
use validity::{StageLedger, WorkPaths};

/// Fewest images a reconstruction can start from.
pub const MIN_INPUT_IMAGES: usize = 3;

pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "tiff", "bmp"];

/// Image files directly inside `dir`, sorted. A missing directory has none.
pub fn collect_images(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut images = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Digest of image names and sizes; changes whenever the input set does.
fn input_digest(images: &[PathBuf]) -> String {
    let mut hasher = Sha256::new();
    for image in images {
        let size = fs::metadata(image).map(|m| m.len()).unwrap_or(0);
        let name = image.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        hasher.update(format!("{}:{}\n", name, size).as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn fact(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

/// Result of one stage body: status plus an optional note for the record.
type StageResult = Result<(StageStatus, Option<String>), StageError>;

/// Mutable bookkeeping of a single run.
struct RunState {
    run_id: String,
    work: WorkPaths,
    cursor: StageCursor,
    ledger: StageLedger,
    outcomes: Vec<StageOutcome>,
    images: Vec<PathBuf>,
    /// Set once a resumable stage executes; nothing later may be skipped.
    invalidated: bool,
    output: Option<PathBuf>,
}

pub struct PipelineDriver {
    layout: WorkspaceLayout,
    profile: CapabilityProfile,
    runner: Arc<dyn ToolRunner>,
    cache: Arc<ArtifactCache>,
    store: Option<Arc<dyn ObjectStore>>,
    reconstruction: ReconstructionSettings,
    training: TrainingSettings,
    use_gpu: bool,
    gpu_fallback: bool,
    dense_enabled: bool,
    upload_enabled: bool,
    upload_prefix: String,
    input_prefix: String,
}

impl PipelineDriver {
    pub fn new(
        layout: WorkspaceLayout,
        config: &PipelineConfig,
        profile: CapabilityProfile,
        runner: Arc<dyn ToolRunner>,
        cache: Arc<ArtifactCache>,
    ) -> Result<Self, ConfigError> {
        Ok(PipelineDriver {
            reconstruction: ReconstructionSettings::from_config(config)?,
            training: TrainingSettings::from_config(config)?,
            use_gpu: config.bool("features.use_gpu")? && profile.gpu_usable(),
            gpu_fallback: config.bool("stages.gpu_fallback")?,
            dense_enabled: config.bool("dense.enabled")?,
            upload_enabled: config.bool("upload.enabled")?,
            upload_prefix: config.str("upload.prefix")?.to_string(),
            input_prefix: config.str("input.prefix")?.to_string(),
            layout,
            profile,
            runner,
            cache,
            store: None,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn work_paths(&self) -> WorkPaths {
        WorkPaths::new(self.layout.work_dir())
    }

    /// Execute the pipeline once. The run record is appended to the history
    /// whether the run succeeds or not.
    pub async fn run(&self) -> Result<RunRecord, PipelineFailure> {
        let run_id = Utc::now().format("%Y%m%d-%H%M%S-%3f").to_string();
        let work = self.work_paths();

        let ledger = StageLedger::load(&self.layout.stage_ledger()).map_err(|e| PipelineFailure {
            error: StageError::io(Stage::AcquireInput, e),
            partial_output: None,
        })?;

        let mut run = RunState {
            run_id,
            work,
            cursor: StageCursor::new(),
            ledger,
            outcomes: Vec::new(),
            images: Vec::new(),
            invalidated: false,
            output: None,
        };

        log::info!(target: "parsed", "[Pipeline] [RUN] Starting run {}", run.run_id);
        let result = self.execute(&mut run).await;

        let failure = match result {
            Ok(()) => None,
            Err(error) => {
                let _ = run.cursor.transition_to(Stage::Failed);
                log::error!("[Pipeline] [{}] Failed: {}", error.stage(), error);
                for line in error.diagnostics() {
                    log::error!("[Pipeline] [{}]   {}", error.stage(), line);
                }
                let note = FailureNote {
                    stage: error.stage(),
                    message: error.to_string(),
                    diagnostics: error.diagnostics(),
                };
                let partial = Packager::new(self.layout.output_dir(), false)
                    .package_partial(&run.run_id, &run.work, &note)
                    .unwrap_or_else(|e| {
                        log::warn!("[Pipeline] [PACKAGE] Partial packaging failed: {}", e);
                        None
                    });
                run.output = partial.clone();
                Some(PipelineFailure {
                    error,
                    partial_output: partial,
                })
            }
        };

        let record = self.finish_record(&run, failure.is_none());
        if let Err(e) = history::append(&self.layout.run_history(), &record) {
            log::warn!("[Pipeline] [HISTORY] Could not append run record: {}", e);
        }

        match failure {
            Some(failure) => Err(failure),
            None => {
                log::info!(
                    target: "parsed",
                    "[Pipeline] [DONE] Run {} finished: {}",
                    record.run_id,
                    record
                        .output_location
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default()
                );
                Ok(record)
            }
        }
    }

    fn finish_record(&self, run: &RunState, succeeded: bool) -> RunRecord {
        let mut outcomes = run.outcomes.clone();
        for stage in Stage::ORDER {
            if !outcomes.iter().any(|o| o.stage == stage) {
                outcomes.push(StageOutcome {
                    stage,
                    status: StageStatus::NotRun,
                    duration_ms: 0,
                    detail: None,
                });
            }
        }
        RunRecord {
            run_id: run.run_id.clone(),
            timestamp: Utc::now(),
            input_count: run.images.len(),
            stage_outcomes: outcomes,
            output_location: run.output.clone(),
            succeeded,
        }
    }

    async fn execute(&self, run: &mut RunState) -> Result<(), StageError> {
        // ACQUIRE_INPUT is the cursor's starting state.
        let started = Instant::now();
        let result = self.acquire_input(run).await;
        self.conclude(run, Stage::AcquireInput, started, result)?;

        self.enter(run, Stage::ExtractFeatures)?;
        let started = Instant::now();
        let result = self.extract_features(run).await;
        self.conclude(run, Stage::ExtractFeatures, started, result)?;

        self.enter(run, Stage::MatchFeatures)?;
        let started = Instant::now();
        let result = self.match_features(run).await;
        self.conclude(run, Stage::MatchFeatures, started, result)?;

        self.enter(run, Stage::SparseReconstruct)?;
        let started = Instant::now();
        let result = self.sparse_reconstruct(run).await;
        self.conclude(run, Stage::SparseReconstruct, started, result)?;

        if self.dense_enabled {
            self.enter(run, Stage::DenseReconstruct)?;
            let started = Instant::now();
            let result = self.dense_reconstruct(run).await;
            self.conclude(run, Stage::DenseReconstruct, started, result)?;
        } else {
            Self::bypass(run, Stage::DenseReconstruct);
        }

        self.enter(run, Stage::TrainModel)?;
        let started = Instant::now();
        let result = self.train_model(run).await;
        self.conclude(run, Stage::TrainModel, started, result)?;

        self.enter(run, Stage::PackageResults)?;
        let started = Instant::now();
        let result = self.package_results(run);
        self.conclude(run, Stage::PackageResults, started, result)?;

        if self.upload_enabled {
            self.enter(run, Stage::Upload)?;
            let started = Instant::now();
            let result = self.upload(run).await;
            self.conclude(run, Stage::Upload, started, result)?;
        } else {
            Self::bypass(run, Stage::Upload);
        }

        self.enter(run, Stage::Done)
    }

    fn enter(&self, run: &mut RunState, stage: Stage) -> Result<(), StageError> {
        run.cursor
            .transition_to(stage)
            .map_err(|reason| StageError::Precondition { stage, reason })?;
        if !stage.is_terminal() {
            log::info!(target: "parsed", "[Pipeline] [{}] Started", stage);
        }
        Ok(())
    }

    fn bypass(run: &mut RunState, stage: Stage) {
        log::info!(target: "parsed", "[Pipeline] [{}] Bypassed (disabled)", stage);
        run.outcomes.push(StageOutcome {
            stage,
            status: StageStatus::Skipped,
            duration_ms: 0,
            detail: Some("disabled".to_string()),
        });
    }

    fn conclude(
        &self,
        run: &mut RunState,
        stage: Stage,
        started: Instant,
        result: StageResult,
    ) -> Result<(), StageError> {
        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok((status, detail)) => {
                log::info!(
                    target: "parsed",
                    "[Pipeline] [{}] {} in {} ms{}",
                    stage,
                    status.as_str(),
                    duration_ms,
                    detail.as_ref().map(|d| format!(" ({})", d)).unwrap_or_default()
                );
                run.outcomes.push(StageOutcome {
                    stage,
                    status,
                    duration_ms,
                    detail,
                });
                Ok(())
            }
            Err(error) => {
                run.outcomes.push(StageOutcome {
                    stage,
                    status: StageStatus::Failed,
                    duration_ms,
                    detail: Some(error.to_string()),
                });
                Err(error)
            }
        }
    }

    /// Whether `stage` may be skipped. The first stage that may not is the
    /// point from which the ledger is invalidated.
    fn try_skip(&self, run: &mut RunState, stage: Stage, facts: &[(String, String)]) -> Result<bool, StageError> {
        if !run.invalidated && run.ledger.is_complete(stage, &run.work, facts) {
            return Ok(true);
        }
        if !run.invalidated {
            run.invalidated = true;
            run.ledger.invalidate_from(stage);
            run.ledger.save().map_err(|e| StageError::io(stage, e))?;
        }
        Ok(false)
    }

    /// Validate and record the outputs of a stage that just executed.
    fn record(
        &self,
        run: &mut RunState,
        stage: Stage,
        facts: Vec<(String, String)>,
        output: &ToolOutput,
    ) -> Result<(), StageError> {
        run.work
            .check(stage)
            .map_err(|(path, reason)| {
                log::warn!("[Pipeline] [{}] {}: {}", stage, path.display(), reason);
                StageError::MissingOutput {
                    stage,
                    path,
                    diagnostics: output.tail.clone(),
                }
            })?;

        let files = integrity::fingerprint_all(run.work.root(), &run.work.outputs(stage))
            .map_err(|e| StageError::io(stage, e))?;
        let mut marker = ValidityMarker::new(files);
        marker.facts = facts;
        run.ledger.record(stage, marker);
        run.ledger.save().map_err(|e| StageError::io(stage, e))
    }

    async fn run_tool(&self, stage: Stage, invocation: &ToolInvocation) -> Result<ToolOutput, StageError> {
        let output = self
            .runner
            .run(invocation)
            .await
            .map_err(|source| StageError::Launch { stage, source })?;
        if !output.success() {
            return Err(StageError::ToolFailed {
                stage,
                tool: invocation.label(),
                exit_code: output.exit_code,
                diagnostics: output.tail,
            });
        }
        Ok(output)
    }

    /// Run a GPU-capable tool; on failure with the GPU enabled, reset the
    /// stage's scratch state and retry once on the CPU.
    async fn run_with_gpu_fallback<B, R>(
        &self,
        stage: Stage,
        build: B,
        reset: R,
    ) -> Result<(ToolOutput, bool), StageError>
    where
        B: Fn(bool) -> ToolInvocation,
        R: Fn() -> io::Result<()>,
    {
        match self.run_tool(stage, &build(self.use_gpu)).await {
            Ok(output) => Ok((output, false)),
            Err(StageError::ToolFailed { exit_code, .. }) if self.use_gpu && self.gpu_fallback => {
                log::warn!(
                    "[Pipeline] [{}] GPU run failed (exit {:?}), retrying once with the GPU disabled",
                    stage,
                    exit_code
                );
                reset().map_err(|e| StageError::io(stage, e))?;
                let output = self.run_tool(stage, &build(false)).await?;
                Ok((output, true))
            }
            Err(e) => Err(e),
        }
    }

    async fn acquire_input(&self, run: &mut RunState) -> StageResult {
        let stage = Stage::AcquireInput;
        let input_dir = self.layout.input_dir();

        if !self.input_prefix.is_empty() {
            let store = self.store.as_ref().ok_or_else(|| StageError::Storage {
                stage,
                source: StorageError::NotConfigured("input.prefix is set but storage.root is empty".to_string()),
            })?;
            store
                .fetch_prefix(&self.input_prefix, &input_dir)
                .await
                .map_err(|source| StageError::Storage { stage, source })?;
        }

        run.images = collect_images(&input_dir).map_err(|e| StageError::io(stage, e))?;
        if run.images.len() < MIN_INPUT_IMAGES {
            return Err(StageError::InsufficientInput {
                found: run.images.len(),
                required: MIN_INPUT_IMAGES,
            });
        }
        Ok((StageStatus::Succeeded, Some(format!("{} images", run.images.len()))))
    }

    async fn extract_features(&self, run: &mut RunState) -> StageResult {
        let stage = Stage::ExtractFeatures;
        let settings = &self.reconstruction;
        let facts = vec![
            fact("input.images", input_digest(&run.images)),
            fact("features.detector", format!("{:?}", settings.detector)),
            fact("features.max_per_image", settings.max_features),
            fact("features.single_camera", settings.single_camera),
        ];
        if self.try_skip(run, stage, &facts)? {
            return Ok((StageStatus::Skipped, Some("outputs still valid".to_string())));
        }

        let database = run.work.features_db();
        let images = self.layout.input_dir();
        let reset = || remove_if_exists(&database);
        fs::create_dir_all(run.work.root()).map_err(|e| StageError::io(stage, e))?;
        reset().map_err(|e| StageError::io(stage, e))?;

        let (output, fell_back) = self
            .run_with_gpu_fallback(
                stage,
                |gpu| settings.extract_features(&database, &images, gpu),
                reset,
            )
            .await?;
        self.record(run, stage, facts, &output)?;

        Ok(if fell_back {
            (StageStatus::Degraded, Some("GPU disabled after failure".to_string()))
        } else {
            (StageStatus::Succeeded, None)
        })
    }

    async fn match_features(&self, run: &mut RunState) -> StageResult {
        let stage = Stage::MatchFeatures;
        let settings = &self.reconstruction;

        let wants_loop_closure =
            settings.matching == MatchingStrategy::Sequential && settings.loop_detection;
        // Loop closure is optional, so its availability is part of the facts.
        let loop_tree = if wants_loop_closure {
            self.cache.fetch_optional(VOCAB_TREE).await
        } else {
            None
        };
        let degraded = wants_loop_closure && loop_tree.is_none();
        if degraded {
            log::warn!(
                "[Pipeline] [{}] [DEGRADED] Vocabulary tree unavailable, matching without loop detection",
                stage
            );
        }

        let facts = vec![
            fact("matching.strategy", settings.matching),
            fact("matching.overlap", settings.overlap),
            fact("matching.loop_closure", !degraded && wants_loop_closure),
        ];
        if self.try_skip(run, stage, &facts)? {
            return Ok((StageStatus::Skipped, Some("outputs still valid".to_string())));
        }

        // A required tree is only needed when the matcher actually runs.
        let tree = match settings.matching {
            MatchingStrategy::VocabTree => Some(
                self.cache
                    .fetch(VOCAB_TREE)
                    .await
                    .map_err(|source| StageError::Artifact { stage, source })?,
            ),
            _ => loop_tree,
        };

        let features = run.work.features_db();
        let database = run.work.matches_db();
        let reset = || fs::copy(&features, &database).map(|_| ());
        reset().map_err(|e| StageError::io(stage, e))?;

        let (output, fell_back) = self
            .run_with_gpu_fallback(
                stage,
                |gpu| settings.match_features(&database, gpu, tree.as_deref()),
                reset,
            )
            .await?;
        self.record(run, stage, facts, &output)?;

        let mut notes = Vec::new();
        if degraded {
            notes.push("loop detection disabled");
        }
        if fell_back {
            notes.push("GPU disabled after failure");
        }
        Ok(if notes.is_empty() {
            (StageStatus::Succeeded, None)
        } else {
            (StageStatus::Degraded, Some(notes.join(", ")))
        })
    }

    async fn sparse_reconstruct(&self, run: &mut RunState) -> StageResult {
        let stage = Stage::SparseReconstruct;
        if self.try_skip(run, stage, &[])? {
            return Ok((StageStatus::Skipped, Some("outputs still valid".to_string())));
        }

        let sparse_dir = run.work.sparse_dir();
        reset_dir(&sparse_dir).map_err(|e| StageError::io(stage, e))?;

        let invocation =
            self.reconstruction
                .map(&run.work.matches_db(), &self.layout.input_dir(), &sparse_dir);
        let output = self.run_tool(stage, &invocation).await?;
        self.record(run, stage, Vec::new(), &output)?;
        Ok((StageStatus::Succeeded, None))
    }

    async fn dense_reconstruct(&self, run: &mut RunState) -> StageResult {
        let stage = Stage::DenseReconstruct;
        if self.try_skip(run, stage, &[])? {
            return Ok((StageStatus::Skipped, Some("outputs still valid".to_string())));
        }

        let dense_dir = run.work.dense_dir();
        reset_dir(&dense_dir).map_err(|e| StageError::io(stage, e))?;

        let settings = &self.reconstruction;
        self.run_tool(
            stage,
            &settings.undistort(&self.layout.input_dir(), &run.work.sparse_model(), &dense_dir),
        )
        .await?;
        self.run_tool(stage, &settings.patch_match(&dense_dir)).await?;
        let output = self
            .run_tool(stage, &settings.fuse(&dense_dir, &run.work.fused_ply()))
            .await?;
        self.record(run, stage, Vec::new(), &output)?;
        Ok((StageStatus::Succeeded, None))
    }

    async fn train_model(&self, run: &mut RunState) -> StageResult {
        let stage = Stage::TrainModel;
        let settings = &self.training;
        let facts = settings.facts();
        if self.try_skip(run, stage, &facts)? {
            return Ok((StageStatus::Skipped, Some("outputs still valid".to_string())));
        }

        let estimate = settings.estimate(&self.profile);
        log::info!(
            target: "parsed",
            "[Pipeline] [{}] Strategy {} (configured {}): ~{} min, ~{:.1} MB, PSNR {:.1}-{:.1} dB, ~{:.1} GB GPU memory, web: {}",
            stage,
            settings.strategy,
            settings.configured,
            estimate.training_minutes,
            estimate.file_size_mb,
            estimate.psnr_range.0,
            estimate.psnr_range.1,
            estimate.memory_gb,
            estimate.web_rating
        );

        let model_dir = run.work.model_dir();
        reset_dir(&model_dir).map_err(|e| StageError::io(stage, e))?;

        let invocation = settings.invocation(
            resolve_program(&self.layout, &settings.program),
            &run.work.sparse_model(),
            &self.layout.input_dir(),
            &model_dir,
        );
        let output = self.run_tool(stage, &invocation).await?;
        self.record(run, stage, facts, &output)?;
        Ok((StageStatus::Succeeded, None))
    }

    fn package_results(&self, run: &mut RunState) -> StageResult {
        let stage = Stage::PackageResults;
        let run_dir = Packager::new(self.layout.output_dir(), self.training.compress)
            .package(&run.run_id, &run.work)
            .map_err(|e| StageError::io(stage, e))?;
        let detail = run_dir.display().to_string();
        run.output = Some(run_dir);
        Ok((StageStatus::Succeeded, Some(detail)))
    }

    async fn upload(&self, run: &mut RunState) -> StageResult {
        let stage = Stage::Upload;
        let store = self.store.as_ref().ok_or_else(|| StageError::Storage {
            stage,
            source: StorageError::NotConfigured("upload.enabled is set but storage.root is empty".to_string()),
        })?;
        let run_dir = run.output.clone().ok_or_else(|| StageError::Precondition {
            stage,
            reason: "no package to upload".to_string(),
        })?;

        let prefix = format!("{}/{}", self.upload_prefix.trim_end_matches('/'), run.run_id);
        let count = store
            .upload_dir(&run_dir, &prefix)
            .await
            .map_err(|source| StageError::Storage { stage, source })?;
        Ok((StageStatus::Succeeded, Some(format!("{} file(s) to {}", count, prefix))))
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn reset_dir(dir: &Path) -> io::Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::artifact::{Artifact, Requirement};
    use crate::cache::fetcher::ArtifactSource;
    use crate::config::ConfigStore;
    use crate::error::ToolError;
    use crate::pipeline::validity::{fixtures, SPARSE_FILES};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Creates each tool's expected outputs; optionally fails chosen subcommands.
    #[derive(Default)]
    struct FakeTools {
        calls: Mutex<Vec<ToolInvocation>>,
        fail_gpu: Vec<&'static str>,
        fail: Vec<&'static str>,
    }

    impl FakeTools {
        fn failing_gpu(subcommands: &[&'static str]) -> Self {
            FakeTools {
                fail_gpu: subcommands.to_vec(),
                ..Default::default()
            }
        }

        fn failing(subcommands: &[&'static str]) -> Self {
            FakeTools {
                fail: subcommands.to_vec(),
                ..Default::default()
            }
        }

        fn labels(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|c| c.label()).collect()
        }

        fn count(&self, label_suffix: &str) -> usize {
            self.labels().iter().filter(|l| l.ends_with(label_suffix)).count()
        }
    }

    fn failure(line: &str) -> ToolOutput {
        ToolOutput {
            exit_code: Some(1),
            tail: vec![line.to_string()],
        }
    }

    #[async_trait]
    impl ToolRunner for FakeTools {
        async fn run(&self, inv: &ToolInvocation) -> Result<ToolOutput, ToolError> {
            self.calls.lock().unwrap().push(inv.clone());
            let sub = if inv.flag_value("--colmap_path").is_some() {
                "train".to_string()
            } else {
                inv.args.first().cloned().unwrap_or_default()
            };
            let gpu = inv
                .flag_value("--SiftExtraction.use_gpu")
                .or(inv.flag_value("--SiftMatching.use_gpu"))
                == Some("1");
            if self.fail.contains(&sub.as_str()) {
                return Ok(failure("fatal error"));
            }
            if gpu && self.fail_gpu.contains(&sub.as_str()) {
                return Ok(failure("CUDA out of memory"));
            }

            let path = |flag: &str| PathBuf::from(inv.flag_value(flag).unwrap_or_default());
            match sub.as_str() {
                "feature_extractor" => fixtures::sqlite(&path("--database_path"), 4),
                "mapper" => {
                    for f in SPARSE_FILES {
                        fixtures::colmap_bin(&path("--output_path").join("0").join(f), 3);
                    }
                }
                "stereo_fusion" => fixtures::ply(&path("--output_path"), 50),
                "train" => {
                    fixtures::ply(&path("--output_path").join("exports/gaussian_splats.ply"), 20)
                }
                _ => {}
            }
            Ok(ToolOutput {
                exit_code: Some(0),
                tail: Vec::new(),
            })
        }
    }

    struct Unreachable;

    #[async_trait]
    impl ArtifactSource for Unreachable {
        async fn download(&self, url: &str, _dest: &Path) -> Result<u64, String> {
            Err(format!("connection refused: {}", url))
        }
    }

    struct Setup {
        _dir: tempfile::TempDir,
        layout: WorkspaceLayout,
    }

    fn workspace(images: usize) -> Setup {
        let dir = tempdir().unwrap();
        let layout = WorkspaceLayout::new(dir.path());
        layout.ensure().unwrap();
        for i in 0..images {
            fs::write(layout.input_dir().join(format!("img_{:03}.jpg", i)), vec![i as u8; 16]).unwrap();
        }
        fs::write(layout.input_dir().join("notes.txt"), "not an image").unwrap();
        Setup { _dir: dir, layout }
    }

    fn gpu_profile() -> CapabilityProfile {
        CapabilityProfile {
            accelerator_present: true,
            driver_version: Some("550.54".to_string()),
            toolkit_version: Some("12.4".to_string()),
            device_name: Some("NVIDIA L4".to_string()),
            device_count: 1,
            architecture_tag: crate::models::ArchitectureTag::Sm89,
            runtime_variant: crate::models::RuntimeVariant::Cu124,
        }
    }

    fn driver(
        layout: &WorkspaceLayout,
        pairs: &[(&str, &str)],
        profile: CapabilityProfile,
        tools: Arc<FakeTools>,
    ) -> PipelineDriver {
        let mut store = ConfigStore::new();
        for (k, v) in pairs {
            store.set_override(k, v).unwrap();
        }
        let config = store.snapshot().unwrap();
        let mut cache = ArtifactCache::new(layout.artifacts_dir(), Arc::new(Unreachable))
            .with_max_attempts(1)
            .with_backoff(Duration::ZERO);
        cache.register(Artifact {
            identifier: VOCAB_TREE.to_string(),
            remote_location: "http://unreachable/tree.bin".to_string(),
            local_path: layout.artifacts_dir().join("tree.bin"),
            expected_min_size_bytes: 1024,
            checksum: None,
            requirement: Requirement::Optional,
        });
        PipelineDriver::new(layout.clone(), &config, profile, tools, Arc::new(cache)).unwrap()
    }

    #[test]
    fn test_collect_images_filters_extensions() {
        let setup = workspace(3);
        fs::write(setup.layout.input_dir().join("UPPER.PNG"), "x").unwrap();
        let images = collect_images(&setup.layout.input_dir()).unwrap();
        assert_eq!(images.len(), 4);
        assert!(collect_images(Path::new("/nonexistent/input")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_too_few_images_runs_no_tool() {
        for count in [0, 2] {
            let setup = workspace(count);
            let tools = Arc::new(FakeTools::default());
            let failure = driver(&setup.layout, &[], CapabilityProfile::cpu_only(), tools.clone())
                .run()
                .await
                .unwrap_err();
            assert!(matches!(
                failure.error,
                StageError::InsufficientInput { found, required: 3 } if found == count
            ));
            assert!(tools.labels().is_empty());
            assert!(failure.partial_output.is_none());
        }
    }

    #[tokio::test]
    async fn test_full_run_packages_and_records_history() {
        let setup = workspace(3);
        let tools = Arc::new(FakeTools::default());
        let record = driver(&setup.layout, &[], CapabilityProfile::cpu_only(), tools.clone())
            .run()
            .await
            .unwrap();

        assert!(record.succeeded);
        assert_eq!(record.input_count, 3);
        let output = record.output_location.clone().unwrap();
        assert!(output.join("gaussian_splats.ply").is_file());
        assert!(output.join("manifest.json").is_file());
        assert_eq!(
            record.outcome(Stage::DenseReconstruct).unwrap().status,
            StageStatus::Skipped
        );
        // Default sequential matching degrades without the vocabulary tree.
        assert_eq!(
            record.outcome(Stage::MatchFeatures).unwrap().status,
            StageStatus::Degraded
        );
        let last = history::last(&setup.layout.run_history()).unwrap().unwrap();
        assert_eq!(last.run_id, record.run_id);
    }

    #[tokio::test]
    async fn test_second_run_skips_valid_stages() {
        let setup = workspace(3);
        let tools = Arc::new(FakeTools::default());
        let pipeline = driver(&setup.layout, &[], CapabilityProfile::cpu_only(), tools.clone());
        pipeline.run().await.unwrap();
        let first_calls = tools.labels().len();

        let record = pipeline.run().await.unwrap();
        assert_eq!(tools.labels().len(), first_calls);
        for stage in [
            Stage::ExtractFeatures,
            Stage::MatchFeatures,
            Stage::SparseReconstruct,
            Stage::TrainModel,
        ] {
            assert_eq!(record.outcome(stage).unwrap().status, StageStatus::Skipped, "{}", stage);
        }
    }

    #[tokio::test]
    async fn test_truncated_database_reruns_downstream() {
        let setup = workspace(3);
        let tools = Arc::new(FakeTools::default());
        let pipeline = driver(&setup.layout, &[], CapabilityProfile::cpu_only(), tools.clone());
        pipeline.run().await.unwrap();

        let matches = pipeline.work_paths().matches_db();
        let bytes = fs::read(&matches).unwrap();
        fs::write(&matches, &bytes[..bytes.len() / 2]).unwrap();

        let record = pipeline.run().await.unwrap();
        assert_eq!(
            record.outcome(Stage::ExtractFeatures).unwrap().status,
            StageStatus::Skipped
        );
        assert_ne!(
            record.outcome(Stage::MatchFeatures).unwrap().status,
            StageStatus::Skipped
        );
        assert_eq!(
            record.outcome(Stage::SparseReconstruct).unwrap().status,
            StageStatus::Succeeded
        );
        assert_eq!(tools.count("mapper"), 2);
    }

    #[tokio::test]
    async fn test_vocab_tree_strategy_requires_artifact() {
        let setup = workspace(5);
        let tools = Arc::new(FakeTools::default());
        let failure = driver(
            &setup.layout,
            &[("matching.strategy", "vocab_tree")],
            CapabilityProfile::cpu_only(),
            tools.clone(),
        )
        .run()
        .await
        .unwrap_err();

        assert_eq!(failure.error.stage(), Stage::MatchFeatures);
        assert!(matches!(failure.error, StageError::Artifact { .. }));
        assert_eq!(tools.count("vocab_tree_matcher"), 0);
        // Extraction finished, so its database is salvaged.
        let partial = failure.partial_output.unwrap();
        assert!(partial.join("database/features.db").is_file());
    }

    #[tokio::test]
    async fn test_valid_matches_skip_without_vocab_tree() {
        let setup = workspace(3);
        let tools = Arc::new(FakeTools::default());
        let tree = setup.layout.artifacts_dir().join("tree.bin");
        fs::write(&tree, vec![7u8; 2048]).unwrap();
        let pipeline = driver(
            &setup.layout,
            &[("matching.strategy", "vocab_tree")],
            CapabilityProfile::cpu_only(),
            tools.clone(),
        );
        pipeline.run().await.unwrap();
        assert_eq!(tools.count("vocab_tree_matcher"), 1);

        // The tree is gone and the mirror is unreachable, but matches.db is intact.
        fs::remove_file(&tree).unwrap();
        let record = pipeline.run().await.unwrap();
        assert_eq!(
            record.outcome(Stage::MatchFeatures).unwrap().status,
            StageStatus::Skipped
        );
        assert_eq!(tools.count("vocab_tree_matcher"), 1);
    }

    #[tokio::test]
    async fn test_gpu_failure_falls_back_to_cpu_once() {
        let setup = workspace(3);
        let tools = Arc::new(FakeTools::failing_gpu(&["feature_extractor"]));
        let record = driver(&setup.layout, &[], gpu_profile(), tools.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(tools.count("feature_extractor"), 2);
        let outcome = record.outcome(Stage::ExtractFeatures).unwrap();
        assert_eq!(outcome.status, StageStatus::Degraded);
    }

    #[tokio::test]
    async fn test_tool_failure_halts_with_diagnostics() {
        let setup = workspace(3);
        let tools = Arc::new(FakeTools::failing(&["mapper"]));
        let failure = driver(&setup.layout, &[], CapabilityProfile::cpu_only(), tools.clone())
            .run()
            .await
            .unwrap_err();
        assert_eq!(failure.error.stage(), Stage::SparseReconstruct);
        assert_eq!(failure.error.diagnostics(), ["fatal error".to_string()]);

        let partial = failure.partial_output.clone().unwrap();
        assert!(partial.join("database/features.db").is_file());
        assert!(partial.join("database/matches.db").is_file());
        let note = fs::read_to_string(partial.join(packaging::FAILURE_FILE)).unwrap();
        assert!(note.contains("SPARSE_RECONSTRUCT"));
        assert!(note.contains("fatal error"));
        let manifest = packaging::PackageManifest::load(&partial).unwrap();
        assert!(manifest.partial);

        let record = history::last(&setup.layout.run_history()).unwrap().unwrap();
        assert!(!record.succeeded);
        assert_eq!(
            record.outcome(Stage::TrainModel).unwrap().status,
            StageStatus::NotRun
        );
    }

    #[tokio::test]
    async fn test_training_failure_packages_sparse_model() {
        let setup = workspace(3);
        let tools = Arc::new(FakeTools::failing(&["train"]));
        let failure = driver(&setup.layout, &[], CapabilityProfile::cpu_only(), tools.clone())
            .run()
            .await
            .unwrap_err();
        assert_eq!(failure.error.stage(), Stage::TrainModel);

        let partial = failure.partial_output.unwrap();
        let manifest = packaging::PackageManifest::load(&partial).unwrap();
        assert!(manifest.partial);
        assert!(partial.join("sparse/cameras.bin").is_file());
    }

    #[tokio::test]
    async fn test_changed_training_settings_rerun_only_training() {
        let setup = workspace(3);
        let tools = Arc::new(FakeTools::default());
        driver(&setup.layout, &[], CapabilityProfile::cpu_only(), tools.clone())
            .run()
            .await
            .unwrap();

        let record = driver(
            &setup.layout,
            &[("train.iterations", "7000")],
            CapabilityProfile::cpu_only(),
            tools.clone(),
        )
        .run()
        .await
        .unwrap();
        assert_eq!(
            record.outcome(Stage::SparseReconstruct).unwrap().status,
            StageStatus::Skipped
        );
        assert_eq!(
            record.outcome(Stage::TrainModel).unwrap().status,
            StageStatus::Succeeded
        );
    }
}
