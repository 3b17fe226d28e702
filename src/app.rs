//! Command handlers behind the CLI.
//!
//! Each handler returns the process exit code on success; every failure is an
//! `AppError` rendered by the single reporter in `main`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{ArtifactCache, ArtifactSource, HttpSource};
use crate::cli::{Cli, Commands};
use crate::config::{keys, loader, presets, validator, ConfigStore, PipelineConfig};
use crate::error::{ArtifactError, ConfigError, Result};
use crate::hardware::{self, resources, CapabilityDetector};
use crate::models::{CapabilityProfile, PhaseStatus, RunRecord};
use crate::orchestrator::phases::{default_phases, PhaseContext};
use crate::orchestrator::{self, PhaseRunner, PhaseSummary};
use crate::pipeline::storage::LocalDirStore;
use crate::pipeline::tools::{ProcessRunner, ToolRunner};
use crate::pipeline::PipelineDriver;
use crate::system::paths::WorkspaceLayout;
use crate::system::StatusReporter;

/// Returned by `verify` when any phase no longer validates.
pub const EXIT_NOT_PROVISIONED: i32 = 2;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Per-invocation inputs shared by every command.
pub struct Invocation {
    pub layout: WorkspaceLayout,
    pub config_file: Option<PathBuf>,
    /// Process environment, captured once in `main`.
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(layout: WorkspaceLayout, config_file: Option<PathBuf>, env: Vec<(String, String)>) -> Self {
        Invocation {
            layout,
            config_file,
            env,
        }
    }

    /// `--config` if given, else the workspace default when it exists.
    fn config_source(&self) -> Option<PathBuf> {
        self.config_file.clone().or_else(|| {
            let default = self.layout.default_config_file();
            default.is_file().then_some(default)
        })
    }

    fn load_store(&self) -> Result<ConfigStore> {
        let source = self.config_source();
        Ok(ConfigStore::load(source.as_deref(), self.env.iter().cloned())?)
    }
}

pub async fn dispatch(cli: &Cli, invocation: &Invocation) -> Result<i32> {
    match &cli.command {
        Commands::Run { preset, set } => run(invocation, preset.as_deref(), set).await,
        Commands::Verify => verify(invocation),
        Commands::Status { json } => status(invocation, *json),
        Commands::Cleanup => cleanup(invocation),
        Commands::Config {
            persist,
            presets,
            explain,
        } => config(invocation, *persist, *presets, explain.as_deref()),
    }
}

/// Detect the host and produce the reconciled snapshot for it.
fn resolve_for_host(store: &mut ConfigStore) -> Result<(PipelineConfig, CapabilityProfile)> {
    let required = store.snapshot()?.bool("accelerator.required")?;
    let profile = CapabilityDetector::new().detect(required)?;
    store.record_capabilities(&profile)?;
    let config = validator::reconcile(store.snapshot()?, &profile)?;
    Ok((config, profile))
}

fn phase_runner(
    layout: &WorkspaceLayout,
    config: PipelineConfig,
    profile: CapabilityProfile,
    runner: Arc<dyn ToolRunner>,
) -> PhaseRunner {
    PhaseRunner::new(PhaseContext {
        layout: layout.clone(),
        config,
        profile,
        runner,
    })
}

fn all_valid(summary: &PhaseSummary) -> bool {
    summary
        .statuses
        .iter()
        .all(|(_, s)| matches!(s, PhaseStatus::Succeeded | PhaseStatus::Skipped))
}

async fn run(invocation: &Invocation, preset: Option<&str>, set: &[String]) -> Result<i32> {
    let layout = &invocation.layout;
    let mut store = invocation.load_store()?;
    if let Some(name) = preset {
        store.apply_preset(name)?;
    }
    for assignment in set {
        let (key, value) = loader::parse_assignment(assignment)?;
        store.set_override(&key, &value)?;
    }

    let (config, profile) = resolve_for_host(&mut store)?;
    layout.ensure()?;
    resources::preflight(
        layout.root(),
        config.u64("preflight.min_memory_gb")?,
        config.u64("preflight.min_disk_gb")?,
    )?;

    let runner: Arc<dyn ToolRunner> = Arc::new(ProcessRunner::new());
    let phases = default_phases();
    let summary = phase_runner(layout, config.clone(), profile.clone(), runner.clone())
        .run(&phases)
        .await?;
    log::info!(
        "[App] [PROVISION] {} phase(s) executed, {} skipped",
        summary.executed(),
        summary.statuses.len() - summary.executed()
    );

    let source = HttpSource::new(DOWNLOAD_TIMEOUT).map_err(|reason| ArtifactError::Download {
        id: "http-client".to_string(),
        reason,
    })?;
    let record = run_pipeline(layout, &config, profile, runner, Arc::new(source)).await?;

    println!("Run {} finished ({} images)", record.run_id, record.input_count);
    for outcome in &record.stage_outcomes {
        println!(
            "  {:<20} {:<10} {:>8} ms",
            outcome.stage.as_str(),
            outcome.status.as_str(),
            outcome.duration_ms
        );
    }
    if let Some(location) = &record.output_location {
        println!("Output: {}", location.display());
    }
    Ok(0)
}

/// Warm the artifact cache, then drive the pipeline. A required artifact that
/// cannot be fetched aborts before any stage starts.
async fn run_pipeline(
    layout: &WorkspaceLayout,
    config: &PipelineConfig,
    profile: CapabilityProfile,
    runner: Arc<dyn ToolRunner>,
    source: Arc<dyn ArtifactSource>,
) -> Result<RunRecord> {
    let cache = ArtifactCache::from_config(config, &layout.artifacts_dir(), source)?;
    cache.prefetch().await?;

    let mut driver = PipelineDriver::new(layout.clone(), config, profile, runner, Arc::new(cache))?;
    if let Some(store) = LocalDirStore::from_config(config)? {
        driver = driver.with_store(Arc::new(store));
    }
    Ok(driver.run().await?)
}

fn verify(invocation: &Invocation) -> Result<i32> {
    let mut store = invocation.load_store()?;
    let (config, profile) = resolve_for_host(&mut store)?;
    let summary = phase_runner(
        &invocation.layout,
        config,
        profile,
        Arc::new(ProcessRunner::new()),
    )
    .verify(&default_phases())?;

    for (name, status) in &summary.statuses {
        println!("{:<12} {}", name, status.as_str());
    }
    if all_valid(&summary) {
        println!("All phases valid");
        Ok(0)
    } else {
        println!("Provisioning incomplete; `splatforge run` will redo invalid phases");
        Ok(EXIT_NOT_PROVISIONED)
    }
}

fn status(invocation: &Invocation, json: bool) -> Result<i32> {
    let layout = &invocation.layout;
    let config = invocation.load_store()?.snapshot()?;
    // Status never probes the host; the last recorded snapshot stands in.
    let profile = hardware::read_snapshot(&layout.capability_snapshot())
        .unwrap_or_else(CapabilityProfile::cpu_only);
    let summary = phase_runner(
        layout,
        config.clone(),
        profile,
        Arc::new(ProcessRunner::new()),
    )
    .verify(&default_phases())?;

    let report = StatusReporter::collect(layout, &config, &summary);
    if json {
        let rendered = report
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        println!("{}", rendered);
    } else {
        print!("{}", report.render_text());
    }
    Ok(0)
}

fn cleanup(invocation: &Invocation) -> Result<i32> {
    let freed = orchestrator::cleanup(&invocation.layout)?;
    println!("Freed {:.1} MB", freed as f64 / (1024.0 * 1024.0));
    Ok(0)
}

fn config(invocation: &Invocation, persist: bool, list_presets: bool, explain: Option<&str>) -> Result<i32> {
    if list_presets {
        for preset in presets::available_presets() {
            println!("{:<14} {}", preset.name, preset.description);
            for (key, value) in &preset.overrides {
                println!("    {}={}", key, value);
            }
        }
        return Ok(0);
    }

    if let Some(key) = explain {
        let spec = keys::spec(key).ok_or_else(|| ConfigError::NotFound(key.to_string()))?;
        println!("{}", spec.name);
        println!("  {}", spec.doc);
        println!("  type:    {}", spec.kind.describe());
        println!("  default: {}", if spec.default.is_empty() { "(empty)" } else { spec.default });
        println!("  env:     {}", keys::env_var_name(spec.name));
        if !spec.impact.is_empty() {
            println!("  impact:  {}", spec.impact);
        }
        return Ok(0);
    }

    let store = invocation.load_store()?;
    if persist {
        let target = invocation
            .config_file
            .clone()
            .unwrap_or_else(|| invocation.layout.default_config_file());
        let backup = store.persist(&target)?;
        println!("Configuration written to {}", target.display());
        if let Some(backup) = backup {
            println!("Previous file kept at {}", backup.display());
        }
        return Ok(0);
    }

    let snapshot = store.snapshot()?;
    for (key, resolved) in snapshot.entries() {
        let marker = if validator::is_explicit(resolved.provenance) { "*" } else { " " };
        println!(
            "{} {:<32} = {:<24} ({})",
            marker,
            key,
            resolved.value,
            resolved.provenance.as_str()
        );
    }
    println!("\n* set explicitly (file, environment or override)");
    Ok(0)
}
