//! environment: Python training environment matched to the detected runtime.
//!
//! Steps: create the venv, install the torch wheel for the runtime variant,
//! install the trainer package (built for the detected architecture).
//! Package installs are retried; a receipt in `cache/state/` records what
//! was installed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;

use super::{failed, Phase, PhaseContext};
use crate::error::PhaseError;
use crate::models::{RuntimeVariant, ValidityMarker};
use crate::orchestrator::state::save_json;
use crate::pipeline::tools::ToolInvocation;
use crate::system::integrity;

pub const NAME: &str = "environment";

const TORCH_INDEX_BASE: &str = "https://download.pytorch.org/whl";

/// Wheel index serving torch builds for a runtime variant.
pub fn torch_index_url(variant: RuntimeVariant) -> String {
    format!("{}/{}", TORCH_INDEX_BASE, variant.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EnvironmentReceipt {
    runtime: String,
    architecture: String,
    trainer_package: String,
    index_url: String,
}

pub struct EnvironmentPhase {
    install_attempts: u32,
}

impl Default for EnvironmentPhase {
    fn default() -> Self {
        EnvironmentPhase {
            install_attempts: 2,
        }
    }
}

impl EnvironmentPhase {
    async fn install(
        &self,
        ctx: &PhaseContext,
        invocation: &ToolInvocation,
    ) -> Result<(), PhaseError> {
        let mut last = None;
        for attempt in 1..=self.install_attempts {
            match ctx.run_tool(NAME, invocation).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    log::warn!(
                        "[Provision] [ENV] Install attempt {}/{} failed: {}",
                        attempt,
                        self.install_attempts,
                        e
                    );
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| failed(NAME, "install was not attempted")))
    }
}

#[async_trait]
impl Phase for EnvironmentPhase {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<ValidityMarker, PhaseError> {
        let layout = &ctx.layout;
        let python = ctx.config.str("env.python").map_err(|e| failed(NAME, e.to_string()))?;
        let trainer_package = ctx
            .config
            .str("env.trainer_package")
            .map_err(|e| failed(NAME, e.to_string()))?;
        let venv_python = layout.venv_python();
        let build_dir = layout.build_dir();
        fs::create_dir_all(&build_dir)?;

        if !venv_python.is_file() {
            log::info!(
                "[Provision] [ENV] Creating environment at {}",
                layout.venv_dir().display()
            );
            ctx.run_tool(
                NAME,
                &ToolInvocation::new(python)
                    .arg("-m")
                    .arg("venv")
                    .arg(layout.venv_dir().display().to_string()),
            )
            .await?;
        }

        let variant = ctx.profile.runtime_variant;
        let index_url = torch_index_url(variant);
        log::info!(
            target: "parsed",
            "[Provision] [ENV] Installing torch for runtime {}",
            variant
        );
        self.install(
            ctx,
            &ToolInvocation::new(venv_python.display().to_string())
                .args_from(&["-m", "pip", "install", "--upgrade", "torch"])
                .flag("--index-url", &index_url)
                .env("PIP_CACHE_DIR", build_dir.join("pip").display().to_string()),
        )
        .await?;

        let mut trainer_install = ToolInvocation::new(venv_python.display().to_string())
            .args_from(&["-m", "pip", "install", trainer_package])
            .env("PIP_CACHE_DIR", build_dir.join("pip").display().to_string())
            .env("TMPDIR", build_dir.display().to_string());
        if ctx.profile.gpu_usable() {
            trainer_install = trainer_install.env(
                "TORCH_CUDA_ARCH_LIST",
                ctx.profile.architecture_tag.compute_capability(),
            );
        }
        log::info!(
            target: "parsed",
            "[Provision] [ENV] Installing {} for {}",
            trainer_package,
            ctx.profile.architecture_tag
        );
        self.install(ctx, &trainer_install).await?;

        let receipt = EnvironmentReceipt {
            runtime: variant.to_string(),
            architecture: ctx.profile.architecture_tag.to_string(),
            trainer_package: trainer_package.to_string(),
            index_url,
        };
        let receipt_path = layout.environment_receipt();
        save_json(&receipt_path, &receipt)?;

        Ok(
            ValidityMarker::new(vec![integrity::fingerprint(layout.root(), &receipt_path)?])
                .with_fact("runtime", receipt.runtime)
                .with_fact("trainer_package", receipt.trainer_package),
        )
    }

    fn is_valid(&self, ctx: &PhaseContext, marker: &ValidityMarker) -> bool {
        if !ctx.layout.venv_python().is_file() {
            log::info!("[Provision] [ENV] Environment interpreter missing");
            return false;
        }
        let runtime_matches = marker.fact("runtime") == Some(ctx.profile.runtime_variant.as_str());
        if !runtime_matches {
            log::info!(
                "[Provision] [ENV] Runtime changed ({} -> {})",
                marker.fact("runtime").unwrap_or("none"),
                ctx.profile.runtime_variant
            );
        }
        let package_matches = ctx
            .config
            .str("env.trainer_package")
            .map(|p| marker.fact("trainer_package") == Some(p))
            .unwrap_or(false);
        runtime_matches && package_matches
    }
}
