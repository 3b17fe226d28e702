//! tool-check: the reconstruction tool and the trainer start and exit 0.

use async_trait::async_trait;
use std::fs;

use super::{failed, Phase, PhaseContext};
use crate::error::PhaseError;
use crate::models::ValidityMarker;
use crate::pipeline::tools::{resolve_program, ToolInvocation};
use crate::system::integrity;

pub const NAME: &str = "tool-check";

pub struct ToolCheckPhase;

/// First non-empty output line, used as a version banner in the receipt.
fn banner(tail: &[String]) -> &str {
    tail.iter()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .unwrap_or("(no output)")
}

#[async_trait]
impl Phase for ToolCheckPhase {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<ValidityMarker, PhaseError> {
        let reconstruction = ctx
            .config
            .str("tools.reconstruction")
            .map_err(|e| failed(NAME, e.to_string()))?;
        let trainer = ctx
            .config
            .str("tools.trainer")
            .map_err(|e| failed(NAME, e.to_string()))?;

        let recon_output = ctx
            .run_tool(NAME, &ToolInvocation::new(reconstruction).arg("-h"))
            .await?;
        let trainer_output = ctx
            .run_tool(
                NAME,
                &ToolInvocation::new(resolve_program(&ctx.layout, trainer)).arg("--help"),
            )
            .await?;

        let receipt = format!(
            "{}: {}\n{}: {}\n",
            reconstruction,
            banner(&recon_output.tail),
            trainer,
            banner(&trainer_output.tail)
        );
        let receipt_path = ctx.layout.tool_receipt();
        if let Some(parent) = receipt_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&receipt_path, receipt)?;
        log::info!(
            target: "parsed",
            "[Provision] [TOOLS] {} and {} respond",
            reconstruction,
            trainer
        );

        Ok(
            ValidityMarker::new(vec![integrity::fingerprint(ctx.layout.root(), &receipt_path)?])
                .with_fact("tools.reconstruction", reconstruction)
                .with_fact("tools.trainer", trainer),
        )
    }

    fn is_valid(&self, ctx: &PhaseContext, marker: &ValidityMarker) -> bool {
        ["tools.reconstruction", "tools.trainer"].iter().all(|key| {
            ctx.config
                .str(key)
                .map(|value| marker.fact(key) == Some(value))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner_skips_blank_lines() {
        let tail = vec![
            "".to_string(),
            "  COLMAP 3.9.1 -- Structure-from-Motion".to_string(),
        ];
        assert_eq!(banner(&tail), "COLMAP 3.9.1 -- Structure-from-Motion");
        assert_eq!(banner(&[]), "(no output)");
    }
}
