//! host-prep: workspace layout and capability snapshot.
//!
//! Valid while every layout directory exists and the recorded profile
//! matches the host detected by this invocation.

use async_trait::async_trait;

use super::{failed, Phase, PhaseContext};
use crate::error::PhaseError;
use crate::hardware;
use crate::models::{CapabilityProfile, ValidityMarker};
use crate::system::integrity;

pub struct HostPrepPhase;

pub const NAME: &str = "host-prep";

fn profile_facts(profile: &CapabilityProfile) -> Vec<(&'static str, String)> {
    vec![
        ("accelerator", profile.accelerator_present.to_string()),
        ("architecture", profile.architecture_tag.to_string()),
        ("runtime", profile.runtime_variant.to_string()),
        ("device_count", profile.device_count.to_string()),
    ]
}

#[async_trait]
impl Phase for HostPrepPhase {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<ValidityMarker, PhaseError> {
        ctx.layout.ensure()?;
        log::info!(
            "[Provision] [PREP] Workspace layout ready at {}",
            ctx.layout.root().display()
        );

        let snapshot = ctx.layout.capability_snapshot();
        hardware::write_snapshot(&ctx.profile, &snapshot)
            .map_err(|e| failed(NAME, format!("capability snapshot: {}", e)))?;

        let mut marker =
            ValidityMarker::new(vec![integrity::fingerprint(ctx.layout.root(), &snapshot)?]);
        for (key, value) in profile_facts(&ctx.profile) {
            marker = marker.with_fact(key, value);
        }
        Ok(marker)
    }

    fn is_valid(&self, ctx: &PhaseContext, marker: &ValidityMarker) -> bool {
        if let Some(missing) = ctx.layout.required_dirs().into_iter().find(|d| !d.is_dir()) {
            log::info!("[Provision] [PREP] {} is missing", missing.display());
            return false;
        }
        profile_facts(&ctx.profile)
            .into_iter()
            .all(|(key, value)| marker.fact(key) == Some(value.as_str()))
    }
}
