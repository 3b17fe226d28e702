//! Host capability detection public API module.
//!
//! Aggregates accelerator identification, toolkit detection and resource
//! preflight into one `CapabilityProfile` per invocation.

pub mod gpu;
pub mod resources;
pub mod toolkit;

pub use gpu::{map_device_to_architecture, parse_gpu_query, GpuDevice};
pub use resources::{preflight, ResourceSnapshot};
pub use toolkit::choose_runtime_variant;

use crate::error::DetectionError;
use crate::models::{ArchitectureTag, CapabilityProfile};
use std::fs;
use std::path::Path;
use std::process::Command;

/// Raw host queries. Every method returns `None` when the source is absent.
pub trait HostProbe: Send + Sync {
    /// CSV rows of `name, driver_version`, one per device.
    fn query_gpus(&self) -> Option<String>;
    /// Contents of the kernel driver version file.
    fn driver_proc_version(&self) -> Option<String>;
    /// Output of the toolkit compiler's version query.
    fn nvcc_version(&self) -> Option<String>;
    /// Banner of the driver's management tool, carrying the supported toolkit version.
    fn smi_banner(&self) -> Option<String>;
}

fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        log::debug!(
            "[Hardware] [PROBE] {} {:?} exited with {:?}",
            program,
            args,
            output.status.code()
        );
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if stdout.trim().is_empty() {
        None
    } else {
        Some(stdout)
    }
}

/// Probe backed by the real driver tools and `/proc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl HostProbe for SystemProbe {
    fn query_gpus(&self) -> Option<String> {
        command_stdout(
            "nvidia-smi",
            &["--query-gpu=name,driver_version", "--format=csv,noheader"],
        )
    }

    fn driver_proc_version(&self) -> Option<String> {
        fs::read_to_string("/proc/driver/nvidia/version").ok()
    }

    fn nvcc_version(&self) -> Option<String> {
        command_stdout("nvcc", &["--version"])
    }

    fn smi_banner(&self) -> Option<String> {
        command_stdout("nvidia-smi", &[])
    }
}

/// Capability detector with per-instance caching.
///
/// The first successful `detect` is cached; later calls return the same
/// profile without re-probing the host.
pub struct CapabilityDetector<P: HostProbe = SystemProbe> {
    probe: P,
    cached: Option<CapabilityProfile>,
}

impl CapabilityDetector<SystemProbe> {
    pub fn new() -> Self {
        Self::with_probe(SystemProbe)
    }
}

impl Default for CapabilityDetector<SystemProbe> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: HostProbe> CapabilityDetector<P> {
    pub fn with_probe(probe: P) -> Self {
        CapabilityDetector {
            probe,
            cached: None,
        }
    }

    /// Build the host's capability profile.
    ///
    /// # Graceful Degradation
    ///
    /// - No device: CPU-only profile, unless `accelerator_required`
    /// - Unknown device name: `ArchitectureTag::SAFE_DEFAULT`
    /// - No toolkit or unparseable version: `RuntimeVariant::Cpu`
    ///
    /// - Device listed without a readable driver version: `driver_version: None`
    ///
    /// Only a required but missing driver is an error.
    pub fn detect(
        &mut self,
        accelerator_required: bool,
    ) -> Result<CapabilityProfile, DetectionError> {
        if let Some(cached) = &self.cached {
            return Ok(cached.clone());
        }

        let devices = self
            .probe
            .query_gpus()
            .map(|csv| parse_gpu_query(&csv))
            .unwrap_or_default();

        let proc_driver = self
            .probe
            .driver_proc_version()
            .and_then(|contents| gpu::parse_proc_driver_version(&contents));

        let driver_version = devices
            .first()
            .and_then(|d| d.driver_version.clone())
            .or(proc_driver);

        if devices.is_empty() {
            if accelerator_required {
                return Err(DetectionError::DriverMissing(
                    "no accelerator device reported by the driver tools".to_string(),
                ));
            }

            log::warn!("[Hardware] [DETECT] No usable accelerator, continuing CPU-only");
            let profile = CapabilityProfile {
                driver_version,
                ..CapabilityProfile::cpu_only()
            };
            self.cached = Some(profile.clone());
            return Ok(profile);
        }

        // The driver tools answered, so the driver is installed.
        if driver_version.is_none() {
            log::warn!("[Hardware] [DETECT] Device reported but driver version unreadable");
        }

        let device_name = devices[0].name.clone();
        let architecture_tag: ArchitectureTag = map_device_to_architecture(&device_name);

        let toolkit_version = self
            .probe
            .nvcc_version()
            .and_then(|out| toolkit::parse_nvcc_release(&out))
            .or_else(|| {
                self.probe
                    .smi_banner()
                    .and_then(|banner| toolkit::parse_smi_cuda_version(&banner))
            });
        let runtime_variant = choose_runtime_variant(toolkit_version.as_deref());

        let profile = CapabilityProfile {
            accelerator_present: true,
            driver_version,
            toolkit_version,
            device_name: Some(device_name),
            device_count: devices.len() as u32,
            architecture_tag,
            runtime_variant,
        };

        log::info!(
            target: "parsed",
            "[Hardware] [DETECT] {} x{} ({}), runtime {}",
            profile.device_name.as_deref().unwrap_or("unknown"),
            profile.device_count,
            profile.architecture_tag,
            profile.runtime_variant
        );

        self.cached = Some(profile.clone());
        Ok(profile)
    }
}

/// Persist the profile as JSON for `status` and later runs.
pub fn write_snapshot(profile: &CapabilityProfile, path: &Path) -> Result<(), DetectionError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(profile)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    fs::write(path, json)?;
    Ok(())
}

/// Read a previously written snapshot, if any.
pub fn read_snapshot(path: &Path) -> Option<CapabilityProfile> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}
