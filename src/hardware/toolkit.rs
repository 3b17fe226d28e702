//! Compute toolkit version parsing and runtime-variant selection.

use crate::models::RuntimeVariant;
use once_cell::sync::Lazy;
use regex::Regex;

// Pre-compiled version patterns
static NVCC_RELEASE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"release\s+(\d+\.\d+)").expect("Invalid nvcc release regex"));
static SMI_CUDA_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"CUDA Version:\s*(\d+\.\d+)").expect("Invalid CUDA version regex"));

/// Version brackets, highest first. A toolkit at or above the bound selects the variant.
const RUNTIME_BRACKETS: &[((u32, u32), RuntimeVariant)] = &[
    ((12, 4), RuntimeVariant::Cu124),
    ((12, 1), RuntimeVariant::Cu121),
    ((11, 8), RuntimeVariant::Cu118),
];

/// Parse a `major.minor[.patch]` version string.
pub fn parse_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.trim().parse().ok()?;
    let minor = parts
        .next()
        .map(|m| m.trim().parse().ok())
        .unwrap_or(Some(0))?;
    Some((major, minor))
}

/// Extract the release from `nvcc --version` output.
pub fn parse_nvcc_release(output: &str) -> Option<String> {
    NVCC_RELEASE_REGEX
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Extract the driver-supported toolkit version from the `nvidia-smi` banner.
pub fn parse_smi_cuda_version(output: &str) -> Option<String> {
    SMI_CUDA_REGEX
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Map a toolkit version to the runtime package variant.
///
/// Monotonic in the version; anything below the lowest bracket, absent or
/// unparseable falls back to `Cpu`, which is always logged.
pub fn choose_runtime_variant(toolkit_version: Option<&str>) -> RuntimeVariant {
    let raw = match toolkit_version {
        Some(v) => v,
        None => {
            log::warn!("[Hardware] [TOOLKIT] No compute toolkit found, using cpu runtime");
            return RuntimeVariant::Cpu;
        }
    };

    let version = match parse_version(raw) {
        Some(v) => v,
        None => {
            log::warn!(
                "[Hardware] [TOOLKIT] Unparseable toolkit version '{}', using cpu runtime",
                raw
            );
            return RuntimeVariant::Cpu;
        }
    };

    for (bound, variant) in RUNTIME_BRACKETS {
        if version >= *bound {
            log::debug!("[Hardware] [TOOLKIT] {} -> {}", raw, variant);
            return *variant;
        }
    }

    log::warn!(
        "[Hardware] [TOOLKIT] Toolkit {} is below the minimum supported 11.8, using cpu runtime",
        raw
    );
    RuntimeVariant::Cpu
}
