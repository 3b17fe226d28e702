//! Accelerator identification and architecture mapping.

use crate::models::ArchitectureTag;
use once_cell::sync::Lazy;
use regex::Regex;

static PROC_VERSION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Kernel Module\s+(?:for\s+\S+\s+)?(\d+\.\d+(?:\.\d+)?)")
        .expect("Invalid driver version regex")
});

/// Device-family table, most specific patterns first.
///
/// Matching is a substring test on the upper-cased device name, so a pattern
/// must precede any shorter pattern it contains (`A100` before `A10`).
pub static ARCHITECTURE_TABLE: &[(&str, ArchitectureTag)] = &[
    ("B200", ArchitectureTag::Sm100),
    ("B100", ArchitectureTag::Sm100),
    ("GH200", ArchitectureTag::Sm90),
    ("H200", ArchitectureTag::Sm90),
    ("H100", ArchitectureTag::Sm90),
    ("H800", ArchitectureTag::Sm90),
    ("ADA GENERATION", ArchitectureTag::Sm89),
    ("L40", ArchitectureTag::Sm89),
    ("L4", ArchitectureTag::Sm89),
    ("RTX 40", ArchitectureTag::Sm89),
    ("RTX A", ArchitectureTag::Sm86),
    ("A100", ArchitectureTag::Sm80),
    ("A800", ArchitectureTag::Sm80),
    ("A30", ArchitectureTag::Sm80),
    ("A40", ArchitectureTag::Sm86),
    ("A10", ArchitectureTag::Sm86),
    ("RTX 30", ArchitectureTag::Sm86),
    ("QUADRO RTX", ArchitectureTag::Sm75),
    ("TITAN RTX", ArchitectureTag::Sm75),
    ("RTX 20", ArchitectureTag::Sm75),
    ("T4", ArchitectureTag::Sm75),
    ("V100", ArchitectureTag::Sm70),
    ("TITAN V", ArchitectureTag::Sm70),
    ("P100", ArchitectureTag::Sm60),
    ("GTX 10", ArchitectureTag::Sm60),
];

/// Look up a device name without the fallback.
pub fn lookup_architecture(device_name: &str) -> Option<ArchitectureTag> {
    let upper = device_name.to_uppercase();
    ARCHITECTURE_TABLE
        .iter()
        .find(|(pattern, _)| upper.contains(pattern))
        .map(|(_, tag)| *tag)
}

/// Map a device name to its architecture tag.
///
/// Unknown devices resolve to `ArchitectureTag::SAFE_DEFAULT` with a warning.
pub fn map_device_to_architecture(device_name: &str) -> ArchitectureTag {
    match lookup_architecture(device_name) {
        Some(tag) => {
            log::debug!("[Hardware] [GPU] '{}' -> {}", device_name, tag);
            tag
        }
        None => {
            log::warn!(
                "[Hardware] [GPU] Unrecognized device '{}', using safe default architecture {}",
                device_name,
                ArchitectureTag::SAFE_DEFAULT
            );
            ArchitectureTag::SAFE_DEFAULT
        }
    }
}

/// One accelerator reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    pub name: String,
    pub driver_version: Option<String>,
}

/// Parse `nvidia-smi --query-gpu=name,driver_version --format=csv,noheader` output.
pub fn parse_gpu_query(output: &str) -> Vec<GpuDevice> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let mut fields = line.splitn(2, ',').map(str::trim);
            let name = fields.next()?.to_string();
            if name.is_empty() {
                return None;
            }
            let driver_version = fields
                .next()
                .filter(|v| !v.is_empty())
                .map(str::to_string);
            Some(GpuDevice {
                name,
                driver_version,
            })
        })
        .collect()
}

/// Extract the kernel module version from `/proc/driver/nvidia/version`.
pub fn parse_proc_driver_version(contents: &str) -> Option<String> {
    PROC_VERSION_REGEX
        .captures(contents)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_every_table_entry_maps_to_its_tag() {
        for (pattern, tag) in ARCHITECTURE_TABLE {
            assert_eq!(map_device_to_architecture(pattern), *tag, "{}", pattern);
        }
    }

    #[test]
    fn test_real_device_names() {
        assert_eq!(
            map_device_to_architecture("NVIDIA A100-SXM4-80GB"),
            ArchitectureTag::Sm80
        );
        assert_eq!(map_device_to_architecture("NVIDIA A10G"), ArchitectureTag::Sm86);
        assert_eq!(
            map_device_to_architecture("NVIDIA GeForce RTX 4090"),
            ArchitectureTag::Sm89
        );
        assert_eq!(map_device_to_architecture("NVIDIA L40S"), ArchitectureTag::Sm89);
        assert_eq!(map_device_to_architecture("Tesla T4"), ArchitectureTag::Sm75);
        assert_eq!(
            map_device_to_architecture("NVIDIA RTX A4000"),
            ArchitectureTag::Sm86
        );
        assert_eq!(
            map_device_to_architecture("NVIDIA H100 80GB HBM3"),
            ArchitectureTag::Sm90
        );
        assert_eq!(
            map_device_to_architecture("nvidia geforce rtx 3090"),
            ArchitectureTag::Sm86
        );
    }

    #[test]
    fn test_unknown_device_uses_safe_default() {
        assert_eq!(
            map_device_to_architecture("Matrox G200eR2"),
            ArchitectureTag::SAFE_DEFAULT
        );
        assert_eq!(map_device_to_architecture(""), ArchitectureTag::SAFE_DEFAULT);
    }

    #[test]
    fn test_parse_gpu_query() {
        let devices = parse_gpu_query(
            "NVIDIA A100-SXM4-40GB, 535.104.05\nNVIDIA A100-SXM4-40GB, 535.104.05\n\n",
        );
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "NVIDIA A100-SXM4-40GB");
        assert_eq!(devices[0].driver_version.as_deref(), Some("535.104.05"));
    }

    #[test]
    fn test_parse_proc_driver_version() {
        let contents = "NVRM version: NVIDIA UNIX x86_64 Kernel Module  550.54.14  Thu Feb 22 01:44:30 UTC 2024\nGCC version:  gcc version 12.2.0";
        assert_eq!(
            parse_proc_driver_version(contents).as_deref(),
            Some("550.54.14")
        );
        assert_eq!(parse_proc_driver_version("garbage"), None);
    }

    proptest! {
        #[test]
        fn prop_mapping_is_total(name in "\\PC{0,40}") {
            let tag = map_device_to_architecture(&name);
            match lookup_architecture(&name) {
                Some(expected) => prop_assert_eq!(tag, expected),
                None => prop_assert_eq!(tag, ArchitectureTag::SAFE_DEFAULT),
            }
        }

        #[test]
        fn prop_names_without_patterns_get_default(name in "[a-z ]{0,24}") {
            let upper = name.to_uppercase();
            let matched = ARCHITECTURE_TABLE.iter().any(|(p, _)| upper.contains(p));
            if !matched {
                prop_assert_eq!(map_device_to_architecture(&name), ArchitectureTag::SAFE_DEFAULT);
            }
        }
    }
}
