//! Memory and disk preflight.

use crate::error::ResourceError;
use std::path::{Path, PathBuf};
use sysinfo::{Disks, System};

const GIB: u64 = 1024 * 1024 * 1024;

/// Resources available to a run, in whole GiB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub available_memory_gb: u64,
    pub free_disk_gb: u64,
    pub disk_path: PathBuf,
}

/// Sample available memory and free space of the filesystem holding `path`.
pub fn probe_resources(path: &Path) -> ResourceSnapshot {
    let mut system = System::new();
    system.refresh_memory();
    let available_memory_gb = system.available_memory() / GIB;

    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    let free_disk_bytes = disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
        .unwrap_or_else(|| {
            log::warn!(
                "[Hardware] [RESOURCES] No mounted filesystem found for {}",
                target.display()
            );
            0
        });

    ResourceSnapshot {
        available_memory_gb,
        free_disk_gb: free_disk_bytes / GIB,
        disk_path: target,
    }
}

/// Compare a snapshot against minimum requirements.
pub fn check_requirements(
    snapshot: &ResourceSnapshot,
    min_memory_gb: u64,
    min_disk_gb: u64,
) -> Result<(), ResourceError> {
    if snapshot.available_memory_gb < min_memory_gb {
        return Err(ResourceError::InsufficientMemory {
            available_gb: snapshot.available_memory_gb,
            required_gb: min_memory_gb,
        });
    }

    if snapshot.free_disk_gb < min_disk_gb {
        return Err(ResourceError::InsufficientDisk {
            path: snapshot.disk_path.display().to_string(),
            available_gb: snapshot.free_disk_gb,
            required_gb: min_disk_gb,
        });
    }

    Ok(())
}

/// Probe and check in one step. Runs before any phase starts.
pub fn preflight(
    workspace: &Path,
    min_memory_gb: u64,
    min_disk_gb: u64,
) -> Result<ResourceSnapshot, ResourceError> {
    let snapshot = probe_resources(workspace);
    log::info!(
        "[Hardware] [RESOURCES] {} GB memory available, {} GB free at {}",
        snapshot.available_memory_gb,
        snapshot.free_disk_gb,
        snapshot.disk_path.display()
    );
    check_requirements(&snapshot, min_memory_gb, min_disk_gb)?;
    Ok(snapshot)
}
