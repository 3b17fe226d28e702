//! Persisted phase ledger.
//!
//! The ledger is a JSON array of `PhaseRecord`s in `cache/state/phases.json`.
//! It is rewritten through a temporary file after every status change, so an
//! interrupted run leaves either the previous or the new ledger on disk.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::PhaseError;
use crate::models::{PhaseRecord, PhaseStatus, ValidityMarker};

/// Write `value` as pretty JSON via `<path>.tmp` and rename.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

/// Read JSON from `path`. A missing file is `Ok(None)`; an unreadable one is
/// discarded with a warning since validity checks rebuild what it described.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            log::warn!(
                "[State] [LEDGER] Discarding unreadable ledger {}: {}",
                path.display(),
                e
            );
            Ok(None)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhaseLedger {
    path: PathBuf,
    records: Vec<PhaseRecord>,
}

impl PhaseLedger {
    pub fn load(path: &Path) -> Result<Self, PhaseError> {
        let records: Vec<PhaseRecord> = load_json(path)?.unwrap_or_default();
        Ok(PhaseLedger {
            path: path.to_path_buf(),
            records,
        })
    }

    pub fn save(&self) -> Result<(), PhaseError> {
        save_json(&self.path, &self.records)
            .map_err(|e| PhaseError::Ledger(format!("{}: {}", self.path.display(), e)))
    }

    pub fn records(&self) -> &[PhaseRecord] {
        &self.records
    }

    pub fn get(&self, name: &str) -> Option<&PhaseRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    fn entry(&mut self, name: &str) -> &mut PhaseRecord {
        let index = match self.records.iter().position(|r| r.name == name) {
            Some(index) => index,
            None => {
                self.records.push(PhaseRecord::pending(name));
                self.records.len() - 1
            }
        };
        &mut self.records[index]
    }

    pub fn mark_running(&mut self, name: &str) {
        let record = self.entry(name);
        record.status = PhaseStatus::Running;
        record.error = None;
    }

    pub fn mark_succeeded(&mut self, name: &str, marker: ValidityMarker) {
        let record = self.entry(name);
        record.status = PhaseStatus::Succeeded;
        record.marker = Some(marker);
        record.error = None;
    }

    pub fn mark_skipped(&mut self, name: &str) {
        self.entry(name).status = PhaseStatus::Skipped;
    }

    /// A failed phase loses its marker: nothing it produced is trusted.
    pub fn mark_failed(&mut self, name: &str, error: String) {
        let record = self.entry(name);
        record.status = PhaseStatus::Failed;
        record.marker = None;
        record.error = Some(error);
    }
}
