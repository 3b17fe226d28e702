//! Append-only run history in `output/runs.jsonl`.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use crate::models::RunRecord;

/// Append one record as a JSON line.
pub fn append(path: &Path, record: &RunRecord) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(record)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}

/// Every readable record, oldest first. Unparseable lines are skipped.
pub fn read_all(path: &Path) -> io::Result<Vec<RunRecord>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    Ok(contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("[History] Skipping unreadable run record: {}", e);
                None
            }
        })
        .collect())
}

pub fn last(path: &Path) -> io::Result<Option<RunRecord>> {
    Ok(read_all(path)?.pop())
}
