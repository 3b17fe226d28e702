//! `key=value` config file parsing and backed-up persistence.

use crate::error::ConfigError;
use chrono::Local;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Parse `key=value` lines. Blank lines and lines starting with `#` are ignored.
pub fn parse_config(contents: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut values = BTreeMap::new();

    for (idx, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::ParseFailed {
            line: idx + 1,
            reason: format!("expected key=value, got '{}'", line),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::ParseFailed {
                line: idx + 1,
                reason: "empty key".to_string(),
            });
        }

        if values
            .insert(key.to_string(), value.trim().to_string())
            .is_some()
        {
            log::warn!(
                "[Config] [LOADER] Key '{}' repeated on line {}, last value wins",
                key,
                idx + 1
            );
        }
    }

    Ok(values)
}

/// Load a config file. A missing file is an empty layer, not an error.
pub fn load_file(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    match fs::read_to_string(path) {
        Ok(contents) => parse_config(&contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("[Config] [LOADER] No config file at {}", path.display());
            Ok(BTreeMap::new())
        }
        Err(e) => Err(ConfigError::IoError(e)),
    }
}

/// Parse a `--set key=value` assignment.
pub fn parse_assignment(assignment: &str) -> Result<(String, String), ConfigError> {
    match assignment.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(ConfigError::InvalidValue {
            key: assignment.to_string(),
            value: String::new(),
            reason: "expected KEY=VALUE".to_string(),
        }),
    }
}

/// Backup path for `path` taken at the current local time.
pub fn backup_path_for(path: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let mut candidate = PathBuf::from(format!("{}.bak.{}", path.display(), stamp));
    let mut counter = 1;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{}.bak.{}-{}", path.display(), stamp, counter));
        counter += 1;
    }
    candidate
}

/// Write `contents` to `path`, first copying any existing file to a timestamped backup.
///
/// Returns the backup location when one was made.
pub fn write_with_backup(path: &Path, contents: &str) -> Result<Option<PathBuf>, ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let backup = if path.exists() {
        let backup = backup_path_for(path);
        fs::copy(path, &backup)?;
        log::info!(
            "[Config] [PERSIST] Backed up {} to {}",
            path.display(),
            backup.display()
        );
        Some(backup)
    } else {
        None
    };

    fs::write(path, contents)?;
    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_ignores_comments_and_blanks() {
        let parsed = parse_config("# header\n\ntrain.iterations = 7000\nmatching.strategy=exhaustive\n")
            .unwrap();
        assert_eq!(parsed.get("train.iterations").map(String::as_str), Some("7000"));
        assert_eq!(parsed.get("matching.strategy").map(String::as_str), Some("exhaustive"));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_parse_keeps_equals_in_value() {
        let parsed = parse_config("artifact.vocab_tree_url=https://host/f.bin?a=b\n").unwrap();
        assert_eq!(
            parsed.get("artifact.vocab_tree_url").map(String::as_str),
            Some("https://host/f.bin?a=b")
        );
    }

    #[test]
    fn test_parse_reports_line_number() {
        let err = parse_config("a=1\nbroken line\n").unwrap_err();
        match err {
            ConfigError::ParseFailed { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_is_empty_layer() {
        let dir = tempdir().unwrap();
        let values = load_file(&dir.path().join("absent.conf")).unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("train.iterations=100").unwrap(),
            ("train.iterations".to_string(), "100".to_string())
        );
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=5").is_err());
    }

    #[test]
    fn test_write_with_backup_keeps_previous_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("splatforge.conf");

        assert!(write_with_backup(&path, "a=1\n").unwrap().is_none());
        let backup = write_with_backup(&path, "a=2\n").unwrap().expect("backup made");

        assert_eq!(fs::read_to_string(&backup).unwrap(), "a=1\n");
        assert_eq!(fs::read_to_string(&path).unwrap(), "a=2\n");
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("splatforge.conf.bak."));
    }
}
