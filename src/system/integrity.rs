//! Content fingerprints backing validity markers and artifact checksums.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::models::{FileFingerprint, ValidityMarker};

/// Stream a file through SHA-256 and return the lowercase hex digest.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprint `path`, recording it relative to `base` when possible.
pub fn fingerprint(base: &Path, path: &Path) -> io::Result<FileFingerprint> {
    let size = std::fs::metadata(path)?.len();
    let sha256 = sha256_file(path)?;
    let recorded = path
        .strip_prefix(base)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf());

    Ok(FileFingerprint {
        path: recorded,
        size,
        sha256,
    })
}

pub fn fingerprint_all(base: &Path, paths: &[PathBuf]) -> io::Result<Vec<FileFingerprint>> {
    paths.iter().map(|p| fingerprint(base, p)).collect()
}

/// Whether the file on disk still has the recorded size and hash.
pub fn fingerprint_matches(base: &Path, recorded: &FileFingerprint) -> bool {
    let path = base.join(&recorded.path);
    let size = match std::fs::metadata(&path) {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return false,
    };
    if size != recorded.size {
        return false;
    }
    match sha256_file(&path) {
        Ok(hash) => hash == recorded.sha256,
        Err(_) => false,
    }
}

/// Whether every file covered by the marker is unchanged on disk.
pub fn marker_matches(base: &Path, marker: &ValidityMarker) -> bool {
    marker
        .files
        .iter()
        .all(|recorded| fingerprint_matches(base, recorded))
}

/// Total size in bytes of all regular files below `dir`.
pub fn dir_size(dir: &Path) -> u64 {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            match entry.metadata() {
                Ok(meta) if meta.is_dir() => dir_size(&path),
                Ok(meta) => meta.len(),
                Err(_) => 0,
            }
        })
        .sum()
}

/// All regular files below `dir`, sorted for deterministic manifests.
pub fn list_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    collect_files(dir, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}
