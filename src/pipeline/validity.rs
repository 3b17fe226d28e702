//! Stage output layout, structural checks and the stage ledger.
//!
//! A stage counts as complete on resume only if its recorded fingerprints
//! match the files on disk and the files pass a structural check for their
//! format. Presence alone is never enough.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use super::Stage;
use crate::models::ValidityMarker;
use crate::orchestrator::state::{load_json, save_json};
use crate::system::integrity;

const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";
const SQLITE_HEADER_LEN: usize = 100;

/// Where each stage writes inside `cache/work/`.
#[derive(Debug, Clone)]
pub struct WorkPaths {
    root: PathBuf,
}

impl WorkPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkPaths { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn features_db(&self) -> PathBuf {
        self.root.join("features.db")
    }

    pub fn matches_db(&self) -> PathBuf {
        self.root.join("matches.db")
    }

    pub fn sparse_dir(&self) -> PathBuf {
        self.root.join("sparse")
    }

    /// First reconstructed model; the mapper numbers models from 0.
    pub fn sparse_model(&self) -> PathBuf {
        self.sparse_dir().join("0")
    }

    pub fn dense_dir(&self) -> PathBuf {
        self.root.join("dense")
    }

    pub fn fused_ply(&self) -> PathBuf {
        self.dense_dir().join("fused.ply")
    }

    pub fn model_dir(&self) -> PathBuf {
        self.root.join("model")
    }

    pub fn splat_ply(&self) -> PathBuf {
        self.model_dir().join("exports").join("gaussian_splats.ply")
    }

    /// Files a resumable stage must leave behind.
    pub fn outputs(&self, stage: Stage) -> Vec<PathBuf> {
        match stage {
            Stage::ExtractFeatures => vec![self.features_db()],
            Stage::MatchFeatures => vec![self.matches_db()],
            Stage::SparseReconstruct => SPARSE_FILES
                .iter()
                .map(|f| self.sparse_model().join(f))
                .collect(),
            Stage::DenseReconstruct => vec![self.fused_ply()],
            Stage::TrainModel => vec![self.splat_ply()],
            _ => Vec::new(),
        }
    }

    /// Structural check of every output of `stage`; reports the first bad file.
    pub fn check(&self, stage: Stage) -> Result<(), (PathBuf, String)> {
        for path in self.outputs(stage) {
            let result = match stage {
                Stage::ExtractFeatures | Stage::MatchFeatures => check_sqlite(&path),
                Stage::SparseReconstruct => check_colmap_bin(&path),
                Stage::DenseReconstruct | Stage::TrainModel => check_ply(&path),
                _ => Ok(()),
            };
            result.map_err(|reason| (path.clone(), reason))?;
        }
        Ok(())
    }
}

pub const SPARSE_FILES: [&str; 3] = ["cameras.bin", "images.bin", "points3D.bin"];

fn read_prefix(path: &Path, len: usize) -> Result<Vec<u8>, String> {
    let mut file = File::open(path).map_err(|e| format!("cannot open: {}", e))?;
    let mut buf = Vec::with_capacity(len);
    file.by_ref()
        .take(len as u64)
        .read_to_end(&mut buf)
        .map_err(|e| format!("cannot read: {}", e))?;
    Ok(buf)
}

/// SQLite database: magic header, and a file at least as long as the page
/// count recorded in the header says it is.
pub fn check_sqlite(path: &Path) -> Result<(), String> {
    let header = read_prefix(path, SQLITE_HEADER_LEN)?;
    if header.len() < SQLITE_HEADER_LEN {
        return Err(format!("{} bytes, shorter than a SQLite header", header.len()));
    }
    if &header[..16] != SQLITE_MAGIC {
        return Err("not a SQLite database".to_string());
    }

    let raw_page_size = u16::from_be_bytes([header[16], header[17]]) as u64;
    let page_size = if raw_page_size == 1 { 65536 } else { raw_page_size };
    let page_count = u32::from_be_bytes([header[28], header[29], header[30], header[31]]) as u64;

    let actual = fs::metadata(path).map_err(|e| e.to_string())?.len();
    if page_count > 0 && actual < page_size * page_count {
        return Err(format!(
            "truncated: {} bytes, header declares {} pages of {} bytes",
            actual, page_count, page_size
        ));
    }
    Ok(())
}

/// Reconstruction binary model file: little-endian u64 record count > 0.
pub fn check_colmap_bin(path: &Path) -> Result<(), String> {
    let prefix = read_prefix(path, 8)?;
    if prefix.len() < 8 {
        return Err("missing record count".to_string());
    }
    let mut count = [0u8; 8];
    count.copy_from_slice(&prefix);
    match u64::from_le_bytes(count) {
        0 => Err("zero records".to_string()),
        _ => Ok(()),
    }
}

fn ply_property_size(kind: &str) -> Option<u64> {
    match kind {
        "char" | "uchar" | "int8" | "uint8" => Some(1),
        "short" | "ushort" | "int16" | "uint16" => Some(2),
        "int" | "uint" | "float" | "int32" | "uint32" | "float32" => Some(4),
        "double" | "float64" => Some(8),
        _ => None,
    }
}

/// PLY file with a non-empty vertex element and a body long enough to hold it.
pub fn check_ply(path: &Path) -> Result<(), String> {
    let file = File::open(path).map_err(|e| format!("cannot open: {}", e))?;
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut header_len: u64 = 0;

    let mut next_line = |reader: &mut BufReader<File>, line: &mut String| -> Result<bool, String> {
        line.clear();
        let read = reader
            .read_line(line)
            .map_err(|e| format!("unreadable header: {}", e))?;
        header_len += read as u64;
        Ok(read > 0)
    };

    if !next_line(&mut reader, &mut line)? || line.trim() != "ply" {
        return Err("missing ply magic".to_string());
    }

    let mut binary = false;
    let mut vertices: Option<u64> = None;
    let mut in_vertex = false;
    let mut stride: Option<u64> = Some(0);
    let mut vertex_first = None;

    loop {
        if !next_line(&mut reader, &mut line)? {
            return Err("header not terminated".to_string());
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["end_header"] => break,
            ["format", format, ..] => binary = format.starts_with("binary"),
            ["element", "vertex", count] => {
                vertices = Some(
                    count
                        .parse()
                        .map_err(|_| format!("bad vertex count '{}'", count))?,
                );
                vertex_first.get_or_insert(true);
                in_vertex = true;
            }
            ["element", ..] => {
                vertex_first.get_or_insert(false);
                in_vertex = false;
            }
            ["property", "list", ..] if in_vertex => stride = None,
            ["property", kind, _name] if in_vertex => {
                stride = match (stride, ply_property_size(kind)) {
                    (Some(total), Some(size)) => Some(total + size),
                    _ => None,
                };
            }
            _ => {}
        }
    }

    let vertices = match vertices {
        Some(0) | None => return Err("no vertices".to_string()),
        Some(n) => n,
    };

    let total = fs::metadata(path).map_err(|e| e.to_string())?.len();
    let body = total.saturating_sub(header_len);
    if binary && vertex_first == Some(true) {
        if let Some(stride) = stride {
            if body < vertices * stride {
                return Err(format!(
                    "truncated: {} body bytes, {} vertices of {} bytes declared",
                    body, vertices, stride
                ));
            }
        }
    } else if body == 0 {
        return Err("empty body".to_string());
    }
    Ok(())
}

/// Completed resumable stages of the current work directory, keyed by stage.
#[derive(Debug, Clone)]
pub struct StageLedger {
    path: PathBuf,
    markers: BTreeMap<Stage, ValidityMarker>,
}

impl StageLedger {
    pub fn load(path: &Path) -> io::Result<Self> {
        Ok(StageLedger {
            path: path.to_path_buf(),
            markers: load_json(path)?.unwrap_or_default(),
        })
    }

    pub fn save(&self) -> io::Result<()> {
        save_json(&self.path, &self.markers)
    }

    pub fn marker(&self, stage: Stage) -> Option<&ValidityMarker> {
        self.markers.get(&stage)
    }

    pub fn record(&mut self, stage: Stage, marker: ValidityMarker) {
        self.markers.insert(stage, marker);
    }

    /// Forget `stage` and everything after it.
    pub fn invalidate_from(&mut self, stage: Stage) {
        self.markers.retain(|recorded, _| *recorded < stage);
    }

    /// Whether `stage` may be skipped: recorded facts equal `facts`, the
    /// fingerprints still match, and the outputs are structurally sound.
    pub fn is_complete(
        &self,
        stage: Stage,
        work: &WorkPaths,
        facts: &[(String, String)],
    ) -> bool {
        let marker = match self.markers.get(&stage) {
            Some(marker) => marker,
            None => return false,
        };
        if marker.facts != facts {
            log::info!("[Pipeline] [{}] Settings changed since last run", stage);
            return false;
        }
        if marker.files.is_empty() || !integrity::marker_matches(work.root(), marker) {
            log::info!("[Pipeline] [{}] Recorded outputs changed on disk", stage);
            return false;
        }
        match work.check(stage) {
            Ok(()) => true,
            Err((path, reason)) => {
                log::warn!(
                    "[Pipeline] [{}] {} failed structural check: {}",
                    stage,
                    path.display(),
                    reason
                );
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Minimal well-formed stage outputs, shared with the driver tests.

    use std::fs;
    use std::path::Path;

    pub fn sqlite(path: &Path, pages: u32) {
        let page_size: u16 = 512;
        let mut bytes = vec![0u8; page_size as usize * pages.max(1) as usize];
        bytes[..16].copy_from_slice(super::SQLITE_MAGIC);
        bytes[16..18].copy_from_slice(&page_size.to_be_bytes());
        bytes[28..32].copy_from_slice(&pages.to_be_bytes());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, bytes).unwrap();
    }

    pub fn colmap_bin(path: &Path, count: u64) {
        let mut bytes = count.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 32]);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, bytes).unwrap();
    }

    pub fn ply(path: &Path, vertices: u64) {
        let header = format!(
            "ply\nformat binary_little_endian 1.0\nelement vertex {}\nproperty float x\nproperty float y\nproperty float z\nend_header\n",
            vertices
        );
        let mut bytes = header.into_bytes();
        bytes.extend(std::iter::repeat(0u8).take(vertices as usize * 12));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, bytes).unwrap();
    }
}
