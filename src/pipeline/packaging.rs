//! Run packages: stage outputs copied into `output/<run_id>/` with a manifest.

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::stage::Stage;
use super::validity::{WorkPaths, SPARSE_FILES};
use crate::models::FileFingerprint;
use crate::orchestrator::state::save_json;
use crate::system::integrity;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SPLAT_FILE: &str = "gaussian_splats.ply";
pub const FAILURE_FILE: &str = "failure.txt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    /// Written after a failed stage; holds whatever outputs existed.
    pub partial: bool,
    pub files: Vec<FileFingerprint>,
}

impl PackageManifest {
    pub fn load(dir: &Path) -> io::Result<Self> {
        let contents = fs::read_to_string(dir.join(MANIFEST_FILE))?;
        serde_json::from_str(&contents).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Why a run stopped, written next to its partial package.
#[derive(Debug, Clone)]
pub struct FailureNote<'a> {
    pub stage: Stage,
    pub message: String,
    pub diagnostics: &'a [String],
}

impl FailureNote<'_> {
    fn render(&self) -> String {
        let mut out = format!("stage: {}\nerror: {}\n", self.stage, self.message);
        if !self.diagnostics.is_empty() {
            out.push_str("\nlast tool output:\n");
            for line in self.diagnostics {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}

/// Copies outputs into a run directory.
#[derive(Debug, Clone)]
pub struct Packager {
    output_dir: PathBuf,
    compress: bool,
}

fn gzip(src: &Path, dest: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(src)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(dest)?), Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?.flush()
}

impl Packager {
    pub fn new(output_dir: impl Into<PathBuf>, compress: bool) -> Self {
        Packager {
            output_dir: output_dir.into(),
            compress,
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.output_dir.join(run_id)
    }

    /// (source, path inside the package) for every packageable output.
    fn candidates(work: &WorkPaths) -> Vec<(PathBuf, PathBuf)> {
        let mut files: Vec<(PathBuf, PathBuf)> = SPARSE_FILES
            .iter()
            .map(|f| (work.sparse_model().join(f), Path::new("sparse").join(f)))
            .collect();
        files.push((work.fused_ply(), PathBuf::from("fused.ply")));
        files.push((work.splat_ply(), PathBuf::from(SPLAT_FILE)));
        files
    }

    /// Finished outputs plus the intermediate databases, for postmortems.
    fn salvage_candidates(work: &WorkPaths) -> Vec<(PathBuf, PathBuf)> {
        let mut files = vec![
            (work.features_db(), PathBuf::from("database/features.db")),
            (work.matches_db(), PathBuf::from("database/matches.db")),
        ];
        files.extend(Self::candidates(work));
        files
    }

    /// Package a finished run. The trained model must exist.
    pub fn package(&self, run_id: &str, work: &WorkPaths) -> io::Result<PathBuf> {
        if !work.splat_ply().is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("trained model missing: {}", work.splat_ply().display()),
            ));
        }
        self.write(run_id, Self::candidates(work), None)
    }

    /// Package whatever a failed run left behind, with a `failure.txt`
    /// describing the failing stage. `None` when no stage produced anything.
    pub fn package_partial(
        &self,
        run_id: &str,
        work: &WorkPaths,
        failure: &FailureNote<'_>,
    ) -> io::Result<Option<PathBuf>> {
        let files = Self::salvage_candidates(work);
        if !files.iter().any(|(src, _)| src.is_file()) {
            log::info!("[Package] [PARTIAL] No stage outputs to salvage");
            return Ok(None);
        }
        self.write(run_id, files, Some(failure)).map(Some)
    }

    fn write(
        &self,
        run_id: &str,
        files: Vec<(PathBuf, PathBuf)>,
        failure: Option<&FailureNote<'_>>,
    ) -> io::Result<PathBuf> {
        let partial = failure.is_some();
        let run_dir = self.run_dir(run_id);
        fs::create_dir_all(&run_dir)?;

        let mut packaged = Vec::new();
        for (src, relative) in files {
            if !src.is_file() {
                continue;
            }
            let dest = run_dir.join(&relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&src, &dest)?;
            packaged.push(dest);
        }

        let splat = run_dir.join(SPLAT_FILE);
        if self.compress && splat.is_file() {
            let compressed = run_dir.join(format!("{}.gz", SPLAT_FILE));
            gzip(&splat, &compressed)?;
            packaged.push(compressed);
        }

        if let Some(note) = failure {
            let path = run_dir.join(FAILURE_FILE);
            fs::write(&path, note.render())?;
            packaged.push(path);
        }

        let manifest = PackageManifest {
            run_id: run_id.to_string(),
            created_at: Utc::now(),
            partial,
            files: integrity::fingerprint_all(&run_dir, &packaged)?,
        };
        save_json(&run_dir.join(MANIFEST_FILE), &manifest)?;

        log::info!(
            target: "parsed",
            "[Package] [{}] {} file(s) in {}",
            if partial { "PARTIAL" } else { "DONE" },
            manifest.files.len(),
            run_dir.display()
        );
        Ok(run_dir)
    }
}
