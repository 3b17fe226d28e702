/// Workspace layout: fixed directory roles shared with the external tools.
///
/// A `.splatforge` anchor file marks the workspace root so commands run from a
/// nested directory still resolve the same tree.
///
/// ```text
/// <root>/input/            source images
/// <root>/cache/artifacts/  downloaded reference artifacts
/// <root>/cache/work/       stage outputs (databases, models)
/// <root>/cache/build/      environment build byproducts
/// <root>/cache/state/      phase/stage ledgers, capability snapshot, receipts
/// <root>/cache/env/        training environment (venv)
/// <root>/output/           per-run packages and run history
/// <root>/logs/             full and parsed logs
/// ```
use std::path::{Path, PathBuf};

pub const ANCHOR_FILE: &str = ".splatforge";

#[derive(Clone, Debug)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkspaceLayout { root: root.into() }
    }

    /// Walk upward from `start` looking for the anchor file.
    ///
    /// Falls back to `start` itself when no anchor exists yet (fresh workspace).
    pub fn discover(start: &Path) -> Self {
        let mut current = start.to_path_buf();
        loop {
            if current.join(ANCHOR_FILE).is_file() {
                log::debug!("[Workspace] Anchor found at {}", current.display());
                return WorkspaceLayout::new(current);
            }
            match current.parent() {
                Some(parent) if parent != current => current = parent.to_path_buf(),
                _ => break,
            }
        }
        WorkspaceLayout::new(start)
    }

    /// Create every layout directory and the anchor file. Idempotent.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in self.required_dirs() {
            std::fs::create_dir_all(&dir)?;
        }
        let anchor = self.root.join(ANCHOR_FILE);
        if !anchor.exists() {
            std::fs::write(&anchor, "")?;
        }
        Ok(())
    }

    /// Directories whose presence `host-prep` validates.
    pub fn required_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.input_dir(),
            self.artifacts_dir(),
            self.work_dir(),
            self.build_dir(),
            self.state_dir(),
            self.output_dir(),
            self.logs_dir(),
        ]
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.cache_dir().join("artifacts")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.cache_dir().join("work")
    }

    pub fn build_dir(&self) -> PathBuf {
        self.cache_dir().join("build")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.cache_dir().join("state")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.cache_dir().join("env")
    }

    /// Executable installed into the training environment.
    pub fn venv_bin(&self, name: &str) -> PathBuf {
        self.venv_dir().join("bin").join(name)
    }

    pub fn venv_python(&self) -> PathBuf {
        self.venv_bin("python")
    }

    pub fn phase_ledger(&self) -> PathBuf {
        self.state_dir().join("phases.json")
    }

    pub fn stage_ledger(&self) -> PathBuf {
        self.state_dir().join("stages.json")
    }

    pub fn capability_snapshot(&self) -> PathBuf {
        self.state_dir().join("capability.json")
    }

    pub fn environment_receipt(&self) -> PathBuf {
        self.state_dir().join("environment.json")
    }

    pub fn tool_receipt(&self) -> PathBuf {
        self.state_dir().join("tools.txt")
    }

    pub fn run_history(&self) -> PathBuf {
        self.output_dir().join("runs.jsonl")
    }

    pub fn default_config_file(&self) -> PathBuf {
        self.root.join("splatforge.conf")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_ensure_creates_layout_and_anchor() {
        let temp = tempdir().unwrap();
        let layout = WorkspaceLayout::new(temp.path());
        layout.ensure().unwrap();

        for dir in layout.required_dirs() {
            assert!(dir.is_dir(), "{} missing", dir.display());
        }
        assert!(temp.path().join(ANCHOR_FILE).exists());

        // second call is a no-op
        layout.ensure().unwrap();
    }

    #[test]
    fn test_discover_walks_up_to_anchor() {
        let temp = tempdir().unwrap();
        let nested = temp.path().join("input").join("day1");
        fs::create_dir_all(&nested).unwrap();
        fs::write(temp.path().join(ANCHOR_FILE), "").unwrap();

        let layout = WorkspaceLayout::discover(&nested);
        assert_eq!(layout.root(), temp.path());
    }

    #[test]
    fn test_discover_without_anchor_uses_start() {
        let temp = tempdir().unwrap();
        let layout = WorkspaceLayout::discover(temp.path());
        assert_eq!(layout.root(), temp.path());
    }
}
