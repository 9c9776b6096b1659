//! Run-local artifact layout and crash-safe JSON persistence.
//!
//! The canonical layout is
//! `<repo>/.autonomous_runs/<project>/runs/<family>/<run_id>/…`. The short
//! historical form without `<family>` is tolerated in old artifacts but is
//! never emitted here.
//!
//! `atomic_write_json` is the single write path for checkpoints and
//! ledgers: `tmp → fsync → atomic rename → fsync dir`, with the previous
//! version retained as `.bak`.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Paths of one run's local artifacts.
#[derive(Debug, Clone)]
pub struct RunPaths {
    base: PathBuf,
}

impl RunPaths {
    pub fn new(workspace_root: &Path, project: &str, family: &str, run_id: &str) -> Self {
        Self {
            base: workspace_root
                .join(".autonomous_runs")
                .join(project)
                .join("runs")
                .join(family)
                .join(run_id),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn executor_state(&self) -> PathBuf {
        self.base.join("executor_state.json")
    }

    pub fn routing_snapshot(&self) -> PathBuf {
        self.base.join("model_routing_snapshot.json")
    }

    pub fn proof(&self, phase_id: &str) -> PathBuf {
        self.base.join("proofs").join(format!("{}.json", phase_id))
    }

    pub fn phase_summary(&self, phase_index: u32, phase_id: &str) -> PathBuf {
        self.base
            .join("phases")
            .join(format!("{}_{}.md", phase_index, phase_id))
    }

    pub fn ci_report(&self, phase_id: &str) -> PathBuf {
        self.base.join("ci").join(format!("pytest_{}.json", phase_id))
    }

    pub fn ci_log(&self, phase_id: &str) -> PathBuf {
        self.base.join("ci").join(format!("pytest_{}.log", phase_id))
    }

    pub fn diagnostics_dir(&self) -> PathBuf {
        self.base.join("diagnostics")
    }

    pub fn events_log(&self) -> PathBuf {
        self.diagnostics_dir().join("events.jsonl")
    }

    pub fn handoff_dir(&self) -> PathBuf {
        self.base.join("handoff")
    }

    pub fn handoff_context(&self) -> PathBuf {
        self.handoff_dir().join("context.md")
    }

    pub fn approvals_dir(&self) -> PathBuf {
        self.handoff_dir().join("approvals")
    }

    pub fn external_actions_ledger(&self) -> PathBuf {
        self.base.join("external_actions_ledger.json")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.base.join("staging")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.base.clone(),
            self.base.join("proofs"),
            self.base.join("phases"),
            self.base.join("ci"),
            self.diagnostics_dir(),
            self.handoff_dir(),
            self.approvals_dir(),
            self.staging_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create run directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

fn bak_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".bak");
    PathBuf::from(os)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Crash-safe JSON write: serialize to `<path>.tmp`, fsync, keep the
/// current version as `<path>.bak`, atomically rename into place, fsync
/// the directory.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize value")?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let tmp = tmp_path(path);
    {
        use std::io::Write;
        let mut file = File::create(&tmp)
            .with_context(|| format!("Failed to create temp file: {}", tmp.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("Failed to write temp file: {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to fsync temp file: {}", tmp.display()))?;
    }

    if path.exists() {
        fs::copy(path, bak_path(path))
            .with_context(|| format!("Failed to retain backup of {}", path.display()))?;
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename into place: {}", path.display()))?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            if let Err(e) = dir.sync_all() {
                warn!(dir = %parent.display(), error = %e, "directory fsync failed");
            }
        }
    }

    Ok(())
}

/// Load JSON, falling back to the `.bak` copy when the primary is corrupt
/// or missing. The boolean reports whether the backup was used.
pub fn load_json_with_backup<T: DeserializeOwned>(path: &Path) -> Result<(T, bool)> {
    match try_load(path) {
        Ok(value) => Ok((value, false)),
        Err(primary_err) => {
            let bak = bak_path(path);
            match try_load(&bak) {
                Ok(value) => {
                    warn!(
                        path = %path.display(),
                        error = %primary_err,
                        "primary corrupt; restored from backup"
                    );
                    Ok((value, true))
                }
                Err(backup_err) => Err(primary_err.context(format!(
                    "backup also unusable ({}): {}",
                    bak.display(),
                    backup_err
                ))),
            }
        }
    }
}

fn try_load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        value: u32,
    }

    #[test]
    fn test_layout_uses_canonical_form() {
        let paths = RunPaths::new(Path::new("/repo"), "myproj", "build", "run-42");
        assert_eq!(
            paths.executor_state(),
            Path::new("/repo/.autonomous_runs/myproj/runs/build/run-42/executor_state.json")
        );
        assert_eq!(
            paths.proof("p1"),
            Path::new("/repo/.autonomous_runs/myproj/runs/build/run-42/proofs/p1.json")
        );
        assert_eq!(
            paths.ci_report("p1"),
            Path::new("/repo/.autonomous_runs/myproj/runs/build/run-42/ci/pytest_p1.json")
        );
    }

    #[test]
    fn test_atomic_write_retains_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write_json(&path, &Doc { value: 1 }).unwrap();
        assert!(path.exists());
        assert!(!bak_path(&path).exists());

        atomic_write_json(&path, &Doc { value: 2 }).unwrap();
        let (doc, from_backup) = load_json_with_backup::<Doc>(&path).unwrap();
        assert_eq!(doc, Doc { value: 2 });
        assert!(!from_backup);

        let (bak, _) = load_json_with_backup::<Doc>(&bak_path(&path)).unwrap();
        assert_eq!(bak, Doc { value: 1 });
    }

    #[test]
    fn test_corrupt_primary_recovers_from_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write_json(&path, &Doc { value: 1 }).unwrap();
        atomic_write_json(&path, &Doc { value: 2 }).unwrap();
        fs::write(&path, "{ corrupted").unwrap();

        let (doc, from_backup) = load_json_with_backup::<Doc>(&path).unwrap();
        assert_eq!(doc, Doc { value: 1 });
        assert!(from_backup);
    }

    #[test]
    fn test_both_corrupt_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ corrupted").unwrap();
        fs::write(bak_path(&path), "also corrupted").unwrap();

        assert!(load_json_with_backup::<Doc>(&path).is_err());
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path(), "proj", "fam", "r1");
        paths.ensure_directories().unwrap();
        assert!(paths.diagnostics_dir().exists());
        assert!(paths.approvals_dir().exists());
        assert!(paths.base().join("proofs").exists());
    }
}
