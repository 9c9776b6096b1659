//! Staging overlay and rollback manifest for atomic apply.
//!
//! Materialized file contents are written to a staging directory first,
//! originals are backed up, and only then are staged files renamed into
//! place. Any failure during commit restores every file from its backup,
//! so the workspace observes all operations or none.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One pre-apply backup: `backup` is `None` for files that did not exist
/// (their rollback is deletion).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEntry {
    pub path: String,
    pub backup: Option<PathBuf>,
}

/// The file-backup manifest: the pre-apply checkpoint sufficient to roll
/// the workspace back if CI later detects a regression.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupManifest {
    pub entries: Vec<BackupEntry>,
}

impl BackupManifest {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize manifest")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write backup manifest: {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read backup manifest: {}", path.display()))?;
        serde_json::from_str(&content).context("Failed to parse backup manifest")
    }
}

/// A staged change set: writes and deletes that commit together.
pub struct Stage {
    workspace_root: PathBuf,
    staging_dir: PathBuf,
    backup_dir: PathBuf,
    /// (relative path, new content). `None` content is a delete.
    pending: Vec<(String, Option<String>)>,
}

impl Stage {
    /// Create a staging area under `staging_root` (kept off the governed
    /// workspace tree).
    pub fn new(workspace_root: &Path, staging_root: &Path) -> Result<Self> {
        let token = uuid::Uuid::new_v4().to_string();
        let staging_dir = staging_root.join(format!("staging-{}", token));
        let backup_dir = staging_root.join(format!("backup-{}", token));
        fs::create_dir_all(&staging_dir).context("Failed to create staging directory")?;
        fs::create_dir_all(&backup_dir).context("Failed to create backup directory")?;
        Ok(Self {
            workspace_root: workspace_root.to_path_buf(),
            staging_dir,
            backup_dir,
            pending: Vec::new(),
        })
    }

    pub fn stage_write(&mut self, rel_path: &str, content: String) {
        self.pending.push((rel_path.to_string(), Some(content)));
    }

    pub fn stage_delete(&mut self, rel_path: &str) {
        self.pending.push((rel_path.to_string(), None));
    }

    /// Commit every pending change. On any failure the workspace is rolled
    /// back from the backups and the error is returned.
    pub fn commit(self, manifest_path: &Path) -> Result<BackupManifest> {
        let mut manifest = BackupManifest::default();

        // Back up every affected file before the first mutation.
        for (rel, _) in &self.pending {
            let target = self.workspace_root.join(rel);
            if target.exists() {
                let backup = self.backup_dir.join(rel);
                if let Some(parent) = backup.parent() {
                    fs::create_dir_all(parent).context("Failed to create backup subdirectory")?;
                }
                fs::copy(&target, &backup)
                    .with_context(|| format!("Failed to back up {}", rel))?;
                manifest.entries.push(BackupEntry {
                    path: rel.clone(),
                    backup: Some(backup),
                });
            } else {
                manifest.entries.push(BackupEntry {
                    path: rel.clone(),
                    backup: None,
                });
            }
        }

        // Write staged copies, then rename them into place one by one.
        let result = self.commit_inner();
        if let Err(e) = result {
            self.rollback(&manifest);
            let _ = fs::remove_dir_all(&self.staging_dir);
            return Err(e);
        }

        manifest.save(manifest_path)?;
        let _ = fs::remove_dir_all(&self.staging_dir);
        Ok(manifest)
    }

    fn commit_inner(&self) -> Result<()> {
        for (rel, content) in &self.pending {
            let target = self.workspace_root.join(rel);
            match content {
                Some(content) => {
                    let staged = self.staging_dir.join(rel);
                    if let Some(parent) = staged.parent() {
                        fs::create_dir_all(parent)
                            .context("Failed to create staging subdirectory")?;
                    }
                    fs::write(&staged, content)
                        .with_context(|| format!("Failed to stage {}", rel))?;

                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)
                            .context("Failed to create target directory")?;
                    }
                    fs::rename(&staged, &target)
                        .with_context(|| format!("Failed to commit {}", rel))?;
                }
                None => {
                    if target.exists() {
                        fs::remove_file(&target)
                            .with_context(|| format!("Failed to delete {}", rel))?;
                    }
                }
            }
        }
        Ok(())
    }

    fn rollback(&self, manifest: &BackupManifest) {
        for entry in &manifest.entries {
            let target = self.workspace_root.join(&entry.path);
            match &entry.backup {
                Some(backup) => {
                    if let Some(parent) = target.parent() {
                        let _ = fs::create_dir_all(parent);
                    }
                    if fs::copy(backup, &target).is_err() {
                        warn!(path = %entry.path, "rollback: failed to restore backup");
                    }
                }
                None => {
                    if target.exists() && fs::remove_file(&target).is_err() {
                        warn!(path = %entry.path, "rollback: failed to remove created file");
                    }
                }
            }
        }
    }

    /// Discard the stage without touching the workspace.
    pub fn discard(self) {
        let _ = fs::remove_dir_all(&self.staging_dir);
        let _ = fs::remove_dir_all(&self.backup_dir);
    }
}

/// Restore a workspace from a previously committed backup manifest.
pub fn restore_from_manifest(workspace_root: &Path, manifest: &BackupManifest) -> Result<()> {
    for entry in &manifest.entries {
        let target = workspace_root.join(&entry.path);
        match &entry.backup {
            Some(backup) => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).context("Failed to create directory")?;
                }
                fs::copy(backup, &target)
                    .with_context(|| format!("Failed to restore {}", entry.path))?;
            }
            None => {
                if target.exists() {
                    fs::remove_file(&target)
                        .with_context(|| format!("Failed to remove {}", entry.path))?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_commit_writes_and_deletes() {
        let ws = tempdir().unwrap();
        let staging = tempdir().unwrap();
        fs::write(ws.path().join("old.py"), "old\n").unwrap();
        fs::write(ws.path().join("gone.py"), "bye\n").unwrap();

        let mut stage = Stage::new(ws.path(), staging.path()).unwrap();
        stage.stage_write("old.py", "new\n".to_string());
        stage.stage_write("fresh/dir/new.py", "created\n".to_string());
        stage.stage_delete("gone.py");

        let manifest_path = staging.path().join("manifest.json");
        let manifest = stage.commit(&manifest_path).unwrap();

        assert_eq!(fs::read_to_string(ws.path().join("old.py")).unwrap(), "new\n");
        assert_eq!(
            fs::read_to_string(ws.path().join("fresh/dir/new.py")).unwrap(),
            "created\n"
        );
        assert!(!ws.path().join("gone.py").exists());
        assert_eq!(manifest.entries.len(), 3);
        assert!(manifest_path.exists());
    }

    #[test]
    fn test_restore_from_manifest_round_trip() {
        let ws = tempdir().unwrap();
        let staging = tempdir().unwrap();
        fs::write(ws.path().join("a.py"), "original\n").unwrap();

        let mut stage = Stage::new(ws.path(), staging.path()).unwrap();
        stage.stage_write("a.py", "modified\n".to_string());
        stage.stage_write("b.py", "brand new\n".to_string());

        let manifest_path = staging.path().join("manifest.json");
        let manifest = stage.commit(&manifest_path).unwrap();

        restore_from_manifest(ws.path(), &manifest).unwrap();
        assert_eq!(
            fs::read_to_string(ws.path().join("a.py")).unwrap(),
            "original\n"
        );
        assert!(!ws.path().join("b.py").exists());
    }

    #[test]
    fn test_manifest_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let manifest = BackupManifest {
            entries: vec![BackupEntry {
                path: "a.py".to_string(),
                backup: None,
            }],
        };
        manifest.save(&path).unwrap();
        let loaded = BackupManifest::load(&path).unwrap();
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].path, "a.py");
    }

    #[test]
    fn test_discard_leaves_workspace_untouched() {
        let ws = tempdir().unwrap();
        let staging = tempdir().unwrap();
        fs::write(ws.path().join("a.py"), "original\n").unwrap();

        let mut stage = Stage::new(ws.path(), staging.path()).unwrap();
        stage.stage_write("a.py", "modified\n".to_string());
        stage.discard();

        assert_eq!(
            fs::read_to_string(ws.path().join("a.py")).unwrap(),
            "original\n"
        );
    }
}
