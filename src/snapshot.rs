//! Pre-apply git snapshots and change summaries.
//!
//! When the workspace is a git repository, a snapshot commit is recorded
//! before each apply so regressions can be inspected and, in maintenance
//! runs only, rolled back hard. `project_build` runs never perform
//! destructive repository operations; their rollback path is the apply
//! subsystem's file-backup manifest.

use anyhow::{Context, Result};
use git2::{Delta, DiffOptions, Repository, Signature};
use std::path::{Path, PathBuf};

use crate::errors::ExecutorError;
use crate::run::RunType;

/// Summary of workspace changes since a snapshot.
#[derive(Debug, Clone, Default)]
pub struct ChangeSummary {
    pub files_added: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub files_deleted: Vec<PathBuf>,
    pub lines_added: usize,
    pub lines_removed: usize,
}

impl ChangeSummary {
    pub fn total_files(&self) -> usize {
        self.files_added.len() + self.files_modified.len() + self.files_deleted.len()
    }
}

pub struct GitSnapshot {
    repo: Repository,
}

impl GitSnapshot {
    /// Open the workspace repository. `None` when the workspace is not a
    /// git repository; snapshots are then simply unavailable.
    pub fn open(workspace_root: &Path) -> Option<Self> {
        Repository::open(workspace_root).ok().map(|repo| Self { repo })
    }

    /// Commit the current tree as a snapshot before a phase attempt.
    pub fn snapshot_before(&self, phase_id: &str) -> Result<String> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now("autopack", "autopack@localhost")?;
        let message = format!("[autopack] snapshot before phase {}", phase_id);

        // Unborn branches get an initial commit with no parents.
        let commit_id = if let Some(parent) = self.head_commit() {
            self.repo
                .commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&parent])?
        } else {
            self.repo
                .commit(Some("HEAD"), &sig, &sig, &message, &tree, &[])?
        };

        Ok(commit_id.to_string())
    }

    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Compute changes in the working tree since the snapshot commit.
    pub fn compute_changes(&self, before_sha: &str) -> Result<ChangeSummary> {
        let before_oid = git2::Oid::from_str(before_sha)?;
        let before_commit = self.repo.find_commit(before_oid)?;
        let before_tree = before_commit.tree()?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true);

        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&before_tree), Some(&mut opts))?;

        let mut summary = ChangeSummary::default();
        diff.foreach(
            &mut |delta, _progress| {
                if let Some(path) = delta.new_file().path() {
                    let path_buf = path.to_path_buf();
                    match delta.status() {
                        Delta::Added | Delta::Untracked => summary.files_added.push(path_buf),
                        Delta::Modified => summary.files_modified.push(path_buf),
                        Delta::Deleted => summary.files_deleted.push(path_buf),
                        _ => {}
                    }
                }
                true
            },
            None,
            None,
            Some(&mut |_delta, _hunk, line| {
                match line.origin() {
                    '+' => summary.lines_added += 1,
                    '-' => summary.lines_removed += 1,
                    _ => {}
                }
                true
            }),
        )?;

        Ok(summary)
    }

    /// Hard-reset the working tree to a snapshot. Destructive: refused
    /// entirely in `project_build` runs, and callers in maintenance runs
    /// must hold an approval.
    pub fn rollback_hard(
        &self,
        snapshot_sha: &str,
        run_type: RunType,
        approval_token: Option<&str>,
    ) -> Result<(), ExecutorError> {
        if run_type == RunType::ProjectBuild {
            return Err(ExecutorError::DestructiveRefused {
                operation: format!("git reset --hard {}", snapshot_sha),
            });
        }
        if approval_token.is_none() {
            return Err(ExecutorError::DestructiveRefused {
                operation: "hard rollback without approval".to_string(),
            });
        }

        let oid = git2::Oid::from_str(snapshot_sha)
            .context("Invalid snapshot sha")
            .map_err(ExecutorError::Other)?;
        let commit = self
            .repo
            .find_commit(oid)
            .context("Snapshot commit not found")
            .map_err(ExecutorError::Other)?;
        self.repo
            .reset(commit.as_object(), git2::ResetType::Hard, None)
            .context("Hard reset failed")
            .map_err(ExecutorError::Other)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn init_repo(dir: &Path) -> GitSnapshot {
        Repository::init(dir).unwrap();
        GitSnapshot::open(dir).unwrap()
    }

    #[test]
    fn test_open_non_repo_is_none() {
        let dir = tempdir().unwrap();
        assert!(GitSnapshot::open(dir.path()).is_none());
    }

    #[test]
    fn test_snapshot_on_unborn_branch() {
        let dir = tempdir().unwrap();
        let snapshot = init_repo(dir.path());
        fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();

        let sha = snapshot.snapshot_before("p1").unwrap();
        assert!(!sha.is_empty());
    }

    #[test]
    fn test_compute_changes_after_snapshot() {
        let dir = tempdir().unwrap();
        let snapshot = init_repo(dir.path());
        fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let sha = snapshot.snapshot_before("p1").unwrap();

        fs::write(dir.path().join("a.py"), "x = 2\n").unwrap();
        fs::write(dir.path().join("b.py"), "new\n").unwrap();

        let changes = snapshot.compute_changes(&sha).unwrap();
        assert_eq!(changes.files_modified.len(), 1);
        assert_eq!(changes.files_added.len(), 1);
        assert!(changes.total_files() >= 2);
    }

    #[test]
    fn test_rollback_refused_in_project_build() {
        let dir = tempdir().unwrap();
        let snapshot = init_repo(dir.path());
        fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let sha = snapshot.snapshot_before("p1").unwrap();

        let err = snapshot
            .rollback_hard(&sha, RunType::ProjectBuild, Some("appr-1"))
            .unwrap_err();
        assert!(matches!(err, ExecutorError::DestructiveRefused { .. }));
    }

    #[test]
    fn test_rollback_requires_approval_in_maintenance() {
        let dir = tempdir().unwrap();
        let snapshot = init_repo(dir.path());
        fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let sha = snapshot.snapshot_before("p1").unwrap();

        let err = snapshot
            .rollback_hard(&sha, RunType::AutopackMaintenance, None)
            .unwrap_err();
        assert!(matches!(err, ExecutorError::DestructiveRefused { .. }));

        fs::write(dir.path().join("a.py"), "x = 2\n").unwrap();
        snapshot
            .rollback_hard(&sha, RunType::AutopackMaintenance, Some("appr-1"))
            .unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("a.py")).unwrap(),
            "x = 1\n"
        );
    }
}
