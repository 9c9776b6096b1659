//! Runtime configuration for Autopack.
//!
//! Bridges the unified `AutopackToml` with the runtime needs of the
//! executor: workspace resolution, `.autopack/` layout, and run-plan
//! discovery.

use anyhow::{Context, Result, anyhow};
use glob::glob;
use std::path::PathBuf;

use crate::autopack_config::AutopackToml;

#[derive(Debug, Clone)]
pub struct Config {
    pub workspace_dir: PathBuf,
    pub autopack_dir: PathBuf,
    pub plan_file: PathBuf,
    pub lock_file: PathBuf,
    pub verbose: bool,
    /// The underlying unified configuration.
    pub toml: AutopackToml,
}

impl Config {
    pub fn new(workspace_dir: PathBuf, verbose: bool, plan_file: Option<PathBuf>) -> Result<Self> {
        let workspace_dir = workspace_dir
            .canonicalize()
            .context("Failed to resolve workspace directory")?;
        let autopack_dir = workspace_dir.join(".autopack");

        let toml = AutopackToml::load_or_default(&autopack_dir)?;

        let plan_file = match plan_file {
            Some(path) => path
                .canonicalize()
                .context("Failed to resolve plan file path")?,
            None => Self::find_plan_file(&workspace_dir)?,
        };
        let lock_file = autopack_dir.join("workspace.lock");

        Ok(Self {
            workspace_dir,
            autopack_dir,
            plan_file,
            lock_file,
            verbose,
            toml,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.autopack_dir)
            .context("Failed to create .autopack directory")?;
        Ok(())
    }

    /// Find a run plan, checking `.autopack/plan.json` first, then any
    /// `*plan*.json` under `.autopack/plans/`, most recently modified
    /// first.
    fn find_plan_file(workspace_dir: &PathBuf) -> Result<PathBuf> {
        let direct = workspace_dir.join(".autopack/plan.json");
        if direct.exists() {
            return Ok(direct);
        }

        let pattern = workspace_dir
            .join(".autopack/plans/*plan*.json")
            .to_string_lossy()
            .to_string();

        let mut candidates: Vec<PathBuf> = glob(&pattern)
            .context("Failed to read glob pattern")?
            .filter_map(|entry| entry.ok())
            .collect();

        if candidates.is_empty() {
            return Err(anyhow!(
                "No run plan found. Create .autopack/plan.json or pass --plan"
            ));
        }

        candidates.sort_by(|a, b| {
            let a_time = a.metadata().and_then(|m| m.modified()).ok();
            let b_time = b.metadata().and_then(|m| m.modified()).ok();
            b_time.cmp(&a_time)
        });

        Ok(candidates.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup_plan(dir: &std::path::Path) -> PathBuf {
        let autopack = dir.join(".autopack");
        fs::create_dir_all(&autopack).unwrap();
        let plan = autopack.join("plan.json");
        fs::write(&plan, "{}").unwrap();
        plan
    }

    #[test]
    fn test_config_with_explicit_plan() {
        let dir = tempdir().unwrap();
        let plan = setup_plan(dir.path());

        let config = Config::new(dir.path().to_path_buf(), true, Some(plan.clone())).unwrap();
        assert!(config.verbose);
        assert_eq!(config.plan_file, plan.canonicalize().unwrap());
        assert_eq!(
            config.lock_file,
            dir.path()
                .canonicalize()
                .unwrap()
                .join(".autopack/workspace.lock")
        );
    }

    #[test]
    fn test_config_discovers_default_plan() {
        let dir = tempdir().unwrap();
        let plan = setup_plan(dir.path());

        let config = Config::new(dir.path().to_path_buf(), false, None).unwrap();
        assert_eq!(config.plan_file, plan);
    }

    #[test]
    fn test_config_no_plan_is_an_error() {
        let dir = tempdir().unwrap();
        let result = Config::new(dir.path().to_path_buf(), false, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("No run plan"));
    }

    #[test]
    fn test_config_discovers_from_plans_dir() {
        let dir = tempdir().unwrap();
        let plans = dir.path().join(".autopack/plans");
        fs::create_dir_all(&plans).unwrap();
        fs::write(plans.join("feature-plan.json"), "{}").unwrap();

        let config = Config::new(dir.path().to_path_buf(), false, None).unwrap();
        assert!(config.plan_file.ends_with("feature-plan.json"));
    }
}
