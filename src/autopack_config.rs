//! Unified configuration for Autopack.
//!
//! Reads `.autopack/autopack.toml` and layers environment overrides on
//! top. CLI flags override both.
//!
//! # Configuration File Format
//!
//! ```toml
//! [run]
//! project = "my-project"
//! family = "build"
//! safety_profile = "normal"
//! run_type = "project_build"
//!
//! [defaults]
//! llm_timeout_secs = 60
//! ci_timeout_secs = 600
//! phase_wallclock_cap_secs = 3600
//! approval_timeout_hours = 24
//! test_cmd = "pytest --json-report"
//!
//! [budget]
//! max_tokens = 2000000
//! max_wallclock_secs = 21600
//!
//! [governance]
//! protection_policy = "config/protection_and_retention_policy.yaml"
//!
//! [models]
//! catalog = ".autopack/models.json"
//!
//! [models.overrides]
//! "docs:low" = "haiku-lane-default"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::executor::ExecutorConfig;
use crate::run::{RunType, SafetyProfile};

/// `[run]` section: posture of new runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub safety_profile: SafetyProfile,
    #[serde(default)]
    pub run_type: RunType,
}

/// `[defaults]` section: executor timeouts and the fallback test command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsSection {
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    #[serde(default = "default_ci_timeout_secs")]
    pub ci_timeout_secs: u64,
    #[serde(default = "default_phase_cap_secs")]
    pub phase_wallclock_cap_secs: u64,
    #[serde(default = "default_approval_timeout_hours")]
    pub approval_timeout_hours: u64,
    #[serde(default)]
    pub test_cmd: Option<String>,
}

fn default_llm_timeout_secs() -> u64 {
    60
}

fn default_ci_timeout_secs() -> u64 {
    600
}

fn default_phase_cap_secs() -> u64 {
    3600
}

fn default_approval_timeout_hours() -> u64 {
    24
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            llm_timeout_secs: default_llm_timeout_secs(),
            ci_timeout_secs: default_ci_timeout_secs(),
            phase_wallclock_cap_secs: default_phase_cap_secs(),
            approval_timeout_hours: default_approval_timeout_hours(),
            test_cmd: None,
        }
    }
}

/// `[budget]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSection {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_max_wallclock_secs")]
    pub max_wallclock_secs: u64,
}

fn default_max_tokens() -> u64 {
    2_000_000
}

fn default_max_wallclock_secs() -> u64 {
    6 * 60 * 60
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            max_wallclock_secs: default_max_wallclock_secs(),
        }
    }
}

/// `[governance]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceSection {
    /// Optional YAML file with extra protected-path patterns.
    #[serde(default)]
    pub protection_policy: Option<PathBuf>,
}

/// `[models]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsSection {
    /// Path to the model catalog JSON; the built-in default catalog is
    /// used when absent.
    #[serde(default)]
    pub catalog: Option<PathBuf>,
    /// Shell command serving builder generations (prompt on stdin).
    #[serde(default)]
    pub builder_cmd: Option<String>,
    /// Shell command serving auditor generations; audits are skipped when
    /// unset.
    #[serde(default)]
    pub auditor_cmd: Option<String>,
    /// `{task_category}:{complexity}` → model_id pins.
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

/// The parsed `.autopack/autopack.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutopackToml {
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub governance: GovernanceSection,
    #[serde(default)]
    pub models: ModelsSection,
}

impl AutopackToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Load from the standard location, falling back to defaults when no
    /// file exists, then apply environment overrides.
    pub fn load_or_default(autopack_dir: &Path) -> Result<Self> {
        let path = autopack_dir.join("autopack.toml");
        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment layering: `AUTOPACK_SAFETY_PROFILE`, `AUTOPACK_RUN_TYPE`,
    /// `AUTOPACK_TEST_CMD`.
    fn apply_env(&mut self) {
        if let Ok(profile) = std::env::var("AUTOPACK_SAFETY_PROFILE") {
            if let Ok(parsed) = profile.parse() {
                self.run.safety_profile = parsed;
            }
        }
        if let Ok(run_type) = std::env::var("AUTOPACK_RUN_TYPE") {
            match run_type.as_str() {
                "project_build" => self.run.run_type = RunType::ProjectBuild,
                "autopack_maintenance" => self.run.run_type = RunType::AutopackMaintenance,
                _ => {}
            }
        }
        if let Ok(cmd) = std::env::var("AUTOPACK_TEST_CMD") {
            self.defaults.test_cmd = Some(cmd);
        }
    }

    /// Resolve the executor tuning knobs.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            llm_timeout: Duration::from_secs(self.defaults.llm_timeout_secs),
            ci_timeout: Duration::from_secs(self.defaults.ci_timeout_secs),
            phase_wallclock_cap: Duration::from_secs(self.defaults.phase_wallclock_cap_secs),
            approval_timeout: Duration::from_secs(self.defaults.approval_timeout_hours * 3600),
            approval_poll_interval: Duration::from_secs(5),
            default_test_cmd: self.defaults.test_cmd.clone(),
            ..ExecutorConfig::default()
        }
    }

    /// Validate and report warnings without failing.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.defaults.llm_timeout_secs > 1200 {
            warnings.push("llm_timeout_secs exceeds the 1200s provider ceiling".to_string());
        }
        if self.budget.max_tokens == 0 && self.budget.max_wallclock_secs == 0 {
            warnings.push("both budgets unlimited; runs can only stop by draining".to_string());
        }
        for key in self.models.overrides.keys() {
            if !key.contains(':') {
                warnings.push(format!(
                    "model override key '{}' is not in task_category:complexity form",
                    key
                ));
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = AutopackToml::default();
        assert_eq!(config.defaults.llm_timeout_secs, 60);
        assert_eq!(config.defaults.approval_timeout_hours, 24);
        assert_eq!(config.budget.max_tokens, 2_000_000);
        assert_eq!(config.run.safety_profile, SafetyProfile::Normal);
        assert_eq!(config.run.run_type, RunType::ProjectBuild);
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("autopack.toml");
        std::fs::write(
            &path,
            r#"
[run]
project = "demo"
safety_profile = "strict"

[defaults]
llm_timeout_secs = 120

[models.overrides]
"docs:low" = "pinned-model"
"#,
        )
        .unwrap();

        let config = AutopackToml::load(&path).unwrap();
        assert_eq!(config.run.project.as_deref(), Some("demo"));
        assert_eq!(config.run.safety_profile, SafetyProfile::Strict);
        assert_eq!(config.defaults.llm_timeout_secs, 120);
        // Unspecified values fall back to defaults.
        assert_eq!(config.defaults.ci_timeout_secs, 600);
        assert_eq!(
            config.models.overrides.get("docs:low").map(|s| s.as_str()),
            Some("pinned-model")
        );
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("autopack.toml");

        let mut config = AutopackToml::default();
        config.run.project = Some("demo".to_string());
        config.save(&path).unwrap();

        let loaded = AutopackToml::load(&path).unwrap();
        assert_eq!(loaded.run.project.as_deref(), Some("demo"));
    }

    #[test]
    fn test_executor_config_resolution() {
        let mut config = AutopackToml::default();
        config.defaults.llm_timeout_secs = 90;
        config.defaults.test_cmd = Some("pytest".to_string());

        let exec = config.executor_config();
        assert_eq!(exec.llm_timeout, Duration::from_secs(90));
        assert_eq!(exec.approval_timeout, Duration::from_secs(24 * 3600));
        assert_eq!(exec.default_test_cmd.as_deref(), Some("pytest"));
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = AutopackToml::default();
        config.defaults.llm_timeout_secs = 2000;
        config
            .models
            .overrides
            .insert("badkey".to_string(), "m".to_string());

        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("1200s")));
        assert!(warnings.iter().any(|w| w.contains("badkey")));
    }
}
