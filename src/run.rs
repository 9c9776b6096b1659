//! Run-level data model: scope, safety profile, budgets, and outcome.
//!
//! A `Run` is an ordered plan of phases grouped into tiers. It is created by
//! the planner, advanced by the executor, and terminal when no queued phase
//! remains or a global budget is exhausted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::phase::{Phase, PhaseState};

/// How widely a run is allowed to range across the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunScopeKind {
    /// Single governed patch; the run carries exactly one effective scope.
    #[default]
    PatchScoped,
    /// Multiple tiers of phases, each with its own scope.
    MultiTier,
}

/// Safety profile selected at run creation. Filters the model catalog and
/// tightens governance checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyProfile {
    Strict,
    #[default]
    Normal,
    Relaxed,
}

impl std::fmt::Display for SafetyProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafetyProfile::Strict => write!(f, "strict"),
            SafetyProfile::Normal => write!(f, "normal"),
            SafetyProfile::Relaxed => write!(f, "relaxed"),
        }
    }
}

impl std::str::FromStr for SafetyProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(SafetyProfile::Strict),
            "normal" => Ok(SafetyProfile::Normal),
            "relaxed" => Ok(SafetyProfile::Relaxed),
            _ => anyhow::bail!(
                "Invalid safety profile '{}'. Valid values: strict, normal, relaxed",
                s
            ),
        }
    }
}

/// Governance posture of the run. `ProjectBuild` protects the orchestrator's
/// own source and refuses destructive repository operations entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    #[default]
    ProjectBuild,
    AutopackMaintenance,
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunType::ProjectBuild => write!(f, "project_build"),
            RunType::AutopackMaintenance => write!(f, "autopack_maintenance"),
        }
    }
}

/// Token and wallclock budgets for the whole run.
///
/// `remaining_fraction` is the signal the policy engine consumes: the lower
/// of the token and wallclock fractions, clamped to [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunBudget {
    pub max_tokens: u64,
    pub max_wallclock_secs: u64,
    #[serde(default)]
    pub used_tokens: u64,
    #[serde(default)]
    pub used_wallclock_secs: u64,
}

impl RunBudget {
    pub fn new(max_tokens: u64, max_wallclock_secs: u64) -> Self {
        Self {
            max_tokens,
            max_wallclock_secs,
            used_tokens: 0,
            used_wallclock_secs: 0,
        }
    }

    pub fn charge_tokens(&mut self, tokens: u64) {
        self.used_tokens = self.used_tokens.saturating_add(tokens);
    }

    pub fn charge_wallclock(&mut self, secs: u64) {
        self.used_wallclock_secs = self.used_wallclock_secs.saturating_add(secs);
    }

    fn fraction(used: u64, max: u64) -> f64 {
        if max == 0 {
            return 1.0;
        }
        (1.0 - used as f64 / max as f64).clamp(0.0, 1.0)
    }

    pub fn remaining_fraction(&self) -> f64 {
        Self::fraction(self.used_tokens, self.max_tokens)
            .min(Self::fraction(self.used_wallclock_secs, self.max_wallclock_secs))
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_fraction() <= 0.0
    }
}

impl Default for RunBudget {
    fn default() -> Self {
        Self::new(2_000_000, 6 * 60 * 60)
    }
}

/// A run: the planner's ordered plan of phases plus run-level posture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    /// Project slug, first path segment of the run-local artifact layout.
    pub project: String,
    /// Run family, second path segment of the run-local artifact layout.
    pub family: String,
    #[serde(default)]
    pub run_scope: RunScopeKind,
    #[serde(default)]
    pub safety_profile: SafetyProfile,
    #[serde(default)]
    pub run_type: RunType,
    #[serde(default)]
    pub budget: RunBudget,
    pub phases: Vec<Phase>,
}

impl Run {
    /// Load a run plan from a JSON file, migrating legacy phase records.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run plan: {}", path.display()))?;

        let mut run: Run = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run plan JSON: {}", path.display()))?;

        for phase in &mut run.phases {
            phase.migrate_legacy_counters();
        }

        Ok(run)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize run plan")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write run plan: {}", path.display()))?;
        Ok(())
    }

    pub fn get_phase(&self, phase_id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.phase_id == phase_id)
    }

    pub fn get_phase_mut(&mut self, phase_id: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.phase_id == phase_id)
    }

    /// The next queued phase in execution order: phase_index ascending
    /// within tier ascending. Phases are never reordered.
    pub fn next_queued(&self) -> Option<&Phase> {
        self.phases
            .iter()
            .filter(|p| p.state == PhaseState::Queued)
            .min_by(|a, b| {
                a.tier_id
                    .cmp(&b.tier_id)
                    .then(a.phase_index.cmp(&b.phase_index))
            })
    }

    pub fn is_drained(&self) -> bool {
        self.phases.iter().all(|p| p.state.is_terminal())
    }
}

/// Terminal disposition of `advance_run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunDisposition {
    /// All phases reached a terminal state.
    Drained,
    /// A phase is waiting on human approval.
    Blocked,
    /// A global budget was exhausted before the run drained.
    BudgetExhausted,
}

/// Summary returned by `advance_run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub disposition: RunDisposition,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub blocked: Option<String>,
    /// True when any completed phase's final CI pass reported test failures.
    pub ci_failures: bool,
}
