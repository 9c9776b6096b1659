//! Phase definition and state for the Autopack executor.
//!
//! A phase is a bounded unit of code modification: a goal, a governed scope,
//! required deliverables, and three decoupled progress counters:
//! - `retry_attempt` — tactical retries under the same plan
//! - `revision_epoch` — strategic replans (never resets `retry_attempt`)
//! - `escalation_level` — model-tier bumps, at most one per epoch

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hard cap on tactical retries per phase.
pub const MAX_RETRY_ATTEMPTS: u32 = 5;
/// Hard cap on strategic replans per phase.
pub const MAX_EPOCHS: u32 = 3;
/// Hard cap on model escalations within a single revision epoch.
pub const MAX_ESCALATIONS_PER_EPOCH: u32 = 1;

/// Lifecycle state of a phase. A phase never moves back from `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseState {
    #[default]
    Queued,
    InProgress,
    Complete,
    Failed,
    Skipped,
}

impl PhaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        write!(f, "{}", s)
    }
}

/// Kind of work a phase performs. Routed together with complexity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    #[default]
    Feature,
    Refactor,
    Bugfix,
    Tests,
    Docs,
    Config,
    Research,
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Feature => "feature",
            Self::Refactor => "refactor",
            Self::Bugfix => "bugfix",
            Self::Tests => "tests",
            Self::Docs => "docs",
            Self::Config => "config",
            Self::Research => "research",
        };
        write!(f, "{}", s)
    }
}

/// Complexity band of a phase; maps to a model lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        write!(f, "{}", s)
    }
}

/// The governed scope of a phase: where the builder may write, what it may
/// read, and how success is judged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseScope {
    /// Relative POSIX path prefixes the builder may modify.
    pub paths: Vec<String>,
    /// Paths the builder may read but never modify.
    #[serde(default)]
    pub read_only_context: Vec<String>,
    /// Free-text criteria surfaced in builder and auditor prompts.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Test command for the CI step; falls back to the run default.
    #[serde(default)]
    pub test_cmd: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A structured proposal to narrow a phase's scope, grounded in its goal.
/// Scope is never widened: every proposed path must sit inside the current
/// scope, and the deliverables must remain reachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeReduction {
    pub paths: Vec<String>,
    #[serde(default)]
    pub rationale: String,
}

/// A single implementation phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub phase_id: String,
    pub phase_index: u32,
    /// Display grouping; the executor orders by (tier_id, phase_index).
    pub tier_id: String,
    /// Short statement of what the phase accomplishes.
    pub goal: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub task_category: TaskCategory,
    #[serde(default)]
    pub complexity: Complexity,
    pub scope: PhaseScope,
    /// Required file-path patterns the phase must produce or modify.
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub allow_mass_deletion: bool,
    #[serde(default)]
    pub allow_mass_addition: bool,
    #[serde(default)]
    pub state: PhaseState,
    #[serde(default)]
    pub retry_attempt: u32,
    #[serde(default)]
    pub revision_epoch: u32,
    #[serde(default)]
    pub escalation_level: u32,
    #[serde(default)]
    pub last_failure_reason: Option<String>,
    #[serde(default)]
    pub last_attempt_timestamp: Option<DateTime<Utc>>,
    /// Legacy single-counter scheme. Present only in old records; migrated
    /// into `retry_attempt` at load and never written back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts_used: Option<u32>,
}

impl Phase {
    /// Migrate a legacy record that carries only `attempts_used` into the
    /// decoupled counter trio: `retry_attempt := attempts_used`,
    /// `revision_epoch := 0`, `escalation_level := 0`.
    pub fn migrate_legacy_counters(&mut self) {
        if let Some(used) = self.attempts_used.take() {
            self.retry_attempt = self.retry_attempt.max(used);
        }
    }

    /// Whether another tactical retry is permitted.
    pub fn retries_remaining(&self) -> bool {
        self.retry_attempt < MAX_RETRY_ATTEMPTS
    }

    /// Whether a model escalation is still available in this epoch.
    pub fn escalation_available(&self) -> bool {
        self.escalation_level < MAX_ESCALATIONS_PER_EPOCH
    }

    /// Record a tactical retry (RETRY_* or ESCALATE_MODEL actions).
    pub fn bump_retry(&mut self) {
        self.retry_attempt += 1;
    }

    /// Record a model escalation. Capped per epoch; callers must check
    /// `escalation_available` first.
    pub fn bump_escalation(&mut self) {
        debug_assert!(self.escalation_available());
        self.escalation_level += 1;
    }

    /// Record a replan: the epoch advances and only the escalation counter
    /// resets. `retry_attempt` survives replans.
    pub fn bump_epoch(&mut self) {
        self.revision_epoch += 1;
        self.escalation_level = 0;
    }

    /// Apply a scope reduction. Returns false (and leaves scope untouched)
    /// if any proposed path falls outside the current scope.
    pub fn reduce_scope(&mut self, reduction: &ScopeReduction) -> bool {
        let ok = reduction.paths.iter().all(|p| {
            self.scope
                .paths
                .iter()
                .any(|existing| crate::apply::paths::is_within_prefix(p, existing))
        });
        if ok && !reduction.paths.is_empty() {
            self.scope.paths = reduction.paths.clone();
        }
        ok && !reduction.paths.is_empty()
    }

    /// Transition state. A phase never leaves `Complete`.
    pub fn set_state(&mut self, state: PhaseState) {
        if self.state == PhaseState::Complete {
            return;
        }
        self.state = state;
    }

    #[cfg(test)]
    pub fn for_tests(phase_id: &str) -> Self {
        Self {
            phase_id: phase_id.to_string(),
            phase_index: 0,
            tier_id: "t1".to_string(),
            goal: format!("test goal for {}", phase_id),
            description: String::new(),
            task_category: TaskCategory::Feature,
            complexity: Complexity::Medium,
            scope: PhaseScope {
                paths: vec!["src".to_string()],
                ..Default::default()
            },
            deliverables: Vec::new(),
            allow_mass_deletion: false,
            allow_mass_addition: false,
            state: PhaseState::Queued,
            retry_attempt: 0,
            revision_epoch: 0,
            escalation_level: 0,
            last_failure_reason: None,
            last_attempt_timestamp: None,
            attempts_used: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_state_terminal() {
        assert!(!PhaseState::Queued.is_terminal());
        assert!(!PhaseState::InProgress.is_terminal());
        assert!(PhaseState::Complete.is_terminal());
        assert!(PhaseState::Failed.is_terminal());
        assert!(PhaseState::Skipped.is_terminal());
    }

    #[test]
    fn test_phase_state_serializes_screaming() {
        let json = serde_json::to_string(&PhaseState::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }

    #[test]
    fn test_legacy_counter_migration() {
        let json = r#"{
            "phase_id": "p1",
            "phase_index": 0,
            "tier_id": "t1",
            "goal": "do things",
            "scope": { "paths": ["src"] },
            "attempts_used": 3
        }"#;
        let mut phase: Phase = serde_json::from_str(json).unwrap();
        assert_eq!(phase.retry_attempt, 0);

        phase.migrate_legacy_counters();
        assert_eq!(phase.retry_attempt, 3);
        assert_eq!(phase.revision_epoch, 0);
        assert_eq!(phase.escalation_level, 0);
        assert!(phase.attempts_used.is_none());

        // Migrated records serialize without the legacy field.
        let out = serde_json::to_string(&phase).unwrap();
        assert!(!out.contains("attempts_used"));
    }

    #[test]
    fn test_migration_prefers_new_counters_when_present() {
        let json = r#"{
            "phase_id": "p1",
            "phase_index": 0,
            "tier_id": "t1",
            "goal": "do things",
            "scope": { "paths": ["src"] },
            "retry_attempt": 4,
            "attempts_used": 2
        }"#;
        let mut phase: Phase = serde_json::from_str(json).unwrap();
        phase.migrate_legacy_counters();
        assert_eq!(phase.retry_attempt, 4);
    }

    #[test]
    fn test_bump_epoch_resets_only_escalation() {
        let mut phase = Phase::for_tests("p1");
        phase.retry_attempt = 3;
        phase.escalation_level = 1;
        phase.revision_epoch = 0;

        phase.bump_epoch();

        assert_eq!(phase.revision_epoch, 1);
        assert_eq!(phase.escalation_level, 0);
        assert_eq!(phase.retry_attempt, 3);
        // A new escalation is permitted in the new epoch.
        assert!(phase.escalation_available());
    }

    #[test]
    fn test_complete_is_sticky() {
        let mut phase = Phase::for_tests("p1");
        phase.set_state(PhaseState::Complete);
        phase.set_state(PhaseState::Failed);
        assert_eq!(phase.state, PhaseState::Complete);
    }

    #[test]
    fn test_reduce_scope_rejects_widening() {
        let mut phase = Phase::for_tests("p1");
        phase.scope.paths = vec!["src/core".to_string()];

        let widen = ScopeReduction {
            paths: vec!["src".to_string()],
            rationale: String::new(),
        };
        assert!(!phase.reduce_scope(&widen));
        assert_eq!(phase.scope.paths, vec!["src/core".to_string()]);

        let narrow = ScopeReduction {
            paths: vec!["src/core/parser".to_string()],
            rationale: "only the parser is implicated".to_string(),
        };
        assert!(phase.reduce_scope(&narrow));
        assert_eq!(phase.scope.paths, vec!["src/core/parser".to_string()]);
    }

    #[test]
    fn test_reduce_scope_rejects_empty() {
        let mut phase = Phase::for_tests("p1");
        let empty = ScopeReduction {
            paths: vec![],
            rationale: String::new(),
        };
        assert!(!phase.reduce_scope(&empty));
    }

    #[test]
    fn test_phase_serde_round_trip() {
        let phase = Phase::for_tests("p1");
        let json = serde_json::to_string(&phase).unwrap();
        let parsed: Phase = serde_json::from_str(&json).unwrap();
        assert_eq!(phase, parsed);
    }
}
