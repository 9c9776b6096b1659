//! Executor state persistence and crash recovery.
//!
//! The whole executor state (the run with its phase counters, appended
//! attempt records, in-flight idempotency keys, and any pending approval)
//! persists as one JSON document under the run-local layout, written
//! crash-safe on every phase transition. On load, a corrupt primary falls
//! back to `.bak`; if both are unusable the run needs a human.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::artifacts::{atomic_write_json, load_json_with_backup};
use crate::attempt::{AttemptRecord, OutcomeClass};
use crate::errors::ExecutorError;
use crate::run::Run;

/// An approval the executor is blocked on, kept in state so a restarted
/// process resumes the wait instead of re-running the attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub phase_id: String,
    pub approval_id: String,
    /// The outcome that triggered the block; drives override semantics.
    pub outcome: OutcomeClass,
    /// Whether CI had fully passed when the block was raised. Approval may
    /// override an auditor block only when this is true.
    pub ci_ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorState {
    pub run: Run,
    /// Immutable attempt records per phase, ordered by attempt_index.
    #[serde(default)]
    pub attempts: BTreeMap<String, Vec<AttemptRecord>>,
    /// Idempotency keys of attempts started but not yet recorded.
    #[serde(default)]
    pub in_flight_keys: BTreeSet<String>,
    #[serde(default)]
    pub pending_approval: Option<PendingApproval>,
    /// Approval ids granted per phase, carried into subsequent attempts
    /// (e.g. a protected-path exemption).
    #[serde(default)]
    pub granted_approvals: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutorState {
    pub fn new(run: Run) -> Self {
        Self {
            run,
            attempts: BTreeMap::new(),
            in_flight_keys: BTreeSet::new(),
            pending_approval: None,
            granted_approvals: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Append an attempt record unless its idempotency key was already
    /// recorded (a restart must not duplicate records).
    pub fn record_attempt(&mut self, phase_id: &str, record: AttemptRecord) {
        let records = self.attempts.entry(phase_id.to_string()).or_default();
        if records
            .iter()
            .any(|r| r.idempotency_key == record.idempotency_key)
        {
            return;
        }
        self.in_flight_keys.remove(&record.idempotency_key);
        records.push(record);
    }

    pub fn has_attempt(&self, phase_id: &str, idempotency_key: &str) -> bool {
        self.attempts
            .get(phase_id)
            .map(|records| records.iter().any(|r| r.idempotency_key == idempotency_key))
            .unwrap_or(false)
    }

    pub fn attempts_for(&self, phase_id: &str) -> &[AttemptRecord] {
        self.attempts
            .get(phase_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Persistent store for the executor state.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn save(&self, state: &mut ExecutorState) -> Result<(), ExecutorError> {
        state.updated_at = Utc::now();
        atomic_write_json(&self.path, state).map_err(|e| ExecutorError::StateWriteFailed {
            path: self.path.clone(),
            source: std::io::Error::other(e.to_string()),
        })
    }

    /// Load persisted state. `Ok(None)` when no state exists yet; an
    /// unrecoverable (both-corrupt) state is an error the caller must
    /// surface as NEEDS_HUMAN.
    pub fn load(&self) -> Result<Option<ExecutorState>, ExecutorError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let (mut state, _from_backup): (ExecutorState, bool) = load_json_with_backup(&self.path)
            .map_err(|e| ExecutorError::StateCorrupt {
                path: self.path.clone(),
                detail: e.to_string(),
            })?;
        for phase in &mut state.run.phases {
            phase.migrate_legacy_counters();
        }
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::AttemptOutcome;
    use crate::phase::Phase;
    use crate::run::{Run, RunBudget, RunScopeKind, RunType, SafetyProfile};
    use tempfile::tempdir;

    fn run() -> Run {
        Run {
            run_id: "r1".into(),
            project: "proj".into(),
            family: "build".into(),
            run_scope: RunScopeKind::PatchScoped,
            safety_profile: SafetyProfile::Normal,
            run_type: RunType::ProjectBuild,
            budget: RunBudget::default(),
            phases: vec![Phase::for_tests("p1")],
        }
    }

    fn record(key: &str, index: u32) -> AttemptRecord {
        AttemptRecord {
            attempt_index: index,
            builder_model_id: "m".into(),
            auditor_model_id: None,
            tokens_in: 10,
            tokens_out: 20,
            wallclock_ms: 5,
            outcome: AttemptOutcome::Applied,
            outcome_class: OutcomeClass::AppliedOk,
            idempotency_key: key.into(),
            patch_hash: None,
            checkpoint: None,
            repairs: vec![],
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_attempt_dedups_by_key() {
        let mut state = ExecutorState::new(run());
        state.in_flight_keys.insert("k1".into());

        state.record_attempt("p1", record("k1", 0));
        state.record_attempt("p1", record("k1", 0));

        assert_eq!(state.attempts_for("p1").len(), 1);
        assert!(!state.in_flight_keys.contains("k1"));
        assert!(state.has_attempt("p1", "k1"));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("executor_state.json"));

        let mut state = ExecutorState::new(run());
        state.record_attempt("p1", record("k1", 0));
        store.save(&mut state).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.run.run_id, "r1");
        assert_eq!(loaded.attempts_for("p1").len(), 1);
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("executor_state.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_primary_recovers_from_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("executor_state.json");
        let store = StateStore::new(path.clone());

        let mut state = ExecutorState::new(run());
        store.save(&mut state).unwrap();
        store.save(&mut state).unwrap();
        std::fs::write(&path, "{ torn write").unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.run.run_id, "r1");
    }

    #[test]
    fn test_both_corrupt_is_state_corrupt_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("executor_state.json");
        std::fs::write(&path, "{ torn").unwrap();
        std::fs::write(dir.path().join("executor_state.json.bak"), "also torn").unwrap();

        let store = StateStore::new(path);
        assert!(matches!(
            store.load(),
            Err(ExecutorError::StateCorrupt { .. })
        ));
    }
}
