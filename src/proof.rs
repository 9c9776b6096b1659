//! Terminal per-phase proof artifacts.
//!
//! Every phase that reaches a terminal state writes exactly one bounded
//! proof under `proofs/<phase_id>.json`, plus a short human summary under
//! `phases/<phase_index>_<phase_id>.md`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifacts::{RunPaths, atomic_write_json};
use crate::attempt::AttemptRecord;
use crate::phase::{Phase, PhaseState};

/// The terminal audit artifact for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proof {
    pub phase_id: String,
    pub terminal_state: PhaseState,
    /// Policy reason the phase terminated.
    pub reason: String,
    #[serde(default)]
    pub final_attempt: Option<AttemptRecord>,
    #[serde(default)]
    pub applied_patch_hash: Option<String>,
    #[serde(default)]
    pub ci_summary: Option<String>,
    /// Governance decisions taken along the way, oldest first.
    #[serde(default)]
    pub governance_decisions: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

impl Proof {
    pub fn new(phase: &Phase, reason: &str) -> Self {
        Self {
            phase_id: phase.phase_id.clone(),
            terminal_state: phase.state,
            reason: reason.to_string(),
            final_attempt: None,
            applied_patch_hash: None,
            ci_summary: None,
            governance_decisions: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_final_attempt(mut self, attempt: AttemptRecord) -> Self {
        self.applied_patch_hash = attempt.patch_hash.clone();
        self.final_attempt = Some(attempt);
        self
    }

    pub fn with_ci_summary(mut self, summary: impl Into<String>) -> Self {
        self.ci_summary = Some(summary.into());
        self
    }

    pub fn with_decisions(mut self, decisions: Vec<String>) -> Self {
        self.governance_decisions = decisions;
        self
    }

    /// Write the proof and the human-readable phase summary.
    pub fn write(&self, paths: &RunPaths, phase: &Phase) -> Result<()> {
        atomic_write_json(&paths.proof(&self.phase_id), self)?;

        let summary = self.render_summary(phase);
        let summary_path = paths.phase_summary(phase.phase_index, &phase.phase_id);
        if let Some(parent) = summary_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(summary_path, summary)?;
        Ok(())
    }

    fn render_summary(&self, phase: &Phase) -> String {
        let mut out = String::new();
        out.push_str(&format!("# Phase {}: {}\n\n", phase.phase_id, phase.goal));
        out.push_str(&format!("- State: {}\n", self.terminal_state));
        out.push_str(&format!("- Reason: {}\n", self.reason));
        out.push_str(&format!(
            "- Counters: retry_attempt={} revision_epoch={} escalation_level={}\n",
            phase.retry_attempt, phase.revision_epoch, phase.escalation_level
        ));
        if let Some(hash) = &self.applied_patch_hash {
            out.push_str(&format!("- Patch: {}\n", &hash[..16.min(hash.len())]));
        }
        if let Some(ci) = &self.ci_summary {
            out.push_str(&format!("- CI: {}\n", ci));
        }
        if !self.governance_decisions.is_empty() {
            out.push_str("\n## Governance decisions\n\n");
            for decision in &self.governance_decisions {
                out.push_str(&format!("- {}\n", decision));
            }
        }
        out
    }
}
