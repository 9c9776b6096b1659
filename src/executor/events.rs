//! Phase state update events.
//!
//! The executor emits one event per phase transition for the API surface
//! to consume. The wire format accepts only the canonical PhaseState enum;
//! a blocked-on-approval phase is transmitted as FAILED with the block
//! reason carried in `reason`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

use crate::phase::{Phase, PhaseState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseStateEvent {
    pub run_id: String,
    pub phase_id: String,
    pub state: PhaseState,
    pub retry_attempt: u32,
    pub revision_epoch: u32,
    pub escalation_level: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl PhaseStateEvent {
    pub fn transition(run_id: &str, phase: &Phase, reason: Option<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase_id: phase.phase_id.clone(),
            state: phase.state,
            retry_attempt: phase.retry_attempt,
            revision_epoch: phase.revision_epoch,
            escalation_level: phase.escalation_level,
            timestamp: Utc::now(),
            reason,
        }
    }

    /// A blocked phase on the wire: BLOCKED is never a PhaseState, so the
    /// event carries FAILED with the block reason.
    pub fn blocked(run_id: &str, phase: &Phase, block_reason: &str) -> Self {
        Self {
            state: PhaseState::Failed,
            reason: Some(format!("blocked_approval: {}", block_reason)),
            ..Self::transition(run_id, phase, None)
        }
    }
}

pub trait EventSink: Send {
    fn emit(&mut self, event: &PhaseStateEvent) -> Result<()>;
}

/// Appends events as JSON lines under the run's diagnostics directory.
pub struct JsonlEventSink {
    path: PathBuf,
}

impl JsonlEventSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl EventSink for JsonlEventSink {
    fn emit(&mut self, event: &PhaseStateEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create events directory")?;
        }
        let line = serde_json::to_string(event).context("Failed to serialize event")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open events log")?;
        writeln!(file, "{}", line).context("Failed to append event")?;
        Ok(())
    }
}

/// Swallows events; used by tests and one-shot commands.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&mut self, _event: &PhaseStateEvent) -> Result<()> {
        Ok(())
    }
}
