//! External-action ledger: exactly-once, approval-gated, auditable
//! execution of side effects.
//!
//! The ledger is the only writer of its file and owns a strict per-key
//! state machine: PROPOSED → APPROVED → EXECUTING → {COMPLETED | FAILED |
//! SKIPPED_DUPLICATE}. Once a key is COMPLETED no further execution is
//! permitted, even across process restarts. Every mutation persists via
//! atomic-rename-with-backup; a corrupt primary is restored from `.bak`
//! at load.

pub mod canonical;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::artifacts::{atomic_write_json, load_json_with_backup};
use crate::errors::LedgerError;
use canonical::payload_hash;

/// Execute retries permitted before an entry is marked FAILED.
pub const MAX_EXECUTE_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Proposed,
    Approved,
    Executing,
    Completed,
    Failed,
    SkippedDuplicate,
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Proposed => "PROPOSED",
            Self::Approved => "APPROVED",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::SkippedDuplicate => "SKIPPED_DUPLICATE",
        };
        write!(f, "{}", s)
    }
}

/// One append-only ledger entry, keyed by idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub idempotency_key: String,
    pub provider: String,
    pub action: String,
    pub payload_hash: String,
    #[serde(default)]
    pub approval_id: Option<String>,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    /// Redacted summary of the provider response.
    #[serde(default)]
    pub response_summary: Option<String>,
}

/// Result of an `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Executed { summary: String },
    /// The key already completed; the side effect is not repeated.
    SkippedDuplicate,
    /// The presented payload does not hash to the recorded hash.
    SkippedHashMismatch,
    /// The provider call failed; retry budget state is on the entry.
    Failed { error: String },
}

/// Side-effect gating that sits on top of the state machine: trading
/// actions need live-trading enablement plus an approval token, and
/// publish/list actions need a fresh publish packet whose content hash
/// matches the payload.
#[derive(Debug, Clone, Default)]
pub struct GatingPolicy {
    pub live_trading_enabled: bool,
    pub trading_approval_token: Option<String>,
    pub publish_packet: Option<PublishPacket>,
}

/// A pre-approved bundle describing a publishing/listing action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishPacket {
    pub content_hash: String,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
}

impl GatingPolicy {
    pub fn from_env() -> Self {
        Self {
            live_trading_enabled: std::env::var("LIVE_TRADING_ENABLED")
                .map(|v| v == "1")
                .unwrap_or(false),
            trading_approval_token: None,
            publish_packet: None,
        }
    }

    fn check(&self, action: &str, payload_hash: &str) -> Result<(), LedgerError> {
        if action.starts_with("trade")
            && (!self.live_trading_enabled || self.trading_approval_token.is_none())
        {
            return Err(LedgerError::TradingDisabled);
        }
        if action.starts_with("publish") || action.starts_with("list") {
            match &self.publish_packet {
                Some(packet) if packet.content_hash == payload_hash => {}
                _ => return Err(LedgerError::PublishPacketMismatch),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    entries: BTreeMap<String, LedgerEntry>,
}

pub struct ExternalActionLedger {
    path: PathBuf,
    entries: BTreeMap<String, LedgerEntry>,
    gating: GatingPolicy,
}

impl ExternalActionLedger {
    /// Open (or create) the ledger file, restoring from `.bak` when the
    /// primary is corrupt.
    pub fn open(path: &Path, gating: GatingPolicy) -> Result<Self, LedgerError> {
        let entries = if path.exists() {
            let (file, from_backup): (LedgerFile, bool) =
                load_json_with_backup(path).map_err(|e| LedgerError::Corrupt {
                    path: path.to_path_buf(),
                    detail: e.to_string(),
                })?;
            if from_backup {
                warn!(path = %path.display(), "ledger restored from backup");
            }
            file.entries
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            gating,
        })
    }

    fn persist(&self) -> Result<(), LedgerError> {
        let file = LedgerFile {
            entries: self.entries.clone(),
        };
        atomic_write_json(&self.path, &file).map_err(|e| LedgerError::PersistFailed {
            path: self.path.clone(),
            source: std::io::Error::other(e.to_string()),
        })
    }

    /// Canonicalize the payload, derive the idempotency key, and upsert a
    /// PROPOSED entry. Re-proposing an existing key is a no-op returning
    /// the same key.
    pub fn propose(
        &mut self,
        provider: &str,
        action: &str,
        payload: &Value,
    ) -> Result<String, LedgerError> {
        let hash = payload_hash(payload);
        let key = hex::encode(sha2::Sha256::digest(
            format!("{}\x00{}\x00{}", provider, action, hash).as_bytes(),
        ));

        if !self.entries.contains_key(&key) {
            self.entries.insert(
                key.clone(),
                LedgerEntry {
                    idempotency_key: key.clone(),
                    provider: provider.to_string(),
                    action: action.to_string(),
                    payload_hash: hash,
                    approval_id: None,
                    status: ActionStatus::Proposed,
                    created_at: Utc::now(),
                    started_at: None,
                    completed_at: None,
                    retry_count: 0,
                    response_summary: None,
                },
            );
            self.persist()?;
            info!(key = %&key[..16], provider, action, "action proposed");
        }
        Ok(key)
    }

    /// Attach an approval and move PROPOSED → APPROVED.
    pub fn approve(&mut self, key: &str, approver_id: &str) -> Result<(), LedgerError> {
        let entry = self.entry_mut(key)?;
        if entry.status != ActionStatus::Proposed {
            return Err(LedgerError::WrongState {
                key: key.to_string(),
                status: entry.status.to_string(),
                required: "PROPOSED".to_string(),
            });
        }
        entry.approval_id = Some(approver_id.to_string());
        entry.status = ActionStatus::Approved;
        self.persist()?;
        info!(key = %&key[..16], approver_id, "action approved");
        Ok(())
    }

    /// Execute an approved action through `perform`.
    ///
    /// Refused unless the entry is APPROVED; the to-be-sent payload must
    /// hash to the recorded `payload_hash`. A COMPLETED key returns
    /// `SkippedDuplicate` without invoking `perform`. On provider failure
    /// the retry counter advances until `MAX_EXECUTE_RETRIES`, then the
    /// entry is FAILED.
    pub fn execute<F>(
        &mut self,
        key: &str,
        payload: &Value,
        perform: F,
    ) -> Result<ExecutionResult, LedgerError>
    where
        F: FnOnce() -> Result<String, String>,
    {
        let entry = self.entry_mut(key)?;

        match entry.status {
            ActionStatus::Completed | ActionStatus::SkippedDuplicate => {
                return Ok(ExecutionResult::SkippedDuplicate);
            }
            ActionStatus::Approved => {}
            other => {
                return Err(LedgerError::WrongState {
                    key: key.to_string(),
                    status: other.to_string(),
                    required: "APPROVED".to_string(),
                });
            }
        }

        let presented = payload_hash(payload);
        if presented != entry.payload_hash {
            warn!(key = %&key[..16], "payload hash mismatch; refusing execution");
            return Ok(ExecutionResult::SkippedHashMismatch);
        }

        let action = entry.action.clone();
        let recorded_hash = entry.payload_hash.clone();
        self.gating.check(&action, &recorded_hash)?;

        // Mark EXECUTING and persist before the side effect so a crash
        // mid-call is visible on restart.
        {
            let entry = self.entry_mut(key)?;
            entry.status = ActionStatus::Executing;
            entry.started_at = Some(Utc::now());
        }
        self.persist()?;

        match perform() {
            Ok(summary) => {
                let entry = self.entry_mut(key)?;
                entry.status = ActionStatus::Completed;
                entry.completed_at = Some(Utc::now());
                entry.response_summary = Some(summary.clone());
                self.persist()?;
                info!(key = %&key[..16], "action completed");
                Ok(ExecutionResult::Executed { summary })
            }
            Err(error) => {
                let entry = self.entry_mut(key)?;
                entry.retry_count += 1;
                if entry.retry_count >= MAX_EXECUTE_RETRIES {
                    entry.status = ActionStatus::Failed;
                    entry.completed_at = Some(Utc::now());
                } else {
                    // Back to APPROVED: the caller may retry.
                    entry.status = ActionStatus::Approved;
                }
                entry.response_summary = Some(error.clone());
                self.persist()?;
                Ok(ExecutionResult::Failed { error })
            }
        }
    }

    pub fn query(&self, key: &str) -> Option<&LedgerEntry> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    /// Reconcile entries left EXECUTING by a crash. `provider_check`
    /// reports whether the provider observed the side effect complete:
    /// `Some(true)` marks the entry COMPLETED, anything else FAILED. The
    /// side effect is never re-performed here.
    pub fn reconcile_in_flight<F>(&mut self, provider_check: F) -> Result<Vec<String>, LedgerError>
    where
        F: Fn(&LedgerEntry) -> Option<bool>,
    {
        let in_flight: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.status == ActionStatus::Executing)
            .map(|e| e.idempotency_key.clone())
            .collect();

        for key in &in_flight {
            let verdict = provider_check(&self.entries[key]);
            let entry = self.entry_mut(key)?;
            match verdict {
                Some(true) => {
                    entry.status = ActionStatus::Completed;
                    entry.completed_at = Some(Utc::now());
                    entry.response_summary =
                        Some("reconciled: provider reports completion".to_string());
                }
                _ => {
                    entry.status = ActionStatus::Failed;
                    entry.completed_at = Some(Utc::now());
                    entry.response_summary =
                        Some("reconciled: in-flight at crash, not confirmed".to_string());
                }
            }
        }
        if !in_flight.is_empty() {
            self.persist()?;
        }
        Ok(in_flight)
    }

    fn entry_mut(&mut self, key: &str) -> Result<&mut LedgerEntry, LedgerError> {
        self.entries
            .get_mut(key)
            .ok_or_else(|| LedgerError::EntryNotFound {
                key: key.to_string(),
            })
    }
}

use sha2::Digest;
