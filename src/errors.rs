//! Typed error hierarchy for the Autopack core.
//!
//! Four top-level enums cover the four subsystems:
//! - `ExecutorError` — phase executor and persistence failures
//! - `LedgerError` — external-action ledger failures
//! - `RouterError` — model routing failures
//! - `CiError` — CI invocation and report-collection failures
//!
//! Governance rejections are not errors in this hierarchy: they are
//! `ValidationError` values (see `crate::apply`) that feed hint generation
//! and never crash the executor.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the phase executor and its persistence layer.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Unknown phase {phase_id} in run {run_id}")]
    UnknownPhase { run_id: String, phase_id: String },

    #[error("Phase {phase_id} is terminal ({state}) and cannot be executed")]
    PhaseTerminal { phase_id: String, state: String },

    #[error("Failed to write executor state at {path}: {source}")]
    StateWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Executor state corrupt at {path} and no usable backup: {detail}")]
    StateCorrupt { path: PathBuf, detail: String },

    #[error("No LLM client registered for model {model_id}")]
    ClientNotRegistered { model_id: String },

    #[error("Destructive repository operation refused in project_build run: {operation}")]
    DestructiveRefused { operation: String },

    #[error("Run budget exhausted ({detail})")]
    BudgetExhausted { detail: String },

    #[error("Ci error: {0}")]
    Ci(#[from] CiError),

    #[error("Routing error: {0}")]
    Router(#[from] RouterError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the external-action ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("No ledger entry for idempotency key {key}")]
    EntryNotFound { key: String },

    #[error("Entry {key} is {status}; operation requires {required}")]
    WrongState {
        key: String,
        status: String,
        required: String,
    },

    #[error("Payload hash mismatch for {key}: recorded {recorded}, presented {presented}")]
    HashMismatch {
        key: String,
        recorded: String,
        presented: String,
    },

    #[error("Live trading is not enabled (set LIVE_TRADING_ENABLED=1 and attach an approval)")]
    TradingDisabled,

    #[error("Publish packet missing or its content hash does not match the payload")]
    PublishPacketMismatch,

    #[error("Ledger file corrupt at {path} and backup unusable: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error("Failed to persist ledger at {path}: {source}")]
    PersistFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from model routing.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("No safety-compatible model for lane {lane} under profile {profile}")]
    LaneEmpty { lane: String, profile: String },

    #[error("Failed to read routing snapshot at {path}: {detail}")]
    SnapshotUnreadable { path: PathBuf, detail: String },
}

/// Errors from CI invocation and result collection.
#[derive(Debug, Error)]
pub enum CiError {
    #[error("Failed to spawn test command `{cmd}`: {source}")]
    SpawnFailed {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Test command timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Machine-readable report missing at {path}")]
    ReportMissing { path: PathBuf },

    #[error("Failed to parse CI report: {detail}")]
    ReportUnparseable { detail: String },
}
