//! Per-attempt records and outcome classification.
//!
//! One `AttemptRecord` is appended per builder attempt and never mutated.
//! The fine-grained `OutcomeClass` is what the executor classifies each
//! attempt into and what the policy engine decides on; the coarse
//! `AttemptOutcome` is the summary stored on the record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fine-grained classification of a single attempt (executor step 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeClass {
    AppliedOk,
    DeliverablesShort,
    TruncatedOutput,
    PatchRejected,
    CiCollectError,
    CiRegression,
    AuditorReject,
    ApprovalRequired,
    NetworkError,
    InternalError,
}

impl OutcomeClass {
    /// Tactical failures: recoverable by another attempt under the same plan.
    pub fn is_tactical(&self) -> bool {
        matches!(
            self,
            Self::DeliverablesShort | Self::PatchRejected | Self::AuditorReject
        )
    }
}

impl std::fmt::Display for OutcomeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AppliedOk => "APPLIED_OK",
            Self::DeliverablesShort => "DELIVERABLES_SHORT",
            Self::TruncatedOutput => "TRUNCATED_OUTPUT",
            Self::PatchRejected => "PATCH_REJECTED",
            Self::CiCollectError => "CI_COLLECT_ERROR",
            Self::CiRegression => "CI_REGRESSION",
            Self::AuditorReject => "AUDITOR_REJECT",
            Self::ApprovalRequired => "APPROVAL_REQUIRED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Coarse outcome stored on the immutable attempt record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Applied,
    ValidationFail,
    BuilderFail,
    Truncated,
    CiFail,
    ApprovalWait,
}

impl From<OutcomeClass> for AttemptOutcome {
    fn from(class: OutcomeClass) -> Self {
        match class {
            OutcomeClass::AppliedOk => Self::Applied,
            OutcomeClass::DeliverablesShort | OutcomeClass::PatchRejected => Self::ValidationFail,
            OutcomeClass::TruncatedOutput => Self::Truncated,
            OutcomeClass::CiCollectError
            | OutcomeClass::CiRegression
            | OutcomeClass::AuditorReject => Self::CiFail,
            OutcomeClass::ApprovalRequired => Self::ApprovalWait,
            OutcomeClass::NetworkError | OutcomeClass::InternalError => Self::BuilderFail,
        }
    }
}

/// Immutable record of one builder attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_index: u32,
    pub builder_model_id: String,
    pub auditor_model_id: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub wallclock_ms: u64,
    pub outcome: AttemptOutcome,
    /// Fine-grained class the policy engine saw for this attempt.
    pub outcome_class: OutcomeClass,
    /// SHA-256 over the normalized attempt inputs; used to dedup attempts
    /// across process restarts.
    pub idempotency_key: String,
    #[serde(default)]
    pub patch_hash: Option<String>,
    #[serde(default)]
    pub checkpoint: Option<String>,
    /// Parser repairs applied to the builder output, recorded for audit.
    #[serde(default)]
    pub repairs: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl AttemptRecord {
    /// Derive the idempotency key for an attempt from its normalized inputs.
    /// Stable across restarts: the same (run, phase, epoch, attempt, model,
    /// prompt) always hashes to the same key.
    pub fn idempotency_key(
        run_id: &str,
        phase_id: &str,
        revision_epoch: u32,
        attempt_index: u32,
        builder_model_id: &str,
        prompt: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(run_id.as_bytes());
        hasher.update(b"\x00");
        hasher.update(phase_id.as_bytes());
        hasher.update(b"\x00");
        hasher.update(revision_epoch.to_le_bytes());
        hasher.update(attempt_index.to_le_bytes());
        hasher.update(builder_model_id.as_bytes());
        hasher.update(b"\x00");
        hasher.update(Sha256::digest(prompt.as_bytes()));
        hex::encode(hasher.finalize())
    }
}
