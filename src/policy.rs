//! Intention-first policy engine.
//!
//! The sole place that maps a stuck-phase situation to an action. Pure:
//! the same `StuckContext` always yields the same `PolicyAction`, with no
//! side effects, so the whole decision table is unit-testable in isolation.
//!
//! Rules are evaluated in order; the first match wins. Invariants:
//! - Replan precedes escalation on the strategic branch.
//! - At most one escalation per revision epoch.
//! - Low budget drives REDUCE_SCOPE before ESCALATE_MODEL.

use serde::{Deserialize, Serialize};

use crate::attempt::OutcomeClass;
use crate::phase::{MAX_EPOCHS, MAX_RETRY_ATTEMPTS};
use crate::run::SafetyProfile;

/// Minimum remaining budget fraction to allow a model escalation.
pub const ESC_MIN: f64 = 0.15;
/// Minimum remaining budget fraction to allow a scope reduction retry.
pub const RED_MIN: f64 = 0.10;
/// Below this remaining fraction the run halts for a human.
pub const HALT_MIN: f64 = 0.05;

/// What the executor should do next with a stuck phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyAction {
    RetrySame,
    RetryWithHints,
    EscalateModel,
    ReduceScope,
    Replan,
    NeedsHuman,
    Complete,
    FailTerminal,
}

impl std::fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RetrySame => "RETRY_SAME",
            Self::RetryWithHints => "RETRY_WITH_HINTS",
            Self::EscalateModel => "ESCALATE_MODEL",
            Self::ReduceScope => "REDUCE_SCOPE",
            Self::Replan => "REPLAN",
            Self::NeedsHuman => "NEEDS_HUMAN",
            Self::Complete => "COMPLETE",
            Self::FailTerminal => "FAIL_TERMINAL",
        };
        write!(f, "{}", s)
    }
}

/// The tuple of signals the policy engine decides on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckContext {
    pub outcome: OutcomeClass,
    pub retry_attempt: u32,
    pub escalation_level: u32,
    pub revision_epoch: u32,
    /// Remaining run budget as a fraction in [0, 1].
    pub budget_remaining: f64,
    pub safety_profile: SafetyProfile,
    /// A structured `ScopeReduction` proposal grounded in the phase goal
    /// is available.
    pub has_scope_reduction_option: bool,
    /// The failure is attributed to the plan rather than the code
    /// (e.g. a CI regression the auditor blames on the phase design).
    pub strategic_signal: bool,
}

/// Decide what to do with a stuck phase. Rules in order, first match wins.
pub fn decide_when_stuck(ctx: &StuckContext) -> PolicyAction {
    // Success short-circuits everything.
    if ctx.outcome == OutcomeClass::AppliedOk {
        return PolicyAction::Complete;
    }

    // Rule 1: human approval is required before anything else may happen.
    if ctx.outcome == OutcomeClass::ApprovalRequired {
        return PolicyAction::NeedsHuman;
    }

    // Transient network failures retry in place; the executor applies
    // bounded backoff around the call itself.
    if ctx.outcome == OutcomeClass::NetworkError {
        return if ctx.retry_attempt < MAX_RETRY_ATTEMPTS {
            PolicyAction::RetrySame
        } else {
            PolicyAction::FailTerminal
        };
    }

    // Internal errors halt to a human: state may be inconsistent.
    if ctx.outcome == OutcomeClass::InternalError {
        return PolicyAction::NeedsHuman;
    }

    // Rule 2: collection/import failures are baseline-independent blockers.
    // One automatic retry on the first occurrence only.
    if ctx.outcome == OutcomeClass::CiCollectError {
        return if ctx.retry_attempt >= 1 {
            PolicyAction::FailTerminal
        } else {
            PolicyAction::RetryWithHints
        };
    }

    // Rule 3: truncation is a control-flow signal, not a diagnosable
    // failure. Retry with hints and an expanded output budget, bounded by
    // the retry cap so the counter invariant holds.
    if ctx.outcome == OutcomeClass::TruncatedOutput {
        return if ctx.retry_attempt < MAX_RETRY_ATTEMPTS {
            PolicyAction::RetryWithHints
        } else {
            PolicyAction::FailTerminal
        };
    }

    // Failures attributed to the plan skip the tactical ladder entirely;
    // a CI regression attributed to code is handled tactically.
    let tactical = !ctx.strategic_signal
        && (ctx.outcome.is_tactical() || ctx.outcome == OutcomeClass::CiRegression);

    // Rule 4: tactical failures retry with hints while attempts remain.
    if tactical && ctx.retry_attempt < MAX_RETRY_ATTEMPTS - 1 {
        return PolicyAction::RetryWithHints;
    }

    // Rule 5: last tactical attempt, no escalation spent this epoch, and
    // enough budget: escalate the model once.
    if tactical
        && ctx.retry_attempt == MAX_RETRY_ATTEMPTS - 1
        && ctx.escalation_level == 0
        && ctx.budget_remaining >= ESC_MIN
    {
        return PolicyAction::EscalateModel;
    }

    // Rule 6: no escalation available, but a grounded scope reduction is;
    // take the cheaper path if budget allows.
    if tactical && ctx.has_scope_reduction_option && ctx.budget_remaining >= RED_MIN {
        return PolicyAction::ReduceScope;
    }

    // Rule 7: strategic signals replan while epochs remain.
    if ctx.strategic_signal && ctx.revision_epoch < MAX_EPOCHS {
        return PolicyAction::Replan;
    }

    // Rule 8: nearly out of budget — hand off to a human.
    if ctx.budget_remaining < HALT_MIN {
        return PolicyAction::NeedsHuman;
    }

    // Rule 9: default.
    PolicyAction::FailTerminal
}
