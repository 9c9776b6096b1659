//! Phase executor: the state machine that drives each phase to a terminal
//! state through builder attempts, governed applies, CI, auditing, and the
//! policy engine's decisions.
//!
//! The executor is a plain state machine across suspension points: every
//! external wait (LLM call, CI invocation, approval poll) sits at a seam,
//! and a checkpoint is persisted before and after each one, so a restarted
//! process resumes at the first non-terminal phase without duplicating
//! attempt records.

pub mod events;
pub mod hints;
pub mod state;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::apply::paths::ProtectedPaths;
use crate::apply::{ApplyError, ApplyRequest, GovernedApply, ValidationError};
use crate::approval::{ApprovalChannel, ApprovalStatus};
use crate::artifacts::RunPaths;
use crate::attempt::{AttemptRecord, OutcomeClass};
use crate::backoff::BackoffPolicy;
use crate::ci::{CiBaseline, CiOutcome, CiRunner};
use crate::errors::ExecutorError;
use crate::llm::{ClientRegistry, GenerateRequest, Generation, Message, StopReason};
use crate::patch::{self, EditPlan, SizeBucket, bucket_for};
use crate::phase::{Phase, PhaseState, ScopeReduction};
use crate::policy::{PolicyAction, StuckContext, decide_when_stuck};
use crate::proof::Proof;
use crate::router::ModelRouter;
use crate::run::{RunDisposition, RunResult, RunType};
use crate::snapshot::GitSnapshot;
use crate::util::{extract_json_object, extract_tag, line_count};
use events::{EventSink, PhaseStateEvent};
use hints::HintPacket;
use state::{ExecutorState, PendingApproval, StateStore};

/// Output-budget growth applied on each truncation retry.
const TOKEN_ESCALATION_FACTOR: f64 = 1.5;

/// Tuning knobs resolved from configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub llm_timeout: Duration,
    pub ci_timeout: Duration,
    pub phase_wallclock_cap: Duration,
    pub approval_timeout: Duration,
    pub approval_poll_interval: Duration,
    /// Fallback test command when a phase scope has none.
    pub default_test_cmd: Option<String>,
    pub max_input_tokens: u64,
    pub base_output_tokens: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            llm_timeout: Duration::from_secs(60),
            ci_timeout: Duration::from_secs(600),
            phase_wallclock_cap: Duration::from_secs(3600),
            approval_timeout: crate::approval::DEFAULT_APPROVAL_TIMEOUT,
            approval_poll_interval: Duration::from_secs(5),
            default_test_cmd: None,
            max_input_tokens: 100_000,
            base_output_tokens: 8_192,
        }
    }
}

/// Terminal disposition of one phase execution.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    Complete,
    Failed { reason: String },
    Blocked { approval_id: String, reason: String },
}

struct AuditorVerdict {
    approved: bool,
    /// The auditor blames the plan rather than the code.
    strategic: bool,
    reason: String,
}

pub struct PhaseExecutor {
    workspace_root: PathBuf,
    run_paths: RunPaths,
    store: StateStore,
    state: ExecutorState,
    router: ModelRouter,
    builders: ClientRegistry,
    auditors: ClientRegistry,
    applier: GovernedApply,
    ci: CiRunner,
    approvals: ApprovalChannel,
    events: Box<dyn EventSink>,
    config: ExecutorConfig,
    backoff: BackoffPolicy,
    git: Option<GitSnapshot>,
}

impl PhaseExecutor {
    /// Build an executor for a run, resuming persisted state when present.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workspace_root: &Path,
        run: crate::run::Run,
        router: ModelRouter,
        builders: ClientRegistry,
        auditors: ClientRegistry,
        events: Box<dyn EventSink>,
        config: ExecutorConfig,
    ) -> Result<Self, ExecutorError> {
        let run_paths = RunPaths::new(workspace_root, &run.project, &run.family, &run.run_id);
        run_paths
            .ensure_directories()
            .map_err(ExecutorError::Other)?;

        let store = StateStore::new(run_paths.executor_state());
        let state = match store.load()? {
            Some(persisted) => {
                info!(run_id = %persisted.run.run_id, "resuming from persisted executor state");
                persisted
            }
            None => ExecutorState::new(run),
        };

        let run_type = state.run.run_type;
        let protected = ProtectedPaths::for_run(run_type);
        let applier = GovernedApply::new(workspace_root, &run_paths.staging_dir(), protected);
        let ci = CiRunner::new(workspace_root, config.ci_timeout);
        let approvals = ApprovalChannel::new(&run_paths.approvals_dir());
        let git = GitSnapshot::open(workspace_root);

        Ok(Self {
            workspace_root: workspace_root.to_path_buf(),
            run_paths,
            store,
            state,
            router,
            builders,
            auditors,
            applier,
            ci,
            approvals,
            events,
            config,
            backoff: BackoffPolicy::transient(),
            git,
        })
    }

    pub fn state(&self) -> &ExecutorState {
        &self.state
    }

    pub fn run_paths(&self) -> &RunPaths {
        &self.run_paths
    }

    /// Atomically persist executor state.
    pub fn checkpoint(&mut self) -> Result<(), ExecutorError> {
        self.store.save(&mut self.state)
    }

    /// Drive queued phases in order until the run drains, a phase blocks on
    /// approval, or a global budget is exhausted.
    pub async fn advance_run(&mut self) -> Result<RunResult, ExecutorError> {
        let run_id = self.state.run.run_id.clone();
        let mut result = RunResult {
            run_id: run_id.clone(),
            disposition: RunDisposition::Drained,
            completed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            blocked: None,
            ci_failures: false,
        };

        loop {
            self.checkpoint()?;

            if self.state.run.budget.is_exhausted() {
                warn!(run_id = %run_id, "run budget exhausted");
                result.disposition = RunDisposition::BudgetExhausted;
                break;
            }

            let Some(phase_id) = self.state.run.next_queued().map(|p| p.phase_id.clone()) else {
                break;
            };

            match self.execute_phase(&phase_id).await? {
                PhaseOutcome::Complete => result.completed.push(phase_id),
                PhaseOutcome::Failed { reason } => {
                    if reason.starts_with("ci_") {
                        result.ci_failures = true;
                    }
                    result.failed.push(phase_id);
                }
                PhaseOutcome::Blocked { reason, .. } => {
                    info!(phase_id = %phase_id, reason = %reason, "run blocked on approval");
                    result.blocked = Some(phase_id);
                    result.disposition = RunDisposition::Blocked;
                    break;
                }
            }
        }

        for phase in &self.state.run.phases {
            if phase.state == PhaseState::Skipped {
                result.skipped.push(phase.phase_id.clone());
            }
        }

        self.write_handoff(&result)?;
        self.checkpoint()?;
        Ok(result)
    }

    /// Run one phase to a terminal state.
    pub async fn execute_phase(&mut self, phase_id: &str) -> Result<PhaseOutcome, ExecutorError> {
        let run_id = self.state.run.run_id.clone();
        {
            let phase = self.phase(phase_id)?;
            if phase.state.is_terminal() {
                return Err(ExecutorError::PhaseTerminal {
                    phase_id: phase_id.to_string(),
                    state: phase.state.to_string(),
                });
            }
        }

        // A restart with a pending approval resumes the wait instead of
        // re-running the attempt.
        if let Some(pending) = self.state.pending_approval.clone() {
            if pending.phase_id == phase_id {
                return self.resume_pending_approval(&run_id, pending).await;
            }
        }

        self.transition(phase_id, PhaseState::InProgress, Some("attempting"))?;

        let phase_started = Instant::now();
        let mut hints = HintPacket::default();
        let mut decisions: Vec<String> = Vec::new();
        let mut output_boost: f64 = 1.0;
        let approval_token: Option<String> = self.state.granted_approvals.get(phase_id).cloned();
        let mut pending_reduction: Option<ScopeReduction> = None;

        // Establish the CI baseline before the first patch so pre-existing
        // failures never count as regressions.
        let baseline = self.compute_baseline(phase_id, &mut decisions).await;

        loop {
            if phase_started.elapsed() > self.config.phase_wallclock_cap {
                return self.fail_terminal(phase_id, "phase_wallclock_cap_exceeded", &decisions);
            }

            let phase = self.phase(phase_id)?.clone();
            let attempt_started = Instant::now();

            // Step 1-2: compose context, select model.
            let builder_model = self
                .router
                .resolve(phase.task_category, phase.complexity, phase.escalation_level)
                .to_string();
            let model_spec = self
                .router
                .resolve_spec(phase.task_category, phase.complexity, phase.escalation_level)
                .clone();
            let max_output = ((self.config.base_output_tokens as f64 * output_boost) as u64)
                .min(model_spec.max_output);
            let prompt = self.compose_prompt(&phase, &hints);
            let idempotency_key = AttemptRecord::idempotency_key(
                &run_id,
                phase_id,
                phase.revision_epoch,
                phase.retry_attempt,
                &builder_model,
                &prompt,
            );

            self.state.in_flight_keys.insert(idempotency_key.clone());
            self.checkpoint()?;

            // Steps 3-6: builder call, parse, governed apply, CI, audit.
            let attempt = self
                .run_attempt(
                    &phase,
                    &builder_model,
                    max_output,
                    &prompt,
                    approval_token.as_deref(),
                    baseline.as_ref(),
                    &mut pending_reduction,
                    &mut hints,
                )
                .await;

            let auditor_model = if self.auditors.get(&builder_model).is_some() {
                Some(builder_model.clone())
            } else {
                None
            };
            let record = AttemptRecord {
                attempt_index: phase.retry_attempt,
                builder_model_id: builder_model.clone(),
                auditor_model_id: auditor_model,
                tokens_in: attempt.tokens_in,
                tokens_out: attempt.tokens_out,
                wallclock_ms: attempt_started.elapsed().as_millis() as u64,
                outcome: attempt.class.into(),
                outcome_class: attempt.class,
                idempotency_key,
                patch_hash: attempt.patch_hash.clone(),
                checkpoint: attempt.git_checkpoint.clone(),
                repairs: attempt.repairs.clone(),
                started_at: chrono::Utc::now(),
            };
            self.state.record_attempt(phase_id, record.clone());
            {
                let phase = self.phase_mut(phase_id)?;
                phase.last_attempt_timestamp = Some(chrono::Utc::now());
                if attempt.class != OutcomeClass::AppliedOk {
                    phase.last_failure_reason = Some(attempt.reason.clone());
                }
            }
            self.checkpoint()?;

            // Step 7: policy decision.
            let phase = self.phase(phase_id)?.clone();
            let ctx = StuckContext {
                outcome: attempt.class,
                retry_attempt: phase.retry_attempt,
                escalation_level: phase.escalation_level,
                revision_epoch: phase.revision_epoch,
                budget_remaining: self.state.run.budget.remaining_fraction(),
                safety_profile: self.state.run.safety_profile,
                has_scope_reduction_option: pending_reduction.is_some(),
                strategic_signal: attempt.strategic,
            };
            let action = decide_when_stuck(&ctx);
            decisions.push(format!("{} -> {}", attempt.class, action));
            debug!(phase_id = %phase_id, outcome = %attempt.class, action = %action, "policy decision");

            // Step 8: apply the action.
            match action {
                PolicyAction::Complete => {
                    self.transition(phase_id, PhaseState::Complete, Some("applied_ok"))?;
                    let phase = self.phase(phase_id)?.clone();
                    Proof::new(&phase, "applied, CI passed, audit approved")
                        .with_final_attempt(record)
                        .with_ci_summary(attempt.ci_summary.clone().unwrap_or_default())
                        .with_decisions(decisions.clone())
                        .write(&self.run_paths, &phase)
                        .map_err(ExecutorError::Other)?;
                    self.charge_wallclock(phase_started);
                    self.checkpoint()?;
                    return Ok(PhaseOutcome::Complete);
                }
                PolicyAction::RetrySame => {
                    self.phase_mut(phase_id)?.bump_retry();
                    self.emit_counters(phase_id, "retry_same")?;
                }
                PolicyAction::RetryWithHints => {
                    if attempt.class == OutcomeClass::TruncatedOutput {
                        // Token escalation: a control-flow signal, not a
                        // diagnosable failure. No doctor, no replan.
                        output_boost *= TOKEN_ESCALATION_FACTOR;
                        hints.note_truncation();
                    }
                    self.phase_mut(phase_id)?.bump_retry();
                    self.emit_counters(phase_id, "retry_with_hints")?;
                }
                PolicyAction::EscalateModel => {
                    let phase = self.phase_mut(phase_id)?;
                    phase.bump_escalation();
                    phase.bump_retry();
                    self.emit_counters(phase_id, "escalate_model")?;
                }
                PolicyAction::ReduceScope => {
                    if let Some(reduction) = pending_reduction.take() {
                        let phase = self.phase_mut(phase_id)?;
                        if phase.reduce_scope(&reduction) {
                            info!(phase_id = %phase_id, "scope reduced to {:?}", phase.scope.paths);
                        } else {
                            decisions.push("scope reduction rejected (would widen)".to_string());
                        }
                    }
                    self.emit_counters(phase_id, "reduce_scope")?;
                }
                PolicyAction::Replan => {
                    // Non-destructive: attempt records and retry_attempt
                    // survive; only the escalation counter resets.
                    self.phase_mut(phase_id)?.bump_epoch();
                    hints = HintPacket::default();
                    pending_reduction = None;
                    self.emit_counters(phase_id, "replan")?;
                }
                PolicyAction::NeedsHuman => {
                    self.charge_wallclock(phase_started);
                    return self
                        .block_for_approval(
                            &run_id,
                            phase_id,
                            attempt.class,
                            attempt.ci_ok,
                            &attempt.reason,
                            &decisions,
                        )
                        .await;
                }
                PolicyAction::FailTerminal => {
                    self.charge_wallclock(phase_started);
                    let reason = terminal_reason(attempt.class);
                    let outcome = self.fail_terminal(phase_id, reason, &decisions);
                    return outcome;
                }
            }
            self.checkpoint()?;
        }
    }

    /// One builder attempt through apply, CI, and audit.
    #[allow(clippy::too_many_arguments)]
    async fn run_attempt(
        &mut self,
        phase: &Phase,
        builder_model: &str,
        max_output: u64,
        prompt: &str,
        approval_token: Option<&str>,
        baseline: Option<&CiBaseline>,
        pending_reduction: &mut Option<ScopeReduction>,
        hints: &mut HintPacket,
    ) -> AttemptResult {
        let mut result = AttemptResult::default();

        // Builder call with bounded backoff on transient errors.
        let generation = match self.call_builder(builder_model, prompt, max_output).await {
            Ok(generation) => generation,
            Err(reason) => {
                result.class = OutcomeClass::NetworkError;
                result.reason = reason;
                return result;
            }
        };
        result.tokens_in = generation.tokens_in;
        result.tokens_out = generation.tokens_out;
        self.state
            .run
            .budget
            .charge_tokens(generation.tokens_in + generation.tokens_out);

        // A scope-reduction proposal may ride along with any output.
        if let Some(reduction) = parse_scope_reduction(&generation.text) {
            *pending_reduction = Some(reduction);
        }

        // Truncation is classified before parsing: partial content must
        // never read as a successful empty patch.
        if generation.effective_stop_reason(max_output) == StopReason::Length {
            result.class = OutcomeClass::TruncatedOutput;
            result.reason = "builder output truncated at token budget".to_string();
            return result;
        }

        // Parse into an edit plan.
        let force_structured = self.phase_declares_bucket_c(phase);
        let plan = match patch::parse_builder_output(&generation.text, force_structured) {
            Ok(plan) => plan,
            Err(e) => {
                result.class = OutcomeClass::PatchRejected;
                result.reason = e.to_string();
                hints.merge(HintPacket {
                    notes: vec![format!("previous output was not a usable patch: {}", e)],
                    ..Default::default()
                });
                return result;
            }
        };
        result.repairs = plan.repairs.clone();

        // Pre-apply git checkpoint when the workspace is a repository.
        if let Some(git) = &self.git {
            match git.snapshot_before(&phase.phase_id) {
                Ok(sha) => result.git_checkpoint = Some(sha),
                Err(e) => warn!(error = %e, "pre-apply snapshot failed"),
            }
        }

        // Governed apply.
        let request = ApplyRequest {
            plan: &plan,
            scope: &phase.scope,
            deliverables: &phase.deliverables,
            run_type: self.state.run.run_type,
            allow_mass_deletion: phase.allow_mass_deletion,
            allow_mass_addition: phase.allow_mass_addition,
            approval_token,
        };
        let applied = match self.applier.apply(&request) {
            Ok(applied) => applied,
            Err(ApplyError::Validation(validation)) => {
                result.classify_validation(&validation, &plan, phase);
                hints.merge(HintPacket::from_validation(
                    &validation,
                    &plan.touched_paths(),
                    &phase.deliverables,
                ));
                return result;
            }
            Err(ApplyError::Internal(e)) => {
                result.class = OutcomeClass::InternalError;
                result.reason = e.to_string();
                return result;
            }
        };
        result.patch_hash = Some(applied.patch_hash.clone());
        if result.git_checkpoint.is_none() {
            // Outside a git repository the backup manifest is the rollback
            // point recorded on the attempt.
            result.git_checkpoint = Some(applied.backup_manifest.display().to_string());
        }

        // CI.
        let test_cmd = phase
            .scope
            .test_cmd
            .clone()
            .or_else(|| self.config.default_test_cmd.clone());
        if let Some(test_cmd) = test_cmd {
            match self
                .ci
                .run(
                    &test_cmd,
                    &self.run_paths.ci_report(&phase.phase_id),
                    &self.run_paths.ci_log(&phase.phase_id),
                    baseline,
                )
                .await
            {
                Ok(CiOutcome::Passed(report)) => {
                    result.ci_ok = true;
                    result.ci_summary = Some(format!(
                        "exit {} / {} tests, {} failed",
                        report.exitcode, report.summary.total, report.summary.failed
                    ));
                }
                Ok(CiOutcome::Regression {
                    report,
                    new_failures,
                }) => {
                    result.class = OutcomeClass::CiRegression;
                    result.reason = format!("new test failures: {:?}", new_failures);
                    result.ci_summary = Some(format!(
                        "exit {} / {} new failures",
                        report.exitcode,
                        new_failures.len()
                    ));
                    hints.merge(HintPacket {
                        notes: vec![format!(
                            "your patch broke tests: {}",
                            new_failures.join(", ")
                        )],
                        ..Default::default()
                    });
                    return result;
                }
                Ok(CiOutcome::CollectionError(report)) => {
                    result.class = OutcomeClass::CiCollectError;
                    let failed: Vec<&str> = report
                        .collectors
                        .iter()
                        .filter(|c| c.outcome == "failed")
                        .map(|c| c.nodeid.as_str())
                        .collect();
                    result.reason = format!("collection failed: {:?}", failed);
                    result.ci_summary = Some("collection error".to_string());
                    return result;
                }
                Err(e) => {
                    // No machine-readable report is itself a collection
                    // failure: nothing downstream can be trusted.
                    result.class = OutcomeClass::CiCollectError;
                    result.reason = e.to_string();
                    return result;
                }
            }
        } else {
            result.ci_ok = true;
        }

        // Auditor.
        match self.run_auditor(phase, &applied.touched_paths, &result).await {
            Some(verdict) if !verdict.approved => {
                result.class = OutcomeClass::AuditorReject;
                result.strategic = verdict.strategic;
                result.reason = verdict.reason.clone();
                hints.merge(HintPacket {
                    notes: vec![format!("auditor rejection: {}", verdict.reason)],
                    ..Default::default()
                });
                return result;
            }
            _ => {}
        }

        result.class = OutcomeClass::AppliedOk;
        result.reason = "applied".to_string();
        result
    }

    async fn call_builder(
        &mut self,
        model_id: &str,
        prompt: &str,
        max_output: u64,
    ) -> Result<Generation, String> {
        let Some(client) = self.builders.get(model_id) else {
            return Err(format!("no client registered for model {}", model_id));
        };

        let request = GenerateRequest {
            messages: vec![
                Message::system("You are the builder. Produce only a patch in one of the accepted formats."),
                Message::user(prompt.to_string()),
            ],
            max_input_tokens: self.config.max_input_tokens,
            max_output_tokens: max_output,
            timeout_ms: self.config.llm_timeout.as_millis() as u64,
        };

        let mut retry = 0u32;
        loop {
            let call = client.generate(request.clone());
            let outcome = tokio::time::timeout(self.config.llm_timeout, call).await;
            match outcome {
                Ok(Ok(generation)) => return Ok(generation),
                Ok(Err(e)) if e.is_transient() => {
                    retry += 1;
                    match self.backoff.delay_for(retry) {
                        Some(delay) => {
                            warn!(model_id, retry, "transient provider error: {}", e);
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(format!("transient errors exhausted retries: {}", e)),
                    }
                }
                Ok(Err(e)) => return Err(e.to_string()),
                Err(_) => {
                    retry += 1;
                    match self.backoff.delay_for(retry) {
                        Some(delay) => {
                            warn!(model_id, retry, "provider call timed out");
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err("provider timeouts exhausted retries".to_string()),
                    }
                }
            }
        }
    }

    async fn run_auditor(
        &mut self,
        phase: &Phase,
        touched: &[String],
        attempt: &AttemptResult,
    ) -> Option<AuditorVerdict> {
        let model_id = self
            .router
            .resolve(phase.task_category, phase.complexity, 0)
            .to_string();
        let client = self.auditors.get(&model_id)?;

        let mut prompt = format!(
            "Audit this patch for phase '{}' (goal: {}).\nTouched files: {}\n",
            phase.phase_id,
            phase.goal,
            touched.join(", ")
        );
        if let Some(ci) = &attempt.ci_summary {
            prompt.push_str(&format!("CI: {}\n", ci));
        }
        if !phase.scope.acceptance_criteria.is_empty() {
            prompt.push_str("Acceptance criteria:\n");
            for criterion in &phase.scope.acceptance_criteria {
                prompt.push_str(&format!("- {}\n", criterion));
            }
        }
        prompt.push_str(
            "Reply with JSON: {\"verdict\": \"approve\"|\"reject\", \"reason\": \"...\", \
             \"attribution\": \"code\"|\"plan\"}\n",
        );

        let request = GenerateRequest {
            messages: vec![Message::user(prompt)],
            max_input_tokens: self.config.max_input_tokens,
            max_output_tokens: 1024,
            timeout_ms: self.config.llm_timeout.as_millis() as u64,
        };

        match tokio::time::timeout(self.config.llm_timeout, client.generate(request)).await {
            Ok(Ok(generation)) => {
                self.state
                    .run
                    .budget
                    .charge_tokens(generation.tokens_in + generation.tokens_out);
                parse_auditor_verdict(&generation.text)
            }
            _ => {
                warn!(model_id, "auditor unavailable; proceeding without audit");
                None
            }
        }
    }

    async fn compute_baseline(
        &mut self,
        phase_id: &str,
        decisions: &mut Vec<String>,
    ) -> Option<CiBaseline> {
        let phase = self.phase(phase_id).ok()?.clone();
        let test_cmd = phase
            .scope
            .test_cmd
            .clone()
            .or_else(|| self.config.default_test_cmd.clone())?;

        let report_path = self
            .run_paths
            .ci_report(&format!("{}_baseline", phase_id));
        let log_path = self.run_paths.ci_log(&format!("{}_baseline", phase_id));

        match self.ci.run(&test_cmd, &report_path, &log_path, None).await {
            Ok(CiOutcome::Passed(report))
            | Ok(CiOutcome::Regression { report, .. })
            | Ok(CiOutcome::CollectionError(report)) => Some(CiBaseline::from_report(&report)),
            Err(e) => {
                decisions.push(format!("baseline unavailable: {}", e));
                None
            }
        }
    }

    async fn block_for_approval(
        &mut self,
        run_id: &str,
        phase_id: &str,
        outcome: OutcomeClass,
        ci_ok: bool,
        reason: &str,
        decisions: &[String],
    ) -> Result<PhaseOutcome, ExecutorError> {
        let request = self
            .approvals
            .request(run_id, phase_id, reason)
            .map_err(ExecutorError::Other)?;

        self.state.pending_approval = Some(PendingApproval {
            phase_id: phase_id.to_string(),
            approval_id: request.approval_id.clone(),
            outcome,
            ci_ok,
        });
        let blocked_event = PhaseStateEvent::blocked(run_id, self.phase(phase_id)?, reason);
        self.events
            .emit(&blocked_event)
            .map_err(ExecutorError::Other)?;
        self.checkpoint()?;

        let resolved = self
            .approvals
            .wait(
                &request.approval_id,
                self.config.approval_timeout,
                self.config.approval_poll_interval,
            )
            .await
            .map_err(ExecutorError::Other)?;

        match resolved.status {
            ApprovalStatus::Approved => {
                self.state.pending_approval = None;
                let approver = resolved.approver_id.unwrap_or_else(|| "unknown".into());

                // A human may override an auditor block, but only when CI
                // was fully green; collection errors and regressions are
                // never overridable.
                if outcome == OutcomeClass::AuditorReject && ci_ok {
                    self.transition(phase_id, PhaseState::Complete, Some("auditor_overridden"))?;
                    let phase = self.phase(phase_id)?.clone();
                    Proof::new(
                        &phase,
                        &format!("auditor block overridden by {}", approver),
                    )
                    .with_decisions(decisions.to_vec())
                    .write(&self.run_paths, &phase)
                    .map_err(ExecutorError::Other)?;
                    self.checkpoint()?;
                    return Ok(PhaseOutcome::Complete);
                }

                // Otherwise approval unblocks further attempts; a
                // protected-path approval carries a token into them.
                if outcome == OutcomeClass::ApprovalRequired {
                    self.state
                        .granted_approvals
                        .insert(phase_id.to_string(), request.approval_id.clone());
                }
                self.checkpoint()?;
                // Re-enter the attempt loop.
                Box::pin(self.execute_phase(phase_id)).await
            }
            ApprovalStatus::Denied => {
                self.state.pending_approval = None;
                let approver = resolved.approver_id.unwrap_or_else(|| "unknown".into());
                self.fail_terminal(
                    phase_id,
                    &format!("approval_denied_by_{}", approver),
                    decisions,
                )
            }
            ApprovalStatus::Pending => {
                // Timed out: the phase stays blocked; never converted to a
                // failure by an attempt-level timeout.
                Ok(PhaseOutcome::Blocked {
                    approval_id: request.approval_id,
                    reason: reason.to_string(),
                })
            }
        }
    }

    async fn resume_pending_approval(
        &mut self,
        run_id: &str,
        pending: PendingApproval,
    ) -> Result<PhaseOutcome, ExecutorError> {
        info!(
            phase_id = %pending.phase_id,
            approval_id = %pending.approval_id,
            "resuming pending approval wait"
        );
        let phase_id = pending.phase_id.clone();
        let resolved = self
            .approvals
            .wait(
                &pending.approval_id,
                self.config.approval_timeout,
                self.config.approval_poll_interval,
            )
            .await
            .map_err(ExecutorError::Other)?;

        match resolved.status {
            ApprovalStatus::Approved => {
                self.state.pending_approval = None;
                if pending.outcome == OutcomeClass::AuditorReject && pending.ci_ok {
                    self.transition(&phase_id, PhaseState::Complete, Some("auditor_overridden"))?;
                    let phase = self.phase(&phase_id)?.clone();
                    Proof::new(&phase, "auditor block overridden after restart")
                        .write(&self.run_paths, &phase)
                        .map_err(ExecutorError::Other)?;
                    self.checkpoint()?;
                    return Ok(PhaseOutcome::Complete);
                }
                if pending.outcome == OutcomeClass::ApprovalRequired {
                    self.state
                        .granted_approvals
                        .insert(phase_id.clone(), pending.approval_id.clone());
                }
                self.checkpoint()?;
                Box::pin(self.execute_phase(&phase_id)).await
            }
            ApprovalStatus::Denied => {
                self.state.pending_approval = None;
                self.fail_terminal(&phase_id, "approval_denied", &[])
            }
            ApprovalStatus::Pending => Ok(PhaseOutcome::Blocked {
                approval_id: pending.approval_id,
                reason: "approval still pending".to_string(),
            }),
        }
    }

    fn fail_terminal(
        &mut self,
        phase_id: &str,
        reason: &str,
        decisions: &[String],
    ) -> Result<PhaseOutcome, ExecutorError> {
        self.transition(phase_id, PhaseState::Failed, Some(reason))?;
        let phase = self.phase(phase_id)?.clone();
        let final_attempt = self.state.attempts_for(phase_id).last().cloned();
        let mut proof = Proof::new(&phase, reason).with_decisions(decisions.to_vec());
        if let Some(attempt) = final_attempt {
            proof = proof.with_final_attempt(attempt);
        }
        proof
            .write(&self.run_paths, &phase)
            .map_err(ExecutorError::Other)?;
        self.checkpoint()?;
        Ok(PhaseOutcome::Failed {
            reason: reason.to_string(),
        })
    }

    fn transition(
        &mut self,
        phase_id: &str,
        state: PhaseState,
        reason: Option<&str>,
    ) -> Result<(), ExecutorError> {
        let run_id = self.state.run.run_id.clone();
        {
            let phase = self.phase_mut(phase_id)?;
            phase.set_state(state);
        }
        let event = PhaseStateEvent::transition(
            &run_id,
            self.phase(phase_id)?,
            reason.map(|s| s.to_string()),
        );
        self.events.emit(&event).map_err(ExecutorError::Other)?;
        Ok(())
    }

    fn emit_counters(&mut self, phase_id: &str, reason: &str) -> Result<(), ExecutorError> {
        let run_id = self.state.run.run_id.clone();
        let event = PhaseStateEvent::transition(
            &run_id,
            self.phase(phase_id)?,
            Some(reason.to_string()),
        );
        self.events.emit(&event).map_err(ExecutorError::Other)
    }

    fn charge_wallclock(&mut self, started: Instant) {
        self.state
            .run
            .budget
            .charge_wallclock(started.elapsed().as_secs());
    }

    fn phase(&self, phase_id: &str) -> Result<&Phase, ExecutorError> {
        self.state
            .run
            .get_phase(phase_id)
            .ok_or_else(|| ExecutorError::UnknownPhase {
                run_id: self.state.run.run_id.clone(),
                phase_id: phase_id.to_string(),
            })
    }

    fn phase_mut(&mut self, phase_id: &str) -> Result<&mut Phase, ExecutorError> {
        let run_id = self.state.run.run_id.clone();
        self.state
            .run
            .get_phase_mut(phase_id)
            .ok_or_else(|| ExecutorError::UnknownPhase {
                run_id,
                phase_id: phase_id.to_string(),
            })
    }

    /// The deliverables contract is a hard prefix of every builder prompt.
    fn compose_prompt(&self, phase: &Phase, hints: &HintPacket) -> String {
        let mut out = String::new();

        out.push_str("## Deliverables contract\n\n");
        if phase.deliverables.is_empty() {
            out.push_str("No fixed deliverables; stay within scope.\n");
        } else {
            out.push_str("You MUST produce or modify these exact paths:\n");
            for deliverable in &phase.deliverables {
                out.push_str(&format!("- {}\n", deliverable));
            }
            if let Some(prefix) = hints::common_prefix(&phase.deliverables) {
                out.push_str(&format!("Common prefix: {}\n", prefix));
            }
        }
        out.push_str("Writable scope prefixes:\n");
        for path in &phase.scope.paths {
            out.push_str(&format!("- {}\n", path));
        }
        if !phase.scope.read_only_context.is_empty() {
            out.push_str("Read-only context (never modify):\n");
            for path in &phase.scope.read_only_context {
                out.push_str(&format!("- {}\n", path));
            }
        }

        out.push_str(&format!(
            "\n## Phase {}: {}\n\n{}\n",
            phase.phase_id, phase.goal, phase.description
        ));
        if !phase.scope.acceptance_criteria.is_empty() {
            out.push_str("\nAcceptance criteria:\n");
            for criterion in &phase.scope.acceptance_criteria {
                out.push_str(&format!("- {}\n", criterion));
            }
        }
        if let Some(notes) = &phase.scope.notes {
            out.push_str(&format!("\nNotes: {}\n", notes));
        }

        out.push_str(
            "\n## Output format\n\nEmit one of: a unified diff, a {\"files\": [...]} JSON \
             payload, or NDJSON edit operations. Files over 500 lines prefer diffs; over \
             1000 lines require NDJSON operations.\n",
        );

        let rendered = hints.render();
        if !rendered.is_empty() {
            out.push('\n');
            out.push_str(&rendered);
        }
        out
    }

    /// Whether any declared deliverable points at an existing Bucket-C file.
    fn phase_declares_bucket_c(&self, phase: &Phase) -> bool {
        phase.deliverables.iter().any(|deliverable| {
            if deliverable.contains(['*', '?', '[']) {
                return false;
            }
            let path = self.workspace_root.join(deliverable);
            std::fs::read_to_string(path)
                .map(|content| bucket_for(line_count(&content)) == SizeBucket::C)
                .unwrap_or(false)
        })
    }

    fn write_handoff(&self, result: &RunResult) -> Result<(), ExecutorError> {
        let run = &self.state.run;
        let mut out = String::new();
        out.push_str(&format!("# Run {} handoff\n\n", run.run_id));
        out.push_str(&format!(
            "Objective: {} / {} ({})\n\n",
            run.project, run.family, run.run_type
        ));
        out.push_str(&format!(
            "Budget remaining: {:.0}%\n\n",
            run.budget.remaining_fraction() * 100.0
        ));
        out.push_str("## Phases\n\n");
        for phase in &run.phases {
            out.push_str(&format!(
                "- {} [{}] retry={} epoch={} esc={} {}\n",
                phase.phase_id,
                phase.state,
                phase.retry_attempt,
                phase.revision_epoch,
                phase.escalation_level,
                phase.goal
            ));
        }
        if let Some(blocked) = &result.blocked {
            out.push_str(&format!(
                "\n## Blockers\n\n- phase {} awaits approval under {}\n",
                blocked,
                self.run_paths.approvals_dir().display()
            ));
        }
        out.push_str(&format!(
            "\nArtifacts: {}\n",
            self.run_paths.base().display()
        ));

        std::fs::write(self.run_paths.handoff_context(), out)
            .map_err(|e| ExecutorError::Other(anyhow::anyhow!("handoff write failed: {}", e)))
    }
}

/// Working result of one attempt before it becomes an `AttemptRecord`.
struct AttemptResult {
    class: OutcomeClass,
    reason: String,
    strategic: bool,
    ci_ok: bool,
    ci_summary: Option<String>,
    patch_hash: Option<String>,
    git_checkpoint: Option<String>,
    repairs: Vec<String>,
    tokens_in: u64,
    tokens_out: u64,
}

impl Default for AttemptResult {
    fn default() -> Self {
        Self {
            class: OutcomeClass::InternalError,
            reason: String::new(),
            strategic: false,
            ci_ok: false,
            ci_summary: None,
            patch_hash: None,
            git_checkpoint: None,
            repairs: Vec::new(),
            tokens_in: 0,
            tokens_out: 0,
        }
    }
}

impl AttemptResult {
    fn classify_validation(&mut self, error: &ValidationError, _plan: &EditPlan, _phase: &Phase) {
        self.reason = error.to_string();
        self.class = match error {
            ValidationError::DeliverablesShort { .. } => OutcomeClass::DeliverablesShort,
            // Protected paths are never auto-retried: they need a human or
            // a scope correction.
            ValidationError::ProtectedPath { .. } => OutcomeClass::ApprovalRequired,
            _ => OutcomeClass::PatchRejected,
        };
    }
}

fn terminal_reason(class: OutcomeClass) -> &'static str {
    match class {
        OutcomeClass::CiCollectError => "ci_collection_error",
        OutcomeClass::CiRegression => "ci_regression",
        OutcomeClass::DeliverablesShort => "deliverables_short_retries_exhausted",
        OutcomeClass::PatchRejected => "patch_rejected_retries_exhausted",
        OutcomeClass::AuditorReject => "auditor_reject_retries_exhausted",
        OutcomeClass::NetworkError => "network_errors_exhausted",
        OutcomeClass::ApprovalRequired => "approval_not_granted",
        _ => "retries_exhausted",
    }
}

fn parse_scope_reduction(text: &str) -> Option<ScopeReduction> {
    let body = extract_tag(text, "scope_reduction")?;
    serde_json::from_str(body).ok()
}

fn parse_auditor_verdict(text: &str) -> Option<AuditorVerdict> {
    let json = extract_json_object(text)?;
    let value: serde_json::Value = serde_json::from_str(&json).ok()?;
    let verdict = value.get("verdict")?.as_str()?;
    Some(AuditorVerdict {
        approved: verdict.eq_ignore_ascii_case("approve"),
        strategic: value
            .get("attribution")
            .and_then(|a| a.as_str())
            .map(|a| a.eq_ignore_ascii_case("plan"))
            .unwrap_or(false),
        reason: value
            .get("reason")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .to_string(),
    })
}
