use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::Ordering;

use crate::core::{
    Bindings, EnvRequirement, Environment, EnvironmentKind, ExecutionEvent, ExecutionResult,
    Finding, FindingCategory, Placeholder, Precondition, RemediationStep, SessionMode,
    SessionState, StepOutcome, TargetVolume, Tier, TierFailure, TierRecord, TierSkip,
};
use crate::engine::{Engine, EngineError};
use crate::logs::{MAX_CMD_OUTPUT_BYTES, truncate_output};
use crate::platform::CommandRunError;
use crate::probes::{self, ScanFacts};
use crate::safety::{self, GateDecision};
use crate::scan;
use crate::session::{Session, SessionHandle};
use crate::verify;

/// Drives one session to a terminal state, yielding every event it logs.
///
/// Each call to `next` performs at most one unit of work (a confirmation, a
/// single step, a verification pass or an escalation decision), so a front end
/// can render progress between commands. Abort requests are honoured at tier
/// boundaries. The session mutex is released while an external command runs.
pub struct Execution {
    engine: Engine,
    handle: SessionHandle,
    session_id: String,
    target: TargetVolume,
    env: Environment,
    approved: bool,
    cursor: usize,
    pending: VecDeque<ExecutionEvent>,
    facts: ScanFacts,
    run: Option<TierRun>,
    finished: bool,
}

struct TierRun {
    tier: Tier,
    steps: Vec<RemediationStep>,
    next: usize,
    ran: Vec<StepRun>,
    stopped: Option<TierFailure>,
}

struct StepRun {
    step: RemediationStep,
    command: String,
    exit_code: Option<i32>,
    success: bool,
    output: String,
}

struct StepJob {
    tier: Tier,
    step: RemediationStep,
}

/// Work that may block, done with the session mutex released.
enum Work {
    Confirm(GateDecision),
    Step(StepJob),
}

/// What one step produced while the session was unlocked.
struct StepDone {
    tier: Tier,
    events: Vec<ExecutionEvent>,
    ran: Option<StepRun>,
    end: StepEnd,
}

enum StepEnd {
    Continue,
    Stop(TierFailure),
    ToolMissing(String),
}

impl Execution {
    pub(crate) fn new(
        engine: Engine,
        handle: SessionHandle,
        approved: bool,
        session: &Session,
    ) -> Self {
        Self {
            engine,
            handle,
            session_id: session.id.clone(),
            target: session.target.clone(),
            env: session.env.clone(),
            approved,
            cursor: session.log.len(),
            pending: VecDeque::new(),
            facts: session.scan.facts.clone(),
            run: None,
            finished: false,
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Runs to completion and returns the final state.
    pub fn finish(mut self) -> SessionState {
        for _ in self.by_ref() {}
        self.handle.state()
    }

    /// Moves the state machine on by one unit. A prompt or a step is handed
    /// back instead of being run here, so the caller can release the session first.
    fn advance(&mut self, session: &mut Session) -> Result<Option<Work>, EngineError> {
        let moved = match session.state {
            SessionState::Planning if session.mode == SessionMode::DryRun => {
                self.preview(session)
            }
            SessionState::Idle | SessionState::Planning => {
                session.transition(SessionState::Aborted)
            }
            SessionState::AwaitingConfirmation => return self.confirm(session),
            SessionState::ExecutingTier(tier) => {
                return Ok(self.take_step(session, tier)?.map(Work::Step));
            }
            SessionState::Verifying(Some(tier)) => self.verify_tier(session, tier),
            SessionState::Verifying(None) => self.verify_all(session),
            SessionState::Escalating(tier) => {
                if self.handle.abort_requested() {
                    session.notes.push(format!("aborted after {tier}"));
                    session.transition(SessionState::Aborted)
                } else {
                    self.enter_next_tier(session, Some(tier))
                }
            }
            SessionState::Succeeded
            | SessionState::Failed
            | SessionState::Aborted
            | SessionState::Previewed => Ok(()),
        };
        moved.map(|()| None)
    }

    fn preview(&mut self, session: &mut Session) -> Result<(), EngineError> {
        let bindings = self.engine.bindings(session, &self.facts);
        let fallback = self.engine.fallback_preview_for(session);
        let scheduled: Vec<RemediationStep> = session.plan.steps().cloned().collect();
        let ladder = scheduled
            .iter()
            .map(|s| (s, false))
            .chain(fallback.iter().flat_map(|t| t.steps.iter()).map(|s| (s, true)));
        let mut events = Vec::new();
        for (step, is_fallback) in ladder {
            let assessment = safety::assess_step(step, &session.target, &session.env);
            events.push(ExecutionEvent::Preview {
                tier: step.tier,
                step_id: step.id.clone(),
                command: step.command.preview(&bindings),
                risk: assessment.effective_risk,
                fallback: is_fallback,
            });
        }
        for event in events {
            session.record(event);
        }
        session.transition(SessionState::Previewed)
    }

    fn confirm(&mut self, session: &mut Session) -> Result<Option<Work>, EngineError> {
        if !self.approved || self.handle.abort_requested() {
            session.notes.push("execution was not approved".to_string());
            session.transition(SessionState::Aborted)?;
            return Ok(None);
        }
        if !session.env.elevated {
            session
                .notes
                .push("administrative rights are required; no command was run".to_string());
            session.transition(SessionState::Failed)?;
            return Ok(None);
        }
        if session.unresolved().is_empty() {
            session.transition(SessionState::Verifying(None))?;
            return Ok(None);
        }
        Ok(Some(Work::Confirm(self.engine.gate_for(session))))
    }

    fn ask(&self, decision: &GateDecision) -> bool {
        safety::request(
            decision,
            self.engine.caps().prompt.as_ref(),
            &self.engine.settings().repair.confirm_phrase,
        )
    }

    fn finish_confirm(
        &mut self,
        session: &mut Session,
        decision: &GateDecision,
        granted: bool,
    ) -> Result<(), EngineError> {
        session.record(ExecutionEvent::Confirmation {
            required: decision.required,
            granted,
        });
        if !granted {
            session.notes.push("confirmation declined".to_string());
            return session.transition(SessionState::Aborted);
        }
        if self.handle.abort_requested() {
            session.notes.push("aborted before the first tier".to_string());
            return session.transition(SessionState::Aborted);
        }
        self.enter_next_tier(session, None)
    }

    /// Picks the first tier above `after` with work to do, recording every tier passed over.
    fn enter_next_tier(
        &mut self,
        session: &mut Session,
        after: Option<Tier>,
    ) -> Result<(), EngineError> {
        let max = self.engine.settings().repair.max_tier;
        let mut candidate = match after {
            Some(tier) => tier.next(),
            None => Some(Tier::MIN),
        };
        while let Some(tier) = candidate.filter(|t| *t <= max) {
            match self.tier_steps(session, tier) {
                Ok(steps) => {
                    session.transition(SessionState::ExecutingTier(tier))?;
                    self.run = Some(TierRun {
                        tier,
                        steps,
                        next: 0,
                        ran: Vec::new(),
                        stopped: None,
                    });
                    return Ok(());
                }
                Err(skip) => self.skip_tier(session, tier, skip),
            }
            candidate = tier.next();
        }
        session.notes.push(format!(
            "no remaining tier up to {max} can address the unresolved findings"
        ));
        session.transition(SessionState::Failed)
    }

    fn skip_tier(&mut self, session: &mut Session, tier: Tier, reason: TierSkip) {
        session.record(ExecutionEvent::TierSkipped {
            tier,
            reason: reason.clone(),
        });
        session.tiers.push(TierRecord {
            tier,
            skipped: Some(reason),
            failure: None,
        });
    }

    fn tier_steps(&self, session: &Session, tier: Tier) -> Result<Vec<RemediationStep>, TierSkip> {
        let unresolved: Vec<&Finding> = session.unresolved();
        let steps: Vec<RemediationStep> = if tier <= Tier::SCHEDULED_MAX {
            session
                .plan
                .tier(tier)
                .map(|planned| {
                    planned
                        .steps
                        .iter()
                        .filter(|s| {
                            s.targets.is_empty()
                                || s.targets.iter().any(|id| !session.resolved.contains(id))
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        } else {
            self.engine
                .planner(&session.target, &session.env)
                .steps_for(tier, &unresolved, &self.facts)
        };

        if steps.is_empty() {
            let source_present = self.facts.boot_manager_source_present == Some(true)
                && unresolved
                    .iter()
                    .any(|f| f.category == FindingCategory::LoaderFileMissingInBootPartition);
            let detail = if source_present && tier.is_fallback() {
                "boot manager source already confirmed present".to_string()
            } else {
                "no remediation for the remaining findings at this tier".to_string()
            };
            return Err(TierSkip::NotApplicable { detail });
        }

        let has_media = self.engine.settings().repair.install_media.is_some();
        let (usable, unusable): (Vec<_>, Vec<_>) = steps
            .into_iter()
            .partition(|s| environment_allows(s.environment, session.env.kind, has_media));
        if usable.is_empty() {
            let detail = unusable
                .iter()
                .map(|s| format!("{} needs {}", s.id, requirement_label(s.environment)))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(TierSkip::EnvironmentMismatch { detail });
        }
        Ok(usable)
    }

    fn take_step(
        &mut self,
        session: &mut Session,
        tier: Tier,
    ) -> Result<Option<StepJob>, EngineError> {
        let Some(mut run) = self.run.take().filter(|r| r.tier == tier) else {
            session
                .notes
                .push(format!("{tier} was interrupted before it completed"));
            session.transition(SessionState::Escalating(tier))?;
            return Ok(None);
        };

        if run.stopped.is_some() || run.next >= run.steps.len() {
            self.run = Some(run);
            session.transition(SessionState::Verifying(Some(tier)))?;
            return Ok(None);
        }

        let step = run.steps[run.next].clone();
        run.next += 1;
        self.run = Some(run);
        Ok(Some(StepJob { tier, step }))
    }

    fn finish_step(&mut self, session: &mut Session, done: StepDone) -> Result<(), EngineError> {
        let StepDone {
            tier,
            events,
            ran,
            end,
        } = done;
        for event in events {
            session.record(event);
        }
        let Some(mut run) = self.run.take() else {
            return Ok(());
        };
        run.ran.extend(ran);
        match end {
            StepEnd::Continue => {}
            StepEnd::Stop(failure) => run.stopped = Some(failure),
            StepEnd::ToolMissing(program) if run.ran.is_empty() => {
                self.skip_tier(
                    session,
                    tier,
                    TierSkip::EnvironmentMismatch {
                        detail: format!("{program} is not available in this environment"),
                    },
                );
                return session.transition(SessionState::Escalating(tier));
            }
            StepEnd::ToolMissing(program) => {
                run.stopped = Some(TierFailure::CommandError {
                    detail: format!("{program} is not available in this environment"),
                });
            }
        }
        self.run = Some(run);
        Ok(())
    }

    /// Runs without the session mutex; everything it learns comes back in `StepDone`.
    fn execute_step(&mut self, job: StepJob) -> StepDone {
        let StepJob { tier, step } = job;
        let mut events = Vec::new();
        let bindings = self.refresh_bindings();

        if step.precondition == Some(Precondition::PartitionAlreadyMounted)
            && self.facts.partition_letter().is_some()
        {
            events.push(ExecutionEvent::StepSkipped {
                tier,
                step_id: step.id.clone(),
                reason: "boot partition already has a drive letter".to_string(),
            });
            return StepDone {
                tier,
                events,
                ran: None,
                end: StepEnd::Continue,
            };
        }

        if step.needs_backup() {
            match self.run_backup(tier, &step, &bindings) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(end) => {
                    return StepDone {
                        tier,
                        events,
                        ran: None,
                        end,
                    };
                }
            }
        }

        let command = match step.command.resolve(&bindings) {
            Ok(command) => command,
            Err(err) => {
                let end = StepEnd::Stop(TierFailure::CommandError {
                    detail: format!("{}: {err}", step.id),
                });
                return StepDone {
                    tier,
                    events,
                    ran: None,
                    end,
                };
            }
        };
        let cmdline = command.cmdline();
        let timeout = self.engine.settings().command_timeout;
        let result = self.engine.caps().runner.execute(&command, timeout);

        let (exit_code, output, error) = match result {
            Ok(out) => (Some(out.exit_code), out.combined(), None),
            Err(CommandRunError::ToolUnavailable { program }) => {
                events.push(ExecutionEvent::CommandFinished {
                    tier,
                    step_id: step.id.clone(),
                    command: cmdline,
                    exit_code: None,
                    error: Some(format!("{program} not found")),
                });
                return StepDone {
                    tier,
                    events,
                    ran: None,
                    end: StepEnd::ToolMissing(program),
                };
            }
            Err(err) => (None, String::new(), Some(err.to_string())),
        };
        events.push(ExecutionEvent::CommandFinished {
            tier,
            step_id: step.id.clone(),
            command: cmdline.clone(),
            exit_code,
            error: error.clone(),
        });

        let success = exit_code.is_some_and(|code| step.command.is_success(code));
        let detail = match (exit_code, &error) {
            (_, Some(err)) => err.clone(),
            (Some(code), None) => format!("{cmdline} exited with {code}"),
            (None, None) => format!("{cmdline} did not finish"),
        };
        let ran = StepRun {
            step,
            command: cmdline,
            exit_code,
            success,
            output: truncate_output(error.as_deref().unwrap_or(&output), MAX_CMD_OUTPUT_BYTES),
        };
        let end = if success {
            StepEnd::Continue
        } else {
            StepEnd::Stop(TierFailure::CommandError { detail })
        };
        StepDone {
            tier,
            events,
            ran: Some(ran),
            end,
        }
    }

    /// The backup must exit cleanly and leave its artifact behind before the step may run.
    fn run_backup(
        &self,
        tier: Tier,
        step: &RemediationStep,
        bindings: &Bindings,
    ) -> Result<Option<ExecutionEvent>, StepEnd> {
        let Some(backup) = &step.backup else {
            return Ok(None);
        };
        let failed = |detail: String| StepEnd::Stop(TierFailure::BackupFailed { detail });

        let command = backup
            .command
            .resolve(bindings)
            .map_err(|err| failed(err.to_string()))?;
        let artifact = bindings
            .render(&backup.artifact)
            .map_err(|err| failed(err.to_string()))?;
        let out = self
            .engine
            .caps()
            .runner
            .execute(&command, self.engine.settings().command_timeout)
            .map_err(|err| failed(err.to_string()))?;
        if !backup.command.is_success(out.exit_code) {
            return Err(failed(format!(
                "{} exited with {}",
                command.cmdline(),
                out.exit_code
            )));
        }
        match self.engine.caps().files.exists(&artifact) {
            Ok(true) => {}
            Ok(false) => return Err(failed(format!("{artifact} was not created"))),
            Err(err) => return Err(failed(err.to_string())),
        }
        Ok(Some(ExecutionEvent::BackupCompleted {
            tier,
            step_id: step.id.clone(),
            artifact,
        }))
    }

    fn refresh_bindings(&mut self) -> Bindings {
        let found = {
            let ctx = self.engine.probe_context(&self.target, &self.env);
            probes::discover_partition(&ctx)
        };
        if let Ok(Some(partition)) = found {
            self.facts.boot_partition = Some(partition);
        }
        self.engine
            .bindings_for(&self.target, &self.env, &self.session_id, &self.facts)
    }

    fn verify_tier(&mut self, session: &mut Session, tier: Tier) -> Result<(), EngineError> {
        let run = self.run.take().filter(|r| r.tier == tier);
        let (ran, stopped) = match run {
            Some(run) => (run.ran, run.stopped),
            None => (Vec::new(), None),
        };

        let targeted: BTreeSet<&str> = ran
            .iter()
            .flat_map(|r| r.step.targets.iter().map(String::as_str))
            .collect();
        let mut targets: Vec<Finding> = session
            .unresolved()
            .into_iter()
            .filter(|f| targeted.contains(f.id.as_str()))
            .cloned()
            .collect();
        if targets.is_empty() {
            targets = session.unresolved().into_iter().cloned().collect();
        }
        let refs: Vec<&Finding> = targets.iter().collect();
        let verification = {
            let ctx = self.engine.probe_context(&session.target, &session.env);
            verify::verify(&ctx, &refs)
        };
        self.merge_facts(verification.facts());

        for verdict in &verification.verdicts {
            session.record(ExecutionEvent::Verification {
                tier: Some(tier),
                finding_id: verdict.finding_id.clone(),
                resolved: verdict.resolved,
                detail: verdict.detail.clone(),
            });
            if verdict.resolved {
                session.resolved.insert(verdict.finding_id.clone());
            }
        }

        let mut mismatch: Vec<String> = Vec::new();
        for r in ran {
            let still: Vec<String> = r
                .step
                .targets
                .iter()
                .filter(|id| !session.resolved.contains(*id))
                .cloned()
                .collect();
            let verified = still.is_empty();
            let (outcome, failure) = match (r.success, verified) {
                (true, true) => (StepOutcome::Success, None),
                (true, false) => {
                    for id in &still {
                        if !mismatch.contains(id) {
                            mismatch.push(id.clone());
                        }
                    }
                    (
                        StepOutcome::Failed,
                        Some(TierFailure::VerificationMismatch { finding_ids: still }),
                    )
                }
                (false, true) => (StepOutcome::Inconclusive, None),
                (false, false) => (
                    StepOutcome::Failed,
                    Some(TierFailure::CommandError {
                        detail: format!("{} failed", r.command),
                    }),
                ),
            };
            session.record(ExecutionEvent::Result(ExecutionResult {
                step_id: r.step.id,
                tier,
                command: r.command,
                exit_code: r.exit_code,
                raw_output: r.output,
                verified,
                outcome,
                failure,
            }));
        }

        let failure = stopped.or_else(|| {
            (!mismatch.is_empty()).then_some(TierFailure::VerificationMismatch {
                finding_ids: mismatch,
            })
        });
        if let Some(failure) = &failure {
            session.record(ExecutionEvent::TierFailed {
                tier,
                failure: failure.clone(),
            });
        }
        session.tiers.push(TierRecord {
            tier,
            skipped: None,
            failure,
        });

        if session.unresolved().is_empty() {
            session.transition(SessionState::Succeeded)
        } else {
            session.transition(SessionState::Escalating(tier))
        }
    }

    /// Nothing was actionable at confirmation time; re-scan before declaring success.
    fn verify_all(&mut self, session: &mut Session) -> Result<(), EngineError> {
        let rescan = {
            let ctx = self.engine.probe_context(&session.target, &session.env);
            scan::scan(&ctx)
        };
        session.record_probe_errors(&rescan.probe_errors);
        let remaining: Vec<Finding> = rescan.actionable().cloned().collect();
        for finding in &remaining {
            session.record(ExecutionEvent::Verification {
                tier: None,
                finding_id: finding.id.clone(),
                resolved: false,
                detail: finding.title.clone(),
            });
        }
        if remaining.is_empty() {
            session.transition(SessionState::Succeeded)
        } else {
            session.scan.findings.extend(remaining);
            session.transition(SessionState::Failed)
        }
    }

    fn merge_facts(&mut self, fresh: &ScanFacts) {
        if fresh.boot_partition.is_some() {
            self.facts.boot_partition.clone_from(&fresh.boot_partition);
        }
        if fresh.boot_store.is_some() {
            self.facts.boot_store.clone_from(&fresh.boot_store);
        }
        if fresh.boot_manager_source_present.is_some() {
            self.facts.boot_manager_source_present = fresh.boot_manager_source_present;
        }
    }
}

impl Iterator for Execution {
    type Item = ExecutionEvent;

    fn next(&mut self) -> Option<ExecutionEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.finished {
                return None;
            }
            let handle = self.handle.clone();
            let mut session = handle.lock();
            let work = match self.advance(&mut session) {
                Ok(work) => work,
                Err(err) => {
                    internal_error(&mut session, &err);
                    None
                }
            };
            if let Some(work) = work {
                drop(session);
                let finished = match work {
                    Work::Confirm(decision) => {
                        let granted = self.ask(&decision);
                        session = handle.lock();
                        self.finish_confirm(&mut session, &decision, granted)
                    }
                    Work::Step(job) => {
                        let done = self.execute_step(job);
                        session = handle.lock();
                        self.finish_step(&mut session, done)
                    }
                };
                if let Err(err) = finished {
                    internal_error(&mut session, &err);
                }
            }
            if session.state.is_terminal() {
                self.finished = true;
                handle.cell.driving.store(false, Ordering::SeqCst);
            }
            self.pending.extend(session.log[self.cursor..].iter().cloned());
            self.cursor = session.log.len();
        }
    }
}

/// A dropped execution can never reach the next tier boundary, so the session ends here.
impl Drop for Execution {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut session = self.handle.lock();
        if !session.state.is_terminal() {
            let note = format!("execution stopped while {}", session.state);
            session.notes.push(note);
            let _ = session.transition(SessionState::Aborted);
        }
        self.handle.cell.driving.store(false, Ordering::SeqCst);
    }
}

fn internal_error(session: &mut Session, err: &EngineError) {
    session.notes.push(format!("internal error: {err}"));
    let _ = session.transition(SessionState::Aborted);
}

fn environment_allows(req: EnvRequirement, kind: EnvironmentKind, has_media: bool) -> bool {
    match req {
        EnvRequirement::Any => true,
        EnvRequirement::LiveOnly => kind == EnvironmentKind::LiveRunningOs,
        EnvRequirement::RecoveryOnly => kind == EnvironmentKind::PreBootRecovery,
        EnvRequirement::InstallMedia => has_media,
    }
}

fn requirement_label(req: EnvRequirement) -> &'static str {
    match req {
        EnvRequirement::Any => "nothing",
        EnvRequirement::LiveOnly => "a running system",
        EnvRequirement::RecoveryOnly => "the recovery environment",
        EnvRequirement::InstallMedia => Placeholder::Media.name(),
    }
}
