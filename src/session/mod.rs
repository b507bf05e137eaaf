use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use time::OffsetDateTime;

use crate::catalog;
use crate::core::{
    Bindings, Environment, ExecutionEvent, ExecutionResult, Finding, FindingCategory, RepairPlan,
    SessionMode, SessionReport, SessionState, TargetVolume, Tier, TierFailure, TierRecord,
};
use crate::engine::EngineError;
use crate::logs::Logger;
use crate::probes::ProbeError;
use crate::scan::ScanOutcome;

mod lock;

pub use lock::{LockManager, VolumeLock};

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn new_session_id() -> String {
    let n = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}-{}-{n}",
        OffsetDateTime::now_utc().unix_timestamp(),
        std::process::id()
    )
}

pub struct Session {
    pub id: String,
    pub target: TargetVolume,
    pub mode: SessionMode,
    pub env: Environment,
    pub state: SessionState,
    pub scan: ScanOutcome,
    pub plan: RepairPlan,
    pub log: Vec<ExecutionEvent>,
    pub tiers: Vec<TierRecord>,
    pub resolved: BTreeSet<String>,
    pub notes: Vec<String>,
    lock: Option<VolumeLock>,
    logger: Arc<dyn Logger>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        target: TargetVolume,
        mode: SessionMode,
        env: Environment,
        lock: VolumeLock,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            id,
            plan: RepairPlan::empty(target.clone()),
            target,
            mode,
            env,
            state: SessionState::Idle,
            scan: ScanOutcome::default(),
            log: Vec::new(),
            tiers: Vec::new(),
            resolved: BTreeSet::new(),
            notes: Vec::new(),
            lock: Some(lock),
            logger,
        }
    }

    /// Appends to the session log and forwards to the logger. Entries are never rewritten.
    pub(crate) fn record(&mut self, event: ExecutionEvent) {
        self.logger.append(&self.id, &self.target.drive, &event);
        self.log.push(event);
    }

    pub(crate) fn transition(&mut self, to: SessionState) -> Result<(), EngineError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { from, to });
        }
        self.state = to;
        self.record(ExecutionEvent::Transition { from, to });
        if to.is_terminal() {
            self.lock.take();
        }
        Ok(())
    }

    pub(crate) fn record_probe_errors(&mut self, errors: &[ProbeError]) {
        for err in errors {
            self.record(ExecutionEvent::ProbeInconclusive {
                probe: err.probe().as_str().to_string(),
                detail: err.to_string(),
            });
        }
    }

    pub fn holds_lock(&self) -> bool {
        self.lock.is_some()
    }

    pub fn results(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.log.iter().filter_map(|e| match e {
            ExecutionEvent::Result(r) => Some(r),
            _ => None,
        })
    }

    pub fn tiers_entered(&self) -> Vec<Tier> {
        self.log
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::Transition {
                    to: SessionState::ExecutingTier(t),
                    ..
                } => Some(*t),
                _ => None,
            })
            .collect()
    }

    pub fn unresolved(&self) -> Vec<&Finding> {
        self.scan
            .actionable()
            .filter(|f| !self.resolved.contains(&f.id))
            .collect()
    }

    fn hypothesis(&self, remaining: &[Finding]) -> Option<String> {
        if self.state != SessionState::Failed {
            return None;
        }
        let mismatch = self.tiers.iter().any(|t| {
            matches!(t.failure, Some(TierFailure::VerificationMismatch { .. }))
        });
        if let Some(first) = remaining.first() {
            let blocking = first.category.is_blocking();
            return Some(catalog::hypothesis(first.category, mismatch && !blocking).to_string());
        }
        if !self.env.elevated {
            return Some(catalog::hypothesis(FindingCategory::PermissionDenied, false).to_string());
        }
        Some(
            "Verification found the system in a different state than the scan reported; re-run the scan before retrying."
                .to_string(),
        )
    }

    pub fn report(&self, bindings: &Bindings, generated_at: String) -> SessionReport {
        let remaining: Vec<Finding> = match self.state {
            SessionState::Succeeded => Vec::new(),
            _ => self.unresolved().into_iter().cloned().collect(),
        };

        let mut manual_commands: Vec<String> = Vec::new();
        let mut seen = BTreeSet::new();
        for finding in &remaining {
            if !seen.insert(finding.category) {
                continue;
            }
            for cmd in catalog::manual_commands(finding.category) {
                let line = bindings.render_lossy(cmd);
                if !manual_commands.contains(&line) {
                    manual_commands.push(line);
                }
            }
        }

        let false_positives = self
            .results()
            .filter(|r| matches!(r.failure, Some(TierFailure::VerificationMismatch { .. })))
            .map(|r| r.step_id.clone())
            .collect();

        SessionReport {
            schema_version: "1.0".to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            session_id: self.id.clone(),
            generated_at,
            target: self.target.clone(),
            mode: self.mode,
            environment: self.env.clone(),
            state: self.state,
            findings: self.scan.findings.clone(),
            probe_errors: self.scan.probe_errors.iter().map(ProbeError::record).collect(),
            tiers: self.tiers.clone(),
            steps_applied: self.results().cloned().collect(),
            resolved: self.resolved.iter().cloned().collect(),
            root_cause_hypothesis: self.hypothesis(&remaining),
            remaining_issues: remaining,
            false_positives,
            manual_commands,
            notes: self.notes.clone(),
        }
    }
}

pub(crate) struct SessionCell {
    pub(crate) session: Mutex<Session>,
    pub(crate) abort: AtomicBool,
    /// Set while an `Execution` owns the session; cleared under the session mutex.
    pub(crate) driving: AtomicBool,
}

/// Cheap to clone; all clones refer to the same session.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    target: TargetVolume,
    pub(crate) cell: Arc<SessionCell>,
}

impl SessionHandle {
    pub(crate) fn new(session: Session) -> Self {
        Self {
            id: session.id.clone(),
            target: session.target.clone(),
            cell: Arc::new(SessionCell {
                session: Mutex::new(session),
                abort: AtomicBool::new(false),
                driving: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &TargetVolume {
        &self.target
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Session> {
        self.cell
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn holds_lock(&self) -> bool {
        self.lock().holds_lock()
    }

    pub fn log(&self) -> Vec<ExecutionEvent> {
        self.lock().log.clone()
    }

    pub fn tiers_entered(&self) -> Vec<Tier> {
        self.lock().tiers_entered()
    }

    pub fn abort_requested(&self) -> bool {
        self.cell.abort.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("target", &self.target.drive)
            .finish_non_exhaustive()
    }
}
