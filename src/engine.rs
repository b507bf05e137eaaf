use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::catalog;
use crate::core::{
    Bindings, Environment, Placeholder, PlannedTier, RepairPlan, SessionMode, SessionReport,
    SessionState, TargetVolume, Tier, win_join,
};
use crate::executor::Execution;
use crate::logs::Logger;
use crate::plan::Planner;
use crate::platform::{
    CommandRunner, EnvironmentInfo, FileProbe, HostEnvironment, LocalFileProbe,
    SystemCommandRunner, UserPrompt,
};
use crate::probes::{ProbeContext, ProbeSettings, ScanFacts};
use crate::safety::{self, GateDecision};
use crate::scan::{self, ScanOutcome};
use crate::session::{LockManager, Session, SessionHandle, new_session_id};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("a repair session is already in progress for {volume}")]
    SessionInProgress { volume: String },
    #[error("not a drive letter: {input:?}")]
    InvalidTarget { input: String },
    #[error("lock file {}: {detail}", path.display())]
    LockFile { path: PathBuf, detail: String },
    #[error("session already finished ({state})")]
    SessionFinished { state: SessionState },
    #[error("session is already being executed")]
    AlreadyExecuting,
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

#[derive(Debug, Clone)]
pub struct RepairSettings {
    pub max_tier: Tier,
    pub prefer_reversible: bool,
    pub confirm_phrase: String,
    pub backup_dir: String,
    pub install_media: Option<String>,
}

impl Default for RepairSettings {
    fn default() -> Self {
        Self {
            max_tier: Tier::MAX,
            prefer_reversible: true,
            confirm_phrase: "WIPE BOOT PARTITION".to_string(),
            backup_dir: "bootmend-backups".to_string(),
            install_media: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub repair: RepairSettings,
    pub probe: ProbeSettings,
    pub command_timeout: Duration,
    pub mount_letter: String,
    pub lock_dir: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            repair: RepairSettings::default(),
            probe: ProbeSettings::default(),
            command_timeout: Duration::from_secs(120),
            mount_letter: "S:".to_string(),
            lock_dir: None,
        }
    }
}

/// Everything the engine talks to outside itself.
#[derive(Clone)]
pub struct Capabilities {
    pub runner: Arc<dyn CommandRunner>,
    pub files: Arc<dyn FileProbe>,
    pub env_info: Arc<dyn EnvironmentInfo>,
    pub prompt: Arc<dyn UserPrompt>,
    pub logger: Arc<dyn Logger>,
}

impl Capabilities {
    pub fn host(
        env_info: HostEnvironment,
        prompt: Arc<dyn UserPrompt>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            runner: Arc::new(SystemCommandRunner),
            files: Arc::new(LocalFileProbe),
            env_info: Arc::new(env_info),
            prompt,
            logger,
        }
    }
}

struct EngineInner {
    settings: EngineSettings,
    caps: Capabilities,
    locks: LockManager,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(settings: EngineSettings, caps: Capabilities) -> Self {
        let locks = LockManager::new(settings.lock_dir.clone());
        Self {
            inner: Arc::new(EngineInner {
                settings,
                caps,
                locks,
            }),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub(crate) fn caps(&self) -> &Capabilities {
        &self.inner.caps
    }

    pub fn capture_environment(&self) -> Environment {
        self.inner.caps.env_info.capture()
    }

    pub(crate) fn probe_context<'a>(
        &'a self,
        target: &'a TargetVolume,
        env: &'a Environment,
    ) -> ProbeContext<'a> {
        ProbeContext {
            target,
            env,
            files: self.inner.caps.files.as_ref(),
            runner: self.inner.caps.runner.as_ref(),
            settings: &self.inner.settings.probe,
        }
    }

    pub(crate) fn planner<'a>(&self, target: &'a TargetVolume, env: &Environment) -> Planner<'a> {
        let repair = &self.inner.settings.repair;
        Planner::new(target, env, repair.max_tier, repair.prefer_reversible)
    }

    /// Read-only scan; takes no lock and starts no session.
    pub fn scan(&self, target: &TargetVolume) -> (Environment, ScanOutcome) {
        let env = self.capture_environment();
        let outcome = scan::scan(&self.probe_context(target, &env));
        (env, outcome)
    }

    pub fn start_session(
        &self,
        target: TargetVolume,
        mode: SessionMode,
    ) -> Result<SessionHandle, EngineError> {
        let lock = self.inner.locks.try_acquire(&target)?;
        let env = self.capture_environment();
        let mut session = Session::new(
            new_session_id(),
            target,
            mode,
            env,
            lock,
            Arc::clone(&self.inner.caps.logger),
        );
        session.transition(SessionState::Planning)?;

        let outcome = scan::scan(&self.probe_context(&session.target, &session.env));
        session.record_probe_errors(&outcome.probe_errors);
        session.plan = self.planner(&session.target, &session.env).plan(&outcome);
        session.scan = outcome;

        if mode == SessionMode::Apply {
            session.transition(SessionState::AwaitingConfirmation)?;
        }
        Ok(SessionHandle::new(session))
    }

    pub fn plan(&self, handle: &SessionHandle) -> RepairPlan {
        handle.lock().plan.clone()
    }

    pub fn scan_outcome(&self, handle: &SessionHandle) -> ScanOutcome {
        handle.lock().scan.clone()
    }

    /// Fallback tiers the executor could escalate into, computed from the initial scan.
    pub fn fallback_preview(&self, handle: &SessionHandle) -> Vec<PlannedTier> {
        let session = handle.lock();
        self.fallback_preview_for(&session)
    }

    pub(crate) fn fallback_preview_for(&self, session: &Session) -> Vec<PlannedTier> {
        self.planner(&session.target, &session.env)
            .fallback_preview(&session.scan)
    }

    /// What the safety gate will ask for, over every tier the session could reach.
    pub fn gate(&self, handle: &SessionHandle) -> GateDecision {
        let session = handle.lock();
        self.gate_for(&session)
    }

    pub(crate) fn gate_for(&self, session: &Session) -> GateDecision {
        let preview = self.fallback_preview_for(session);
        let ladder = session
            .plan
            .steps()
            .chain(preview.iter().flat_map(|t| t.steps.iter()));
        safety::assess(ladder, &session.target, &session.env)
    }

    pub fn execute(
        &self,
        handle: &SessionHandle,
        approved: bool,
    ) -> Result<Execution, EngineError> {
        let session = handle.lock();
        if session.state.is_terminal() {
            return Err(EngineError::SessionFinished {
                state: session.state,
            });
        }
        if handle.cell.driving.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyExecuting);
        }
        Ok(Execution::new(
            self.clone(),
            handle.clone(),
            approved,
            &session,
        ))
    }

    /// Takes effect at the next tier boundary if the session is being executed,
    /// immediately otherwise. Never waits on a running command.
    pub fn abort(&self, handle: &SessionHandle) {
        handle.cell.abort.store(true, Ordering::SeqCst);
        let mut session = handle.lock();
        if !handle.cell.driving.load(Ordering::SeqCst) && !session.state.is_terminal() {
            let _ = session.transition(SessionState::Aborted);
        }
    }

    pub fn report(&self, handle: &SessionHandle) -> SessionReport {
        let session = handle.lock();
        let bindings = self.bindings(&session, &session.scan.facts);
        let generated_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string());
        session.report(&bindings, generated_at)
    }

    /// Values for command placeholders; `{esp}` and `{store}` only once a boot partition is known.
    pub(crate) fn bindings(&self, session: &Session, facts: &ScanFacts) -> Bindings {
        self.bindings_for(&session.target, &session.env, &session.id, facts)
    }

    pub(crate) fn bindings_for(
        &self,
        target: &TargetVolume,
        env: &Environment,
        session_id: &str,
        facts: &ScanFacts,
    ) -> Bindings {
        let settings = &self.inner.settings;
        let mut bindings = Bindings::default()
            .with(Placeholder::Target, target.drive.as_str())
            .with(Placeholder::TargetLetter, target.letter())
            .with(Placeholder::Windows, target.windows_dir())
            .with(Placeholder::MountLetter, settings.mount_letter.as_str())
            .with(Placeholder::Firmware, env.firmware.bcdboot_arg())
            .with(
                Placeholder::Backup,
                win_join(&settings.repair.backup_dir, session_id),
            );
        if let Some(media) = &settings.repair.install_media {
            bindings.set(Placeholder::Media, media.trim_end_matches('\\'));
        }
        let esp = facts.boot_partition.as_ref().and_then(|p| {
            p.drive
                .clone()
                .or_else(|| p.volume_path.as_deref().map(|v| v.trim_end_matches('\\').to_string()))
        });
        if let Some(esp) = esp {
            bindings.set(Placeholder::Store, win_join(&esp, catalog::STORE));
            bindings.set(Placeholder::Esp, esp);
        }
        bindings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Firmware, SessionMode};
    use crate::logs::MemoryLog;
    use crate::platform::memory::{MemoryFiles, ScriptedPrompt, ScriptedRunner, StaticEnvironment};
    use crate::platform::{CommandOutput, CommandRunError};

    fn engine(runner: ScriptedRunner) -> Engine {
        let caps = Capabilities {
            runner: Arc::new(runner),
            files: Arc::new(MemoryFiles::new()),
            env_info: Arc::new(StaticEnvironment::recovery(Firmware::Uefi)),
            prompt: Arc::new(ScriptedPrompt::declining()),
            logger: Arc::new(MemoryLog::new()),
        };
        Engine::new(EngineSettings::default(), caps)
    }

    fn quiet_runner() -> ScriptedRunner {
        ScriptedRunner::new().respond(|cmd| match cmd.program.as_str() {
            "manage-bde" => Some(Ok(CommandOutput::ok("Protection Status: Protection Off"))),
            "powershell" => Some(Ok(CommandOutput::ok(""))),
            _ => Some(Err(CommandRunError::ToolUnavailable {
                program: cmd.program.clone(),
            })),
        })
    }

    #[test]
    fn second_session_for_same_volume_is_rejected() {
        let engine = engine(quiet_runner());
        let target = TargetVolume::new("C:").unwrap();
        let first = engine
            .start_session(target.clone(), SessionMode::Apply)
            .unwrap();
        let second = engine.start_session(target, SessionMode::DryRun);
        assert_eq!(
            second.unwrap_err(),
            EngineError::SessionInProgress {
                volume: "C:".to_string()
            }
        );
        assert_eq!(first.state(), SessionState::AwaitingConfirmation);
        assert!(first.holds_lock());
    }

    #[test]
    fn abort_waits_for_a_reader_and_still_ends_the_session() {
        let engine = engine(quiet_runner());
        let target = TargetVolume::new("E:").unwrap();
        let handle = engine
            .start_session(target.clone(), SessionMode::Apply)
            .unwrap();
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        std::thread::scope(|s| {
            let reader = handle.clone();
            s.spawn(move || {
                let session = reader.lock();
                held_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(100));
                drop(session);
            });
            held_rx.recv().unwrap();
            engine.abort(&handle);
        });
        assert_eq!(handle.state(), SessionState::Aborted);
        assert!(!handle.holds_lock());
        assert!(engine.start_session(target, SessionMode::Apply).is_ok());
    }

    #[test]
    fn abort_before_execute_releases_the_lock() {
        let engine = engine(quiet_runner());
        let target = TargetVolume::new("D:").unwrap();
        let handle = engine
            .start_session(target.clone(), SessionMode::Apply)
            .unwrap();
        engine.abort(&handle);
        assert_eq!(handle.state(), SessionState::Aborted);
        assert!(!handle.holds_lock());
        assert!(engine.start_session(target, SessionMode::Apply).is_ok());
        assert!(matches!(
            engine.execute(&handle, true),
            Err(EngineError::SessionFinished { .. })
        ));
    }

    #[test]
    fn bindings_prefer_drive_letter_and_fall_back_to_volume_path() {
        let engine = engine(quiet_runner());
        let handle = engine
            .start_session(TargetVolume::new("C:").unwrap(), SessionMode::DryRun)
            .unwrap();
        let session = handle.lock();
        let mut facts = ScanFacts::default();
        let bare = engine.bindings(&session, &facts);
        assert_eq!(bare.get(Placeholder::Windows), Some("C:\\Windows"));
        assert_eq!(bare.get(Placeholder::Firmware), Some("UEFI"));
        assert_eq!(bare.get(Placeholder::Esp), None);

        facts.boot_partition = Some(crate::core::BootPartition {
            drive: None,
            volume_path: Some("\\\\?\\Volume{42}\\".to_string()),
            file_system: Some("FAT32".to_string()),
            mount: crate::core::MountState::Unmounted,
        });
        let by_path = engine.bindings(&session, &facts);
        assert_eq!(by_path.get(Placeholder::Esp), Some("\\\\?\\Volume{42}"));
        assert_eq!(
            by_path.get(Placeholder::Store),
            Some("\\\\?\\Volume{42}\\EFI\\Microsoft\\Boot\\BCD")
        );
    }
}
