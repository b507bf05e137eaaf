//! In-memory capabilities for previews, embedding and tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::core::{Environment, EnvironmentKind, Firmware, ResolvedCommand, RiskLevel};
use crate::platform::{
    CommandOutput, CommandRunError, CommandRunner, EnvironmentInfo, FileProbe, FileProbeError,
    UserPrompt,
};

fn key(path: &str) -> String {
    path.trim_end_matches('\\').to_ascii_lowercase()
}

#[derive(Debug, Default)]
struct FileTable {
    files: BTreeMap<String, Vec<u8>>,
    denied: BTreeSet<String>,
}

/// Case-insensitive file table keyed by `\`-separated paths. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryFiles {
    inner: Arc<Mutex<FileTable>>,
}

impl MemoryFiles {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut FileTable) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn put(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        let bytes = bytes.into();
        self.with(|t| t.files.insert(key(path), bytes));
    }

    pub fn remove(&self, path: &str) -> bool {
        self.with(|t| t.files.remove(&key(path)).is_some())
    }

    pub fn remove_tree(&self, prefix: &str) -> usize {
        let prefix = key(prefix);
        self.with(|t| {
            let before = t.files.len();
            t.files
                .retain(|k, _| !(k == &prefix || k.starts_with(&format!("{prefix}\\"))));
            before - t.files.len()
        })
    }

    pub fn rename(&self, from: &str, to: &str) -> bool {
        self.with(|t| match t.files.remove(&key(from)) {
            Some(bytes) => {
                t.files.insert(key(to), bytes);
                true
            }
            None => false,
        })
    }

    pub fn copy_tree(&self, from: &str, to: &str) -> usize {
        let from = key(from);
        let to = key(to);
        self.with(|t| {
            let copied: Vec<(String, Vec<u8>)> = t
                .files
                .iter()
                .filter_map(|(k, v)| {
                    k.strip_prefix(&format!("{from}\\"))
                        .map(|rest| (format!("{to}\\{rest}"), v.clone()))
                })
                .collect();
            let n = copied.len();
            t.files.extend(copied);
            n
        })
    }

    pub fn deny(&self, prefix: &str) {
        self.with(|t| t.denied.insert(key(prefix)));
    }

    pub fn allow(&self, prefix: &str) {
        self.with(|t| t.denied.remove(&key(prefix)));
    }

    pub fn paths(&self) -> Vec<String> {
        self.with(|t| t.files.keys().cloned().collect())
    }

    fn check(&self, path: &str) -> Result<String, FileProbeError> {
        let k = key(path);
        let denied = self.with(|t| {
            t.denied
                .iter()
                .any(|d| &k == d || k.starts_with(&format!("{d}\\")))
        });
        if denied {
            return Err(FileProbeError::AccessDenied {
                path: path.to_string(),
            });
        }
        Ok(k)
    }
}

impl FileProbe for MemoryFiles {
    fn exists(&self, path: &str) -> Result<bool, FileProbeError> {
        let k = self.check(path)?;
        let dir = format!("{k}\\");
        Ok(self.with(|t| {
            t.files.contains_key(&k) || t.files.keys().any(|p| p.starts_with(&dir))
        }))
    }

    fn size(&self, path: &str) -> Result<Option<u64>, FileProbeError> {
        let k = self.check(path)?;
        Ok(self.with(|t| t.files.get(&k).map(|b| b.len() as u64)))
    }

    fn read_text(&self, path: &str, limit: usize) -> Result<String, FileProbeError> {
        let k = self.check(path)?;
        self.with(|t| match t.files.get(&k) {
            Some(bytes) => Ok(String::from_utf8_lossy(&bytes[..bytes.len().min(limit)])
                .into_owned()),
            None => Err(FileProbeError::Io {
                path: path.to_string(),
                detail: "not found".to_string(),
            }),
        })
    }
}

type Handler =
    Box<dyn Fn(&ResolvedCommand) -> Option<Result<CommandOutput, CommandRunError>> + Send + Sync>;

/// Answers commands from registered handlers, first match wins.
/// Unmatched programs are reported as unavailable.
#[derive(Default)]
pub struct ScriptedRunner {
    handlers: Vec<Handler>,
    calls: Mutex<Vec<ResolvedCommand>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond<F>(mut self, f: F) -> Self
    where
        F: Fn(&ResolvedCommand) -> Option<Result<CommandOutput, CommandRunError>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.push(Box::new(f));
        self
    }

    pub fn calls(&self) -> Vec<ResolvedCommand> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn execute(
        &self,
        command: &ResolvedCommand,
        _timeout: Duration,
    ) -> Result<CommandOutput, CommandRunError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.clone());
        for handler in &self.handlers {
            if let Some(result) = handler(command) {
                return result;
            }
        }
        Err(CommandRunError::ToolUnavailable {
            program: command.program.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct StaticEnvironment(pub Environment);

impl StaticEnvironment {
    pub fn recovery(firmware: Firmware) -> Self {
        Self(Environment {
            kind: EnvironmentKind::PreBootRecovery,
            elevated: true,
            system_drive: Some("X:".to_string()),
            firmware,
        })
    }

    pub fn live(system_drive: &str, firmware: Firmware) -> Self {
        Self(Environment {
            kind: EnvironmentKind::LiveRunningOs,
            elevated: true,
            system_drive: Some(system_drive.to_string()),
            firmware,
        })
    }

    pub fn unelevated(mut self) -> Self {
        self.0.elevated = false;
        self
    }
}

impl EnvironmentInfo for StaticEnvironment {
    fn kind(&self) -> EnvironmentKind {
        self.0.kind
    }

    fn has_elevated_rights(&self) -> bool {
        self.0.elevated
    }

    fn system_drive(&self) -> Option<String> {
        self.0.system_drive.clone()
    }

    fn firmware(&self) -> Firmware {
        self.0.firmware
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptRecord {
    Confirm(RiskLevel),
    Phrase(String),
}

/// Answers every prompt the same way and records what was asked.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    approve: bool,
    typed: Option<String>,
    asked: Mutex<Vec<PromptRecord>>,
}

impl ScriptedPrompt {
    pub fn approving() -> Self {
        Self {
            approve: true,
            ..Self::default()
        }
    }

    pub fn declining() -> Self {
        Self::default()
    }

    /// Approves plain confirmations and types `typed` when a phrase is demanded.
    pub fn typing(typed: &str) -> Self {
        Self {
            approve: true,
            typed: Some(typed.to_string()),
            ..Self::default()
        }
    }

    pub fn asked(&self) -> Vec<PromptRecord> {
        self.asked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl UserPrompt for ScriptedPrompt {
    fn confirm(&self, risk: RiskLevel, _message: &str) -> bool {
        self.asked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PromptRecord::Confirm(risk));
        self.approve
    }

    fn confirm_with_phrase(&self, phrase: &str, _message: &str) -> bool {
        self.asked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PromptRecord::Phrase(phrase.to_string()));
        self.typed.as_deref() == Some(phrase)
    }
}
