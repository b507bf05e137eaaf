use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Result, anyhow};
use thiserror::Error;
use wait_timeout::ChildExt;

use crate::core::{Environment, EnvironmentKind, Firmware, ResolvedCommand, RiskLevel};

mod host;
pub mod memory;

pub use host::{HostEnvironment, LocalFileProbe, SystemCommandRunner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (true, true) => String::new(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandRunError {
    #[error("{program} is not available in this environment")]
    ToolUnavailable { program: String },
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("{program} could not be run: {detail}")]
    Io { program: String, detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileProbeError {
    #[error("access denied: {path}")]
    AccessDenied { path: String },
    #[error("{path}: {detail}")]
    Io { path: String, detail: String },
}

pub trait CommandRunner: Send + Sync {
    fn execute(
        &self,
        command: &ResolvedCommand,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandRunError>;
}

pub trait FileProbe: Send + Sync {
    fn exists(&self, path: &str) -> Result<bool, FileProbeError>;
    /// `None` when the path does not exist.
    fn size(&self, path: &str) -> Result<Option<u64>, FileProbeError>;
    /// Reads at most `limit` bytes, lossily decoded.
    fn read_text(&self, path: &str, limit: usize) -> Result<String, FileProbeError>;
}

pub trait EnvironmentInfo: Send + Sync {
    fn kind(&self) -> EnvironmentKind;
    fn has_elevated_rights(&self) -> bool;
    fn system_drive(&self) -> Option<String>;
    fn firmware(&self) -> Firmware;

    fn capture(&self) -> Environment {
        Environment {
            kind: self.kind(),
            elevated: self.has_elevated_rights(),
            system_drive: self.system_drive(),
            firmware: self.firmware(),
        }
    }
}

pub trait UserPrompt: Send + Sync {
    fn confirm(&self, risk: RiskLevel, message: &str) -> bool;
    fn confirm_with_phrase(&self, phrase: &str, message: &str) -> bool;
}

pub fn run_command(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<CommandOutput, CommandRunError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => CommandRunError::ToolUnavailable {
            program: program.to_string(),
        },
        _ => CommandRunError::Io {
            program: program.to_string(),
            detail: err.to_string(),
        },
    })?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = match child.wait_timeout(timeout).map_err(|err| CommandRunError::Io {
        program: program.to_string(),
        detail: err.to_string(),
    })? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CommandRunError::Timeout {
                program: program.to_string(),
                timeout,
            });
        }
    };

    Ok(CommandOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

/// Pipes are read while the child runs; a full pipe would otherwise stall it.
fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|h| h.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

pub fn effective_home_dir() -> Result<PathBuf> {
    for key in ["HOME", "USERPROFILE"] {
        if let Some(v) = std::env::var_os(key).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(v));
        }
    }
    Err(anyhow!("neither HOME nor USERPROFILE is set"))
}
