use std::io::Read;
use std::path::Path;
use std::time::Duration;

use crate::core::{EnvironmentKind, Firmware, ResolvedCommand, normalize_drive};
use crate::platform::{
    CommandOutput, CommandRunError, CommandRunner, EnvironmentInfo, FileProbe, FileProbeError,
    run_command,
};

#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn execute(
        &self,
        command: &ResolvedCommand,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandRunError> {
        run_command(&command.program, &command.args, timeout)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalFileProbe;

fn io_error(path: &str, err: std::io::Error) -> FileProbeError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => FileProbeError::AccessDenied {
            path: path.to_string(),
        },
        _ => FileProbeError::Io {
            path: path.to_string(),
            detail: err.to_string(),
        },
    }
}

impl FileProbe for LocalFileProbe {
    fn exists(&self, path: &str) -> Result<bool, FileProbeError> {
        match std::fs::metadata(path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error(path, err)),
        }
    }

    fn size(&self, path: &str) -> Result<Option<u64>, FileProbeError> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(path, err)),
        }
    }

    fn read_text(&self, path: &str, limit: usize) -> Result<String, FileProbeError> {
        let file = std::fs::File::open(path).map_err(|err| io_error(path, err))?;
        let mut buf = Vec::new();
        file.take(limit as u64)
            .read_to_end(&mut buf)
            .map_err(|err| io_error(path, err))?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostEnvironment {
    pub kind_override: Option<EnvironmentKind>,
    pub firmware_override: Option<Firmware>,
}

impl EnvironmentInfo for HostEnvironment {
    fn kind(&self) -> EnvironmentKind {
        if let Some(kind) = self.kind_override {
            return kind;
        }
        let in_pe = self.system_drive().as_deref() == Some("X:")
            || Path::new("X:\\Windows\\System32\\winpeshl.ini").exists();
        if in_pe {
            EnvironmentKind::PreBootRecovery
        } else {
            EnvironmentKind::LiveRunningOs
        }
    }

    fn has_elevated_rights(&self) -> bool {
        is_elevated()
    }

    fn system_drive(&self) -> Option<String> {
        std::env::var("SystemDrive")
            .ok()
            .and_then(|v| normalize_drive(&v))
    }

    fn firmware(&self) -> Firmware {
        if let Some(fw) = self.firmware_override {
            return fw;
        }
        if let Ok(v) = std::env::var("firmware_type") {
            match v.trim().to_ascii_lowercase().as_str() {
                "uefi" => return Firmware::Uefi,
                "legacy" | "bios" => return Firmware::Bios,
                _ => {}
            }
        }
        if Path::new("/sys/firmware/efi").exists() {
            return Firmware::Uefi;
        }
        Firmware::Unknown
    }
}

#[cfg(windows)]
fn is_elevated() -> bool {
    // `net session` is refused without an elevated token.
    run_command("net", &["session".to_string()], Duration::from_secs(10))
        .map(|out| out.exit_code == 0)
        .unwrap_or(false)
}

#[cfg(unix)]
fn is_elevated() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(any(unix, windows)))]
fn is_elevated() -> bool {
    false
}
