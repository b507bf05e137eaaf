use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    LiveRunningOs,
    PreBootRecovery,
}

impl EnvironmentKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            EnvironmentKind::LiveRunningOs => "live",
            EnvironmentKind::PreBootRecovery => "recovery",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Firmware {
    Uefi,
    Bios,
    Unknown,
}

impl Firmware {
    /// Value for `bcdboot /f`.
    pub const fn bcdboot_arg(self) -> &'static str {
        match self {
            Firmware::Uefi => "UEFI",
            Firmware::Bios => "BIOS",
            Firmware::Unknown => "ALL",
        }
    }
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Firmware::Uefi => "uefi",
            Firmware::Bios => "bios",
            Firmware::Unknown => "unknown",
        })
    }
}

/// Captured once per session and never re-queried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub kind: EnvironmentKind,
    pub elevated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_drive: Option<String>,
    pub firmware: Firmware,
}

impl Environment {
    pub fn is_running_system(&self, drive: &str) -> bool {
        self.kind == EnvironmentKind::LiveRunningOs
            && self
                .system_drive
                .as_deref()
                .is_some_and(|d| d.eq_ignore_ascii_case(drive))
    }
}
