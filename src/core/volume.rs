use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeHealth {
    Unknown,
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetVolume {
    pub drive: String,
    pub root_path: String,
    pub file_system: Option<String>,
    pub is_encrypted: bool,
    pub health: VolumeHealth,
}

impl TargetVolume {
    pub fn new(drive: &str) -> Option<Self> {
        let drive = normalize_drive(drive)?;
        Some(Self {
            root_path: format!("{drive}\\"),
            drive,
            file_system: None,
            is_encrypted: false,
            health: VolumeHealth::Unknown,
        })
    }

    pub fn letter(&self) -> &str {
        self.drive.trim_end_matches(':')
    }

    pub fn windows_dir(&self) -> String {
        win_join(&self.drive, "Windows")
    }

    pub fn lock_key(&self) -> String {
        self.drive.to_ascii_uppercase()
    }
}

impl fmt::Display for TargetVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.drive)
    }
}

/// Accepts `c`, `C:`, `c:\` and returns `C:`.
pub fn normalize_drive(input: &str) -> Option<String> {
    let s = input.trim();
    let s = s.strip_suffix('\\').unwrap_or(s);
    let s = s.strip_suffix(':').unwrap_or(s);
    let mut chars = s.chars();
    let letter = chars.next()?;
    if chars.next().is_some() || !letter.is_ascii_alphabetic() {
        return None;
    }
    Some(format!("{}:", letter.to_ascii_uppercase()))
}

pub fn win_join(base: &str, rel: &str) -> String {
    let base = base.trim_end_matches('\\');
    let rel = rel.trim_start_matches('\\');
    if rel.is_empty() {
        return format!("{base}\\");
    }
    format!("{base}\\{rel}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountState {
    Mounted,
    Unmounted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootPartition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drive: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_system: Option<String>,
    pub mount: MountState,
}

impl BootPartition {
    pub fn readable_root(&self) -> Option<&str> {
        self.drive.as_deref().or(self.volume_path.as_deref())
    }

    pub fn is_fat32(&self) -> bool {
        self.file_system
            .as_deref()
            .is_some_and(|fs| fs.trim().eq_ignore_ascii_case("FAT32"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEntry {
    pub identifier: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootStore {
    pub path: String,
    pub readable: bool,
    pub entries: Vec<StoreEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_entry_id: Option<String>,
}

impl BootStore {
    pub fn default_entry(&self) -> Option<&StoreEntry> {
        let id = self.default_entry_id.as_deref()?;
        self.entries
            .iter()
            .find(|e| e.identifier.eq_ignore_ascii_case(id))
    }
}
