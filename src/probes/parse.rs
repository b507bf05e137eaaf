use crate::core::{BootPartition, MountState, StoreEntry};

pub fn partition_query(stdout: &str) -> Vec<BootPartition> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("ESP|"))
        .map(|rest| {
            let mut parts = rest.splitn(3, '|');
            let letter = parts.next().unwrap_or("").trim();
            let fs = parts.next().unwrap_or("").trim();
            let paths = parts.next().unwrap_or("");

            let drive = letter
                .chars()
                .next()
                .filter(|c| c.is_ascii_alphabetic())
                .map(|c| format!("{}:", c.to_ascii_uppercase()));
            let volume_path = paths
                .split(';')
                .map(str::trim)
                .find(|p| p.starts_with("\\\\?\\Volume"))
                .map(ToOwned::to_owned);

            BootPartition {
                mount: if drive.is_some() {
                    MountState::Mounted
                } else {
                    MountState::Unmounted
                },
                drive,
                volume_path,
                file_system: (!fs.is_empty()).then(|| fs.to_string()),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreListing {
    pub entries: Vec<StoreEntry>,
    pub default_entry_id: Option<String>,
}

/// Parses `bcdedit /enum` output: blocks of a title, a dashed rule, then `key  value` lines.
pub fn store_enumeration(stdout: &str) -> StoreListing {
    let mut listing = StoreListing::default();
    let lines: Vec<&str> = stdout.lines().collect();
    let mut i = 0;
    while i < lines.len() {
        let title = lines[i].trim();
        let is_header = lines
            .get(i + 1)
            .is_some_and(|next| is_rule(next.trim()))
            && !title.is_empty();
        if !is_header {
            i += 1;
            continue;
        }

        i += 2;
        let mut identifier = None;
        let mut device = None;
        let mut path = None;
        let mut default = None;
        while i < lines.len() && !lines[i].trim().is_empty() {
            if lines.get(i + 1).is_some_and(|next| is_rule(next.trim())) {
                break;
            }
            let line = lines[i].trim();
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k, v.trim()),
                None => (line, ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "identifier" => identifier = Some(value.to_string()),
                "device" => device = Some(value.to_string()),
                "path" => path = Some(value.to_string()),
                "default" => default = Some(value.to_string()),
                _ => {}
            }
            i += 1;
        }

        if let Some(identifier) = identifier {
            let is_manager = identifier.eq_ignore_ascii_case("{bootmgr}")
                || title.eq_ignore_ascii_case("Windows Boot Manager");
            if is_manager && listing.default_entry_id.is_none() {
                listing.default_entry_id = default;
            }
            listing.entries.push(StoreEntry {
                identifier,
                description: title.to_string(),
                device,
                path,
            });
        }
    }
    listing
}

fn is_rule(line: &str) -> bool {
    line.len() >= 3 && line.chars().all(|c| c == '-')
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncryptionStatus {
    pub protection_on: bool,
    pub locked: bool,
}

pub fn encryption_status(stdout: &str) -> EncryptionStatus {
    let mut status = EncryptionStatus::default();
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim().to_ascii_lowercase();
        match key.as_str() {
            "protection status" => status.protection_on = value.starts_with("protection on"),
            "lock status" => status.locked = value == "locked",
            _ => {}
        }
    }
    status
}

pub fn mentions_access_denied(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("access is denied") || lower.contains("access denied")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_query_reads_letter_and_volume_path() {
        let out = "ESP|S|FAT32|S:\\;\\\\?\\Volume{1111}\\\r\nESP|\0||\\\\?\\Volume{2222}\\\n";
        let parts = partition_query(out);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].drive.as_deref(), Some("S:"));
        assert_eq!(parts[0].mount, MountState::Mounted);
        assert_eq!(parts[0].volume_path.as_deref(), Some("\\\\?\\Volume{1111}\\"));
        assert_eq!(parts[1].drive, None);
        assert_eq!(parts[1].mount, MountState::Unmounted);
        assert_eq!(parts[1].file_system, None);
    }

    #[test]
    fn partition_query_ignores_noise() {
        assert!(partition_query("WARNING: something\n\n").is_empty());
    }

    const ENUM: &str = "\
Windows Boot Manager
--------------------
identifier              {bootmgr}
device                  partition=S:
path                    \\EFI\\Microsoft\\Boot\\bootmgfw.efi
default                 {default}
displayorder            {default}

Windows Boot Loader
-------------------
identifier              {default}
device                  partition=C:
path                    \\Windows\\system32\\winload.efi
description             Windows 11
";

    #[test]
    fn store_enumeration_collects_entries_and_default() {
        let listing = store_enumeration(ENUM);
        assert_eq!(listing.entries.len(), 2);
        assert_eq!(listing.default_entry_id.as_deref(), Some("{default}"));
        assert_eq!(
            listing.entries[1].path.as_deref(),
            Some("\\Windows\\system32\\winload.efi")
        );
        assert_eq!(listing.entries[0].description, "Windows Boot Manager");
    }

    #[test]
    fn store_enumeration_of_garbage_is_empty() {
        let listing = store_enumeration("The boot configuration data store could not be opened.\n");
        assert!(listing.entries.is_empty());
        assert_eq!(listing.default_entry_id, None);
    }

    #[test]
    fn encryption_status_reads_lock_state() {
        let out = "Volume C: [OS]\n    Protection Status:    Protection On\n    Lock Status:          Locked\n";
        assert_eq!(
            encryption_status(out),
            EncryptionStatus {
                protection_on: true,
                locked: true
            }
        );
        let out = "    Protection Status:    Protection Off\n    Lock Status:          Unlocked\n";
        assert_eq!(encryption_status(out), EncryptionStatus::default());
    }
}
