use serde::Serialize;

use crate::catalog;
use crate::core::{Finding, FindingCategory, win_join};
use crate::probes::{ProbeContext, ProbeId, ScanFacts};
use crate::scan::{self, ScanOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub finding_id: String,
    pub category: FindingCategory,
    pub resolved: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct Verification {
    pub verdicts: Vec<Verdict>,
    pub rescan: ScanOutcome,
}

impl Verification {
    pub fn all_resolved(&self) -> bool {
        self.verdicts.iter().all(|v| v.resolved)
    }

    pub fn is_resolved(&self, finding_id: &str) -> bool {
        self.verdicts
            .iter()
            .any(|v| v.finding_id == finding_id && v.resolved)
    }

    pub fn facts(&self) -> &ScanFacts {
        &self.rescan.facts
    }
}

/// Re-probes only what `targets` depend on and then checks each condition
/// directly, so a tool's exit code is never taken as proof.
pub fn verify(ctx: &ProbeContext<'_>, targets: &[&Finding]) -> Verification {
    let mut probes: Vec<ProbeId> = Vec::new();
    for t in targets {
        for p in ProbeId::for_category(t.category) {
            if !probes.contains(p) {
                probes.push(*p);
            }
        }
    }
    let rescan = scan::scan_subset(ctx, &probes);

    let verdicts = targets
        .iter()
        .map(|t| {
            let (resolved, detail) = judge(ctx, t, &rescan);
            Verdict {
                finding_id: t.id.clone(),
                category: t.category,
                resolved,
                detail,
            }
        })
        .collect();

    Verification { verdicts, rescan }
}

fn judge(ctx: &ProbeContext<'_>, target: &Finding, rescan: &ScanOutcome) -> (bool, String) {
    if let Some(still) = rescan.finding(&target.id) {
        return (false, format!("still detected: {}", still.title));
    }
    if let Some(err) = rescan
        .errors_for(ProbeId::for_category(target.category))
        .next()
    {
        return (false, format!("could not be re-checked: {err}"));
    }
    match inverse_check(ctx, target, &rescan.facts) {
        Ok(detail) => (true, detail),
        Err(detail) => (false, detail),
    }
}

fn inverse_check(
    ctx: &ProbeContext<'_>,
    target: &Finding,
    facts: &ScanFacts,
) -> Result<String, String> {
    let min_loader = ctx.settings.min_loader_bytes;
    match target.category {
        FindingCategory::LoaderFileMissingInBootPartition => {
            let root = facts
                .partition_root()
                .ok_or("boot partition is not readable")?;
            let path = win_join(root, catalog::PARTITION_LOADER);
            executable_image(ctx, &path, min_loader)
        }
        FindingCategory::LoaderFileMissingInSystem => {
            let mut checked = Vec::new();
            for path in target.evidence_paths() {
                checked.push(executable_image(ctx, path, min_loader)?);
            }
            Ok(checked.join("; "))
        }
        FindingCategory::DriverMissing => {
            let mut checked = Vec::new();
            for path in target.evidence_paths() {
                checked.push(executable_image(ctx, path, 2)?);
            }
            Ok(checked.join("; "))
        }
        FindingCategory::StoreMissing | FindingCategory::StoreCorrupt => {
            let store = facts
                .boot_store
                .as_ref()
                .filter(|s| s.readable && !s.entries.is_empty())
                .ok_or("boot store is not enumerable")?;
            let size = ctx
                .files
                .size(&store.path)
                .map_err(|err| err.to_string())?
                .unwrap_or(0);
            if size < ctx.settings.min_store_bytes {
                return Err(format!("{} is only {size} bytes", store.path));
            }
            Ok(format!(
                "{} enumerates {} entries ({size} bytes)",
                store.path,
                store.entries.len()
            ))
        }
        FindingCategory::PartitionNotMounted => {
            let letter = facts
                .partition_letter()
                .ok_or("boot partition still has no drive letter")?;
            let root = win_join(letter, "");
            match ctx.files.exists(&root) {
                Ok(true) => Ok(format!("boot partition mounted at {letter}")),
                Ok(false) => Err(format!("{root} is not accessible")),
                Err(err) => Err(err.to_string()),
            }
        }
        FindingCategory::PartitionFileSystemInvalid => {
            let partition = facts
                .boot_partition
                .as_ref()
                .ok_or("boot partition disappeared")?;
            if partition.is_fat32() {
                Ok("boot partition is FAT32".to_string())
            } else {
                Err(format!(
                    "boot partition is {}",
                    partition.file_system.as_deref().unwrap_or("RAW")
                ))
            }
        }
        FindingCategory::PermissionDenied
        | FindingCategory::VolumeEncrypted
        | FindingCategory::PartitionNotFound
        | FindingCategory::FirmwareModeMismatch => Ok("no longer detected".to_string()),
    }
}

/// Present, at least `min` bytes, and carrying a PE header.
fn executable_image(ctx: &ProbeContext<'_>, path: &str, min: u64) -> Result<String, String> {
    let size = ctx
        .files
        .size(path)
        .map_err(|err| err.to_string())?
        .ok_or_else(|| format!("{path} is missing"))?;
    if size < min {
        return Err(format!("{path} is only {size} bytes"));
    }
    let head = ctx
        .files
        .read_text(path, 2)
        .map_err(|err| err.to_string())?;
    if !head.starts_with("MZ") {
        return Err(format!("{path} is not an executable image"));
    }
    Ok(format!("{path} ({size} bytes)"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Environment, EnvironmentKind, Evidence, Firmware, Severity, TargetVolume};
    use crate::platform::CommandOutput;
    use crate::platform::memory::{MemoryFiles, ScriptedRunner};
    use crate::probes::ProbeSettings;

    fn runner() -> ScriptedRunner {
        ScriptedRunner::new()
            .respond(|c| {
                (c.program == "powershell").then(|| Ok(CommandOutput::ok("ESP|S|FAT32|S:\\\n")))
            })
    }

    fn verify_with(
        files: &MemoryFiles,
        runner: &ScriptedRunner,
        targets: &[&Finding],
    ) -> Verification {
        let target = TargetVolume::new("C:").unwrap();
        let env = Environment {
            kind: EnvironmentKind::PreBootRecovery,
            elevated: true,
            system_drive: Some("X:".to_string()),
            firmware: Firmware::Uefi,
        };
        let settings = ProbeSettings::default();
        let ctx = ProbeContext {
            target: &target,
            env: &env,
            files,
            runner,
            settings: &settings,
        };
        verify(&ctx, targets)
    }

    fn loader_finding() -> Finding {
        Finding::new(
            FindingCategory::LoaderFileMissingInBootPartition,
            None,
            "loader",
            Severity::Critical,
            90,
        )
    }

    #[test]
    fn restored_loader_with_pe_header_is_resolved() {
        let files = MemoryFiles::new();
        let mut image = b"MZ".to_vec();
        image.resize(80 * 1024, 0);
        files.put("S:\\EFI\\Microsoft\\Boot\\bootmgfw.efi", image);
        let finding = loader_finding();
        let v = verify_with(&files, &runner(), &[&finding]);
        assert!(v.all_resolved(), "{:?}", v.verdicts);
    }

    #[test]
    fn large_file_without_pe_header_is_not_trusted() {
        let files = MemoryFiles::new();
        files.put("S:\\EFI\\Microsoft\\Boot\\bootmgfw.efi", vec![0u8; 80 * 1024]);
        let finding = loader_finding();
        let v = verify_with(&files, &runner(), &[&finding]);
        assert!(!v.all_resolved());
        assert!(v.verdicts[0].detail.contains("not an executable image"));
    }

    #[test]
    fn still_missing_loader_is_unresolved() {
        let files = MemoryFiles::new();
        let finding = loader_finding();
        let v = verify_with(&files, &runner(), &[&finding]);
        assert!(!v.is_resolved(&finding.id));
        assert!(v.verdicts[0].detail.starts_with("still detected"));
    }

    #[test]
    fn inconclusive_recheck_is_not_resolution() {
        let files = MemoryFiles::new();
        let finding = loader_finding();
        let v = verify_with(&files, &ScriptedRunner::new(), &[&finding]);
        assert!(!v.all_resolved());
        assert!(v.verdicts[0].detail.starts_with("could not be re-checked"));
    }

    #[test]
    fn system_loader_checks_each_recorded_path() {
        let files = MemoryFiles::new();
        let mut image = b"MZ".to_vec();
        image.resize(80 * 1024, 0);
        files.put("C:\\Windows\\System32\\winload.efi", image.clone());
        files.put("C:\\Windows\\Boot\\EFI\\bootmgfw.efi", image);
        let finding = Finding::new(
            FindingCategory::LoaderFileMissingInSystem,
            Some("winload.efi"),
            "winload",
            Severity::Critical,
            90,
        )
        .with_evidence(Evidence::path("C:\\Windows\\System32\\winload.efi", false, None));
        let v = verify_with(&files, &ScriptedRunner::new(), &[&finding]);
        assert!(v.all_resolved(), "{:?}", v.verdicts);
    }
}
