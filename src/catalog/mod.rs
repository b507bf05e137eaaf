//! Static command templates, risk table and on-disk layout.

use crate::core::{
    BackupAction, CommandTemplate, EnvRequirement, FindingCategory, Precondition,
    RemediationStep, ResolvedCommand, RiskLevel, StepTemplate, Tier, VolumeRole,
};

pub const ESP_GPT_TYPE: &str = "{c12a7328-f81f-11d2-ba4b-00a0c93ec93b}";

pub const SYSTEM_LOADER: &str = "Windows\\System32\\winload.efi";
pub const BOOT_MANAGER_SOURCE: &str = "Windows\\Boot\\EFI\\bootmgfw.efi";
pub const PARTITION_LOADER: &str = "EFI\\Microsoft\\Boot\\bootmgfw.efi";
pub const STORE: &str = "EFI\\Microsoft\\Boot\\BCD";
pub const STORE_DIR: &str = "EFI\\Microsoft\\Boot";
pub const DRIVERS_DIR: &str = "Windows\\System32\\drivers";

const ROBOCOPY_OK: std::ops::RangeInclusive<i32> = 0..=7;
const DISM_OK: [i32; 2] = [0, 3010];

/// Lists ESP partitions on the target's disk as `ESP|<letter>|<fs>|<access paths>`.
pub fn partition_query(target_letter: &str) -> ResolvedCommand {
    let script = format!(
        "$d = (Get-Partition -DriveLetter {target_letter}).DiskNumber; \
         Get-Partition -DiskNumber $d | Where-Object {{ $_.GptType -eq '{ESP_GPT_TYPE}' }} | \
         ForEach-Object {{ $v = $_ | Get-Volume -ErrorAction SilentlyContinue; \
         'ESP|{{0}}|{{1}}|{{2}}' -f $_.DriveLetter, $v.FileSystem, ($_.AccessPaths -join ';') }}"
    );
    ResolvedCommand {
        program: "powershell".to_string(),
        args: vec![
            "-NoProfile".to_string(),
            "-NonInteractive".to_string(),
            "-Command".to_string(),
            script,
        ],
    }
}

pub fn store_enumeration(store_path: &str) -> ResolvedCommand {
    ResolvedCommand {
        program: "bcdedit".to_string(),
        args: vec![
            "/store".to_string(),
            store_path.to_string(),
            "/enum".to_string(),
            "all".to_string(),
        ],
    }
}

pub fn encryption_status(drive: &str) -> ResolvedCommand {
    ResolvedCommand {
        program: "manage-bde".to_string(),
        args: vec!["-status".to_string(), drive.to_string()],
    }
}

/// Facts that select between command variants of a template.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateOptions {
    pub target_is_running_system: bool,
    pub prefer_reversible: bool,
}

struct Traits {
    title: &'static str,
    risk: RiskLevel,
    destructive: bool,
    reversible: bool,
    touches: &'static [VolumeRole],
}

const PARTITION: &[VolumeRole] = &[VolumeRole::BootPartition];
const TARGET: &[VolumeRole] = &[VolumeRole::Target];
const BOTH: &[VolumeRole] = &[VolumeRole::Target, VolumeRole::BootPartition];

fn traits(template: StepTemplate, opts: TemplateOptions) -> Traits {
    match template {
        StepTemplate::MountBootPartition => Traits {
            title: "Assign a drive letter to the boot partition",
            risk: RiskLevel::R1,
            destructive: false,
            reversible: true,
            touches: PARTITION,
        },
        StepTemplate::CopyBootManager => Traits {
            title: "Copy the boot manager from the system volume",
            risk: RiskLevel::R1,
            destructive: false,
            reversible: true,
            touches: BOTH,
        },
        StepTemplate::ComponentStoreRepair => Traits {
            title: "Repair the component store",
            risk: RiskLevel::R2,
            destructive: false,
            reversible: false,
            touches: TARGET,
        },
        StepTemplate::SystemFileCheck => Traits {
            title: "Restore protected system files",
            risk: RiskLevel::R2,
            destructive: false,
            reversible: false,
            touches: TARGET,
        },
        StepTemplate::ReformatBootPartition => Traits {
            title: "Reformat the boot partition as FAT32",
            risk: RiskLevel::R3,
            destructive: true,
            reversible: false,
            touches: PARTITION,
        },
        StepTemplate::RemoveCorruptStore if opts.prefer_reversible => Traits {
            title: "Move the corrupt boot store aside",
            risk: RiskLevel::R2,
            destructive: false,
            reversible: true,
            touches: PARTITION,
        },
        StepTemplate::RemoveCorruptStore => Traits {
            title: "Delete the corrupt boot store",
            risk: RiskLevel::R3,
            destructive: true,
            reversible: false,
            touches: PARTITION,
        },
        StepTemplate::CreateStore => Traits {
            title: "Create a new boot store",
            risk: RiskLevel::R2,
            destructive: false,
            reversible: false,
            touches: BOTH,
        },
        StepTemplate::RegenerateBootFiles => Traits {
            title: "Regenerate boot files and store entries",
            risk: RiskLevel::R2,
            destructive: false,
            reversible: false,
            touches: BOTH,
        },
        StepTemplate::MediaRestoreHealth => Traits {
            title: "Restore system files from installation media",
            risk: RiskLevel::R2,
            destructive: false,
            reversible: false,
            touches: TARGET,
        },
        StepTemplate::ForceWipeFormat => Traits {
            title: "Wipe the boot partition",
            risk: RiskLevel::R3,
            destructive: true,
            reversible: false,
            touches: PARTITION,
        },
        StepTemplate::ForceWipeRebuild => Traits {
            title: "Rebuild the wiped boot partition",
            risk: RiskLevel::R2,
            destructive: false,
            reversible: false,
            touches: BOTH,
        },
    }
}

fn bcdboot() -> CommandTemplate {
    CommandTemplate::new("bcdboot", &["{windows}", "/s", "{esp}", "/f", "{firmware}"])
}

fn format_esp() -> CommandTemplate {
    CommandTemplate::new("format", &["{esp}", "/FS:FAT32", "/Q", "/Y", "/V:SYSTEM"])
}

pub fn command(template: StepTemplate, opts: TemplateOptions) -> CommandTemplate {
    let online = opts.target_is_running_system;
    match template {
        StepTemplate::MountBootPartition => {
            CommandTemplate::new("mountvol", &["{mount_letter}", "/s"])
        }
        StepTemplate::CopyBootManager => CommandTemplate::new(
            "cmd",
            &[
                "/c",
                "copy",
                "/y",
                "{windows}\\Boot\\EFI\\bootmgfw.efi",
                "{esp}\\EFI\\Microsoft\\Boot\\bootmgfw.efi",
            ],
        ),
        StepTemplate::ComponentStoreRepair if online => {
            CommandTemplate::new("dism", &["/Online", "/Cleanup-Image", "/RestoreHealth"])
                .with_success_codes(DISM_OK)
        }
        StepTemplate::ComponentStoreRepair => {
            CommandTemplate::new("dism", &["/Image:{target}\\", "/Cleanup-Image", "/RestoreHealth"])
                .with_success_codes(DISM_OK)
        }
        StepTemplate::SystemFileCheck if online => CommandTemplate::new("sfc", &["/scannow"]),
        StepTemplate::SystemFileCheck => CommandTemplate::new(
            "sfc",
            &["/scannow", "/offbootdir={target}\\", "/offwindir={windows}"],
        ),
        StepTemplate::ReformatBootPartition | StepTemplate::ForceWipeFormat => format_esp(),
        StepTemplate::RemoveCorruptStore if opts.prefer_reversible => {
            CommandTemplate::new("cmd", &["/c", "move", "/y", "{store}", "{store}.corrupt"])
        }
        StepTemplate::RemoveCorruptStore => {
            CommandTemplate::new("cmd", &["/c", "del", "/f", "/a", "{store}"])
        }
        StepTemplate::CreateStore | StepTemplate::RegenerateBootFiles => bcdboot(),
        StepTemplate::ForceWipeRebuild => bcdboot(),
        StepTemplate::MediaRestoreHealth => {
            let image = if online { "/Online" } else { "/Image:{target}\\" };
            CommandTemplate::new(
                "dism",
                &[
                    image,
                    "/Cleanup-Image",
                    "/RestoreHealth",
                    "/Source:wim:{media}\\sources\\install.wim:1",
                    "/LimitAccess",
                ],
            )
            .with_success_codes(DISM_OK)
        }
    }
}

fn backup(template: StepTemplate) -> Option<BackupAction> {
    match template {
        StepTemplate::RemoveCorruptStore => Some(BackupAction {
            description: "Copy the boot store into the backup directory".to_string(),
            command: CommandTemplate::new(
                "robocopy",
                &["{esp}\\EFI\\Microsoft\\Boot", "{backup}\\store", "BCD", "/R:0", "/W:0"],
            )
            .with_success_codes(ROBOCOPY_OK),
            artifact: "{backup}\\store\\BCD".to_string(),
        }),
        StepTemplate::ReformatBootPartition | StepTemplate::ForceWipeFormat => Some(BackupAction {
            description: "Copy the whole boot partition into the backup directory".to_string(),
            command: CommandTemplate::new(
                "robocopy",
                &["{esp}\\", "{backup}\\esp", "/E", "/R:0", "/W:0"],
            )
            .with_success_codes(ROBOCOPY_OK),
            artifact: "{backup}\\esp".to_string(),
        }),
        _ => None,
    }
}

fn precondition(template: StepTemplate) -> Option<Precondition> {
    match template {
        StepTemplate::MountBootPartition => Some(Precondition::PartitionAlreadyMounted),
        _ => None,
    }
}

fn environment(template: StepTemplate) -> EnvRequirement {
    match template {
        StepTemplate::MediaRestoreHealth => EnvRequirement::InstallMedia,
        _ => EnvRequirement::Any,
    }
}

pub fn step(tier: Tier, template: StepTemplate, opts: TemplateOptions) -> RemediationStep {
    let t = traits(template, opts);
    RemediationStep {
        id: format!("t{}-{}", tier.get(), template.slug()),
        tier,
        template,
        title: t.title.to_string(),
        command: command(template, opts),
        targets: Vec::new(),
        touches: t.touches.to_vec(),
        risk: t.risk,
        destructive: t.destructive,
        reversible: t.reversible,
        backup: backup(template),
        precondition: precondition(template),
        environment: environment(template),
    }
}

/// Templates that can clear a finding category, with the tier each runs at.
pub fn remedies(category: FindingCategory) -> &'static [(u8, StepTemplate)] {
    use StepTemplate::*;
    match category {
        FindingCategory::PermissionDenied
        | FindingCategory::VolumeEncrypted
        | FindingCategory::PartitionNotFound => &[],
        FindingCategory::PartitionNotMounted => &[(1, MountBootPartition)],
        FindingCategory::PartitionFileSystemInvalid => &[
            (3, ReformatBootPartition),
            (3, RegenerateBootFiles),
            (5, ForceWipeFormat),
            (5, ForceWipeRebuild),
        ],
        FindingCategory::StoreMissing => &[
            (3, CreateStore),
            (5, ForceWipeFormat),
            (5, ForceWipeRebuild),
        ],
        FindingCategory::StoreCorrupt => &[
            (3, RemoveCorruptStore),
            (3, RegenerateBootFiles),
            (5, ForceWipeFormat),
            (5, ForceWipeRebuild),
        ],
        FindingCategory::FirmwareModeMismatch => &[
            (3, RegenerateBootFiles),
            (5, ForceWipeFormat),
            (5, ForceWipeRebuild),
        ],
        FindingCategory::LoaderFileMissingInSystem | FindingCategory::DriverMissing => &[
            (2, ComponentStoreRepair),
            (2, SystemFileCheck),
            (4, MediaRestoreHealth),
        ],
        FindingCategory::LoaderFileMissingInBootPartition => &[
            (1, CopyBootManager),
            (3, RegenerateBootFiles),
            (4, MediaRestoreHealth),
            (5, ForceWipeFormat),
            (5, ForceWipeRebuild),
        ],
    }
}

/// Commands an operator can run by hand; placeholders render like step commands.
pub fn manual_commands(category: FindingCategory) -> &'static [&'static str] {
    match category {
        FindingCategory::PermissionDenied => {
            &["runas /user:Administrator \"bootmend repair --target {target} --apply\""]
        }
        FindingCategory::VolumeEncrypted => &[
            "manage-bde -unlock {target} -RecoveryPassword <recovery-password>",
            "manage-bde -protectors -disable {target}",
        ],
        FindingCategory::PartitionNotFound => &[
            "diskpart /s <script: select disk <n>; create partition efi size=260; format quick fs=fat32 label=SYSTEM; assign letter={mount_letter}>",
            "bcdboot {windows} /s {mount_letter} /f {firmware}",
        ],
        FindingCategory::PartitionNotMounted => &["mountvol {mount_letter} /s"],
        FindingCategory::PartitionFileSystemInvalid => &[
            "chkdsk {esp} /f",
            "format {esp} /FS:FAT32 /Q /Y /V:SYSTEM",
            "bcdboot {windows} /s {esp} /f {firmware}",
        ],
        FindingCategory::StoreMissing | FindingCategory::StoreCorrupt => &[
            "bcdedit /store {store} /enum all",
            "bcdboot {windows} /s {esp} /f {firmware}",
            "bootrec /rebuildbcd",
        ],
        FindingCategory::FirmwareModeMismatch => {
            &["bcdboot {windows} /s {esp} /f {firmware}"]
        }
        FindingCategory::LoaderFileMissingInSystem => &[
            "dism /Image:{target}\\ /Cleanup-Image /RestoreHealth /Source:wim:<media>\\sources\\install.wim:1 /LimitAccess",
            "sfc /scannow /offbootdir={target}\\ /offwindir={windows}",
        ],
        FindingCategory::LoaderFileMissingInBootPartition => &[
            "chkdsk {esp} /f",
            "attrib -r -s -h {esp}\\EFI\\Microsoft\\Boot\\*.*",
            "bcdboot {windows} /s {esp} /f {firmware}",
        ],
        FindingCategory::DriverMissing => &[
            "dism /Image:{target}\\ /Cleanup-Image /RestoreHealth /Source:wim:<media>\\sources\\install.wim:1 /LimitAccess",
            "dism /Image:{target}\\ /Add-Driver /Driver:<driver.inf>",
        ],
    }
}

pub fn hypothesis(category: FindingCategory, writes_did_not_persist: bool) -> &'static str {
    if writes_did_not_persist {
        return "Repair commands reported success but their writes did not persist; the boot partition is likely write-protected, held open by firmware or another process, or the underlying disk is failing.";
    }
    match category {
        FindingCategory::PermissionDenied => {
            "The engine ran without administrative rights, so no repair could be attempted."
        }
        FindingCategory::VolumeEncrypted => {
            "The target volume is encrypted and locked; boot files cannot be read or repaired until it is unlocked."
        }
        FindingCategory::PartitionNotFound => {
            "The target disk has no boot partition; it must be recreated before boot files can be written."
        }
        FindingCategory::PartitionNotMounted => {
            "The boot partition could not be given a drive letter, which usually means it is damaged or hidden by disk policy."
        }
        FindingCategory::PartitionFileSystemInvalid => {
            "The boot partition's file system is damaged or unsupported by the firmware, and it could not be safely reformatted."
        }
        FindingCategory::StoreMissing | FindingCategory::StoreCorrupt => {
            "The boot store could not be recreated, which points to a damaged boot partition or an incomplete Windows installation."
        }
        FindingCategory::FirmwareModeMismatch => {
            "The installation was set up for a different firmware mode than the machine now boots in; check the firmware's boot mode setting."
        }
        FindingCategory::LoaderFileMissingInSystem => {
            "The Windows installation is missing its own boot files, and no installation media was available to restore them."
        }
        FindingCategory::LoaderFileMissingInBootPartition => {
            "The boot manager could not be written to the boot partition even after a full rebuild."
        }
        FindingCategory::DriverMissing => {
            "Storage drivers needed at boot are missing from the installation and could not be restored."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_tiers_are_never_below_four() {
        for category in FindingCategory::ALL {
            for (tier, template) in remedies(category) {
                if matches!(
                    template,
                    StepTemplate::MediaRestoreHealth
                        | StepTemplate::ForceWipeFormat
                        | StepTemplate::ForceWipeRebuild
                ) {
                    assert!(*tier >= 4, "{category} {template:?}");
                }
            }
        }
    }

    #[test]
    fn destructive_steps_carry_a_backup() {
        let opts = TemplateOptions::default();
        for category in FindingCategory::ALL {
            for (tier, template) in remedies(category) {
                let step = step(Tier::new(*tier).unwrap(), *template, opts);
                if step.destructive {
                    assert!(step.backup.is_some(), "{}", step.id);
                    assert_eq!(step.risk, RiskLevel::R3);
                }
            }
        }
    }

    #[test]
    fn reversible_preference_renames_instead_of_deleting() {
        let keep = TemplateOptions {
            prefer_reversible: true,
            ..TemplateOptions::default()
        };
        let step = step(Tier::new(3).unwrap(), StepTemplate::RemoveCorruptStore, keep);
        assert_eq!(step.command.args[1], "move");
        assert!(!step.destructive);
        assert!(!step.needs_backup());

        let step = super::step(
            Tier::new(3).unwrap(),
            StepTemplate::RemoveCorruptStore,
            TemplateOptions::default(),
        );
        assert_eq!(step.command.args[1], "del");
        assert!(step.needs_backup());
    }

    #[test]
    fn running_system_uses_online_servicing() {
        let opts = TemplateOptions {
            target_is_running_system: true,
            ..TemplateOptions::default()
        };
        assert_eq!(
            command(StepTemplate::ComponentStoreRepair, opts).args[0],
            "/Online"
        );
        assert!(
            command(StepTemplate::ComponentStoreRepair, TemplateOptions::default()).args[0]
                .starts_with("/Image:")
        );
    }

    #[test]
    fn partition_query_embeds_the_target_letter() {
        let cmd = partition_query("C");
        assert!(cmd.args[3].contains("-DriveLetter C"));
        assert!(cmd.args[3].contains(ESP_GPT_TYPE));
    }
}
