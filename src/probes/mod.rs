use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog;
use crate::core::{
    BootPartition, BootStore, Environment, Evidence, Finding, FindingCategory, Firmware,
    ProbeErrorRecord, ResolvedCommand, Severity, TargetVolume, win_join,
};
use crate::platform::{CommandOutput, CommandRunError, CommandRunner, FileProbe, FileProbeError};

pub mod parse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeId {
    Elevation,
    VolumeEncryption,
    BootPartitionDiscovery,
    BootPartitionMount,
    BootPartitionFileSystem,
    BootStore,
    FirmwareMode,
    SystemLoader,
    BootManagerSource,
    PartitionLoader,
    StorageDrivers,
}

impl ProbeId {
    /// Dependency order: environment, partition, store, files, drivers.
    pub const ALL: [ProbeId; 11] = [
        ProbeId::Elevation,
        ProbeId::VolumeEncryption,
        ProbeId::BootPartitionDiscovery,
        ProbeId::BootPartitionMount,
        ProbeId::BootPartitionFileSystem,
        ProbeId::BootStore,
        ProbeId::FirmwareMode,
        ProbeId::SystemLoader,
        ProbeId::BootManagerSource,
        ProbeId::PartitionLoader,
        ProbeId::StorageDrivers,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ProbeId::Elevation => "elevation",
            ProbeId::VolumeEncryption => "volume_encryption",
            ProbeId::BootPartitionDiscovery => "boot_partition_discovery",
            ProbeId::BootPartitionMount => "boot_partition_mount",
            ProbeId::BootPartitionFileSystem => "boot_partition_filesystem",
            ProbeId::BootStore => "boot_store",
            ProbeId::FirmwareMode => "firmware_mode",
            ProbeId::SystemLoader => "system_loader",
            ProbeId::BootManagerSource => "boot_manager_source",
            ProbeId::PartitionLoader => "partition_loader",
            ProbeId::StorageDrivers => "storage_drivers",
        }
    }

    pub const fn requires(self) -> &'static [ProbeId] {
        match self {
            ProbeId::BootPartitionMount
            | ProbeId::BootPartitionFileSystem
            | ProbeId::BootStore
            | ProbeId::PartitionLoader => &[ProbeId::BootPartitionDiscovery],
            ProbeId::FirmwareMode => &[ProbeId::BootPartitionDiscovery, ProbeId::BootStore],
            _ => &[],
        }
    }

    /// Probes that can raise a finding of `category`.
    pub const fn for_category(category: FindingCategory) -> &'static [ProbeId] {
        match category {
            FindingCategory::PermissionDenied => &[ProbeId::Elevation],
            FindingCategory::VolumeEncrypted => &[ProbeId::VolumeEncryption],
            FindingCategory::PartitionNotFound => &[ProbeId::BootPartitionDiscovery],
            FindingCategory::PartitionNotMounted => &[ProbeId::BootPartitionMount],
            FindingCategory::PartitionFileSystemInvalid => &[ProbeId::BootPartitionFileSystem],
            FindingCategory::StoreMissing | FindingCategory::StoreCorrupt => &[ProbeId::BootStore],
            FindingCategory::FirmwareModeMismatch => &[ProbeId::FirmwareMode],
            FindingCategory::LoaderFileMissingInSystem => {
                &[ProbeId::SystemLoader, ProbeId::BootManagerSource]
            }
            FindingCategory::LoaderFileMissingInBootPartition => &[ProbeId::PartitionLoader],
            FindingCategory::DriverMissing => &[ProbeId::StorageDrivers],
        }
    }

    pub fn run(self, ctx: &ProbeContext<'_>, facts: &mut ScanFacts) -> ProbeOutcome {
        let result = match self {
            ProbeId::Elevation => elevation(ctx),
            ProbeId::VolumeEncryption => volume_encryption(ctx),
            ProbeId::BootPartitionDiscovery => boot_partition_discovery(ctx, facts),
            ProbeId::BootPartitionMount => boot_partition_mount(facts),
            ProbeId::BootPartitionFileSystem => boot_partition_filesystem(facts),
            ProbeId::BootStore => boot_store(ctx, facts),
            ProbeId::FirmwareMode => firmware_mode(ctx, facts),
            ProbeId::SystemLoader => system_loader(ctx),
            ProbeId::BootManagerSource => boot_manager_source(ctx, facts),
            ProbeId::PartitionLoader => partition_loader(ctx, facts),
            ProbeId::StorageDrivers => storage_drivers(ctx),
        };
        match result {
            Ok(Some(finding)) => ProbeOutcome::Issue(finding),
            Ok(None) => ProbeOutcome::Healthy,
            Err(err) => ProbeOutcome::Inconclusive(err),
        }
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("{probe}: access denied ({detail})")]
    AccessDenied { probe: ProbeId, detail: String },
    #[error("{probe}: blocked, {requires} is unknown")]
    Blocked {
        probe: ProbeId,
        requires: &'static str,
    },
    #[error("{probe}: {detail}")]
    Command { probe: ProbeId, detail: String },
    #[error("{probe}: {detail}")]
    Io { probe: ProbeId, detail: String },
}

impl ProbeError {
    pub fn probe(&self) -> ProbeId {
        match self {
            ProbeError::AccessDenied { probe, .. }
            | ProbeError::Blocked { probe, .. }
            | ProbeError::Command { probe, .. }
            | ProbeError::Io { probe, .. } => *probe,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::AccessDenied { .. } => "access_denied",
            ProbeError::Blocked { .. } => "blocked",
            ProbeError::Command { .. } => "command",
            ProbeError::Io { .. } => "io",
        }
    }

    pub fn record(&self) -> ProbeErrorRecord {
        ProbeErrorRecord {
            probe: self.probe().as_str().to_string(),
            kind: self.kind().to_string(),
            detail: self.to_string(),
        }
    }

    fn from_file(probe: ProbeId, err: FileProbeError) -> Self {
        match err {
            FileProbeError::AccessDenied { path } => ProbeError::AccessDenied {
                probe,
                detail: path,
            },
            FileProbeError::Io { path, detail } => ProbeError::Io {
                probe,
                detail: format!("{path}: {detail}"),
            },
        }
    }

    fn from_command(probe: ProbeId, err: CommandRunError) -> Self {
        ProbeError::Command {
            probe,
            detail: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Issue(Finding),
    Inconclusive(ProbeError),
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub min_loader_bytes: u64,
    pub min_store_bytes: u64,
    pub required_drivers: Vec<String>,
    pub timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            min_loader_bytes: 64 * 1024,
            min_store_bytes: 8 * 1024,
            required_drivers: vec!["stornvme.sys".to_string(), "storahci.sys".to_string()],
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct ProbeContext<'a> {
    pub target: &'a TargetVolume,
    pub env: &'a Environment,
    pub files: &'a dyn FileProbe,
    pub runner: &'a dyn CommandRunner,
    pub settings: &'a ProbeSettings,
}

impl ProbeContext<'_> {
    fn run(&self, probe: ProbeId, command: &ResolvedCommand) -> Result<CommandOutput, ProbeError> {
        self.runner
            .execute(command, self.settings.timeout)
            .map_err(|err| ProbeError::from_command(probe, err))
    }

    fn stat(&self, probe: ProbeId, path: &str) -> Result<Option<u64>, ProbeError> {
        self.files
            .size(path)
            .map_err(|err| ProbeError::from_file(probe, err))
    }
}

/// Facts established by earlier probes and consumed by later ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFacts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_partition: Option<BootPartition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_store: Option<BootStore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_manager_source_present: Option<bool>,
}

impl ScanFacts {
    pub fn partition_root(&self) -> Option<&str> {
        self.boot_partition.as_ref()?.readable_root()
    }

    pub fn partition_letter(&self) -> Option<&str> {
        self.boot_partition.as_ref()?.drive.as_deref()
    }
}

type ProbeResult = Result<Option<Finding>, ProbeError>;

fn elevation(ctx: &ProbeContext<'_>) -> ProbeResult {
    if ctx.env.elevated {
        return Ok(None);
    }
    Ok(Some(
        Finding::new(
            FindingCategory::PermissionDenied,
            None,
            "Running without administrative rights",
            Severity::Critical,
            100,
        )
        .with_evidence(Evidence::stat("elevated", "false")),
    ))
}

fn volume_encryption(ctx: &ProbeContext<'_>) -> ProbeResult {
    const PROBE: ProbeId = ProbeId::VolumeEncryption;
    let command = catalog::encryption_status(&ctx.target.drive);
    let out = ctx.run(PROBE, &command)?;
    if parse::mentions_access_denied(&out.combined()) {
        return Err(ProbeError::AccessDenied {
            probe: PROBE,
            detail: command.cmdline(),
        });
    }
    if out.exit_code != 0 {
        return Err(ProbeError::Command {
            probe: PROBE,
            detail: format!("{} exited with {}", command.cmdline(), out.exit_code),
        });
    }
    let status = parse::encryption_status(&out.stdout);
    let evidence = Evidence::command(command.cmdline(), Some(out.exit_code));
    if status.locked {
        return Ok(Some(
            Finding::new(
                FindingCategory::VolumeEncrypted,
                None,
                format!("{} is encrypted and locked", ctx.target.drive),
                Severity::Critical,
                95,
            )
            .with_evidence(evidence)
            .with_evidence(Evidence::stat("lock_status", "locked")),
        ));
    }
    if status.protection_on {
        return Ok(Some(
            Finding::new(
                FindingCategory::VolumeEncrypted,
                None,
                format!(
                    "{} is encrypted; boot changes may trigger recovery-key prompts",
                    ctx.target.drive
                ),
                Severity::Info,
                90,
            )
            .with_evidence(evidence)
            .with_evidence(Evidence::stat("protection_status", "on")),
        ));
    }
    Ok(None)
}

pub fn discover_partition(ctx: &ProbeContext<'_>) -> Result<Option<BootPartition>, ProbeError> {
    const PROBE: ProbeId = ProbeId::BootPartitionDiscovery;
    let command = catalog::partition_query(ctx.target.letter());
    let out = ctx.run(PROBE, &command)?;
    if parse::mentions_access_denied(&out.combined()) {
        return Err(ProbeError::AccessDenied {
            probe: PROBE,
            detail: command.program.clone(),
        });
    }
    if out.exit_code != 0 {
        return Err(ProbeError::Command {
            probe: PROBE,
            detail: format!("partition query exited with {}", out.exit_code),
        });
    }
    Ok(parse::partition_query(&out.stdout).into_iter().next())
}

fn boot_partition_discovery(ctx: &ProbeContext<'_>, facts: &mut ScanFacts) -> ProbeResult {
    match discover_partition(ctx)? {
        Some(partition) => {
            facts.boot_partition = Some(partition);
            Ok(None)
        }
        None => Ok(Some(
            Finding::new(
                FindingCategory::PartitionNotFound,
                None,
                format!("No boot partition on the disk holding {}", ctx.target.drive),
                Severity::Critical,
                90,
            )
            .with_evidence(Evidence::stat("gpt_type", catalog::ESP_GPT_TYPE)),
        )),
    }
}

fn blocked(probe: ProbeId) -> ProbeError {
    ProbeError::Blocked {
        probe,
        requires: "boot partition",
    }
}

fn boot_partition_mount(facts: &ScanFacts) -> ProbeResult {
    let partition = facts
        .boot_partition
        .as_ref()
        .ok_or_else(|| blocked(ProbeId::BootPartitionMount))?;
    if partition.drive.is_some() {
        return Ok(None);
    }
    let mut finding = Finding::new(
        FindingCategory::PartitionNotMounted,
        None,
        "Boot partition has no drive letter",
        Severity::Critical,
        95,
    );
    if let Some(path) = &partition.volume_path {
        finding = finding.with_evidence(Evidence::stat("volume_path", path.as_str()));
    }
    Ok(Some(finding))
}

fn boot_partition_filesystem(facts: &ScanFacts) -> ProbeResult {
    let partition = facts
        .boot_partition
        .as_ref()
        .ok_or_else(|| blocked(ProbeId::BootPartitionFileSystem))?;
    if partition.is_fat32() {
        return Ok(None);
    }
    let fs = partition.file_system.as_deref().unwrap_or("RAW");
    Ok(Some(
        Finding::new(
            FindingCategory::PartitionFileSystemInvalid,
            None,
            format!("Boot partition is {fs}, expected FAT32"),
            Severity::Critical,
            85,
        )
        .with_evidence(Evidence::stat("file_system", fs)),
    ))
}

fn boot_store(ctx: &ProbeContext<'_>, facts: &mut ScanFacts) -> ProbeResult {
    const PROBE: ProbeId = ProbeId::BootStore;
    let root = facts.partition_root().ok_or_else(|| blocked(PROBE))?;
    let path = win_join(root, catalog::STORE);

    let Some(size) = ctx.stat(PROBE, &path)? else {
        return Ok(Some(
            Finding::new(
                FindingCategory::StoreMissing,
                None,
                "Boot store is missing",
                Severity::Critical,
                95,
            )
            .with_evidence(Evidence::path(&path, false, None)),
        ));
    };

    let command = catalog::store_enumeration(&path);
    let out = ctx.run(PROBE, &command)?;
    if parse::mentions_access_denied(&out.combined()) {
        return Err(ProbeError::AccessDenied {
            probe: PROBE,
            detail: command.cmdline(),
        });
    }
    let listing = parse::store_enumeration(&out.stdout);
    if out.exit_code != 0 || listing.entries.is_empty() || size < ctx.settings.min_store_bytes {
        return Ok(Some(
            Finding::new(
                FindingCategory::StoreCorrupt,
                None,
                "Boot store cannot be enumerated",
                Severity::Critical,
                if out.exit_code != 0 { 90 } else { 75 },
            )
            .with_evidence(Evidence::path(&path, true, Some(size)))
            .with_evidence(Evidence::command(command.cmdline(), Some(out.exit_code)))
            .with_evidence(Evidence::stat("entries", listing.entries.len().to_string())),
        ));
    }

    facts.boot_store = Some(BootStore {
        path,
        readable: true,
        entries: listing.entries,
        default_entry_id: listing.default_entry_id,
    });
    Ok(None)
}

fn firmware_mode(ctx: &ProbeContext<'_>, facts: &ScanFacts) -> ProbeResult {
    let store = facts.boot_store.as_ref().ok_or(ProbeError::Blocked {
        probe: ProbeId::FirmwareMode,
        requires: "boot store",
    })?;
    let Some(loader) = store.default_entry().and_then(|e| e.path.as_deref()) else {
        return Ok(None);
    };
    let lower = loader.to_ascii_lowercase();
    let mismatch = match ctx.env.firmware {
        Firmware::Uefi => lower.ends_with(".exe"),
        Firmware::Bios => lower.ends_with(".efi"),
        Firmware::Unknown => false,
    };
    if !mismatch {
        return Ok(None);
    }
    Ok(Some(
        Finding::new(
            FindingCategory::FirmwareModeMismatch,
            None,
            format!("Default entry loads {loader} under {} firmware", ctx.env.firmware),
            Severity::Warning,
            80,
        )
        .with_evidence(Evidence::stat("default_loader", loader))
        .with_evidence(Evidence::stat("firmware", ctx.env.firmware.to_string())),
    ))
}

/// Exists and at least `min` bytes.
fn check_file(
    ctx: &ProbeContext<'_>,
    probe: ProbeId,
    path: &str,
    min: u64,
) -> Result<(bool, Evidence), ProbeError> {
    let size = ctx.stat(probe, path)?;
    let ok = size.is_some_and(|s| s >= min);
    Ok((ok, Evidence::path(path, size.is_some(), size)))
}

fn system_loader(ctx: &ProbeContext<'_>) -> ProbeResult {
    let path = win_join(&ctx.target.drive, catalog::SYSTEM_LOADER);
    let (ok, evidence) = check_file(
        ctx,
        ProbeId::SystemLoader,
        &path,
        ctx.settings.min_loader_bytes,
    )?;
    if ok {
        return Ok(None);
    }
    Ok(Some(
        Finding::new(
            FindingCategory::LoaderFileMissingInSystem,
            Some("winload.efi"),
            "OS loader is missing from the system volume",
            Severity::Critical,
            90,
        )
        .with_evidence(evidence),
    ))
}

fn boot_manager_source(ctx: &ProbeContext<'_>, facts: &mut ScanFacts) -> ProbeResult {
    let path = win_join(&ctx.target.drive, catalog::BOOT_MANAGER_SOURCE);
    let (ok, evidence) = check_file(
        ctx,
        ProbeId::BootManagerSource,
        &path,
        ctx.settings.min_loader_bytes,
    )?;
    facts.boot_manager_source_present = Some(ok);
    if ok {
        return Ok(None);
    }
    Ok(Some(
        Finding::new(
            FindingCategory::LoaderFileMissingInSystem,
            Some("bootmgfw.efi"),
            "Boot manager source is missing from the system volume",
            Severity::Critical,
            90,
        )
        .with_evidence(evidence),
    ))
}

fn partition_loader(ctx: &ProbeContext<'_>, facts: &ScanFacts) -> ProbeResult {
    const PROBE: ProbeId = ProbeId::PartitionLoader;
    let root = facts.partition_root().ok_or_else(|| blocked(PROBE))?;
    let path = win_join(root, catalog::PARTITION_LOADER);
    let (ok, evidence) = check_file(ctx, PROBE, &path, ctx.settings.min_loader_bytes)?;
    if ok {
        return Ok(None);
    }
    Ok(Some(
        Finding::new(
            FindingCategory::LoaderFileMissingInBootPartition,
            None,
            "Boot manager is missing from the boot partition",
            Severity::Critical,
            90,
        )
        .with_evidence(evidence),
    ))
}

fn storage_drivers(ctx: &ProbeContext<'_>) -> ProbeResult {
    let mut missing = Vec::new();
    for name in &ctx.settings.required_drivers {
        let path = win_join(&ctx.target.drive, &format!("{}\\{name}", catalog::DRIVERS_DIR));
        let (ok, evidence) = check_file(ctx, ProbeId::StorageDrivers, &path, 1)?;
        if !ok {
            missing.push((name.as_str(), evidence));
        }
    }
    if missing.is_empty() {
        return Ok(None);
    }
    let names: Vec<&str> = missing.iter().map(|(n, _)| *n).collect();
    let mut finding = Finding::new(
        FindingCategory::DriverMissing,
        None,
        format!("Boot-critical storage drivers missing: {}", names.join(", ")),
        Severity::Critical,
        85,
    );
    for (_, evidence) in missing {
        finding = finding.with_evidence(evidence);
    }
    Ok(Some(finding))
}
