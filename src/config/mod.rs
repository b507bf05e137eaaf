use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{EnvironmentKind, Firmware, Tier, normalize_drive};
use crate::engine::{EngineSettings, RepairSettings};
use crate::platform::HostEnvironment;
use crate::probes::ProbeSettings;

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub repair: RepairConfig,
    pub probe: ProbeConfig,
    pub command: CommandConfig,
    pub session: SessionConfig,
    pub environment: EnvironmentConfig,
    pub ui: UiConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairConfig {
    pub max_tier: Tier,
    pub prefer_reversible: bool,
    pub confirm_phrase: String,
    pub backup_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_media: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeConfig {
    pub min_loader_bytes: u64,
    pub min_store_bytes: u64,
    pub required_drivers: Vec<String>,
    pub mount_letter: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandConfig {
    pub timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentConfig {
    pub kind: KindSetting,
    pub firmware: FirmwareSetting,
}

#[derive(Debug, Clone, Serialize)]
pub struct UiConfig {
    pub color: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindSetting {
    Auto,
    Live,
    Recovery,
}

impl FromStr for KindSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(KindSetting::Auto),
            "live" => Ok(KindSetting::Live),
            "recovery" => Ok(KindSetting::Recovery),
            other => Err(format!(
                "invalid environment kind: {other} (expected auto|live|recovery)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareSetting {
    Auto,
    Uefi,
    Bios,
}

impl FromStr for FirmwareSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(FirmwareSetting::Auto),
            "uefi" => Ok(FirmwareSetting::Uefi),
            "bios" => Ok(FirmwareSetting::Bios),
            other => Err(format!(
                "invalid firmware: {other} (expected auto|uefi|bios)"
            )),
        }
    }
}

impl EffectiveConfig {
    pub fn defaults(home_dir: &Path) -> Self {
        let probe = ProbeSettings::default();
        Self {
            repair: RepairConfig {
                max_tier: Tier::MAX,
                prefer_reversible: true,
                confirm_phrase: "WIPE BOOT PARTITION".to_string(),
                backup_dir: home_dir
                    .join(".config/bootmend/backups")
                    .display()
                    .to_string(),
                install_media: None,
            },
            probe: ProbeConfig {
                min_loader_bytes: probe.min_loader_bytes,
                min_store_bytes: probe.min_store_bytes,
                required_drivers: probe.required_drivers,
                mount_letter: "S:".to_string(),
            },
            command: CommandConfig {
                timeout_secs: 120,
                probe_timeout_secs: probe.timeout.as_secs(),
            },
            session: SessionConfig { lock_dir: None },
            environment: EnvironmentConfig {
                kind: KindSetting::Auto,
                firmware: FirmwareSetting::Auto,
            },
            ui: UiConfig { color: true },
            config_path: None,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            repair: RepairSettings {
                max_tier: self.repair.max_tier,
                prefer_reversible: self.repair.prefer_reversible,
                confirm_phrase: self.repair.confirm_phrase.clone(),
                backup_dir: self.repair.backup_dir.clone(),
                install_media: self.repair.install_media.clone(),
            },
            probe: ProbeSettings {
                min_loader_bytes: self.probe.min_loader_bytes,
                min_store_bytes: self.probe.min_store_bytes,
                required_drivers: self.probe.required_drivers.clone(),
                timeout: Duration::from_secs(self.command.probe_timeout_secs),
            },
            command_timeout: Duration::from_secs(self.command.timeout_secs),
            mount_letter: self.probe.mount_letter.clone(),
            lock_dir: self.session.lock_dir.as_ref().map(PathBuf::from),
        }
    }

    pub fn host_environment(&self) -> HostEnvironment {
        HostEnvironment {
            kind_override: match self.environment.kind {
                KindSetting::Auto => None,
                KindSetting::Live => Some(EnvironmentKind::LiveRunningOs),
                KindSetting::Recovery => Some(EnvironmentKind::PreBootRecovery),
            },
            firmware_override: match self.environment.firmware {
                FirmwareSetting::Auto => None,
                FirmwareSetting::Uefi => Some(Firmware::Uefi),
                FirmwareSetting::Bios => Some(Firmware::Bios),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    repair: Option<RawRepairConfig>,
    probe: Option<RawProbeConfig>,
    command: Option<RawCommandConfig>,
    session: Option<RawSessionConfig>,
    environment: Option<RawEnvironmentConfig>,
    ui: Option<RawUiConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRepairConfig {
    max_tier: Option<u8>,
    prefer_reversible: Option<bool>,
    confirm_phrase: Option<String>,
    backup_dir: Option<String>,
    install_media: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProbeConfig {
    min_loader_bytes: Option<u64>,
    min_store_bytes: Option<u64>,
    required_drivers: Option<Vec<String>>,
    mount_letter: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCommandConfig {
    timeout_secs: Option<u64>,
    probe_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSessionConfig {
    lock_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEnvironmentConfig {
    kind: Option<KindSetting>,
    firmware: Option<FirmwareSetting>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawUiConfig {
    color: Option<bool>,
}

pub fn default_config_path(home_dir: &Path) -> PathBuf {
    home_dir.join(".config/bootmend/config.toml")
}

pub fn load(config_path: Option<&Path>, home_dir: &Path) -> Result<EffectiveConfig> {
    let mut cfg = EffectiveConfig::defaults(home_dir);

    let path = config_path
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| default_config_path(home_dir));

    if path.exists() {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let raw: RawConfig = toml::from_str(&s)
            .with_context(|| format!("failed to parse config file (TOML): {}", path.display()))?;
        apply_raw_config(&mut cfg, raw)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        cfg.config_path = Some(path.display().to_string());
    }

    apply_env_overrides(&mut cfg)?;

    Ok(cfg)
}

fn apply_raw_config(cfg: &mut EffectiveConfig, raw: RawConfig) -> Result<()> {
    if let Some(repair) = raw.repair {
        if let Some(max_tier) = repair.max_tier {
            cfg.repair.max_tier = parse_tier(max_tier).context("repair.max_tier")?;
        }
        if let Some(prefer_reversible) = repair.prefer_reversible {
            cfg.repair.prefer_reversible = prefer_reversible;
        }
        if let Some(phrase) = repair.confirm_phrase {
            cfg.repair.confirm_phrase = non_empty(&phrase).context("repair.confirm_phrase")?;
        }
        if let Some(backup_dir) = repair.backup_dir {
            cfg.repair.backup_dir = non_empty(&backup_dir).context("repair.backup_dir")?;
        }
        if let Some(media) = repair.install_media {
            cfg.repair.install_media = Some(non_empty(&media).context("repair.install_media")?);
        }
    }

    if let Some(probe) = raw.probe {
        if let Some(n) = probe.min_loader_bytes {
            cfg.probe.min_loader_bytes = n;
        }
        if let Some(n) = probe.min_store_bytes {
            cfg.probe.min_store_bytes = n;
        }
        if let Some(drivers) = probe.required_drivers {
            cfg.probe.required_drivers = drivers;
        }
        if let Some(letter) = probe.mount_letter {
            cfg.probe.mount_letter = parse_drive(&letter).context("probe.mount_letter")?;
        }
    }

    if let Some(command) = raw.command {
        if let Some(secs) = command.timeout_secs {
            cfg.command.timeout_secs = parse_secs(secs).context("command.timeout_secs")?;
        }
        if let Some(secs) = command.probe_timeout_secs {
            cfg.command.probe_timeout_secs =
                parse_secs(secs).context("command.probe_timeout_secs")?;
        }
    }

    if let Some(session) = raw.session {
        if let Some(dir) = session.lock_dir {
            cfg.session.lock_dir = Some(non_empty(&dir).context("session.lock_dir")?);
        }
    }

    if let Some(environment) = raw.environment {
        if let Some(kind) = environment.kind {
            cfg.environment.kind = kind;
        }
        if let Some(firmware) = environment.firmware {
            cfg.environment.firmware = firmware;
        }
    }

    if let Some(ui) = raw.ui {
        if let Some(color) = ui.color {
            cfg.ui.color = color;
        }
    }

    Ok(())
}

fn apply_env_overrides(cfg: &mut EffectiveConfig) -> Result<()> {
    if let Ok(v) = std::env::var("BOOTMEND_REPAIR_MAX_TIER") {
        let n = v
            .trim()
            .parse::<u8>()
            .with_context(|| "BOOTMEND_REPAIR_MAX_TIER")?;
        cfg.repair.max_tier = parse_tier(n).with_context(|| "BOOTMEND_REPAIR_MAX_TIER")?;
    }
    if let Ok(v) = std::env::var("BOOTMEND_REPAIR_PREFER_REVERSIBLE") {
        cfg.repair.prefer_reversible =
            parse_bool(&v).with_context(|| "BOOTMEND_REPAIR_PREFER_REVERSIBLE")?;
    }
    if let Ok(v) = std::env::var("BOOTMEND_REPAIR_INSTALL_MEDIA") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.repair.install_media = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("BOOTMEND_COMMAND_TIMEOUT_SECS") {
        let n = v
            .trim()
            .parse::<u64>()
            .with_context(|| "BOOTMEND_COMMAND_TIMEOUT_SECS")?;
        cfg.command.timeout_secs = parse_secs(n).with_context(|| "BOOTMEND_COMMAND_TIMEOUT_SECS")?;
    }
    if let Ok(v) = std::env::var("BOOTMEND_ENVIRONMENT_KIND") {
        cfg.environment.kind = v
            .parse::<KindSetting>()
            .map_err(anyhow::Error::msg)
            .with_context(|| "BOOTMEND_ENVIRONMENT_KIND")?;
    }
    if let Ok(v) = std::env::var("BOOTMEND_ENVIRONMENT_FIRMWARE") {
        cfg.environment.firmware = v
            .parse::<FirmwareSetting>()
            .map_err(anyhow::Error::msg)
            .with_context(|| "BOOTMEND_ENVIRONMENT_FIRMWARE")?;
    }
    if let Ok(v) = std::env::var("BOOTMEND_SESSION_LOCK_DIR") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.session.lock_dir = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("BOOTMEND_UI_COLOR") {
        cfg.ui.color = parse_bool(&v).with_context(|| "BOOTMEND_UI_COLOR")?;
    }

    Ok(())
}

fn parse_tier(n: u8) -> Result<Tier> {
    Tier::new(n).ok_or_else(|| {
        anyhow::anyhow!(
            "tier out of range: {n} (expected {}..={})",
            Tier::MIN.get(),
            Tier::MAX.get()
        )
    })
}

fn parse_secs(n: u64) -> Result<u64> {
    if n == 0 {
        return Err(anyhow::anyhow!("timeout must be at least 1 second"));
    }
    Ok(n)
}

fn parse_drive(s: &str) -> Result<String> {
    normalize_drive(s).ok_or_else(|| anyhow::anyhow!("not a drive letter: {s:?}"))
}

fn non_empty(s: &str) -> Result<String> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow::anyhow!("value must not be empty"));
    }
    Ok(s.to_string())
}

pub fn parse_bool(s: &str) -> Result<bool> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow::anyhow!(
            "invalid boolean: {s} (expected true|false|1|0|yes|no|on|off)"
        )),
    }
}
