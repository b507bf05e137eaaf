use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::core::RiskLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tier(u8);

impl Tier {
    pub const MIN: Tier = Tier(1);
    pub const MAX: Tier = Tier(5);
    /// Highest tier scheduled up front; tiers above it are fallback only.
    pub const SCHEDULED_MAX: Tier = Tier(3);

    pub const fn new(n: u8) -> Option<Tier> {
        if n >= 1 && n <= 5 { Some(Tier(n)) } else { None }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub fn next(self) -> Option<Tier> {
        Tier::new(self.0 + 1)
    }

    pub fn is_fallback(self) -> bool {
        self > Tier::SCHEDULED_MAX
    }

    pub fn range(from: Tier, to: Tier) -> impl Iterator<Item = Tier> {
        (from.0..=to.0).map(Tier)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepTemplate {
    MountBootPartition,
    CopyBootManager,
    ComponentStoreRepair,
    SystemFileCheck,
    ReformatBootPartition,
    RemoveCorruptStore,
    CreateStore,
    RegenerateBootFiles,
    MediaRestoreHealth,
    ForceWipeFormat,
    ForceWipeRebuild,
}

impl StepTemplate {
    pub const fn slug(self) -> &'static str {
        match self {
            StepTemplate::MountBootPartition => "mount-boot-partition",
            StepTemplate::CopyBootManager => "copy-boot-manager",
            StepTemplate::ComponentStoreRepair => "component-store-repair",
            StepTemplate::SystemFileCheck => "system-file-check",
            StepTemplate::ReformatBootPartition => "reformat-boot-partition",
            StepTemplate::RemoveCorruptStore => "remove-corrupt-store",
            StepTemplate::CreateStore => "create-store",
            StepTemplate::RegenerateBootFiles => "regenerate-boot-files",
            StepTemplate::MediaRestoreHealth => "media-restore-health",
            StepTemplate::ForceWipeFormat => "force-wipe-format",
            StepTemplate::ForceWipeRebuild => "force-wipe-rebuild",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Placeholder {
    Target,
    TargetLetter,
    Windows,
    Esp,
    Store,
    MountLetter,
    Firmware,
    Backup,
    Media,
}

impl Placeholder {
    pub const ALL: [Placeholder; 9] = [
        Placeholder::Target,
        Placeholder::TargetLetter,
        Placeholder::Windows,
        Placeholder::Esp,
        Placeholder::Store,
        Placeholder::MountLetter,
        Placeholder::Firmware,
        Placeholder::Backup,
        Placeholder::Media,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Placeholder::Target => "target",
            Placeholder::TargetLetter => "target_letter",
            Placeholder::Windows => "windows",
            Placeholder::Esp => "esp",
            Placeholder::Store => "store",
            Placeholder::MountLetter => "mount_letter",
            Placeholder::Firmware => "firmware",
            Placeholder::Backup => "backup",
            Placeholder::Media => "media",
        }
    }

    pub fn from_name(name: &str) -> Option<Placeholder> {
        Placeholder::ALL.into_iter().find(|p| p.name() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("placeholder {{{name}}} has no value")]
    Unresolved { name: &'static str },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    values: BTreeMap<Placeholder, String>,
}

impl Bindings {
    pub fn set(&mut self, key: Placeholder, value: impl Into<String>) {
        self.values.insert(key, value.into());
    }

    pub fn with(mut self, key: Placeholder, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: Placeholder) -> Option<&str> {
        self.values.get(&key).map(String::as_str)
    }

    pub fn remove(&mut self, key: Placeholder) {
        self.values.remove(&key);
    }

    pub fn render(&self, text: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                out.push_str(&rest[open..]);
                return Ok(out);
            };
            let name = &after[..close];
            match Placeholder::from_name(name) {
                Some(p) => match self.get(p) {
                    Some(v) => out.push_str(v),
                    None => return Err(TemplateError::Unresolved { name: p.name() }),
                },
                None => {
                    out.push('{');
                    out.push_str(name);
                    out.push('}');
                }
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Like `render`, but leaves unknown values as `{name}` for display.
    pub fn render_lossy(&self, text: &str) -> String {
        let mut filled = self.clone();
        for p in Placeholder::ALL {
            if filled.get(p).is_none() {
                filled.set(p, format!("<{}>", p.name()));
            }
        }
        filled
            .render(text)
            .unwrap_or_else(|_| text.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
    pub success_codes: Vec<i32>,
}

impl CommandTemplate {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            success_codes: vec![0],
        }
    }

    pub fn with_success_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.success_codes = codes.into_iter().collect();
        self
    }

    pub fn is_success(&self, exit_code: i32) -> bool {
        self.success_codes.contains(&exit_code)
    }

    pub fn uses(&self, placeholder: Placeholder) -> bool {
        let token = format!("{{{}}}", placeholder.name());
        self.args.iter().any(|a| a.contains(&token)) || self.program.contains(&token)
    }

    pub fn resolve(&self, bindings: &Bindings) -> Result<ResolvedCommand, TemplateError> {
        let program = bindings.render(&self.program)?;
        let args = self
            .args
            .iter()
            .map(|a| bindings.render(a))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ResolvedCommand { program, args })
    }

    pub fn preview(&self, bindings: &Bindings) -> String {
        let program = bindings.render_lossy(&self.program);
        let args: Vec<String> = self.args.iter().map(|a| bindings.render_lossy(a)).collect();
        ResolvedCommand { program, args }.cmdline()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ResolvedCommand {
    pub fn cmdline(&self) -> String {
        let mut out = quote_arg(&self.program);
        for arg in &self.args {
            out.push(' ');
            out.push_str(&quote_arg(arg));
        }
        out
    }
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.contains(' ') {
        format!("\"{arg}\"")
    } else {
        arg.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeRole {
    Target,
    BootPartition,
}

/// A step is skipped when its precondition already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precondition {
    PartitionAlreadyMounted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvRequirement {
    Any,
    LiveOnly,
    RecoveryOnly,
    InstallMedia,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupAction {
    pub description: String,
    pub command: CommandTemplate,
    pub artifact: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationStep {
    pub id: String,
    pub tier: Tier,
    pub template: StepTemplate,
    pub title: String,
    pub command: CommandTemplate,
    pub targets: Vec<String>,
    pub touches: Vec<VolumeRole>,
    pub risk: RiskLevel,
    pub destructive: bool,
    pub reversible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precondition: Option<Precondition>,
    pub environment: EnvRequirement,
}

impl RemediationStep {
    pub fn mutates(&self) -> bool {
        self.risk > RiskLevel::R0
    }

    pub fn touches(&self, role: VolumeRole) -> bool {
        self.touches.contains(&role)
    }

    pub fn needs_backup(&self) -> bool {
        self.backup.is_some() && (self.destructive || !self.reversible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_known_placeholders_and_keeps_literal_braces() {
        let b = Bindings::default()
            .with(Placeholder::Windows, "C:\\Windows")
            .with(Placeholder::Esp, "S:");
        let cmd = CommandTemplate::new(
            "bcdboot",
            &["{windows}", "/s", "{esp}", "/d", "{bootmgr}"],
        );
        let resolved = cmd.resolve(&b).unwrap();
        assert_eq!(resolved.args, vec!["C:\\Windows", "/s", "S:", "/d", "{bootmgr}"]);
    }

    #[test]
    fn missing_value_is_an_error() {
        let cmd = CommandTemplate::new("dism", &["/Source:{media}"]);
        let err = cmd.resolve(&Bindings::default()).unwrap_err();
        assert_eq!(err, TemplateError::Unresolved { name: "media" });
        assert!(cmd.uses(Placeholder::Media));
    }

    #[test]
    fn preview_marks_unresolved_values() {
        let cmd = CommandTemplate::new("format", &["{esp}", "/FS:FAT32"]);
        assert_eq!(cmd.preview(&Bindings::default()), "format <esp> /FS:FAT32");
    }

    #[test]
    fn tiers_are_bounded() {
        assert!(Tier::new(0).is_none());
        assert!(Tier::new(6).is_none());
        assert_eq!(Tier::MAX.next(), None);
        assert!(Tier::new(4).unwrap().is_fallback());
        assert!(!Tier::SCHEDULED_MAX.is_fallback());
    }
}
