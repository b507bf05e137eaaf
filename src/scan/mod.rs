use serde::Serialize;

use crate::core::{Environment, Finding, ScanReport, TargetVolume, sort_findings};
use crate::probes::{ProbeContext, ProbeError, ProbeId, ProbeOutcome, ScanFacts};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanOutcome {
    pub findings: Vec<Finding>,
    #[serde(skip)]
    pub probe_errors: Vec<ProbeError>,
    pub facts: ScanFacts,
}

impl ScanOutcome {
    pub fn actionable(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.is_actionable())
    }

    pub fn finding(&self, id: &str) -> Option<&Finding> {
        self.findings.iter().find(|f| f.id == id)
    }

    pub fn errors_for(&self, probes: &[ProbeId]) -> impl Iterator<Item = &ProbeError> {
        self.probe_errors
            .iter()
            .filter(move |e| probes.contains(&e.probe()))
    }

    pub fn report(
        &self,
        target: &TargetVolume,
        env: &Environment,
        generated_at: String,
    ) -> ScanReport {
        ScanReport {
            schema_version: "1.0".to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            generated_at,
            target: target.clone(),
            environment: env.clone(),
            findings: self.findings.clone(),
            probe_errors: self.probe_errors.iter().map(ProbeError::record).collect(),
        }
    }
}

pub fn scan(ctx: &ProbeContext<'_>) -> ScanOutcome {
    run_probes(ctx, &ProbeId::ALL)
}

/// Runs `probes` plus whatever they depend on, in dependency order.
pub fn scan_subset(ctx: &ProbeContext<'_>, probes: &[ProbeId]) -> ScanOutcome {
    run_probes(ctx, &with_prerequisites(probes))
}

pub fn with_prerequisites(probes: &[ProbeId]) -> Vec<ProbeId> {
    let mut wanted: Vec<ProbeId> = probes.to_vec();
    let mut i = 0;
    while i < wanted.len() {
        for dep in wanted[i].requires() {
            if !wanted.contains(dep) {
                wanted.push(*dep);
            }
        }
        i += 1;
    }
    ProbeId::ALL
        .into_iter()
        .filter(|p| wanted.contains(p))
        .collect()
}

fn run_probes(ctx: &ProbeContext<'_>, probes: &[ProbeId]) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();
    for probe in probes {
        match probe.run(ctx, &mut outcome.facts) {
            ProbeOutcome::Healthy => {}
            ProbeOutcome::Issue(finding) => outcome.findings.push(finding),
            ProbeOutcome::Inconclusive(err) => outcome.probe_errors.push(err),
        }
    }
    sort_findings(&mut outcome.findings);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EnvironmentKind, FindingCategory, Firmware};
    use crate::platform::CommandOutput;
    use crate::platform::memory::{MemoryFiles, ScriptedRunner};
    use crate::probes::ProbeSettings;

    fn healthy_files() -> MemoryFiles {
        let files = MemoryFiles::new();
        let big = vec![b'M'; 70 * 1024];
        files.put("C:\\Windows\\System32\\winload.efi", big.clone());
        files.put("C:\\Windows\\Boot\\EFI\\bootmgfw.efi", big.clone());
        files.put("C:\\Windows\\System32\\drivers\\stornvme.sys", "MZ");
        files.put("C:\\Windows\\System32\\drivers\\storahci.sys", "MZ");
        files.put("S:\\EFI\\Microsoft\\Boot\\bootmgfw.efi", big);
        files.put("S:\\EFI\\Microsoft\\Boot\\BCD", vec![0u8; 16 * 1024]);
        files
    }

    fn runner() -> ScriptedRunner {
        ScriptedRunner::new()
            .respond(|c| {
                (c.program == "powershell").then(|| Ok(CommandOutput::ok("ESP|S|FAT32|S:\\\n")))
            })
            .respond(|c| {
                (c.program == "bcdedit").then(|| {
                    Ok(CommandOutput::ok(
                        "Windows Boot Manager\n----\nidentifier {bootmgr}\ndefault {default}\n\nWindows Boot Loader\n----\nidentifier {default}\npath \\Windows\\system32\\winload.efi\n",
                    ))
                })
            })
            .respond(|c| {
                (c.program == "manage-bde")
                    .then(|| Ok(CommandOutput::ok("Protection Status: Protection Off\n")))
            })
    }

    fn scan_with(files: &MemoryFiles, runner: &ScriptedRunner) -> ScanOutcome {
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
        scan(&ctx)
    }

    #[test]
    fn healthy_system_has_no_findings_or_errors() {
        let outcome = scan_with(&healthy_files(), &runner());
        assert!(outcome.findings.is_empty(), "{:?}", outcome.findings);
        assert!(outcome.probe_errors.is_empty(), "{:?}", outcome.probe_errors);
        assert_eq!(outcome.facts.partition_letter(), Some("S:"));
        assert_eq!(outcome.facts.boot_manager_source_present, Some(true));
    }

    #[test]
    fn scanning_twice_yields_the_same_findings() {
        let files = healthy_files();
        files.remove("S:\\EFI\\Microsoft\\Boot\\BCD");
        files.remove("C:\\Windows\\System32\\drivers\\stornvme.sys");
        let runner = runner();
        let first = scan_with(&files, &runner);
        let second = scan_with(&files, &runner);
        assert_eq!(first.findings, second.findings);
        let categories: Vec<_> = first.findings.iter().map(|f| f.category).collect();
        assert_eq!(
            categories,
            vec![FindingCategory::StoreMissing, FindingCategory::DriverMissing]
        );
    }

    #[test]
    fn prerequisites_are_pulled_in_and_ordered() {
        assert_eq!(
            with_prerequisites(&[ProbeId::FirmwareMode, ProbeId::Elevation]),
            vec![
                ProbeId::Elevation,
                ProbeId::BootPartitionDiscovery,
                ProbeId::BootStore,
                ProbeId::FirmwareMode
            ]
        );
    }
}
