use crate::catalog::{self, TemplateOptions};
use crate::core::{
    Environment, Finding, FindingCategory, PlannedTier, RemediationStep, RepairPlan,
    StepTemplate, TargetVolume, Tier, VolumeRole,
};
use crate::probes::ScanFacts;
use crate::scan::ScanOutcome;

pub struct Planner<'a> {
    target: &'a TargetVolume,
    max_tier: Tier,
    opts: TemplateOptions,
}

impl<'a> Planner<'a> {
    pub fn new(
        target: &'a TargetVolume,
        env: &Environment,
        max_tier: Tier,
        prefer_reversible: bool,
    ) -> Self {
        Self {
            target,
            max_tier,
            opts: TemplateOptions {
                target_is_running_system: env.is_running_system(&target.drive),
                prefer_reversible,
            },
        }
    }

    pub fn max_tier(&self) -> Tier {
        self.max_tier
    }

    /// Schedules tiers up to the last non-fallback tier; fallback tiers are chosen at run time.
    pub fn plan(&self, scan: &ScanOutcome) -> RepairPlan {
        let findings: Vec<&Finding> = scan.actionable().collect();
        let last = std::cmp::min(Tier::SCHEDULED_MAX, self.max_tier);
        let tiers = Tier::range(Tier::MIN, last)
            .map(|tier| PlannedTier {
                tier,
                steps: self.steps_for(tier, &findings, &scan.facts),
            })
            .filter(|t| !t.steps.is_empty())
            .collect();
        RepairPlan {
            target: self.target.clone(),
            tiers,
        }
    }

    /// What the fallback tiers would run if every finding stayed unresolved.
    pub fn fallback_preview(&self, scan: &ScanOutcome) -> Vec<PlannedTier> {
        let findings: Vec<&Finding> = scan.actionable().collect();
        let Some(first) = Tier::SCHEDULED_MAX.next() else {
            return Vec::new();
        };
        if self.max_tier < first {
            return Vec::new();
        }
        Tier::range(first, self.max_tier)
            .map(|tier| PlannedTier {
                tier,
                steps: self.steps_for(tier, &findings, &scan.facts),
            })
            .filter(|t| !t.steps.is_empty())
            .collect()
    }

    pub fn steps_for(
        &self,
        tier: Tier,
        findings: &[&Finding],
        facts: &ScanFacts,
    ) -> Vec<RemediationStep> {
        let partition_known = facts.boot_partition.is_some();
        let mut steps: Vec<RemediationStep> = Vec::new();

        for finding in findings.iter().filter(|f| f.is_actionable()) {
            for (t, template) in catalog::remedies(finding.category) {
                if *t != tier.get() || !applicable(*template, finding, facts) {
                    continue;
                }
                let mut step = catalog::step(tier, *template, self.opts);
                if step.touches(VolumeRole::BootPartition) && !partition_known {
                    continue;
                }
                step.targets.push(finding.id.clone());
                steps.push(step);
            }
        }

        let needs_mount = facts.partition_letter().is_none()
            && partition_known
            && steps.iter().any(|s| {
                s.touches(VolumeRole::BootPartition)
                    && s.template != StepTemplate::MountBootPartition
            })
            && !steps
                .iter()
                .any(|s| s.template == StepTemplate::MountBootPartition);
        if needs_mount {
            let mut mount = catalog::step(tier, StepTemplate::MountBootPartition, self.opts);
            mount.targets = findings
                .iter()
                .filter(|f| f.category == FindingCategory::PartitionNotMounted)
                .map(|f| f.id.clone())
                .collect();
            steps.push(mount);
        }

        steps.sort_by_key(|s| s.template);
        merge_shared(steps)
    }
}

fn applicable(template: StepTemplate, finding: &Finding, facts: &ScanFacts) -> bool {
    match (template, finding.category) {
        (StepTemplate::CopyBootManager, _) => facts.boot_manager_source_present == Some(true),
        (StepTemplate::MediaRestoreHealth, FindingCategory::LoaderFileMissingInBootPartition) => {
            facts.boot_manager_source_present != Some(true)
        }
        _ => true,
    }
}

/// Steps that would run the same command (or whose work another step already
/// covers) collapse into the earlier one, which inherits their targets.
fn merge_shared(steps: Vec<RemediationStep>) -> Vec<RemediationStep> {
    let mut merged: Vec<RemediationStep> = Vec::new();
    for step in steps {
        let existing = merged.iter_mut().find(|m| {
            m.template == step.template
                || m.command == step.command
                || covers(m.template, step.template)
        });
        match existing {
            Some(m) => {
                for id in step.targets {
                    if !m.targets.contains(&id) {
                        m.targets.push(id);
                    }
                }
            }
            None => merged.push(step),
        }
    }
    merged
}

fn covers(earlier: StepTemplate, later: StepTemplate) -> bool {
    matches!(
        (earlier, later),
        (StepTemplate::ReformatBootPartition, StepTemplate::RemoveCorruptStore)
    )
}
