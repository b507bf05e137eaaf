use serde::Serialize;

use crate::core::{
    Confirmation, Environment, RemediationStep, RiskLevel, TargetVolume, Tier, VolumeRole,
};
use crate::platform::UserPrompt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepAssessment {
    pub step_id: String,
    pub tier: Tier,
    pub static_risk: RiskLevel,
    pub effective_risk: RiskLevel,
    pub live_target: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    pub assessments: Vec<StepAssessment>,
    pub max_risk: RiskLevel,
    pub required: Confirmation,
}

impl GateDecision {
    pub fn summary(&self) -> String {
        let mutating = self
            .assessments
            .iter()
            .filter(|a| a.effective_risk > RiskLevel::R0)
            .count();
        let live = self.assessments.iter().filter(|a| a.live_target).count();
        let mut out = format!(
            "{mutating} step(s) may modify the system; highest risk {} ({})",
            self.max_risk,
            self.max_risk.label()
        );
        if live > 0 {
            out.push_str(&format!(
                "; {live} step(s) write to the volume this system is running from"
            ));
        }
        out
    }
}

/// Risk is the catalog's static risk, raised to R3 for any write that lands on
/// the volume the live system is running from.
pub fn assess_step(
    step: &RemediationStep,
    target: &TargetVolume,
    env: &Environment,
) -> StepAssessment {
    let live_target = step.mutates()
        && env.is_running_system(&target.drive)
        && (step.touches(VolumeRole::Target) || step.touches(VolumeRole::BootPartition));
    let dynamic = if live_target {
        RiskLevel::R3
    } else {
        RiskLevel::R0
    };
    StepAssessment {
        step_id: step.id.clone(),
        tier: step.tier,
        static_risk: step.risk,
        effective_risk: std::cmp::max(step.risk, dynamic),
        live_target,
    }
}

pub fn assess<'s>(
    steps: impl IntoIterator<Item = &'s RemediationStep>,
    target: &TargetVolume,
    env: &Environment,
) -> GateDecision {
    let assessments: Vec<StepAssessment> = steps
        .into_iter()
        .map(|s| assess_step(s, target, env))
        .collect();
    let max_risk = assessments
        .iter()
        .map(|a| a.effective_risk)
        .max()
        .unwrap_or(RiskLevel::R0);
    let required = match max_risk {
        RiskLevel::R0 => Confirmation::NotRequired,
        RiskLevel::R3 => Confirmation::ConfirmWithPhrase,
        risk => Confirmation::Confirm(risk),
    };
    GateDecision {
        assessments,
        max_risk,
        required,
    }
}

pub fn request(decision: &GateDecision, prompt: &dyn UserPrompt, phrase: &str) -> bool {
    let message = decision.summary();
    match decision.required {
        Confirmation::NotRequired => true,
        Confirmation::Confirm(risk) => prompt.confirm(risk, &message),
        Confirmation::ConfirmWithPhrase => prompt.confirm_with_phrase(phrase, &message),
    }
}
