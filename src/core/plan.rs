use serde::{Deserialize, Serialize};

use crate::core::{RemediationStep, TargetVolume, Tier};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTier {
    pub tier: Tier,
    pub steps: Vec<RemediationStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairPlan {
    pub target: TargetVolume,
    pub tiers: Vec<PlannedTier>,
}

impl RepairPlan {
    pub fn empty(target: TargetVolume) -> Self {
        Self {
            target,
            tiers: Vec::new(),
        }
    }

    pub fn tier(&self, tier: Tier) -> Option<&PlannedTier> {
        self.tiers.iter().find(|t| t.tier == tier)
    }

    pub fn steps(&self) -> impl Iterator<Item = &RemediationStep> {
        self.tiers.iter().flat_map(|t| t.steps.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(|t| t.steps.is_empty())
    }

    pub fn lowest_tier(&self) -> Option<Tier> {
        self.tiers
            .iter()
            .filter(|t| !t.steps.is_empty())
            .map(|t| t.tier)
            .min()
    }
}
