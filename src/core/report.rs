use serde::{Deserialize, Serialize};

use crate::core::{
    Environment, ExecutionResult, Finding, SessionMode, SessionState, TargetVolume, Tier,
    TierFailure, TierSkip,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeErrorRecord {
    pub probe: String,
    pub kind: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub schema_version: String,
    pub tool_version: String,
    pub generated_at: String,
    pub target: TargetVolume,
    pub environment: Environment,
    pub findings: Vec<Finding>,
    pub probe_errors: Vec<ProbeErrorRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRecord {
    pub tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<TierSkip>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TierFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub schema_version: String,
    pub tool_version: String,
    pub session_id: String,
    pub generated_at: String,
    pub target: TargetVolume,
    pub mode: SessionMode,
    pub environment: Environment,
    pub state: SessionState,
    pub findings: Vec<Finding>,
    pub probe_errors: Vec<ProbeErrorRecord>,
    pub tiers: Vec<TierRecord>,
    pub steps_applied: Vec<ExecutionResult>,
    pub resolved: Vec<String>,
    pub remaining_issues: Vec<Finding>,
    pub false_positives: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cause_hypothesis: Option<String>,
    pub manual_commands: Vec<String>,
    pub notes: Vec<String>,
}
