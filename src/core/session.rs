use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::{RiskLevel, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    DryRun,
    Apply,
}

impl SessionMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionMode::DryRun => "dry_run",
            SessionMode::Apply => "apply",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "tier", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Planning,
    AwaitingConfirmation,
    ExecutingTier(Tier),
    Verifying(Option<Tier>),
    Escalating(Tier),
    Succeeded,
    Failed,
    Aborted,
    Previewed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Succeeded
                | SessionState::Failed
                | SessionState::Aborted
                | SessionState::Previewed
        )
    }

    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (_, Aborted) => true,
            (Idle, Planning) => true,
            (Planning, AwaitingConfirmation) | (Planning, Previewed) => true,
            (AwaitingConfirmation, ExecutingTier(_))
            | (AwaitingConfirmation, Verifying(None))
            | (AwaitingConfirmation, Failed) => true,
            (ExecutingTier(a), Verifying(Some(b))) => a == b,
            (ExecutingTier(a), Escalating(b)) => a == b,
            (Verifying(_), Succeeded) | (Verifying(_), Failed) => true,
            (Verifying(Some(a)), Escalating(b)) => a == b,
            (Escalating(a), ExecutingTier(b)) => b > a,
            (Escalating(_), Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Planning => f.write_str("planning"),
            SessionState::AwaitingConfirmation => f.write_str("awaiting confirmation"),
            SessionState::ExecutingTier(t) => write!(f, "executing {t}"),
            SessionState::Verifying(Some(t)) => write!(f, "verifying {t}"),
            SessionState::Verifying(None) => f.write_str("verifying"),
            SessionState::Escalating(t) => write!(f, "escalating from {t}"),
            SessionState::Succeeded => f.write_str("succeeded"),
            SessionState::Failed => f.write_str("failed"),
            SessionState::Aborted => f.write_str("aborted"),
            SessionState::Previewed => f.write_str("previewed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failed,
    Inconclusive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TierFailure {
    CommandError { detail: String },
    VerificationMismatch { finding_ids: Vec<String> },
    BackupFailed { detail: String },
}

impl fmt::Display for TierFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierFailure::CommandError { detail } => write!(f, "command error: {detail}"),
            TierFailure::VerificationMismatch { finding_ids } => write!(
                f,
                "commands reported success but {} still present",
                finding_ids.join(", ")
            ),
            TierFailure::BackupFailed { detail } => write!(f, "backup failed: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TierSkip {
    EnvironmentMismatch { detail: String },
    NotApplicable { detail: String },
}

impl fmt::Display for TierSkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierSkip::EnvironmentMismatch { detail } => write!(f, "environment mismatch: {detail}"),
            TierSkip::NotApplicable { detail } => write!(f, "not applicable: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub step_id: String,
    pub tier: Tier,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub raw_output: String,
    pub verified: bool,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TierFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "risk", rename_all = "snake_case")]
pub enum Confirmation {
    NotRequired,
    Confirm(RiskLevel),
    ConfirmWithPhrase,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Transition {
        from: SessionState,
        to: SessionState,
    },
    ProbeInconclusive {
        probe: String,
        detail: String,
    },
    Confirmation {
        required: Confirmation,
        granted: bool,
    },
    Preview {
        tier: Tier,
        step_id: String,
        command: String,
        risk: RiskLevel,
        fallback: bool,
    },
    StepSkipped {
        tier: Tier,
        step_id: String,
        reason: String,
    },
    BackupCompleted {
        tier: Tier,
        step_id: String,
        artifact: String,
    },
    CommandFinished {
        tier: Tier,
        step_id: String,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TierSkipped {
        tier: Tier,
        reason: TierSkip,
    },
    TierFailed {
        tier: Tier,
        failure: TierFailure,
    },
    Verification {
        #[serde(skip_serializing_if = "Option::is_none")]
        tier: Option<Tier>,
        finding_id: String,
        resolved: bool,
        detail: String,
    },
    Result(ExecutionResult),
}
