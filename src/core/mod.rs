mod environment;
mod evidence;
mod finding;
mod plan;
mod report;
mod risk;
mod session;
mod step;
mod volume;

pub use environment::{Environment, EnvironmentKind, Firmware};
pub use evidence::Evidence;
pub use finding::{Finding, FindingCategory, Severity, sort_findings};
pub use plan::{PlannedTier, RepairPlan};
pub use report::{ProbeErrorRecord, ScanReport, SessionReport, TierRecord};
pub use risk::RiskLevel;
pub use session::{
    Confirmation, ExecutionEvent, ExecutionResult, SessionMode, SessionState, StepOutcome,
    TierFailure, TierSkip,
};
pub use step::{
    BackupAction, Bindings, CommandTemplate, EnvRequirement, Placeholder, Precondition,
    RemediationStep, ResolvedCommand, StepTemplate, TemplateError, Tier, VolumeRole,
};
pub use volume::{
    BootPartition, BootStore, MountState, StoreEntry, TargetVolume, VolumeHealth,
    normalize_drive, win_join,
};
