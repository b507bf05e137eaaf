use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::Evidence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingCategory {
    PermissionDenied,
    VolumeEncrypted,
    PartitionNotFound,
    PartitionNotMounted,
    PartitionFileSystemInvalid,
    StoreMissing,
    StoreCorrupt,
    FirmwareModeMismatch,
    LoaderFileMissingInSystem,
    LoaderFileMissingInBootPartition,
    DriverMissing,
}

impl FindingCategory {
    pub const ALL: [FindingCategory; 11] = [
        FindingCategory::PermissionDenied,
        FindingCategory::VolumeEncrypted,
        FindingCategory::PartitionNotFound,
        FindingCategory::PartitionNotMounted,
        FindingCategory::PartitionFileSystemInvalid,
        FindingCategory::StoreMissing,
        FindingCategory::StoreCorrupt,
        FindingCategory::FirmwareModeMismatch,
        FindingCategory::LoaderFileMissingInSystem,
        FindingCategory::LoaderFileMissingInBootPartition,
        FindingCategory::DriverMissing,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            FindingCategory::PermissionDenied => "PERMISSION_DENIED",
            FindingCategory::VolumeEncrypted => "VOLUME_ENCRYPTED",
            FindingCategory::PartitionNotFound => "PARTITION_NOT_FOUND",
            FindingCategory::PartitionNotMounted => "PARTITION_NOT_MOUNTED",
            FindingCategory::PartitionFileSystemInvalid => "PARTITION_FILE_SYSTEM_INVALID",
            FindingCategory::StoreMissing => "STORE_MISSING",
            FindingCategory::StoreCorrupt => "STORE_CORRUPT",
            FindingCategory::FirmwareModeMismatch => "FIRMWARE_MODE_MISMATCH",
            FindingCategory::LoaderFileMissingInSystem => "LOADER_FILE_MISSING_IN_SYSTEM",
            FindingCategory::LoaderFileMissingInBootPartition => {
                "LOADER_FILE_MISSING_IN_BOOT_PARTITION"
            }
            FindingCategory::DriverMissing => "DRIVER_MISSING",
        }
    }

    pub const fn slug(self) -> &'static str {
        match self {
            FindingCategory::PermissionDenied => "permission-denied",
            FindingCategory::VolumeEncrypted => "volume-encrypted",
            FindingCategory::PartitionNotFound => "partition-not-found",
            FindingCategory::PartitionNotMounted => "partition-not-mounted",
            FindingCategory::PartitionFileSystemInvalid => "partition-fs-invalid",
            FindingCategory::StoreMissing => "store-missing",
            FindingCategory::StoreCorrupt => "store-corrupt",
            FindingCategory::FirmwareModeMismatch => "firmware-mismatch",
            FindingCategory::LoaderFileMissingInSystem => "system-loader-missing",
            FindingCategory::LoaderFileMissingInBootPartition => "partition-loader-missing",
            FindingCategory::DriverMissing => "driver-missing",
        }
    }

    /// Categories that no remediation step can clear; they block or stop a session.
    pub const fn is_blocking(self) -> bool {
        matches!(
            self,
            FindingCategory::PermissionDenied
                | FindingCategory::VolumeEncrypted
                | FindingCategory::PartitionNotFound
        )
    }
}

impl fmt::Display for FindingCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub category: FindingCategory,
    pub title: String,
    pub severity: Severity,
    pub confidence: u8,
    pub evidence: Vec<Evidence>,
}

impl Finding {
    pub fn new(
        category: FindingCategory,
        subject: Option<&str>,
        title: impl Into<String>,
        severity: Severity,
        confidence: u8,
    ) -> Self {
        let id = match subject {
            Some(subject) => format!("{}:{}", category.slug(), subject.to_ascii_lowercase()),
            None => category.slug().to_string(),
        };
        Self {
            id,
            category,
            title: title.into(),
            severity,
            confidence: confidence.min(100),
            evidence: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence.push(evidence);
        self
    }

    pub fn is_actionable(&self) -> bool {
        self.severity != Severity::Info
    }

    pub fn evidence_paths(&self) -> impl Iterator<Item = &str> {
        self.evidence.iter().filter_map(|e| match e {
            Evidence::Path { path, .. } => Some(path.as_str()),
            _ => None,
        })
    }
}

pub fn sort_findings(findings: &mut Vec<Finding>) {
    findings.sort_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then(a.category.cmp(&b.category))
            .then(a.id.cmp(&b.id))
    });
    findings.dedup_by(|a, b| a.id == b.id);
}
