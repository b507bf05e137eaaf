use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::{ExecutionEvent, SessionReport};

pub const MAX_CMD_OUTPUT_BYTES: usize = 64 * 1024;

pub trait Logger: Send + Sync {
    fn append(&self, session_id: &str, target: &str, event: &ExecutionEvent);
}

#[derive(Debug, Serialize)]
struct LogLine<'a> {
    at: String,
    session_id: &'a str,
    target: &'a str,
    event: &'a ExecutionEvent,
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

pub fn logs_dir(home_dir: &Path) -> PathBuf {
    home_dir.join(".config/bootmend/logs")
}

/// One JSON object per line, appended as events happen.
#[derive(Debug)]
pub struct JsonLinesLog {
    path: PathBuf,
    file: Mutex<File>,
    last_error: Mutex<Option<String>>,
}

impl JsonLinesLog {
    pub fn create(home_dir: &Path) -> Result<Self> {
        let dir = logs_dir(home_dir);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create log directory: {}", dir.display()))?;
        let pid = std::process::id();
        let ts = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let path = dir.join(format!("session-{pid}-{ts}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            last_error: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Logger for JsonLinesLog {
    fn append(&self, session_id: &str, target: &str, event: &ExecutionEvent) {
        let line = LogLine {
            at: now_rfc3339(),
            session_id,
            target,
            event,
        };
        let result = serde_json::to_vec(&line)
            .map_err(|err| err.to_string())
            .and_then(|mut bytes| {
                bytes.push(b'\n');
                let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
                file.write_all(&bytes).map_err(|err| err.to_string())
            });
        if let Err(err) = result {
            *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
        }
    }
}

/// Keeps events in memory, serialized the same way as on disk.
#[derive(Debug, Default)]
pub struct MemoryLog {
    lines: Mutex<Vec<serde_json::Value>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<serde_json::Value> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Logger for MemoryLog {
    fn append(&self, session_id: &str, target: &str, event: &ExecutionEvent) {
        let line = LogLine {
            at: now_rfc3339(),
            session_id,
            target,
            event,
        };
        if let Ok(value) = serde_json::to_value(&line) {
            self.lines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(value);
        }
    }
}

#[derive(Debug, Default)]
pub struct NullLog;

impl Logger for NullLog {
    fn append(&self, _session_id: &str, _target: &str, _event: &ExecutionEvent) {}
}

pub fn write_session_report(home_dir: &Path, report: &SessionReport) -> Result<PathBuf> {
    let dir = logs_dir(home_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;
    let pid = std::process::id();
    let ts = OffsetDateTime::now_utc().unix_timestamp_nanos();
    let path = dir.join(format!("report-{pid}-{ts}.json"));
    let bytes = serde_json::to_vec_pretty(report).context("failed to serialize report")?;
    std::fs::write(&path, bytes)
        .with_context(|| format!("failed to write report: {}", path.display()))?;
    Ok(path)
}

pub fn truncate_output(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut idx = max_bytes;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx = idx.saturating_sub(1);
    }
    let head = &s[..idx];
    format!("{head}\n...(truncated, total={} bytes)", s.len())
}
