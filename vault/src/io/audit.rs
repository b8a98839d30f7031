//! Append-only audit log partitioned by UTC day (`Logs/YYYY-MM-DD.json`).
//!
//! Each partition is a JSON array of entries. Entries are never rewritten or
//! removed; a partition that no longer parses is discarded and started fresh
//! so the next write always succeeds.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::atomic::write_json_atomic;
use crate::core::analysis::preview;

/// Well-known actor identifiers.
pub mod actors {
    pub const WATCHER: &str = "watcher";
    pub const TASK_ROUTER: &str = "task_router";
    pub const TASK_AGENT: &str = "task_agent";
    pub const ERROR_RECOVERY: &str = "error_recovery";
    pub const LOOP_CONTROLLER: &str = "loop_controller";
    pub const CLI: &str = "cli";
    pub const CLAUDE: &str = "claude";
}

const DATE_FORMAT: &str = "%Y-%m-%d";
const TARGET_WIDTH: usize = 45;
const EMPTY_TABLE: &str = "_No audit entries recorded yet._";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "approved")]
    Approved,
    #[serde(rename = "rejected")]
    Rejected,
    #[serde(rename = "n_a")]
    NotApplicable,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::NotApplicable => "n_a",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionResult {
    Success,
    Fail,
    Skip,
    Pending,
}

impl ActionResult {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionResult::Success => "success",
            ActionResult::Fail => "fail",
            ActionResult::Skip => "skip",
            ActionResult::Pending => "pending",
        }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action_type: String,
    pub actor: String,
    pub target: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub approval_status: ApprovalStatus,
    pub result: ActionResult,
    #[serde(default)]
    pub error: Option<String>,
}

impl AuditEntry {
    /// A successful, approval-free action stamped with the current time.
    pub fn new(
        action_type: impl Into<String>,
        actor: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            action_type: action_type.into(),
            actor: actor.into(),
            target: target.into(),
            parameters: Map::new(),
            approval_status: ApprovalStatus::NotApplicable,
            result: ActionResult::Success,
            error: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn approval(mut self, status: ApprovalStatus) -> Self {
        self.approval_status = status;
        self
    }

    pub fn result(mut self, result: ActionResult) -> Self {
        self.result = result;
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.result = ActionResult::Fail;
        self.error = Some(error.into());
        self
    }
}

/// A file written into the vault.
pub fn file_write(actor: &str, target: &str, size: u64, source: &str) -> AuditEntry {
    AuditEntry::new("file_write", actor, target)
        .param("size", size)
        .param("source", source)
}

/// A metadata status change.
pub fn status_transition(actor: &str, target: &str, from: &str, to: &str) -> AuditEntry {
    AuditEntry::new("status_transition", actor, target)
        .param("from", from)
        .param("to", to)
}

/// A caught failure.
pub fn failure(actor: &str, target: &str, action_type: &str, error: &str) -> AuditEntry {
    AuditEntry::new(action_type, actor, target).error(error)
}

/// Handle to the day-partitioned store under `Logs/`.
#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn partition_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.json", date.format(DATE_FORMAT)))
    }

    /// Append `entry` to the partition for its UTC day.
    pub fn append(&self, entry: &AuditEntry) -> Result<()> {
        let path = self.partition_path(entry.timestamp.date_naive());
        let mut entries = match read_partition(&path)? {
            Partition::Entries(entries) => entries,
            Partition::Missing => Vec::new(),
            Partition::Corrupt(reason) => {
                warn!(path = %path.display(), reason = %reason, "discarding corrupt audit partition");
                Vec::new()
            }
        };
        entries.push(serde_json::to_value(entry).context("serialize audit entry")?);
        write_json_atomic(&path, &entries)
            .with_context(|| format!("append audit entry to {}", path.display()))?;
        debug!(action = %entry.action_type, target = %entry.target, "audit entry appended");
        Ok(())
    }

    /// Best-effort append for use inside error handling; never fails.
    pub fn record(&self, entry: AuditEntry) {
        if let Err(err) = self.append(&entry) {
            warn!(
                err = %format!("{err:#}"),
                action = %entry.action_type,
                target = %entry.target,
                "audit write failed"
            );
        }
    }

    /// Entries of one UTC day, in append order. Missing or corrupt partitions are empty.
    pub fn for_date(&self, date: NaiveDate) -> Result<Vec<AuditEntry>> {
        let path = self.partition_path(date);
        Ok(match read_partition(&path)? {
            Partition::Entries(raw) => typed_entries(raw),
            Partition::Missing => Vec::new(),
            Partition::Corrupt(reason) => {
                warn!(path = %path.display(), reason = %reason, "skipping corrupt audit partition");
                Vec::new()
            }
        })
    }

    /// Up to `n` newest entries across partitions, newest first.
    ///
    /// Partitions are read newest-first until at least `3n` raw entries are
    /// collected, then the collection is sorted by timestamp and truncated.
    pub fn most_recent(&self, n: usize) -> Result<Vec<AuditEntry>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let budget = n.saturating_mul(3);
        let mut collected = Vec::new();
        for date in self.partition_dates()?.into_iter().rev() {
            collected.extend(self.for_date(date)?);
            if collected.len() >= budget {
                break;
            }
        }
        collected.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        collected.truncate(n);
        Ok(collected)
    }

    /// Dates that have a partition file, oldest first.
    pub fn partition_dates(&self) -> Result<Vec<NaiveDate>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("list {}", self.dir.display()));
            }
        };
        let mut dates = Vec::new();
        for item in read_dir {
            let item = item.with_context(|| format!("list {}", self.dir.display()))?;
            let name = item.file_name();
            let Some(stem) = name.to_str().and_then(|name| name.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(date) = NaiveDate::parse_from_str(stem, DATE_FORMAT) {
                dates.push(date);
            }
        }
        dates.sort();
        Ok(dates)
    }
}

pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .map_err(|err| anyhow!("invalid date {raw:?} (expected YYYY-MM-DD): {err}"))
}

/// Six-column Markdown projection of `entries`.
pub fn render_table(entries: &[AuditEntry]) -> String {
    if entries.is_empty() {
        return EMPTY_TABLE.to_string();
    }
    let mut rows = vec![
        "| Timestamp (UTC) | Action Type | Actor | Target | Approval | Result |".to_string(),
        "|-----------------|-------------|-------|--------|----------|--------|".to_string(),
    ];
    for entry in entries {
        rows.push(format!(
            "| {} | {} | {} | {} | {} | {} |",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.action_type,
            entry.actor,
            truncate_target(&entry.target),
            entry.approval_status.as_str(),
            entry.result.as_str(),
        ));
    }
    rows.join("\n")
}

fn truncate_target(target: &str) -> String {
    if target.chars().count() > TARGET_WIDTH {
        preview(target, TARGET_WIDTH - 3)
    } else {
        target.to_string()
    }
}

enum Partition {
    Entries(Vec<Value>),
    Missing,
    Corrupt(String),
}

fn read_partition(path: &Path) -> Result<Partition> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Partition::Missing),
        Err(err) if err.kind() == ErrorKind::InvalidData => {
            return Ok(Partition::Corrupt(err.to_string()));
        }
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    Ok(match serde_json::from_str::<Vec<Value>>(&contents) {
        Ok(entries) => Partition::Entries(entries),
        Err(err) => Partition::Corrupt(err.to_string()),
    })
}

fn typed_entries(raw: Vec<Value>) -> Vec<AuditEntry> {
    raw.into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!(err = %err, "skipping malformed audit entry");
                None
            }
        })
        .collect()
}
