//! Deferred-action ledger (`deferred_queue.json`).
//!
//! A single JSON array of critically failed actions awaiting a human decision.
//! A ledger that no longer parses is replaced by an empty one so future writes
//! are never blocked.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::atomic::write_json_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeferredStatus {
    Deferred,
    Retried,
    Resolved,
    Dismissed,
}

impl DeferredStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeferredStatus::Deferred => "deferred",
            DeferredStatus::Retried => "retried",
            DeferredStatus::Resolved => "resolved",
            DeferredStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "deferred" => Some(DeferredStatus::Deferred),
            "retried" => Some(DeferredStatus::Retried),
            "resolved" => Some(DeferredStatus::Resolved),
            "dismissed" => Some(DeferredStatus::Dismissed),
            _ => None,
        }
    }
}

impl fmt::Display for DeferredStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A critically failed action, preserved with its full payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredEntry {
    pub id: String,
    pub action: String,
    pub service: String,
    pub error: String,
    pub actor: String,
    pub payload: Value,
    pub queued_at: DateTime<Utc>,
    pub status: DeferredStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Handle to the ledger file.
#[derive(Debug, Clone)]
pub struct DeferredLedger {
    path: PathBuf,
}

impl DeferredLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All parseable entries in append order.
    pub fn entries(&self) -> Result<Vec<DeferredEntry>> {
        Ok(self
            .load_raw()?
            .into_iter()
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect())
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.load_raw()?.iter().any(|value| entry_id(value) == Some(id)))
    }

    /// Durably append `entry`.
    pub fn append(&self, entry: &DeferredEntry) -> Result<()> {
        let mut raw = self.load_raw()?;
        raw.push(serde_json::to_value(entry).context("serialize deferred entry")?);
        write_json_atomic(&self.path, &raw)
            .with_context(|| format!("append to {}", self.path.display()))?;
        debug!(id = %entry.id, action = %entry.action, "deferred entry appended");
        Ok(())
    }

    /// Remove the entry with `id`. Returns whether it was present.
    ///
    /// Used only to undo an append whose paired alert could not be published.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut raw = self.load_raw()?;
        let before = raw.len();
        raw.retain(|value| entry_id(value) != Some(id));
        if raw.len() == before {
            return Ok(false);
        }
        write_json_atomic(&self.path, &raw)
            .with_context(|| format!("rewrite {}", self.path.display()))?;
        Ok(true)
    }

    /// Record a human decision on a deferred entry.
    pub fn resolve(
        &self,
        id: &str,
        status: DeferredStatus,
        now: DateTime<Utc>,
    ) -> Result<DeferredEntry> {
        if status == DeferredStatus::Deferred {
            return Err(anyhow!(
                "resolve {id}: a decision must be retried, resolved or dismissed"
            ));
        }
        let mut raw = self.load_raw()?;
        let slot = raw
            .iter_mut()
            .find(|value| entry_id(value) == Some(id))
            .ok_or_else(|| anyhow!("no deferred entry with id {id}"))?;
        let mut entry: DeferredEntry = serde_json::from_value(slot.clone())
            .with_context(|| format!("parse deferred entry {id}"))?;
        entry.status = status;
        entry.resolved_at = Some(now);
        *slot = serde_json::to_value(&entry).context("serialize deferred entry")?;
        write_json_atomic(&self.path, &raw)
            .with_context(|| format!("rewrite {}", self.path.display()))?;
        info!(id = %id, status = %status, "deferred entry resolved");
        Ok(entry)
    }

    fn load_raw(&self) -> Result<Vec<Value>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) if err.kind() == ErrorKind::InvalidData => {
                warn!(path = %self.path.display(), "deferred ledger is not utf-8, starting fresh");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()));
            }
        };
        match serde_json::from_str::<Vec<Value>>(&contents) {
            Ok(raw) => Ok(raw),
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    err = %err,
                    "deferred ledger is corrupt, starting fresh"
                );
                Ok(Vec::new())
            }
        }
    }
}

fn entry_id(value: &Value) -> Option<&str> {
    value.get("id").and_then(Value::as_str)
}
