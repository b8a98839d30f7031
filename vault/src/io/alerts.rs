//! Human-facing alert documents in `Pending_Approval/`.
//!
//! Every alert is a Markdown document plus a `<name>.meta.json` sidecar. The
//! pair is staged under hidden temp names and published by rename, so a
//! reader never sees a document without its sidecar.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::atomic::{temp_path, to_json_bytes};
use super::ledger::DeferredEntry;
use super::templates::{ABANDONED_ALERT, CRITICAL_FAILURE_ALERT, TemplateEngine};
use crate::core::types::Priority;

/// Sidecar path for a document: `<file name>.meta.json`.
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.file_name().unwrap_or_default());
    name.push(".meta.json");
    path.with_file_name(name)
}

/// A rendered alert ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertDocument {
    pub file_name: String,
    pub body: String,
    pub sidecar: Value,
}

/// Coarse risk rating shown on critical-failure alerts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskAssessment {
    pub data_loss: &'static str,
    pub service_impact: &'static str,
    pub irreversibility: &'static str,
    pub financial: &'static str,
    pub overall: String,
}

/// Payload is always preserved, so data-loss risk is low. A named service
/// raises service impact; only read actions are reversible.
pub fn assess_risk(action: &str, service_named: bool, priority: Priority) -> RiskAssessment {
    RiskAssessment {
        data_loss: "Low",
        service_impact: if service_named { "High" } else { "Medium" },
        irreversibility: if action.starts_with("read") {
            "Low"
        } else {
            "High"
        },
        financial: "Low",
        overall: capitalize(priority.as_str()),
    }
}

/// Inputs for an abandoned-task alert.
#[derive(Debug, Clone)]
pub struct AbandonedAlert<'a> {
    pub file_name: String,
    pub task_name: &'a str,
    /// Where the task can be inspected, vault-relative.
    pub location: &'a str,
    pub retry_count: u32,
    pub error: &'a str,
    pub created_at: DateTime<Utc>,
}

pub fn render_abandoned(engine: &TemplateEngine, alert: &AbandonedAlert<'_>) -> Result<AlertDocument> {
    let timestamp = iso(alert.created_at);
    let body = engine.render(
        ABANDONED_ALERT,
        json!({
            "timestamp": timestamp,
            "task": alert.task_name,
            "location": alert.location,
            "retry_count": alert.retry_count,
            "error": alert.error,
        }),
    )?;
    Ok(AlertDocument {
        file_name: alert.file_name.clone(),
        body,
        sidecar: json!({
            "name": alert.file_name,
            "action": "task_abandoned",
            "original_task": alert.task_name,
            "status": "pending_approval",
            "created_at": timestamp,
            "priority": Priority::High.as_str(),
        }),
    })
}

/// Inputs for a critical-failure alert paired with a deferred entry.
#[derive(Debug, Clone)]
pub struct CriticalFailureAlert<'a> {
    pub file_name: String,
    pub entry: &'a DeferredEntry,
    pub service_named: bool,
    pub priority: Priority,
    /// Ledger file name shown to the reader.
    pub ledger_name: &'a str,
}

pub fn render_critical_failure(
    engine: &TemplateEngine,
    alert: &CriticalFailureAlert<'_>,
) -> Result<AlertDocument> {
    let entry = alert.entry;
    let timestamp = iso(entry.queued_at);
    let payload = serde_json::to_string_pretty(&entry.payload).context("serialize payload")?;
    let risk = assess_risk(&entry.action, alert.service_named, alert.priority);
    let body = engine.render(
        CRITICAL_FAILURE_ALERT,
        json!({
            "entry": entry,
            "timestamp": timestamp,
            "time": entry.queued_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            "priority": alert.priority.as_str(),
            "payload": payload,
            "risk": risk,
            "ledger": alert.ledger_name,
        }),
    )?;
    Ok(AlertDocument {
        file_name: alert.file_name.clone(),
        body,
        sidecar: json!({
            "name": alert.file_name,
            "action": "critical_failure_alert",
            "failed_action": entry.action,
            "service": entry.service,
            "status": "pending_approval",
            "created_at": timestamp,
            "priority": alert.priority.as_str(),
            "deferred_entry_id": entry.id,
        }),
    })
}

/// An alert written under temp names, not yet visible.
#[derive(Debug)]
pub struct StagedAlert {
    path: PathBuf,
    tmp_path: PathBuf,
    sidecar_path: PathBuf,
    sidecar_tmp_path: PathBuf,
}

impl StagedAlert {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make the alert visible. On failure nothing stays published.
    pub fn publish(self) -> Result<PathBuf> {
        fs::rename(&self.sidecar_tmp_path, &self.sidecar_path)
            .with_context(|| format!("publish {}", self.sidecar_path.display()))
            .inspect_err(|_| self.cleanup())?;
        if let Err(err) = fs::rename(&self.tmp_path, &self.path) {
            if let Err(undo) = fs::remove_file(&self.sidecar_path) {
                warn!(path = %self.sidecar_path.display(), err = %undo, "failed to withdraw sidecar");
            }
            self.cleanup();
            return Err(err).with_context(|| format!("publish {}", self.path.display()));
        }
        debug!(path = %self.path.display(), "alert published");
        Ok(self.path)
    }

    /// Drop the staged files.
    pub fn discard(self) {
        self.cleanup();
    }

    fn cleanup(&self) {
        for path in [&self.tmp_path, &self.sidecar_tmp_path] {
            if path.exists()
                && let Err(err) = fs::remove_file(path)
            {
                warn!(path = %path.display(), err = %err, "failed to remove staged alert file");
            }
        }
    }
}

/// Write `doc` and its sidecar under temp names in `dir`.
pub fn stage(dir: &Path, doc: &AlertDocument) -> Result<StagedAlert> {
    fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    let path = dir.join(&doc.file_name);
    let sidecar = sidecar_path(&path);
    let staged = StagedAlert {
        tmp_path: temp_path(&path),
        sidecar_tmp_path: temp_path(&sidecar),
        sidecar_path: sidecar,
        path,
    };
    let written = fs::write(&staged.tmp_path, doc.body.as_bytes())
        .with_context(|| format!("write {}", staged.tmp_path.display()))
        .and_then(|()| {
            let sidecar = to_json_bytes(&doc.sidecar)?;
            fs::write(&staged.sidecar_tmp_path, sidecar)
                .with_context(|| format!("write {}", staged.sidecar_tmp_path.display()))
        });
    if let Err(err) = written {
        staged.cleanup();
        return Err(err);
    }
    Ok(staged)
}

/// Stage and publish `doc` in one step.
pub fn write_alert(dir: &Path, doc: &AlertDocument) -> Result<PathBuf> {
    stage(dir, doc)?.publish()
}

/// First of `<base>.md`, `<base>_2.md`, ... not yet present in `dir`.
pub fn unique_file_name(dir: &Path, base: &str, taken: impl Fn(&str) -> bool) -> String {
    let mut suffix = 1u32;
    loop {
        let stem = if suffix == 1 {
            base.to_string()
        } else {
            format!("{base}_{suffix}")
        };
        let name = format!("{stem}.md");
        let path = dir.join(&name);
        if !path.exists() && !sidecar_path(&path).exists() && !taken(&stem) {
            return name;
        }
        suffix += 1;
    }
}

pub fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn capitalize(raw: &str) -> String {
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
