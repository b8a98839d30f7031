//! Two-tier failure escalation.
//!
//! Tier 1 ([`requeue`]) re-injects a failed task as a cooldown-tagged copy
//! until a retry ceiling is reached, then abandons it with an alert. Tier 2
//! ([`graceful_degrade`]) preserves a critically failed action in the
//! deferred ledger and raises exactly one paired alert for a human.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::core::lifecycle::is_terminal;
use crate::core::signals::HINT_FIELDS;
use crate::core::types::{Priority, TaskStatus};
use crate::io::alerts::{
    AbandonedAlert, CriticalFailureAlert, StagedAlert, render_abandoned, render_critical_failure,
    sidecar_path, stage, unique_file_name, write_alert,
};
use crate::io::audit::{ActionResult, ApprovalStatus, AuditEntry, actors};
use crate::io::ledger::{DeferredEntry, DeferredLedger, DeferredStatus};
use crate::io::task_store::TaskMeta;
use crate::pipeline::Pipeline;

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

static RETRY_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^RETRY_\d{8}T\d{6}_").expect("retry prefix should compile"));

/// Collector fields carried from a failed task onto its retry copy.
const CARRIED_FIELDS: &[&str] = &["source", "received", "timestamp"];

/// Tier-1 input.
#[derive(Debug, Clone)]
pub struct RequeueRequest<'a> {
    pub task: &'a str,
    pub error: &'a str,
    /// Retries already spent on this task.
    pub retry_count: u32,
    pub max_retries: u32,
    pub cooldown: TimeDelta,
    /// Extra sidecar fields, merged last.
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueOutcome {
    Queued {
        name: String,
        retry_count: u32,
        retry_after: DateTime<Utc>,
    },
    Abandoned {
        alert: PathBuf,
        /// Whether a stored task was moved to `abandoned/`.
        task_moved: bool,
    },
}

/// Cooldown from fractional hours; negative or non-finite values mean none.
pub fn cooldown_from_hours(hours: f64) -> TimeDelta {
    if !hours.is_finite() || hours <= 0.0 {
        return TimeDelta::zero();
    }
    TimeDelta::milliseconds((hours * 3_600_000.0) as i64)
}

/// Name of the task a retry copy descends from.
pub fn root_task_name(name: &str) -> &str {
    match RETRY_PREFIX.find(name) {
        Some(found) => &name[found.end()..],
        None => name,
    }
}

/// Tier 1: queue a cooldown-tagged copy of `task`, or abandon it once
/// `retry_count` reaches `max_retries`.
#[instrument(skip_all, fields(task = %request.task, retry_count = request.retry_count))]
pub fn requeue(
    pipeline: &Pipeline,
    request: &RequeueRequest<'_>,
    now: DateTime<Utc>,
) -> Result<RequeueOutcome> {
    let original = pipeline.store.get(request.task)?;
    let root_name = original
        .as_ref()
        .and_then(|record| record.meta.str_field("original_task"))
        .unwrap_or_else(|| root_task_name(request.task))
        .to_string();

    if request.retry_count >= request.max_retries {
        let task_moved = match &original {
            Some(record) if !is_terminal(record.meta.status) => {
                pipeline.store.abandon(&record.name, now, request.error)?;
                true
            }
            _ => false,
        };
        let location = if task_moved {
            format!("abandoned/{}", request.task)
        } else {
            "needs_action/".to_string()
        };
        let stem = Path::new(request.task)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(request.task);
        let dir = &pipeline.paths.pending_approval_dir;
        let file_name = unique_file_name(
            dir,
            &format!("ALERT_abandoned_{}_{stem}", now.format(STAMP_FORMAT)),
            |_| false,
        );
        let doc = render_abandoned(
            &pipeline.templates,
            &AbandonedAlert {
                file_name,
                task_name: request.task,
                location: &location,
                retry_count: request.retry_count,
                error: request.error,
                created_at: now,
            },
        )?;
        let alert = write_alert(dir, &doc)?;
        pipeline.audit.record(
            AuditEntry::new("task_abandoned", actors::ERROR_RECOVERY, request.task)
                .at(now)
                .param("retry_count", request.retry_count)
                .param("max_retries", request.max_retries)
                .param("alert", doc.file_name.as_str())
                .approval(ApprovalStatus::Pending)
                .error(request.error),
        );
        warn!(
            max_retries = request.max_retries,
            alert = %alert.display(),
            "task abandoned after exhausting retries"
        );
        return Ok(RequeueOutcome::Abandoned { alert, task_moved });
    }

    let name = pipeline
        .store
        .unique_name(&format!("RETRY_{}_{root_name}", now.format(STAMP_FORMAT)));
    let content = match &original {
        Some(record) if record.content_path.exists() => fs::read(&record.content_path)
            .with_context(|| format!("read {}", record.content_path.display()))?,
        _ => format!(
            "# Retry Task\n\nOriginal: `{root_name}`\nError: {}\n",
            request.error
        )
        .into_bytes(),
    };

    let retry_count = request.retry_count + 1;
    let retry_after = now
        .checked_add_signed(request.cooldown)
        .ok_or_else(|| anyhow!("requeue cooldown {} is out of range", request.cooldown))?;
    let mut meta = TaskMeta::new(&name, TaskStatus::RetryQueued);
    meta.retry_count = retry_count;
    meta.retry_after = Some(retry_after);
    if let Some(record) = &original {
        for field in CARRIED_FIELDS.iter().chain(HINT_FIELDS) {
            if let Some(value) = record.meta.fields.get(*field) {
                meta.set(field, value.clone());
            }
        }
    }
    meta.set("original_task", root_name.as_str());
    meta.set("max_retries", request.max_retries);
    meta.set("retry_queued_at", now.to_rfc3339());
    meta.set("retry_reason", request.error);
    meta.set("size", content.len());
    for (key, value) in &request.extra {
        meta.set(key, value.clone());
    }
    let queued = pipeline.store.create(&content, meta)?;

    if let Some(record) = &original
        && !is_terminal(record.meta.status)
    {
        pipeline.store.retire(&record.name)?;
    }

    pipeline.audit.record(
        AuditEntry::new("task_requeued", actors::ERROR_RECOVERY, request.task)
            .at(now)
            .param("retry_task", queued.name.as_str())
            .param("retry_count", retry_count)
            .param("max_retries", request.max_retries)
            .param("retry_after", retry_after.to_rfc3339())
            .param("reason", request.error)
            .result(ActionResult::Pending),
    );
    info!(
        retry_task = %queued.name,
        retry_count,
        max_retries = request.max_retries,
        retry_after = %retry_after,
        "task requeued"
    );
    Ok(RequeueOutcome::Queued {
        name: queued.name,
        retry_count,
        retry_after,
    })
}

/// Tier-2 input.
#[derive(Debug, Clone)]
pub struct DegradeRequest<'a> {
    pub action: &'a str,
    pub error: &'a str,
    pub payload: Value,
    /// Failing external service, when one is known.
    pub service: Option<&'a str>,
    pub priority: Priority,
    pub actor: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DegradeOutcome {
    pub entry: DeferredEntry,
    pub alert: PathBuf,
}

/// Tier 2: append one deferred entry and publish one alert sharing its id.
///
/// The alert is staged before the ledger append and published after it; a
/// failure at either step rolls the other back, so neither half is left
/// without its partner.
#[instrument(skip_all, fields(action = %request.action))]
pub fn graceful_degrade(
    pipeline: &Pipeline,
    request: &DegradeRequest<'_>,
    now: DateTime<Utc>,
) -> Result<DegradeOutcome> {
    let dir = &pipeline.paths.pending_approval_dir;
    let (id, file_name) = unique_deferred_id(pipeline, dir, now)?;
    let entry = DeferredEntry {
        id,
        action: request.action.to_string(),
        service: request.service.unwrap_or(request.action).to_string(),
        error: request.error.to_string(),
        actor: request.actor.to_string(),
        payload: request.payload.clone(),
        queued_at: now,
        status: DeferredStatus::Deferred,
        resolved_at: None,
    };
    let ledger_name = pipeline
        .ledger
        .path()
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("deferred_queue.json");
    let doc = render_critical_failure(
        &pipeline.templates,
        &CriticalFailureAlert {
            file_name,
            entry: &entry,
            service_named: request.service.is_some(),
            priority: request.priority,
            ledger_name,
        },
    )?;

    let staged = stage(dir, &doc)?;
    let alert = commit_deferred(&pipeline.ledger, staged, &entry)?;

    pipeline.audit.record(
        AuditEntry::new("critical_failure", request.actor, request.action)
            .at(now)
            .param("deferred_entry_id", entry.id.as_str())
            .param("service", entry.service.as_str())
            .param("priority", request.priority.as_str())
            .param("alert", doc.file_name.as_str())
            .approval(ApprovalStatus::Pending)
            .error(request.error),
    );
    warn!(
        id = %entry.id,
        service = %entry.service,
        alert = %alert.display(),
        "critical failure deferred for human review"
    );
    Ok(DegradeOutcome { entry, alert })
}

/// Append `entry`, then publish its staged alert, undoing the append if the
/// publish fails.
fn commit_deferred(
    ledger: &DeferredLedger,
    staged: StagedAlert,
    entry: &DeferredEntry,
) -> Result<PathBuf> {
    if let Err(err) = ledger.append(entry) {
        staged.discard();
        return Err(err);
    }
    staged.publish().inspect_err(|_| {
        if let Err(undo) = ledger.remove(&entry.id) {
            warn!(id = %entry.id, err = %format!("{undo:#}"), "failed to withdraw deferred entry");
        }
    })
}

/// First `deferred_<stamp>[_n]` id unused by both the ledger and the alert folder.
fn unique_deferred_id(
    pipeline: &Pipeline,
    dir: &Path,
    now: DateTime<Utc>,
) -> Result<(String, String)> {
    let stamp = now.format(STAMP_FORMAT).to_string();
    let mut suffix = 1u32;
    loop {
        let tail = if suffix == 1 {
            stamp.clone()
        } else {
            format!("{stamp}_{suffix}")
        };
        let id = format!("deferred_{tail}");
        let file_name = format!("ALERT_critical_failure_{tail}.md");
        let path = dir.join(&file_name);
        if !path.exists() && !sidecar_path(&path).exists() && !pipeline.ledger.contains(&id)? {
            return Ok((id, file_name));
        }
        suffix += 1;
    }
}
