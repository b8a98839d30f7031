//! Final stage: processing tasks move to `done/`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::core::types::TaskStatus;
use crate::io::audit::{actors, failure, status_transition};
use crate::io::task_store::TaskRecord;
use crate::pipeline::Pipeline;

/// Mark one processing task complete and audit the transition.
pub fn complete_task(pipeline: &Pipeline, name: &str, now: DateTime<Utc>) -> Result<TaskRecord> {
    let record = match pipeline.store.complete(name, now) {
        Ok(record) => record,
        Err(err) => {
            pipeline.audit.record(
                failure(actors::TASK_AGENT, name, "error", &format!("{err:#}")).at(now),
            );
            return Err(err);
        }
    };
    pipeline.audit.record(
        status_transition(
            actors::TASK_AGENT,
            name,
            TaskStatus::Processing.as_str(),
            TaskStatus::Complete.as_str(),
        )
        .at(now),
    );
    info!(task = %name, "task complete");
    Ok(record)
}

/// Complete every processing task. Failures are logged and skipped.
pub fn complete_all(pipeline: &Pipeline, now: DateTime<Utc>) -> Result<Vec<TaskRecord>> {
    let mut done = Vec::new();
    for record in pipeline.store.list(Some(TaskStatus::Processing))? {
        match complete_task(pipeline, &record.name, now) {
            Ok(record) => done.push(record),
            Err(err) => warn!(task = %record.name, err = %format!("{err:#}"), "completion failed"),
        }
    }
    Ok(done)
}
