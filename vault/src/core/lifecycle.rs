//! Task lifecycle state machine.
//!
//! A task's status and its lifecycle location are two views of one state:
//! every status maps to exactly one location and the store rejects any
//! transition not listed here.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::TaskStatus;

/// Directory that holds a task in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    /// `needs_action/`: pending, processing and retry-queued tasks.
    Active,
    /// `done/`: completed tasks. This is the terminal location the loop
    /// controller watches.
    Done,
    /// `abandoned/`: tasks whose retry ceiling was reached.
    Abandoned,
}

impl Location {
    pub const ALL: [Location; 3] = [Location::Active, Location::Done, Location::Abandoned];

    pub fn for_status(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending | TaskStatus::Processing | TaskStatus::RetryQueued => {
                Location::Active
            }
            TaskStatus::Complete => Location::Done,
            TaskStatus::Abandoned => Location::Abandoned,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Location::Active => "needs_action",
            Location::Done => "done",
            Location::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a task is asked to move along an edge the lifecycle lacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub task: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {} cannot move from {} to {}",
            self.task, self.from, self.to
        )
    }
}

impl std::error::Error for TransitionError {}

pub fn is_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::{Abandoned, Complete, Pending, Processing, RetryQueued};
    matches!(
        (from, to),
        (Pending, Processing)
            | (RetryQueued, Processing)
            | (Processing, Complete)
            | (Processing, RetryQueued)
            | (Pending | Processing | RetryQueued, Abandoned)
    )
}

pub fn check_transition(
    task: &str,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<(), TransitionError> {
    if is_allowed(from, to) {
        Ok(())
    } else {
        Err(TransitionError {
            task: task.to_string(),
            from,
            to,
        })
    }
}

pub fn is_terminal(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Complete | TaskStatus::Abandoned)
}

/// Whether a task may be picked up for classification at `now`.
///
/// Retry-queued tasks wait until their cooldown has passed. A retry-queued
/// task without a recorded cooldown is eligible immediately.
pub fn is_eligible(
    status: TaskStatus,
    retry_after: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    match status {
        TaskStatus::Pending => true,
        TaskStatus::RetryQueued => retry_after.is_none_or(|after| after <= now),
        _ => false,
    }
}
