//! Shared deterministic types for the vault core.
//!
//! These types define the stable vocabulary persisted in task metadata, the
//! deferred ledger, and alert documents. Serialized spellings must not change.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status recorded in a task's metadata sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    RetryQueued,
    Complete,
    Abandoned,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::RetryQueued,
        TaskStatus::Complete,
        TaskStatus::Abandoned,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::RetryQueued => "retry_queued",
            TaskStatus::Complete => "complete",
            TaskStatus::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain a task belongs to after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Personal,
    Business,
    Both,
}

impl Domain {
    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Personal => "personal",
            Domain::Business => "business",
            Domain::Both => "both",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority attached to routed tasks and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Downstream workflow a routed task is handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    #[serde(rename = "human-approval-workflow")]
    HumanApproval,
    #[serde(rename = "plan-creation-workflow")]
    PlanCreation,
    #[serde(rename = "split")]
    Split,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Route::HumanApproval => "human-approval-workflow",
            Route::PlanCreation => "plan-creation-workflow",
            Route::Split => "split",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse failure taxonomy used to decide whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Timeout,
    RateLimited,
    Unavailable,
    Auth,
    InvalidInput,
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Network => "network",
            FailureKind::Timeout => "timeout",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Auth => "auth",
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::Internal => "internal",
        }
    }

    /// Kinds that usually clear up on their own.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FailureKind::Network
                | FailureKind::Timeout
                | FailureKind::RateLimited
                | FailureKind::Unavailable
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_spellings_are_stable() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::RetryQueued).expect("json"),
            "\"retry_queued\""
        );
        assert_eq!(
            serde_json::to_string(&Route::HumanApproval).expect("json"),
            "\"human-approval-workflow\""
        );
        assert_eq!(serde_json::to_string(&Domain::Both).expect("json"), "\"both\"");
        assert_eq!(
            serde_json::to_string(&FailureKind::RateLimited).expect("json"),
            "\"rate_limited\""
        );
    }

    #[test]
    fn priority_parse_is_case_insensitive() {
        assert_eq!(Priority::parse(" HIGH "), Some(Priority::High));
        assert_eq!(Priority::parse("urgent"), None);
    }
}
