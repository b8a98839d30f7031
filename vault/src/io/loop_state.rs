//! Persisted loop controller state (`Loop_State/<task_id>.json`).

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::atomic::write_json_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Running,
    Complete,
    MaxIterationsReached,
}

/// Which evidence ended the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMethod {
    Token,
    TerminalFile,
    TokenAndTerminalFile,
}

impl CompletionMethod {
    pub fn from_evidence(token_found: bool, files_arrived: bool) -> Option<Self> {
        match (token_found, files_arrived) {
            (true, true) => Some(CompletionMethod::TokenAndTerminalFile),
            (true, false) => Some(CompletionMethod::Token),
            (false, true) => Some(CompletionMethod::TerminalFile),
            (false, false) => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompletionMethod::Token => "token",
            CompletionMethod::TerminalFile => "terminal_file",
            CompletionMethod::TokenAndTerminalFile => "token_and_terminal_file",
        }
    }
}

/// Outcome of one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub output_length: usize,
    pub exit_code: i32,
    #[serde(default)]
    pub timed_out: bool,
    pub complete: bool,
    pub completion_method: Option<CompletionMethod>,
    /// Terminal files that appeared since the loop started, as of this iteration.
    #[serde(default)]
    pub new_terminal_files: Vec<String>,
}

/// One record per goal-prompt identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    pub task_id: String,
    pub prompt: String,
    pub start_time: DateTime<Utc>,
    pub max_iterations: u32,
    pub completion_token: String,
    pub status: LoopStatus,
    /// Last iteration started (0 before the first).
    pub iteration: u32,
    #[serde(default)]
    pub iterations: Vec<IterationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_method: Option<CompletionMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Every terminal file that appeared since the loop started.
    #[serde(default)]
    pub new_terminal_files: Vec<String>,
}

impl LoopState {
    pub fn new(
        task_id: &str,
        prompt: &str,
        max_iterations: u32,
        completion_token: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            prompt: prompt.to_string(),
            start_time: now,
            max_iterations,
            completion_token: completion_token.to_string(),
            status: LoopStatus::Running,
            iteration: 0,
            iterations: Vec::new(),
            completion_method: None,
            completed_at: None,
            new_terminal_files: Vec::new(),
        }
    }
}

pub fn loop_state_path(dir: &Path, task_id: &str) -> PathBuf {
    dir.join(format!("{task_id}.json"))
}

/// Load loop state. Missing state is `None`; corrupt state is discarded
/// with a warning and also reads as `None`.
pub fn load_loop_state(path: &Path) -> Option<LoopState> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "unreadable loop state, starting over");
            return None;
        }
    };
    match serde_json::from_str::<LoopState>(&contents) {
        Ok(state) => {
            debug!(task_id = %state.task_id, iteration = state.iteration, "loop state loaded");
            Some(state)
        }
        Err(err) => {
            warn!(path = %path.display(), err = %err, "corrupt loop state, starting over");
            None
        }
    }
}

/// Atomically write loop state (temp file + rename).
pub fn write_loop_state(path: &Path, state: &LoopState) -> Result<()> {
    debug!(path = %path.display(), iteration = state.iteration, status = ?state.status, "writing loop state");
    write_json_atomic(path, state)
}
