//! Test-only helpers: a temporary vault, task builders, and scripted seams.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::types::TaskStatus;
use crate::io::agent::{AgentInvoker, AgentRequest, AgentResponse};
use crate::io::config::VaultConfig;
use crate::io::paths::VaultPaths;
use crate::io::task_store::{TaskMeta, TaskRecord};
use crate::pipeline::Pipeline;
use crate::retry::Sleeper;

/// A vault in a temporary directory with the default config.
pub struct TestVault {
    _temp: TempDir,
    pub pipeline: Pipeline,
}

impl TestVault {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let pipeline = Pipeline::with_config(VaultPaths::new(temp.path()), VaultConfig::default())?;
        Ok(Self {
            _temp: temp,
            pipeline,
        })
    }

    pub fn root(&self) -> &Path {
        &self.pipeline.paths.root
    }

    /// Store an active task with `content`.
    pub fn add_task(&self, name: &str, content: &str, meta: TaskMeta) -> Result<TaskRecord> {
        let meta = TaskMeta {
            name: name.to_string(),
            ..meta
        };
        self.pipeline.store.create(content.as_bytes(), meta)
    }
}

/// Metadata with `status` and nothing else.
pub fn task_meta(name: &str, status: TaskStatus) -> TaskMeta {
    TaskMeta::new(name, status)
}

/// Metadata for a freshly collected task.
pub fn pending_meta(name: &str) -> TaskMeta {
    task_meta(name, TaskStatus::Pending)
}

/// Sleeper that records requested durations instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
    }
}

/// Agent that replays queued responses and records every prompt.
///
/// `Err` entries simulate an agent that could not be started. Running out
/// of responses is also an invocation error.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    responses: RefCell<VecDeque<Result<AgentResponse, String>>>,
    prompts: RefCell<Vec<String>>,
    calls: Cell<u32>,
    /// `(call number, path)`: write `path` during that call.
    writes: Vec<(u32, PathBuf)>,
}

impl ScriptedAgent {
    /// Successful responses with the given outputs.
    pub fn new<I, S>(outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_responses(
            outputs
                .into_iter()
                .map(|output| {
                    Ok(AgentResponse {
                        output: output.into(),
                        exit_code: 0,
                        timed_out: false,
                    })
                })
                .collect(),
        )
    }

    pub fn from_responses(responses: Vec<Result<AgentResponse, String>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            ..Self::default()
        }
    }

    /// Also create `path` while answering the 1-indexed call `call`.
    pub fn writing_on_call(mut self, call: u32, path: PathBuf) -> Self {
        self.writes.push((call, path));
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl AgentInvoker for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let call = self.calls.get() + 1;
        self.calls.set(call);
        self.prompts.borrow_mut().push(request.prompt.clone());
        for (_, path) in self.writes.iter().filter(|(at, _)| *at == call) {
            fs::write(path, format!("written by call {call}\n"))?;
        }
        match self.responses.borrow_mut().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted response for call {call}")),
        }
    }
}
