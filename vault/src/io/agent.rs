//! External agent invocation.
//!
//! The [`AgentInvoker`] trait decouples the loop controller from the agent
//! backend. Tests use scripted invokers that return predetermined outputs
//! without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use super::config::LoopConfig;
use super::process::run_command_with_timeout;

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Prompt text written to the agent's stdin.
    pub prompt: String,
    /// Hard wall-clock limit.
    pub timeout: Duration,
    /// Truncate captured output beyond this many bytes per stream.
    pub output_limit_bytes: usize,
}

/// What came back from the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
    /// stdout followed by stderr.
    pub output: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Abstraction over agent backends.
///
/// A returned `Err` means the agent could not be run at all; a non-zero exit
/// or a timeout is a normal response.
pub trait AgentInvoker {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse>;
}

/// Agent that spawns a configured command line.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    program: String,
    args: Vec<String>,
    unset_env: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: &[String], unset_env: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            unset_env: unset_env.to_vec(),
        })
    }

    pub fn from_config(cfg: &LoopConfig) -> Result<Self> {
        Self::new(&cfg.agent_command, &cfg.unset_env)
    }

    fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(&request.workdir);
        // Some agents refuse to start when they detect a parent session.
        for key in &self.unset_env {
            cmd.env_remove(key);
        }
        cmd
    }
}

impl AgentInvoker for CommandAgent {
    #[instrument(skip_all, fields(program = %self.program, timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse> {
        info!(workdir = %request.workdir.display(), "starting agent");
        let output = run_command_with_timeout(
            self.command(request),
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run agent {}", self.program))?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
        } else if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent exited with failure");
        } else {
            debug!("agent completed");
        }
        Ok(AgentResponse {
            output: output.combined_output(),
            exit_code: output.exit_code(),
            timed_out: output.timed_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandAgent::new(&[], &[]).is_err());
    }

    #[test]
    fn command_removes_configured_env() {
        let agent = CommandAgent::new(
            &["agent".to_string(), "--print".to_string()],
            &["CLAUDECODE".to_string()],
        )
        .expect("agent");
        let cmd = agent.command(&AgentRequest {
            workdir: PathBuf::from("/tmp"),
            prompt: String::new(),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 16,
        });
        let removed: Vec<_> = cmd
            .get_envs()
            .filter(|(_, value)| value.is_none())
            .map(|(key, _)| key.to_string_lossy().into_owned())
            .collect();
        assert_eq!(removed, vec!["CLAUDECODE"]);
        assert_eq!(cmd.get_args().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn command_agent_pipes_prompt_through_stdin() {
        let temp = tempfile::tempdir().expect("tempdir");
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat; echo warn >&2; exit 4".to_string(),
        ];
        let agent = CommandAgent::new(&command, &[]).expect("agent");
        let response = agent
            .invoke(&AgentRequest {
                workdir: temp.path().to_path_buf(),
                prompt: "do the thing\n".to_string(),
                timeout: Duration::from_secs(10),
                output_limit_bytes: 1024,
            })
            .expect("invoke");
        assert_eq!(response.output, "do the thing\nwarn\n");
        assert_eq!(response.exit_code, 4);
        assert!(!response.timed_out);
    }
}
