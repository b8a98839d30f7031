//! Vault configuration stored in `vault.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::atomic::write_atomic;
use crate::core::backoff::{RetryPolicy, Retryable};

/// Vault configuration (TOML).
///
/// Edited by humans; missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct VaultConfig {
    pub retry: RetryConfig,
    pub requeue: RequeueConfig,
    #[serde(rename = "loop")]
    pub loop_: LoopConfig,
    pub cycle: CycleConfig,
}

/// Backoff applied to individual pipeline operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_secs: 1.0,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::try_from_secs_f64(self.base_delay_secs).unwrap_or_default(),
            backoff_factor: self.backoff_factor,
            retryable: Retryable::Any,
        }
    }
}

/// Longest accepted requeue cooldown (one year).
pub const MAX_COOLDOWN_HOURS: f64 = 24.0 * 365.0;

/// Tier-1 requeue ceiling and cooldown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RequeueConfig {
    pub cooldown_hours: f64,
    pub max_retries: u32,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            cooldown_hours: 1.0,
            max_retries: 3,
        }
    }
}

/// Persistent loop controller settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Iteration budget for one invocation.
    pub max_iterations: u32,
    pub completion_token: String,
    /// Hard wall-clock limit for one agent invocation.
    pub iteration_timeout_secs: u64,
    /// Pause between iterations that did not complete.
    pub pause_secs: u64,
    /// Truncate captured agent output beyond this many bytes per stream.
    pub output_limit_bytes: usize,
    /// Characters of the previous output quoted in a continuation prompt.
    pub continuation_tail_chars: usize,
    /// Agent command; the prompt is written to its stdin.
    pub agent_command: Vec<String>,
    /// Environment variables removed before spawning the agent.
    pub unset_env: Vec<String>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            completion_token: "<TASK_COMPLETE>".to_string(),
            iteration_timeout_secs: 600,
            pause_secs: 3,
            output_limit_bytes: 1_000_000,
            continuation_tail_chars: 600,
            agent_command: vec![
                "claude".to_string(),
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            unset_env: vec!["CLAUDECODE".to_string()],
        }
    }
}

/// Polling pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CycleConfig {
    pub poll_interval_secs: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
        }
    }
}

impl VaultConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.retry.base_delay_secs.is_finite() || self.retry.base_delay_secs < 0.0 {
            return Err(anyhow!("retry.base_delay_secs must be a non-negative number"));
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            return Err(anyhow!("retry.backoff_factor must be >= 1"));
        }
        if !self.requeue.cooldown_hours.is_finite() || self.requeue.cooldown_hours < 0.0 {
            return Err(anyhow!("requeue.cooldown_hours must be a non-negative number"));
        }
        if self.requeue.cooldown_hours > MAX_COOLDOWN_HOURS {
            return Err(anyhow!(
                "requeue.cooldown_hours must be at most {MAX_COOLDOWN_HOURS}"
            ));
        }
        if self.loop_.max_iterations == 0 {
            return Err(anyhow!("loop.max_iterations must be > 0"));
        }
        if self.loop_.completion_token.trim().is_empty() {
            return Err(anyhow!("loop.completion_token must not be empty"));
        }
        if self.loop_.iteration_timeout_secs == 0 {
            return Err(anyhow!("loop.iteration_timeout_secs must be > 0"));
        }
        if self.loop_.output_limit_bytes == 0 {
            return Err(anyhow!("loop.output_limit_bytes must be > 0"));
        }
        if self.loop_.agent_command.is_empty() || self.loop_.agent_command[0].trim().is_empty() {
            return Err(anyhow!("loop.agent_command must be a non-empty array"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `VaultConfig::default()`.
pub fn load_config(path: &Path) -> Result<VaultConfig> {
    if !path.exists() {
        let cfg = VaultConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: VaultConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &VaultConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, VaultConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("vault.toml");
        let mut cfg = VaultConfig::default();
        cfg.loop_.max_iterations = 7;
        cfg.requeue.cooldown_hours = 0.5;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("vault.toml");
        fs::write(&path, "[loop]\ncompletion_token = \"DONE\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.loop_.completion_token, "DONE");
        assert_eq!(cfg.loop_.max_iterations, 20);
        assert_eq!(cfg.retry, RetryConfig::default());
    }

    #[test]
    fn rejects_shrinking_backoff() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("vault.toml");
        fs::write(&path, "[retry]\nbackoff_factor = 0.5\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("backoff_factor"));
    }

    #[test]
    fn rejects_cooldown_beyond_one_year() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("vault.toml");
        fs::write(&path, "[requeue]\ncooldown_hours = 1e12\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("cooldown_hours"));

        let mut cfg = VaultConfig::default();
        cfg.requeue.cooldown_hours = MAX_COOLDOWN_HOURS;
        cfg.validate().expect("one year is accepted");
    }

    #[test]
    fn retry_policy_uses_configured_schedule() {
        let policy = RetryConfig {
            max_retries: 3,
            base_delay_secs: 2.0,
            backoff_factor: 3.0,
        }
        .policy();
        assert_eq!(
            policy.delays(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(6),
                Duration::from_secs(18)
            ]
        );
    }
}
