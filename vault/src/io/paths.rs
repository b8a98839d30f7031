//! Vault layout and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use super::config::{VaultConfig, write_config};
use crate::core::lifecycle::Location;

/// All canonical paths within a vault root.
#[derive(Debug, Clone)]
pub struct VaultPaths {
    pub root: PathBuf,
    pub inbox_dir: PathBuf,
    pub needs_action_dir: PathBuf,
    pub done_dir: PathBuf,
    pub abandoned_dir: PathBuf,
    pub plans_dir: PathBuf,
    pub pending_approval_dir: PathBuf,
    pub approved_dir: PathBuf,
    pub rejected_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub loop_state_dir: PathBuf,
    pub state_dir: PathBuf,
    pub journal_dir: PathBuf,
    pub seen_dir: PathBuf,
    pub deferred_ledger_path: PathBuf,
    pub config_path: PathBuf,
}

impl VaultPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".vault");
        Self {
            inbox_dir: root.join("inbox"),
            needs_action_dir: root.join("needs_action"),
            done_dir: root.join("done"),
            abandoned_dir: root.join("abandoned"),
            plans_dir: root.join("plans"),
            pending_approval_dir: root.join("Pending_Approval"),
            approved_dir: root.join("Approved"),
            rejected_dir: root.join("Rejected"),
            logs_dir: root.join("Logs"),
            loop_state_dir: root.join("Loop_State"),
            journal_dir: state_dir.join("journal"),
            seen_dir: state_dir.join("seen"),
            state_dir,
            deferred_ledger_path: root.join("deferred_queue.json"),
            config_path: root.join("vault.toml"),
            root,
        }
    }

    pub fn location_dir(&self, location: Location) -> &Path {
        match location {
            Location::Active => &self.needs_action_dir,
            Location::Done => &self.done_dir,
            Location::Abandoned => &self.abandoned_dir,
        }
    }

    fn dirs(&self) -> [&Path; 14] {
        [
            &self.inbox_dir,
            &self.needs_action_dir,
            &self.done_dir,
            &self.abandoned_dir,
            &self.plans_dir,
            &self.pending_approval_dir,
            &self.approved_dir,
            &self.rejected_dir,
            &self.logs_dir,
            &self.loop_state_dir,
            &self.state_dir,
            &self.journal_dir,
            &self.seen_dir,
            &self.root,
        ]
    }

    /// Create every vault directory that does not exist yet.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in self.dirs() {
            fs::create_dir_all(dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Vault-relative display form of `path`.
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }
}

/// Options for `init_vault`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, rewrite `vault.toml` with defaults.
    pub force: bool,
}

/// Create the vault layout and a default `vault.toml` in `root`.
///
/// Fails if `vault.toml` already exists unless `options.force` is set.
/// Existing task, plan, and log files are never touched.
pub fn init_vault(root: &Path, options: &InitOptions) -> Result<VaultPaths> {
    let paths = VaultPaths::new(root);
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "vault init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }
    if root.exists() && !root.is_dir() {
        return Err(anyhow!("vault init: {} is not a directory", root.display()));
    }

    paths.ensure_layout()?;
    write_config(&paths.config_path, &VaultConfig::default())?;
    info!(root = %root.display(), "vault initialized");
    Ok(paths)
}
