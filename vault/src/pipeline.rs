//! Handles shared by every pipeline stage of one vault.

use std::path::Path;

use anyhow::Result;
use tracing::debug;

use crate::io::audit::AuditLog;
use crate::io::config::{VaultConfig, load_config};
use crate::io::ledger::DeferredLedger;
use crate::io::paths::VaultPaths;
use crate::io::task_store::TaskStore;
use crate::io::templates::TemplateEngine;

/// An opened vault: layout, config, and the persistent stores.
pub struct Pipeline {
    pub paths: VaultPaths,
    pub config: VaultConfig,
    pub store: TaskStore,
    pub audit: AuditLog,
    pub ledger: DeferredLedger,
    pub templates: TemplateEngine,
}

impl Pipeline {
    /// Open the vault at `root` using its `vault.toml` (defaults when absent).
    pub fn open(root: &Path) -> Result<Self> {
        let paths = VaultPaths::new(root);
        let config = load_config(&paths.config_path)?;
        Self::with_config(paths, config)
    }

    /// Open with an explicit config. Creates missing directories and finishes
    /// interrupted task moves.
    pub fn with_config(paths: VaultPaths, config: VaultConfig) -> Result<Self> {
        config.validate()?;
        paths.ensure_layout()?;
        let store = TaskStore::open(&paths)?;
        debug!(root = %paths.root.display(), "vault opened");
        Ok(Self {
            audit: AuditLog::new(&paths.logs_dir),
            ledger: DeferredLedger::new(&paths.deferred_ledger_path),
            templates: TemplateEngine::new(),
            store,
            config,
            paths,
        })
    }
}
