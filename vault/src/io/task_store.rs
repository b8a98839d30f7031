//! Task records: content files plus `<name>.meta.json` sidecars.
//!
//! The store is keyed by task name and tagged by [`TaskStatus`]; the status
//! decides which lifecycle directory holds the pair. Relocations and removals
//! are journaled under `.vault/journal/` before they touch any file, and
//! [`TaskStore::open`] rolls every interrupted intent forward, so a crash
//! never leaves content and metadata split across directories.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use super::alerts::sidecar_path;
use super::atomic::{write_atomic, write_json_atomic};
use super::paths::VaultPaths;
use crate::core::lifecycle::{Location, check_transition, is_eligible, is_terminal};
use crate::core::signals::{DEFAULT_SOURCE, HINT_FIELDS};
use crate::core::types::TaskStatus;

const META_SUFFIX: &str = ".meta.json";

/// Parsed metadata sidecar.
///
/// Well-known fields are typed; everything else a collector or classifier
/// wrote is preserved in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub name: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl TaskMeta {
    pub fn new(name: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            name: name.into(),
            status,
            retry_count: 0,
            retry_after: None,
            completed_at: None,
            fields: Map::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Collector that produced the task.
    pub fn source(&self) -> &str {
        self.str_field("source").unwrap_or(DEFAULT_SOURCE)
    }

    /// Metadata hint fields (subject, sender, ...) joined for classification.
    pub fn hint_text(&self) -> String {
        HINT_FIELDS
            .iter()
            .filter_map(|field| self.str_field(field))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A task as currently stored.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub name: String,
    pub location: Location,
    pub content_path: PathBuf,
    pub meta_path: PathBuf,
    pub meta: TaskMeta,
}

/// A disagreement between a record's status, its location, or its halves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
    StatusMismatch {
        name: String,
        location: Location,
        status: TaskStatus,
    },
    MissingContent {
        name: String,
        location: Location,
    },
    MissingMetadata {
        name: String,
        location: Location,
    },
    UnreadableMetadata {
        name: String,
        location: Location,
        reason: String,
    },
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inconsistency::StatusMismatch {
                name,
                location,
                status,
            } => write!(f, "{location}/{name}: status {status} does not belong here"),
            Inconsistency::MissingContent { name, location } => {
                write!(f, "{location}/{name}: metadata without content")
            }
            Inconsistency::MissingMetadata { name, location } => {
                write!(f, "{location}/{name}: content without metadata")
            }
            Inconsistency::UnreadableMetadata {
                name,
                location,
                reason,
            } => write!(f, "{location}/{name}: unreadable metadata ({reason})"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Intent {
    Relocate {
        name: String,
        from: Location,
        to: Location,
        meta: TaskMeta,
    },
    Remove {
        name: String,
        location: Location,
    },
}

impl Intent {
    fn name(&self) -> &str {
        match self {
            Intent::Relocate { name, .. } | Intent::Remove { name, .. } => name,
        }
    }
}

/// Directory-backed task store.
#[derive(Debug, Clone)]
pub struct TaskStore {
    paths: VaultPaths,
}

impl TaskStore {
    /// Open the store under `paths`, creating directories and finishing any
    /// interrupted relocation.
    pub fn open(paths: &VaultPaths) -> Result<Self> {
        let store = Self {
            paths: paths.clone(),
        };
        for location in Location::ALL {
            let dir = store.dir(location);
            fs::create_dir_all(dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        let recovered = store.recover()?;
        if recovered > 0 {
            info!(recovered, "finished interrupted task moves");
        }
        Ok(store)
    }

    pub fn dir(&self, location: Location) -> &Path {
        self.paths.location_dir(location)
    }

    fn record(&self, location: Location, meta: TaskMeta) -> TaskRecord {
        let content_path = self.dir(location).join(&meta.name);
        TaskRecord {
            name: meta.name.clone(),
            location,
            meta_path: sidecar_path(&content_path),
            content_path,
            meta,
        }
    }

    /// Records in one location, sorted by name. Unreadable sidecars are skipped.
    pub fn list_location(&self, location: Location) -> Result<Vec<TaskRecord>> {
        let mut records = Vec::new();
        for name in self.sidecar_names(location)? {
            match self.load_meta(location, &name) {
                Ok(meta) => records.push(self.record(location, meta)),
                Err(err) => {
                    warn!(location = %location, task = %name, err = %format!("{err:#}"), "skipping unreadable task metadata");
                }
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Every record, optionally filtered by status.
    pub fn list(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>> {
        let mut records = Vec::new();
        for location in Location::ALL {
            records.extend(
                self.list_location(location)?
                    .into_iter()
                    .filter(|record| status.is_none_or(|status| record.meta.status == status)),
            );
        }
        Ok(records)
    }

    /// Tasks that may be classified at `now`: pending, plus retry-queued tasks
    /// whose cooldown has passed.
    pub fn eligible(&self, now: DateTime<Utc>) -> Result<Vec<TaskRecord>> {
        Ok(self
            .list_location(Location::Active)?
            .into_iter()
            .filter(|record| is_eligible(record.meta.status, record.meta.retry_after, now))
            .collect())
    }

    pub fn get(&self, name: &str) -> Result<Option<TaskRecord>> {
        for location in Location::ALL {
            let meta_path = sidecar_path(&self.dir(location).join(name));
            if meta_path.exists() {
                let meta = self.load_meta(location, name)?;
                return Ok(Some(self.record(location, meta)));
            }
        }
        Ok(None)
    }

    pub fn require(&self, name: &str) -> Result<TaskRecord> {
        self.get(name)?
            .ok_or_else(|| anyhow!("no task named {name}"))
    }

    /// Task body, decoded lossily.
    pub fn read_content(&self, record: &TaskRecord) -> Result<String> {
        let bytes = fs::read(&record.content_path)
            .with_context(|| format!("read {}", record.content_path.display()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// `desired` if free in every location, else `stem_2.ext`, `stem_3.ext`, ...
    pub fn unique_name(&self, desired: &str) -> String {
        let (stem, ext) = match desired.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
            _ => (desired, None),
        };
        let mut suffix = 1u32;
        loop {
            let candidate = match (suffix, ext) {
                (1, _) => desired.to_string(),
                (_, Some(ext)) => format!("{stem}_{suffix}.{ext}"),
                (_, None) => format!("{stem}_{suffix}"),
            };
            if !self.name_taken(&candidate) {
                return candidate;
            }
            suffix += 1;
        }
    }

    fn name_taken(&self, name: &str) -> bool {
        Location::ALL.iter().any(|location| {
            let path = self.dir(*location).join(name);
            path.exists() || sidecar_path(&path).exists()
        })
    }

    /// Add a new active task. Content is written before the sidecar, so a
    /// record only becomes visible once both halves exist.
    #[instrument(skip_all, fields(task = %meta.name, status = %meta.status))]
    pub fn create(&self, content: &[u8], meta: TaskMeta) -> Result<TaskRecord> {
        let location = Location::for_status(meta.status);
        if location != Location::Active {
            return Err(anyhow!(
                "task {} cannot be created with status {}",
                meta.name,
                meta.status
            ));
        }
        validate_name(&meta.name)?;
        if self.name_taken(&meta.name) {
            return Err(anyhow!("task {} already exists", meta.name));
        }
        let record = self.record(location, meta);
        write_atomic(&record.content_path, content)?;
        write_json_atomic(&record.meta_path, &record.meta)?;
        debug!("task created");
        Ok(record)
    }

    /// pending/retry_queued → processing, in place, applying `annotate` to
    /// the metadata in the same write.
    pub fn begin_processing(
        &self,
        name: &str,
        now: DateTime<Utc>,
        annotate: impl FnOnce(&mut TaskMeta),
    ) -> Result<TaskRecord> {
        let mut record = self.require(name)?;
        check_transition(name, record.meta.status, TaskStatus::Processing)?;
        if !is_eligible(record.meta.status, record.meta.retry_after, now) {
            return Err(anyhow!(
                "task {name} is cooling down until {}",
                record
                    .meta
                    .retry_after
                    .map(|after| after.to_rfc3339())
                    .unwrap_or_default()
            ));
        }
        let mut meta = record.meta.clone();
        annotate(&mut meta);
        meta.status = TaskStatus::Processing;
        write_json_atomic(&record.meta_path, &meta)?;
        record.meta = meta;
        Ok(record)
    }

    /// processing → complete: move the pair to `done/` with a completion time.
    #[instrument(skip_all, fields(task = %name))]
    pub fn complete(&self, name: &str, now: DateTime<Utc>) -> Result<TaskRecord> {
        let record = self.require(name)?;
        check_transition(name, record.meta.status, TaskStatus::Complete)?;
        let mut meta = record.meta.clone();
        meta.status = TaskStatus::Complete;
        meta.completed_at = Some(now);
        self.relocate(&record, meta)
    }

    /// Active → abandoned: move the pair to `abandoned/`.
    #[instrument(skip_all, fields(task = %name))]
    pub fn abandon(&self, name: &str, now: DateTime<Utc>, reason: &str) -> Result<TaskRecord> {
        let record = self.require(name)?;
        check_transition(name, record.meta.status, TaskStatus::Abandoned)?;
        let mut meta = record.meta.clone();
        meta.status = TaskStatus::Abandoned;
        meta.set("abandoned_at", now.to_rfc3339());
        meta.set("abandon_reason", reason);
        self.relocate(&record, meta)
    }

    /// Remove an active task whose work was handed to a requeued copy.
    #[instrument(skip_all, fields(task = %name))]
    pub fn retire(&self, name: &str) -> Result<()> {
        let record = self.require(name)?;
        if is_terminal(record.meta.status) {
            return Err(anyhow!(
                "task {name} is {} and cannot be retired",
                record.meta.status
            ));
        }
        self.run_intent(Intent::Remove {
            name: record.name,
            location: record.location,
        })
    }

    fn relocate(&self, record: &TaskRecord, meta: TaskMeta) -> Result<TaskRecord> {
        let to = Location::for_status(meta.status);
        self.run_intent(Intent::Relocate {
            name: record.name.clone(),
            from: record.location,
            to,
            meta: meta.clone(),
        })?;
        info!(task = %record.name, from = %record.location, to = %to, "task moved");
        Ok(self.record(to, meta))
    }

    fn journal_path(&self, name: &str) -> PathBuf {
        self.paths.journal_dir.join(format!("{name}.json"))
    }

    fn run_intent(&self, intent: Intent) -> Result<()> {
        let journal = self.journal_path(intent.name());
        write_json_atomic(&journal, &intent)
            .with_context(|| format!("journal move of {}", intent.name()))?;
        self.apply(&intent)?;
        remove_if_exists(&journal)
    }

    /// Idempotent: safe to run again after a crash at any point.
    fn apply(&self, intent: &Intent) -> Result<()> {
        match intent {
            Intent::Relocate {
                name,
                from,
                to,
                meta,
            } => {
                let src = self.dir(*from).join(name);
                let dst = self.dir(*to).join(name);
                write_json_atomic(&sidecar_path(&dst), meta)?;
                if src.exists() {
                    fs::rename(&src, &dst).with_context(|| {
                        format!("move {} to {}", src.display(), dst.display())
                    })?;
                } else if !dst.exists() {
                    warn!(task = %name, "task content vanished during move");
                }
                if from != to {
                    remove_if_exists(&sidecar_path(&src))?;
                }
            }
            Intent::Remove { name, location } => {
                let path = self.dir(*location).join(name);
                remove_if_exists(&sidecar_path(&path))?;
                remove_if_exists(&path)?;
            }
        }
        Ok(())
    }

    /// Roll forward every journaled intent. Returns how many were applied.
    pub fn recover(&self) -> Result<usize> {
        let dir = &self.paths.journal_dir;
        let read_dir = match fs::read_dir(dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err).with_context(|| format!("list {}", dir.display())),
        };
        let mut journals: Vec<PathBuf> = Vec::new();
        for item in read_dir {
            let path = item.with_context(|| format!("list {}", dir.display()))?.path();
            if path.extension().is_some_and(|ext| ext == "json") && !is_hidden(&path) {
                journals.push(path);
            }
        }
        journals.sort();

        let mut applied = 0;
        for journal in journals {
            let parsed = fs::read_to_string(&journal)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_str::<Intent>(&raw).map_err(anyhow::Error::from));
            match parsed {
                Ok(intent) => {
                    self.apply(&intent)
                        .with_context(|| format!("recover {}", journal.display()))?;
                    applied += 1;
                }
                Err(err) => {
                    warn!(path = %journal.display(), err = %err, "dropping unreadable journal entry");
                }
            }
            remove_if_exists(&journal)?;
        }
        Ok(applied)
    }

    /// Every place where status, location, and file pairing disagree.
    pub fn verify(&self) -> Result<Vec<Inconsistency>> {
        let mut problems = Vec::new();
        for location in Location::ALL {
            let sidecars = self.sidecar_names(location)?;
            for name in &sidecars {
                match self.load_meta(location, name) {
                    Ok(meta) => {
                        if Location::for_status(meta.status) != location {
                            problems.push(Inconsistency::StatusMismatch {
                                name: name.clone(),
                                location,
                                status: meta.status,
                            });
                        }
                    }
                    Err(err) => problems.push(Inconsistency::UnreadableMetadata {
                        name: name.clone(),
                        location,
                        reason: format!("{err:#}"),
                    }),
                }
                if !self.dir(location).join(name).exists() {
                    problems.push(Inconsistency::MissingContent {
                        name: name.clone(),
                        location,
                    });
                }
            }
            for name in self.content_names(location)? {
                if !sidecars.contains(&name) {
                    problems.push(Inconsistency::MissingMetadata { name, location });
                }
            }
        }
        Ok(problems)
    }

    /// Number of readable records per status.
    pub fn counts(&self) -> Result<BTreeMap<TaskStatus, usize>> {
        let mut counts: BTreeMap<TaskStatus, usize> =
            TaskStatus::ALL.iter().map(|status| (*status, 0)).collect();
        for record in self.list(None)? {
            *counts.entry(record.meta.status).or_default() += 1;
        }
        Ok(counts)
    }

    fn load_meta(&self, location: Location, name: &str) -> Result<TaskMeta> {
        let path = sidecar_path(&self.dir(location).join(name));
        let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let mut meta: TaskMeta =
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        // The file name is authoritative for identity.
        meta.name = name.to_string();
        Ok(meta)
    }

    fn sidecar_names(&self, location: Location) -> Result<Vec<String>> {
        Ok(self
            .file_names(location)?
            .into_iter()
            .filter_map(|name| name.strip_suffix(META_SUFFIX).map(str::to_string))
            .filter(|name| !name.is_empty())
            .collect())
    }

    fn content_names(&self, location: Location) -> Result<Vec<String>> {
        Ok(self
            .file_names(location)?
            .into_iter()
            .filter(|name| !name.ends_with(META_SUFFIX))
            .collect())
    }

    fn file_names(&self, location: Location) -> Result<Vec<String>> {
        let dir = self.dir(location);
        let read_dir = match fs::read_dir(dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("list {}", dir.display())),
        };
        let mut names = Vec::new();
        for item in read_dir {
            let item = item.with_context(|| format!("list {}", dir.display()))?;
            if !item.file_type().map(|kind| kind.is_file()).unwrap_or(false) {
                continue;
            }
            if let Ok(name) = item.file_name().into_string()
                && !name.starts_with('.')
            {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.ends_with(META_SUFFIX)
    {
        return Err(anyhow!("invalid task name {name:?}"));
    }
    Ok(())
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}
