//! Collectors turn items from a monitored source into active tasks.
//!
//! A collector only knows how to list candidates and how to materialize one
//! of them. De-duplication state ([`SeenIds`]) is owned by the caller and
//! handed in explicitly; [`collect_once`] drives a scan and records it in the
//! audit log.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::atomic::write_json_atomic;
use super::audit::{ActionResult, AuditEntry, AuditLog, actors, failure, file_write};
use super::task_store::{TaskMeta, TaskRecord, TaskStore};
use crate::core::types::TaskStatus;

/// Source item ids a collector has already turned into tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeenIds {
    ids: BTreeSet<String>,
}

impl SeenIds {
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        self.ids.insert(id.into())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Load a persisted store. Missing is empty; corrupt is reset with a warning.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        match serde_json::from_str(&contents) {
            Ok(seen) => Ok(seen),
            Err(err) => {
                warn!(path = %path.display(), err = %err, "resetting corrupt seen-id store");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }
}

/// Where a collector's [`SeenIds`] live.
pub fn seen_path(seen_dir: &Path, collector: &str) -> PathBuf {
    seen_dir.join(format!("{collector}.json"))
}

/// A source of candidate tasks.
pub trait Collector {
    type Item;

    /// Stable name; also keys the persisted seen-id store.
    fn name(&self) -> &str;

    /// Items not yet in `seen`.
    fn produce_candidates(&mut self, seen: &SeenIds) -> Result<Vec<Self::Item>>;

    /// De-duplication id of `item`.
    fn item_id(&self, item: &Self::Item) -> String;

    /// Write `item` into the store as a pending task.
    fn materialize(
        &self,
        store: &TaskStore,
        item: &Self::Item,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord>;
}

/// Result of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectReport {
    pub created: Vec<String>,
    /// `(item id, error)` for items that could not be materialized.
    pub failed: Vec<(String, String)>,
}

/// One scan: list candidates, materialize each unseen item, mark it seen.
///
/// An item that fails to materialize stays unseen so the next scan retries it.
#[instrument(skip_all, fields(collector = %collector.name()))]
pub fn collect_once<C: Collector>(
    collector: &mut C,
    seen: &mut SeenIds,
    store: &TaskStore,
    audit: &AuditLog,
    now: DateTime<Utc>,
) -> Result<CollectReport> {
    let name = collector.name().to_string();
    audit.record(
        AuditEntry::new("watcher_scan", actors::WATCHER, &name)
            .at(now)
            .result(ActionResult::Pending),
    );

    let candidates = match collector.produce_candidates(seen) {
        Ok(candidates) => candidates,
        Err(err) => {
            let message = format!("{err:#}");
            audit.record(failure(actors::WATCHER, &name, "watcher_scan", &message).at(now));
            return Err(err).with_context(|| format!("scan {name}"));
        }
    };

    let mut report = CollectReport::default();
    for item in candidates {
        let id = collector.item_id(&item);
        if seen.contains(&id) {
            continue;
        }
        match collector.materialize(store, &item, now) {
            Ok(record) => {
                let size = fs::metadata(&record.content_path)
                    .map(|meta| meta.len())
                    .unwrap_or(0);
                audit.record(
                    file_write(actors::WATCHER, &record.name, size, record.meta.source()).at(now),
                );
                seen.insert(id);
                report.created.push(record.name);
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(item = %id, err = %message, "failed to materialize item");
                audit.record(failure(actors::WATCHER, &id, "error", &message).at(now));
                report.failed.push((id, message));
            }
        }
    }

    audit.record(
        AuditEntry::new("watcher_scan", actors::WATCHER, &name)
            .at(now)
            .param("created", report.created.len())
            .param("failed", report.failed.len()),
    );
    if !report.created.is_empty() {
        info!(created = report.created.len(), "collected new tasks");
    }
    Ok(report)
}

/// A file dropped into `inbox/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxItem {
    pub file_name: String,
    pub path: PathBuf,
}

/// Copies new files from the inbox directory into the active location.
#[derive(Debug, Clone)]
pub struct InboxCollector {
    dir: PathBuf,
}

impl InboxCollector {
    pub const NAME: &'static str = "inbox";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Collector for InboxCollector {
    type Item = InboxItem;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn produce_candidates(&mut self, seen: &SeenIds) -> Result<Vec<InboxItem>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("list {}", self.dir.display())),
        };
        let mut items = Vec::new();
        for entry in read_dir {
            let entry = entry.with_context(|| format!("list {}", self.dir.display()))?;
            if !entry.file_type().map(|kind| kind.is_file()).unwrap_or(false) {
                continue;
            }
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            if file_name.starts_with('.') || seen.contains(&file_name) {
                continue;
            }
            items.push(InboxItem {
                path: entry.path(),
                file_name,
            });
        }
        items.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        debug!(candidates = items.len(), "inbox scanned");
        Ok(items)
    }

    fn item_id(&self, item: &InboxItem) -> String {
        item.file_name.clone()
    }

    fn materialize(
        &self,
        store: &TaskStore,
        item: &InboxItem,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord> {
        let content =
            fs::read(&item.path).with_context(|| format!("read {}", item.path.display()))?;
        let name = store.unique_name(&item.file_name);
        let meta = TaskMeta::new(&name, TaskStatus::Pending)
            .with("size", content.len())
            .with("timestamp", now.to_rfc3339())
            .with("source", Self::NAME)
            .with("original_name", item.file_name.as_str());
        store.create(&content, meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::paths::VaultPaths;
    use anyhow::anyhow;

    fn setup() -> (tempfile::TempDir, VaultPaths, TaskStore, AuditLog) {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = VaultPaths::new(temp.path());
        paths.ensure_layout().expect("layout");
        let store = TaskStore::open(&paths).expect("store");
        let audit = AuditLog::new(&paths.logs_dir);
        (temp, paths, store, audit)
    }

    #[test]
    fn inbox_files_become_pending_tasks_once() {
        let (_temp, paths, store, audit) = setup();
        fs::write(paths.inbox_dir.join("note.md"), "hello").expect("write");
        fs::write(paths.inbox_dir.join(".hidden"), "skip").expect("write");

        let mut collector = InboxCollector::new(&paths.inbox_dir);
        let mut seen = SeenIds::default();
        let now = Utc::now();
        let report = collect_once(&mut collector, &mut seen, &store, &audit, now).expect("collect");
        assert_eq!(report.created, vec!["note.md"]);
        assert!(seen.contains("note.md"));

        let record = store.require("note.md").expect("task");
        assert_eq!(record.meta.status, TaskStatus::Pending);
        assert_eq!(record.meta.source(), "inbox");
        assert_eq!(record.meta.fields["size"], 5);

        let again = collect_once(&mut collector, &mut seen, &store, &audit, now).expect("collect");
        assert!(again.created.is_empty());

        let actions: Vec<_> = audit
            .for_date(now.date_naive())
            .expect("audit")
            .into_iter()
            .map(|entry| entry.action_type)
            .collect();
        assert_eq!(
            actions,
            vec!["watcher_scan", "file_write", "watcher_scan", "watcher_scan", "watcher_scan"]
        );
    }

    #[test]
    fn name_clash_in_active_location_gets_suffix() {
        let (_temp, paths, store, audit) = setup();
        store
            .create(b"older", TaskMeta::new("note.md", TaskStatus::Pending))
            .expect("create");
        fs::write(paths.inbox_dir.join("note.md"), "newer").expect("write");

        let mut seen = SeenIds::default();
        let report = collect_once(
            &mut InboxCollector::new(&paths.inbox_dir),
            &mut seen,
            &store,
            &audit,
            Utc::now(),
        )
        .expect("collect");
        assert_eq!(report.created, vec!["note_2.md"]);
    }

    #[test]
    fn seen_ids_persist_and_reset_when_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = seen_path(temp.path(), "inbox");
        let mut seen = SeenIds::default();
        seen.insert("a.md");
        seen.save(&path).expect("save");
        assert_eq!(SeenIds::load(&path).expect("load"), seen);

        fs::write(&path, "[1, 2").expect("write");
        assert!(SeenIds::load(&path).expect("load").is_empty());
    }

    struct FailingCollector;

    impl Collector for FailingCollector {
        type Item = String;

        fn name(&self) -> &str {
            "failing"
        }

        fn produce_candidates(&mut self, _seen: &SeenIds) -> Result<Vec<String>> {
            Ok(vec!["one".to_string()])
        }

        fn item_id(&self, item: &String) -> String {
            item.clone()
        }

        fn materialize(
            &self,
            _store: &TaskStore,
            _item: &String,
            _now: DateTime<Utc>,
        ) -> Result<TaskRecord> {
            Err(anyhow!("source unavailable"))
        }
    }

    /// Failed items are reported, audited as errors, and left unseen.
    #[test]
    fn materialize_failure_is_recorded_and_retried_later() {
        let (_temp, _paths, store, audit) = setup();
        let mut seen = SeenIds::default();
        let now = Utc::now();
        let report =
            collect_once(&mut FailingCollector, &mut seen, &store, &audit, now).expect("collect");
        assert_eq!(report.failed.len(), 1);
        assert!(!seen.contains("one"));

        let errors: Vec<_> = audit
            .for_date(now.date_naive())
            .expect("audit")
            .into_iter()
            .filter(|entry| entry.action_type == "error")
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error.as_deref(), Some("source unavailable"));
    }
}
