//! Issue tracker mirror of the work graph.
//!
//! The scheduler is the source of truth while the harness runs; the tracker
//! is the durable record the CLI queries between runs. [`LocalTracker`]
//! keeps issues in a JSON file (or only in memory for tests).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::{FailureKind, IssueRef, RepositoryId, WorkItem, WorkItemId, WorkState};
use crate::orchestration::CheckpointEvent;
use crate::scheduler::SharedScheduler;
use crate::{Error, Result};

/// Current version of the tracker file format.
pub const TRACKER_VERSION: u32 = 1;

/// Narrow a [`IssueTracker::list`] query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueFilter {
    pub state: Option<WorkState>,
    pub repository: Option<RepositoryId>,
    pub label: Option<String>,
}

impl IssueFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, item: &WorkItem) -> bool {
        self.state.is_none_or(|state| item.state == state)
            && self
                .repository
                .as_ref()
                .is_none_or(|repo| &item.repository == repo)
            && self.label.as_deref().is_none_or(|label| item.has_label(label))
    }
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn create(&self, item: &WorkItem) -> Result<IssueRef>;

    async fn update_state(&self, issue: &IssueRef, state: WorkState) -> Result<()>;

    async fn add_dependency(&self, issue: &IssueRef, depends_on: &IssueRef) -> Result<()>;

    async fn list(&self, filter: &IssueFilter) -> Result<Vec<WorkItem>>;

    /// Store the full audit record of an item that already has an issue.
    async fn save(&self, item: &WorkItem) -> Result<()> {
        match &item.issue {
            Some(issue) => self.update_state(issue, item.state).await,
            None => Ok(()),
        }
    }

    async fn record_checkpoint(&self, _event: &CheckpointEvent) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TrackerStore {
    version: u32,
    next_issue: u64,
    issues: Vec<WorkItem>,
    #[serde(default)]
    checkpoints: Vec<CheckpointEvent>,
}

impl TrackerStore {
    fn new() -> Self {
        Self {
            version: TRACKER_VERSION,
            ..Default::default()
        }
    }

    fn by_issue(&mut self, issue: &IssueRef) -> Result<&mut WorkItem> {
        self.issues
            .iter_mut()
            .find(|item| item.issue.as_ref() == Some(issue))
            .ok_or_else(|| Error::WorkItemNotFound(issue.to_string()))
    }
}

/// JSON-file issue tracker.
#[derive(Debug)]
pub struct LocalTracker {
    path: Option<PathBuf>,
    store: Mutex<TrackerStore>,
}

impl LocalTracker {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            store: Mutex::new(TrackerStore::new()),
        }
    }

    /// Open the tracker file, starting empty if it does not exist yet.
    pub async fn open(path: &Path) -> Result<Self> {
        let store = match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let store: TrackerStore = serde_json::from_str(&contents)?;
                tracing::debug!(path = %path.display(), issues = store.issues.len(), "tracker loaded");
                store
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TrackerStore::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            store: Mutex::new(store),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Checkpoint audit log, oldest first.
    pub async fn checkpoints(&self) -> Vec<CheckpointEvent> {
        self.store.lock().await.checkpoints.clone()
    }

    async fn persist(&self, store: &TrackerStore) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_string_pretty(store)?;
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, contents).await?;
        tokio::fs::rename(&temp_path, path).await?;
        Ok(())
    }
}

#[async_trait]
impl IssueTracker for LocalTracker {
    async fn create(&self, item: &WorkItem) -> Result<IssueRef> {
        let mut store = self.store.lock().await;
        if let Some(existing) = store.issues.iter().find(|i| i.id == item.id) {
            if let Some(issue) = &existing.issue {
                return Ok(issue.clone());
            }
        }
        store.next_issue += 1;
        let issue = IssueRef(format!("HX-{}", store.next_issue));
        let mut record = item.clone();
        record.issue = Some(issue.clone());
        store.issues.push(record);
        self.persist(&store).await?;
        tracing::debug!(issue = %issue, item = %item.id.short(), "issue created");
        Ok(issue)
    }

    async fn update_state(&self, issue: &IssueRef, state: WorkState) -> Result<()> {
        let mut store = self.store.lock().await;
        store.by_issue(issue)?.state = state;
        self.persist(&store).await
    }

    async fn add_dependency(&self, issue: &IssueRef, depends_on: &IssueRef) -> Result<()> {
        let mut store = self.store.lock().await;
        let dependency = store.by_issue(depends_on)?.id;
        let record = store.by_issue(issue)?;
        if !record.depends_on.contains(&dependency) {
            record.depends_on.push(dependency);
        }
        self.persist(&store).await
    }

    async fn list(&self, filter: &IssueFilter) -> Result<Vec<WorkItem>> {
        let store = self.store.lock().await;
        let mut items: Vec<WorkItem> = store
            .issues
            .iter()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect();
        items.sort_by_key(|item| item.order);
        Ok(items)
    }

    async fn save(&self, item: &WorkItem) -> Result<()> {
        let mut store = self.store.lock().await;
        match store.issues.iter_mut().find(|i| i.id == item.id) {
            Some(record) => *record = item.clone(),
            None => return Err(Error::WorkItemNotFound(item.id.to_string())),
        }
        self.persist(&store).await
    }

    async fn record_checkpoint(&self, event: &CheckpointEvent) -> Result<()> {
        let mut store = self.store.lock().await;
        store.checkpoints.push(event.clone());
        self.persist(&store).await
    }
}

/// Mirror every scheduler change since the last sync to the tracker.
///
/// Items without an issue get one, then new dependencies are linked between
/// issues. Whatever a failing tracker call leaves unwritten is queued again
/// for the next sync. Returns the number of items written.
pub async fn sync_changes(scheduler: &SharedScheduler, tracker: &dyn IssueTracker) -> Result<usize> {
    let (changed, dependencies) = {
        let mut guard = scheduler.write().await;
        (guard.take_changes(), guard.take_new_dependencies())
    };

    for (written, id) in changed.iter().enumerate() {
        if let Err(e) = sync_item(scheduler, tracker, id).await {
            let mut guard = scheduler.write().await;
            guard.requeue_changes(&changed[written..]);
            guard.requeue_dependencies(&dependencies);
            return Err(e);
        }
    }

    for (linked, (dependent, dependency)) in dependencies.iter().enumerate() {
        let issues = {
            let guard = scheduler.read().await;
            let issue = |id: &WorkItemId| guard.get(id).and_then(|item| item.issue.clone());
            (issue(dependent), issue(dependency))
        };
        let (Some(issue), Some(depends_on)) = issues else {
            tracing::debug!(item = %dependent.short(), "dependency endpoint has no issue");
            continue;
        };
        if let Err(e) = tracker.add_dependency(&issue, &depends_on).await {
            scheduler
                .write()
                .await
                .requeue_dependencies(&dependencies[linked..]);
            return Err(e);
        }
    }
    Ok(changed.len())
}

async fn sync_item(
    scheduler: &SharedScheduler,
    tracker: &dyn IssueTracker,
    id: &WorkItemId,
) -> Result<()> {
    let Some(item) = scheduler.read().await.get(id).cloned() else {
        return Ok(());
    };
    if item.issue.is_some() {
        return tracker.save(&item).await;
    }
    let issue = tracker.create(&item).await?;
    scheduler.write().await.set_issue(id, issue)
}

/// Prepare stored items for a new run.
///
/// Sessions interrupted by a previous crash are failed so they can be
/// re-opened explicitly.
pub fn recover_interrupted(items: &mut [WorkItem]) -> Vec<WorkItemId> {
    let mut recovered = Vec::new();
    for item in items.iter_mut().filter(|item| item.state.is_active()) {
        item.record_failure(FailureKind::Unrecoverable, "session interrupted");
        recovered.push(item.id);
    }
    recovered
}

/// Spec items that are not tracked yet, matched by title.
///
/// Dependencies on already tracked items are rewritten to the tracked ids.
pub fn untracked_items(tracked: &[WorkItem], items: Vec<WorkItem>) -> Vec<WorkItem> {
    let known: HashMap<&str, WorkItemId> = tracked
        .iter()
        .map(|item| (item.title.as_str(), item.id))
        .collect();
    let remap: HashMap<WorkItemId, WorkItemId> = items
        .iter()
        .filter_map(|item| known.get(item.title.as_str()).map(|id| (item.id, *id)))
        .collect();

    items
        .into_iter()
        .filter(|item| !remap.contains_key(&item.id))
        .map(|mut item| {
            for dep in item.depends_on.iter_mut() {
                if let Some(tracked) = remap.get(dep) {
                    *dep = *tracked;
                }
            }
            item
        })
        .collect()
}
