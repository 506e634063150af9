//! Periodic checkpoint reviews.
//!
//! The [`CheckpointTracker`] counts finished sessions and wall time since the
//! last checkpoint. When either limit is reached a checkpoint is due: new
//! sessions are held back, a [`Reviewer`] looks at the items closed since the
//! last checkpoint, and critical findings come back as P0 work items.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::core::{CheckpointId, ItemKind, Lineage, Priority, RepositoryId, WorkItem, WorkItemId};
use crate::error::Result;
use crate::orchestration::routing::RepositoryContext;
use crate::orchestration::verify::run_checks;

/// Default number of finished sessions between checkpoints.
pub const DEFAULT_EVERY_SESSIONS: u32 = 3;

/// Default wall time between checkpoints (4 hours).
pub const DEFAULT_EVERY_SECS: u64 = 4 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    pub every_sessions: u32,
    pub every: Duration,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            every_sessions: DEFAULT_EVERY_SESSIONS,
            every: Duration::from_secs(DEFAULT_EVERY_SECS),
        }
    }
}

/// Which limit made a checkpoint due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum CheckpointTrigger {
    Sessions(u32),
    Elapsed(Duration),
}

impl std::fmt::Display for CheckpointTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointTrigger::Sessions(n) => write!(f, "{} sessions finished", n),
            CheckpointTrigger::Elapsed(d) => write!(f, "{}m elapsed", d.as_secs() / 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewArea {
    Security,
    Architecture,
    Quality,
}

impl ReviewArea {
    pub const ALL: [ReviewArea; 3] = [
        ReviewArea::Security,
        ReviewArea::Architecture,
        ReviewArea::Quality,
    ];
}

impl std::fmt::Display for ReviewArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReviewArea::Security => "security",
            ReviewArea::Architecture => "architecture",
            ReviewArea::Quality => "quality",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One observation of a checkpoint review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub area: ReviewArea,
    pub severity: Severity,
    pub title: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub repository: Option<RepositoryId>,
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl Finding {
    pub fn critical(area: ReviewArea, title: &str, details: &str) -> Self {
        Self {
            area,
            severity: Severity::Critical,
            title: title.to_string(),
            details: details.to_string(),
            repository: None,
            files: Vec::new(),
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }

    /// A P0 work item addressing this finding.
    pub fn to_work_item(&self, checkpoint: CheckpointId) -> WorkItem {
        let mut item = WorkItem::new(
            &format!("[{}] {}", self.area, self.title),
            &self.details,
        )
        .with_priority(Priority::P0)
        .with_kind(ItemKind::Finding)
        .with_labels([self.area.to_string(), "checkpoint".to_string()])
        .with_files(self.files.clone());
        if let Some(repository) = &self.repository {
            item.repository = repository.clone();
        }
        item.discovered_from = Some(Lineage::Checkpoint(checkpoint));
        item
    }
}

/// Audit record of one checkpoint review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEvent {
    pub id: CheckpointId,
    pub trigger: CheckpointTrigger,
    pub at: DateTime<Utc>,
    pub reviewed: Vec<WorkItemId>,
    pub findings: Vec<Finding>,
    /// Work items created from critical findings.
    pub created: Vec<WorkItemId>,
}

impl CheckpointEvent {
    pub fn critical_count(&self) -> usize {
        self.findings.iter().filter(|f| f.is_critical()).count()
    }
}

/// Counts sessions and time toward the next checkpoint.
#[derive(Debug)]
pub struct CheckpointTracker {
    policy: CheckpointPolicy,
    finished: u32,
    since: Instant,
    closed: Vec<WorkItemId>,
    events: Vec<CheckpointEvent>,
}

impl CheckpointTracker {
    pub fn new(policy: CheckpointPolicy) -> Self {
        Self {
            policy,
            finished: 0,
            since: Instant::now(),
            closed: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn policy(&self) -> &CheckpointPolicy {
        &self.policy
    }

    /// Count a finished session; closed items are reviewed at the next checkpoint.
    pub fn record_session(&mut self, item: WorkItemId, closed: bool) {
        self.finished += 1;
        if closed {
            self.closed.push(item);
        }
    }

    pub fn sessions_since_checkpoint(&self) -> u32 {
        self.finished
    }

    /// Items closed since the last checkpoint.
    pub fn pending_review(&self) -> &[WorkItemId] {
        &self.closed
    }

    /// Whether a checkpoint must run before the next session starts.
    pub fn due(&self) -> Option<CheckpointTrigger> {
        if self.finished >= self.policy.every_sessions {
            return Some(CheckpointTrigger::Sessions(self.finished));
        }
        let elapsed = self.since.elapsed();
        if elapsed >= self.policy.every {
            return Some(CheckpointTrigger::Elapsed(elapsed));
        }
        None
    }

    /// Store the event and start counting toward the next checkpoint.
    pub fn complete(&mut self, event: CheckpointEvent) {
        self.finished = 0;
        self.since = Instant::now();
        self.closed.clear();
        self.events.push(event);
    }

    /// Every checkpoint completed so far, oldest first.
    pub fn events(&self) -> &[CheckpointEvent] {
        &self.events
    }
}

/// Reviews recently closed work at a checkpoint.
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(
        &self,
        checkpoint: CheckpointId,
        items: &[WorkItem],
        repositories: &[RepositoryContext],
    ) -> Result<Vec<Finding>>;
}

/// Runs each repository's review commands per area.
///
/// A failing command is a critical finding carrying the command output.
#[derive(Debug, Clone)]
pub struct CommandReviewer {
    timeout: Duration,
}

impl CommandReviewer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for CommandReviewer {
    fn default() -> Self {
        Self::new(Duration::from_secs(15 * 60))
    }
}

#[async_trait]
impl Reviewer for CommandReviewer {
    async fn review(
        &self,
        checkpoint: CheckpointId,
        items: &[WorkItem],
        repositories: &[RepositoryContext],
    ) -> Result<Vec<Finding>> {
        let touched: BTreeSet<&RepositoryId> = items.iter().map(|i| &i.repository).collect();
        let mut findings = Vec::new();
        for repo in repositories
            .iter()
            .filter(|repo| touched.is_empty() || touched.contains(&repo.id))
        {
            for area in ReviewArea::ALL {
                let commands = repo.review_commands(area);
                if commands.is_empty() {
                    continue;
                }
                let report = run_checks(commands, &repo.path, self.timeout).await?;
                for check in report.failures() {
                    let mut finding = Finding::critical(
                        area,
                        &format!("`{}` failed in {}", check.command, repo.id),
                        &check.output,
                    );
                    finding.repository = Some(repo.id.clone());
                    findings.push(finding);
                }
            }
        }
        tracing::info!(
            checkpoint = %checkpoint.short(),
            items = items.len(),
            findings = findings.len(),
            "checkpoint review finished"
        );
        Ok(findings)
    }
}
