//! Work item data model for the work graph.
//!
//! Work items ("issues") are the atomic units of work executed by one
//! autonomous session. Each item tracks its lifecycle state, priority,
//! dependencies, verification attempts and the audit trail of its outcome.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::tier::Classification;

/// Unique identifier for a work item.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(pub Uuid);

impl WorkItemId {
    /// Create a new unique work item identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier of a checkpoint review, used as lineage for findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub Uuid);

impl CheckpointId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of the repository (or property) that owns a work item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(pub String);

impl RepositoryId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RepositoryId {
    fn default() -> Self {
        Self("main".to_string())
    }
}

impl std::fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RepositoryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Ordinal priority. Lower values are more urgent; `P0` is the top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub const P0: Priority = Priority(0);
    pub const P1: Priority = Priority(1);
    pub const P2: Priority = Priority(2);

    /// Promote by `levels`, clamping at `P0`.
    pub fn promoted(self, levels: u8) -> Priority {
        Priority(self.0.saturating_sub(levels))
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::P2
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Lifecycle state of a work item.
///
/// The happy path is `Pending -> Runnable -> InProgress -> CodeComplete ->
/// Verified -> Closed`. Allowed transitions live in
/// [`crate::scheduler::state::can_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    /// Waiting on dependencies.
    #[default]
    Pending,
    /// Dependencies satisfied, can be picked by the orchestrator.
    Runnable,
    /// A session is executing the item.
    InProgress,
    /// Local verification passed.
    CodeComplete,
    /// End-to-end verification passed.
    Verified,
    /// Committed and closed.
    Closed,
    /// An ancestor failed or the item yielded to a discovered blocker.
    Blocked,
    /// Non-recoverable failure; requires a manual re-open.
    Failed,
    /// Withdrawn before any session ran.
    Cancelled,
}

impl WorkState {
    pub const ALL: [WorkState; 9] = [
        WorkState::Pending,
        WorkState::Runnable,
        WorkState::InProgress,
        WorkState::CodeComplete,
        WorkState::Verified,
        WorkState::Closed,
        WorkState::Blocked,
        WorkState::Failed,
        WorkState::Cancelled,
    ];

    /// Whether dependents may treat this item as done.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, WorkState::Verified | WorkState::Closed)
    }

    /// Whether this item can never satisfy its dependents without manual action.
    pub fn is_dead_end(&self) -> bool {
        matches!(self, WorkState::Failed | WorkState::Cancelled)
    }

    /// Whether a session currently owns the item.
    pub fn is_active(&self) -> bool {
        matches!(self, WorkState::InProgress | WorkState::CodeComplete)
    }

    /// Whether the item is finished (no more sessions will run it).
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            WorkState::Closed | WorkState::Failed | WorkState::Cancelled
        )
    }
}

impl std::fmt::Display for WorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkState::Pending => "pending",
            WorkState::Runnable => "runnable",
            WorkState::InProgress => "in_progress",
            WorkState::CodeComplete => "code_complete",
            WorkState::Verified => "verified",
            WorkState::Closed => "closed",
            WorkState::Blocked => "blocked",
            WorkState::Failed => "failed",
            WorkState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for WorkState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        WorkState::ALL
            .into_iter()
            .find(|state| state.to_string() == s.trim().to_lowercase().replace('-', "_"))
            .ok_or_else(|| format!("unknown state: {}", s))
    }
}

/// A single acceptance criterion of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AcceptanceCriterion {
    /// A plain description checked by the agent and reviewers.
    Description(String),
    /// A description with a shell command that proves it.
    Verified { description: String, verify: String },
}

impl AcceptanceCriterion {
    pub fn description(&self) -> &str {
        match self {
            AcceptanceCriterion::Description(d) => d,
            AcceptanceCriterion::Verified { description, .. } => description,
        }
    }

    pub fn verify_command(&self) -> Option<&str> {
        match self {
            AcceptanceCriterion::Description(_) => None,
            AcceptanceCriterion::Verified { verify, .. } => Some(verify),
        }
    }
}

/// Where a work item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Declared in the work spec.
    #[default]
    Feature,
    /// Synthetic item repairing a broken repository baseline.
    SelfHeal,
    /// Critical finding of a checkpoint review.
    Finding,
    /// Discovered during a session or created from the command line.
    AdHoc,
}

/// Non-owning back-reference to the event that produced a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "from", content = "id")]
pub enum Lineage {
    Checkpoint(CheckpointId),
    Session(WorkItemId),
    Baseline(RepositoryId),
}

impl std::fmt::Display for Lineage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lineage::Checkpoint(id) => write!(f, "checkpoint {}", id.short()),
            Lineage::Session(id) => write!(f, "session {}", id.short()),
            Lineage::Baseline(repo) => write!(f, "baseline of {}", repo),
        }
    }
}

/// Why an item ended up `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Local or end-to-end verification exhausted its retry budget.
    Verification,
    /// Tool or environment fault.
    Unrecoverable,
    /// Cancelled while a session was running.
    Cancelled,
}

/// Audit record kept on a failed item, also after it is re-opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub reason: String,
    /// Retries and repair attempts spent before giving up.
    pub remediation_attempts: u32,
    pub at: DateTime<Utc>,
}

/// Reference to a durable changeset (a commit id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitRef(pub String);

impl CommitRef {
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for CommitRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier assigned by the issue tracker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueRef(pub String);

impl std::fmt::Display for IssueRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single work item in the work graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Nominal priority as declared.
    pub priority: Priority,
    /// Number of blocker promotions applied on top of `priority`.
    #[serde(default)]
    pub boosts: u8,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Items that must reach `verified`/`closed` first, in declaration order.
    #[serde(default)]
    pub depends_on: Vec<WorkItemId>,
    pub state: WorkState,
    #[serde(default)]
    pub acceptance: Vec<AcceptanceCriterion>,
    #[serde(default)]
    pub repository: RepositoryId,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub kind: ItemKind,
    /// Declaration order, used to break priority ties.
    #[serde(default)]
    pub order: u64,
    #[serde(default)]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub discovered_from: Option<Lineage>,
    /// Local verification failures in the current repair cycle.
    #[serde(default)]
    pub local_attempts: u32,
    /// End-to-end verification failures so far.
    #[serde(default)]
    pub repair_attempts: u32,
    #[serde(default)]
    pub failure: Option<FailureRecord>,
    /// Why the item is blocked, if it is.
    #[serde(default)]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub commit: Option<CommitRef>,
    #[serde(default)]
    pub issue: Option<IssueRef>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Create a new pending work item with default priority.
    pub fn new(title: &str, description: &str) -> Self {
        Self {
            id: WorkItemId::new(),
            title: title.to_string(),
            description: description.to_string(),
            priority: Priority::default(),
            boosts: 0,
            labels: BTreeSet::new(),
            depends_on: Vec::new(),
            state: WorkState::Pending,
            acceptance: Vec::new(),
            repository: RepositoryId::default(),
            files: Vec::new(),
            kind: ItemKind::Feature,
            order: 0,
            classification: None,
            discovered_from: None,
            local_attempts: 0,
            repair_attempts: 0,
            failure: None,
            blocked_reason: None,
            commit: None,
            issue: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_repository(mut self, repository: RepositoryId) -> Self {
        self.repository = repository;
        self
    }

    pub fn with_files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_kind(mut self, kind: ItemKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_acceptance(mut self, acceptance: Vec<AcceptanceCriterion>) -> Self {
        self.acceptance = acceptance;
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// Priority after blocker promotions of `step` levels each.
    pub fn effective_priority(&self, step: u8) -> Priority {
        self.priority
            .promoted(step.saturating_mul(self.boosts))
    }

    /// Record a failure and move to `Failed`. Callers validate the transition.
    pub fn record_failure(&mut self, kind: FailureKind, reason: &str) {
        self.failure = Some(FailureRecord {
            kind,
            reason: reason.to_string(),
            remediation_attempts: self.local_attempts + self.repair_attempts,
            at: Utc::now(),
        });
        self.state = WorkState::Failed;
        self.finished_at = Some(Utc::now());
    }

    /// Human-readable one-line summary used by logs and the CLI.
    pub fn summary(&self) -> String {
        format!(
            "{} {} [{}] {} ({})",
            self.id.short(),
            self.priority,
            self.state,
            self.title,
            self.repository
        )
    }
}
