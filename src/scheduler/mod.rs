//! Work scheduler: lifecycle state machine over the work graph.
//!
//! The Scheduler owns the [`WorkGraph`] and is the only component that
//! changes item states. Every public mutation ends with a runnability refresh
//! of the whole graph, so a state change and the promotion (or blocking) of
//! its dependents are one logical operation. The orchestrator shares it as a
//! [`SharedScheduler`] and holds one write guard per mutation.
//!
//! Selection order for [`Scheduler::next_runnable`]:
//! 1. self-heal items first;
//! 2. then lowest effective priority (nominal priority promoted by blocker
//!    boosts);
//! 3. then earliest declaration order.

pub mod state;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::{
    CommitRef, FailureKind, IssueRef, ItemKind, Lineage, Priority, RepositoryId, WorkGraph,
    WorkItem, WorkItemId, WorkState,
};
use crate::error::{Error, Result};
use crate::spec::WorkSpec;

pub use state::{can_transition, transition, TransitionRecord};

/// Scheduler shared between the orchestrator and concurrent sessions.
pub type SharedScheduler = Arc<RwLock<Scheduler>>;

/// Label that marks discovered work as blocking the item that found it.
pub const BLOCKER_LABEL: &str = "blocker";

/// Retry budgets and priority boost arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerPolicy {
    /// Local verification attempts per repair cycle before failing.
    pub local_attempts: u32,
    /// Total end-to-end verification attempts before failing.
    pub e2e_attempts: u32,
    /// Priority levels gained per blocker boost.
    pub blocker_boost: u8,
    /// Whether repeated boosts accumulate.
    pub stack_boosts: bool,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            local_attempts: 3,
            e2e_attempts: 3,
            blocker_boost: 1,
            stack_boosts: false,
        }
    }
}

/// What happens after a local verification failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalOutcome {
    /// Retry within the same session.
    Retry { attempt: u32, remaining: u32 },
    /// Budget exhausted; the item is now `failed`.
    Failed,
}

/// What happens after an end-to-end verification failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndToEndOutcome {
    /// Item went back to `in_progress` for a repair attempt.
    Repair { attempt: u32, remaining: u32 },
    /// Budget exhausted; the item is now `failed`.
    Failed,
}

/// Item counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub counts: BTreeMap<WorkState, usize>,
}

impl Progress {
    pub fn count(&self, state: WorkState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    /// Items that reached `verified` or `closed`.
    pub fn done(&self) -> usize {
        self.count(WorkState::Verified) + self.count(WorkState::Closed)
    }

    pub fn percent_done(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.done() as f64 * 100.0 / self.total as f64
    }
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} done ({:.0}%)", self.done(), self.total, self.percent_done())?;
        for (state, count) in &self.counts {
            write!(f, ", {} {}", count, state)?;
        }
        Ok(())
    }
}

/// Lifecycle state machine and selection policy over the work graph.
#[derive(Debug)]
pub struct Scheduler {
    graph: WorkGraph,
    policy: SchedulerPolicy,
    history: Vec<TransitionRecord>,
    /// Items changed since the last [`Scheduler::take_changes`].
    changed: Vec<WorkItemId>,
    /// Dependencies added since the last [`Scheduler::take_new_dependencies`],
    /// as `(dependent, dependency)`.
    new_dependencies: Vec<(WorkItemId, WorkItemId)>,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new(policy: SchedulerPolicy) -> Self {
        Self {
            graph: WorkGraph::new(),
            policy,
            history: Vec::new(),
            changed: Vec::new(),
            new_dependencies: Vec::new(),
        }
    }

    /// Build a scheduler from a loaded spec and compute initial runnability.
    pub fn from_spec(spec: &WorkSpec, policy: SchedulerPolicy) -> Result<Self> {
        Self::from_items(spec.items.clone(), policy)
    }

    /// Build a scheduler from persisted items, e.g. the tracker's records.
    ///
    /// Every item and dependency counts as changed so the first tracker sync
    /// sees all of them.
    pub fn from_items(items: Vec<WorkItem>, policy: SchedulerPolicy) -> Result<Self> {
        let graph = WorkGraph::from_items(items)?;
        let mut scheduler = Self {
            changed: graph.ids(),
            new_dependencies: graph.edges(),
            graph,
            policy,
            history: Vec::new(),
        };
        scheduler.refresh()?;
        Ok(scheduler)
    }

    /// Wrap in the shared handle used by the orchestrator.
    pub fn into_shared(self) -> SharedScheduler {
        Arc::new(RwLock::new(self))
    }

    pub fn policy(&self) -> &SchedulerPolicy {
        &self.policy
    }

    pub fn graph(&self) -> &WorkGraph {
        &self.graph
    }

    /// Every transition applied so far, oldest first.
    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// Drain the ids of items changed since the last call, without duplicates.
    pub fn take_changes(&mut self) -> Vec<WorkItemId> {
        let mut changed = std::mem::take(&mut self.changed);
        let mut seen = std::collections::HashSet::new();
        changed.retain(|id| seen.insert(*id));
        changed
    }

    /// Drain the dependencies added since the last call.
    pub fn take_new_dependencies(&mut self) -> Vec<(WorkItemId, WorkItemId)> {
        std::mem::take(&mut self.new_dependencies)
    }

    /// Put back changes a tracker sync could not write, ahead of newer ones.
    pub fn requeue_changes(&mut self, ids: &[WorkItemId]) {
        self.changed.splice(0..0, ids.iter().copied());
    }

    pub fn requeue_dependencies(&mut self, edges: &[(WorkItemId, WorkItemId)]) {
        self.new_dependencies.splice(0..0, edges.iter().copied());
    }

    // Queries

    pub fn items(&self) -> Vec<&WorkItem> {
        self.graph.items()
    }

    pub fn get(&self, id: &WorkItemId) -> Option<&WorkItem> {
        self.graph.get(id)
    }

    /// Find an item by full id, short id prefix or exact title (case-insensitive).
    pub fn find(&self, query: &str) -> Result<&WorkItem> {
        let query = query.trim();
        if let Ok(id) = query.parse::<WorkItemId>() {
            if let Some(item) = self.graph.get(&id) {
                return Ok(item);
            }
        }

        let matches: Vec<&WorkItem> = self
            .graph
            .items()
            .into_iter()
            .filter(|item| {
                (!query.is_empty() && item.id.to_string().starts_with(query))
                    || item.title.eq_ignore_ascii_case(query)
            })
            .collect();
        match matches.as_slice() {
            [item] => Ok(*item),
            [] => Err(Error::WorkItemNotFound(query.to_string())),
            _ => Err(Error::WorkItemNotFound(format!(
                "{} is ambiguous ({} matches)",
                query,
                matches.len()
            ))),
        }
    }

    /// Runnable items in selection order.
    pub fn runnable(&self) -> Vec<&WorkItem> {
        let step = self.policy.blocker_boost;
        let mut items: Vec<&WorkItem> = self
            .graph
            .items()
            .into_iter()
            .filter(|item| item.state == WorkState::Runnable)
            .collect();
        items.sort_by_key(|item| {
            (
                item.kind != ItemKind::SelfHeal,
                item.effective_priority(step),
                item.order,
            )
        });
        items
    }

    /// The item the next session should work on, if any.
    pub fn next_runnable(&self) -> Option<&WorkItem> {
        self.runnable().into_iter().next()
    }

    pub fn blocked(&self) -> Vec<&WorkItem> {
        self.items_in(WorkState::Blocked)
    }

    pub fn active(&self) -> Vec<&WorkItem> {
        self.graph
            .items()
            .into_iter()
            .filter(|item| item.state.is_active())
            .collect()
    }

    pub fn items_in(&self, state: WorkState) -> Vec<&WorkItem> {
        self.graph
            .items()
            .into_iter()
            .filter(|item| item.state == state)
            .collect()
    }

    pub fn progress(&self) -> Progress {
        let mut progress = Progress {
            total: self.graph.len(),
            counts: BTreeMap::new(),
        };
        for item in self.graph.items() {
            *progress.counts.entry(item.state).or_insert(0) += 1;
        }
        progress
    }

    /// Nothing is runnable and no session is active.
    pub fn is_idle(&self) -> bool {
        self.graph
            .items()
            .iter()
            .all(|item| item.state != WorkState::Runnable && !item.state.is_active())
    }

    /// Every item is closed, failed or cancelled.
    pub fn is_finished(&self) -> bool {
        self.graph.items().iter().all(|item| item.state.is_finished())
    }

    /// Unfinished self-heal item for a repository, if one exists.
    pub fn open_self_heal(&self, repository: &RepositoryId) -> Option<&WorkItem> {
        self.graph.items().into_iter().find(|item| {
            item.kind == ItemKind::SelfHeal
                && &item.repository == repository
                && !item.state.is_finished()
        })
    }

    /// Whether an item repairs its repository's baseline: a self-heal item,
    /// or work discovered (transitively) by a self-heal session.
    pub fn repairs_baseline(&self, item: &WorkItem) -> bool {
        let mut current = item;
        loop {
            if current.kind == ItemKind::SelfHeal {
                return true;
            }
            let Some(Lineage::Session(parent)) = &current.discovered_from else {
                return false;
            };
            match self.graph.get(parent) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    // Mutations

    /// Add a new item (pending) and compute its runnability.
    pub fn add_item(&mut self, mut item: WorkItem) -> Result<WorkItemId> {
        item.state = WorkState::Pending;
        let deps = std::mem::take(&mut item.depends_on);
        let id = self.graph.push(item);
        for dep in deps {
            self.link(&id, &dep)?;
        }
        self.changed.push(id);
        self.refresh()?;
        Ok(id)
    }

    /// Append a batch of items after the existing ones.
    ///
    /// Dependencies may point at items of the same batch regardless of their
    /// position in it.
    pub fn extend(&mut self, items: Vec<WorkItem>) -> Result<Vec<WorkItemId>> {
        let mut added = Vec::with_capacity(items.len());
        let mut edges = Vec::new();
        for mut item in items {
            item.state = WorkState::Pending;
            let deps = std::mem::take(&mut item.depends_on);
            let id = self.graph.push(item);
            edges.extend(deps.into_iter().map(|dep| (id, dep)));
            self.changed.push(id);
            added.push(id);
        }
        for (dependent, dependency) in edges {
            self.link(&dependent, &dependency)?;
        }
        self.refresh()?;
        Ok(added)
    }

    /// Remember the tracker's identifier for an item.
    pub fn set_issue(&mut self, id: &WorkItemId, issue: IssueRef) -> Result<()> {
        self.item_mut(id)?.issue = Some(issue);
        Ok(())
    }

    /// Record that `dependent` depends on `dependency`.
    pub fn add_dependency(&mut self, dependent: &WorkItemId, dependency: &WorkItemId) -> Result<()> {
        self.link(dependent, dependency)?;
        self.changed.push(*dependent);
        self.refresh()
    }

    /// Insert discovered work with its lineage.
    ///
    /// If `blocks` names an item, or the new item carries the `blocker`
    /// label with `blocks` set, the new item is boosted and becomes a
    /// dependency of the blocked item. Active items are not yielded here;
    /// the session that found the blocker calls [`Scheduler::yield_item`].
    pub fn intake(
        &mut self,
        mut item: WorkItem,
        lineage: Lineage,
        blocks: Option<WorkItemId>,
    ) -> Result<WorkItemId> {
        if let Some(blocked) = blocks {
            if !self.graph.contains(&blocked) {
                return Err(Error::WorkItemNotFound(blocked.to_string()));
            }
            // The blocked item will depend on the new one, so none of the new
            // item's dependencies may lead back to it.
            if let Some(dep) = item.depends_on.iter().find(|dep| {
                **dep == blocked || self.graph.depends_on_transitively(dep, &blocked)
            }) {
                return Err(Error::CycleDetected {
                    from: blocked,
                    to: *dep,
                });
            }
        }

        item.discovered_from = Some(lineage);
        if blocks.is_some() {
            self.boost(&mut item);
        }
        let id = self.add_item(item)?;
        if let Some(blocked) = blocks {
            self.link(&blocked, &id)?;
            self.changed.push(blocked);
            self.refresh()?;
        }

        if let Some(item) = self.graph.get(&id) {
            tracing::info!(
                item = %id.short(),
                title = %item.title,
                lineage = ?item.discovered_from,
                blocks = ?blocks.map(|b| b.short()),
                "discovered work added"
            );
        }
        Ok(id)
    }

    fn boost(&self, item: &mut WorkItem) {
        item.boosts = if self.policy.stack_boosts {
            item.boosts.saturating_add(1)
        } else {
            1
        };
    }

    /// Schedule a self-heal item for a broken repository baseline.
    ///
    /// Returns `None` when one is already open for the repository, so a
    /// single outage produces a single item.
    pub fn add_self_heal(
        &mut self,
        repository: &RepositoryId,
        details: &str,
    ) -> Result<Option<WorkItemId>> {
        if self.open_self_heal(repository).is_some() {
            return Ok(None);
        }
        let mut item = WorkItem::new(
            &format!("Repair baseline of {}", repository),
            &format!(
                "The baseline health check of repository {} fails. Restore a passing build, \
                 test suite, type check and lint before other work resumes.\n\n{}",
                repository, details
            ),
        )
        .with_priority(Priority::P1)
        .with_kind(ItemKind::SelfHeal)
        .with_repository(repository.clone())
        .with_labels(["self-heal"]);
        item.discovered_from = Some(Lineage::Baseline(repository.clone()));
        let id = self.add_item(item)?;
        tracing::warn!(item = %id.short(), repository = %repository, "self-heal item scheduled");
        Ok(Some(id))
    }

    /// Start a session: `runnable -> in_progress`.
    pub fn begin(&mut self, id: &WorkItemId) -> Result<&WorkItem> {
        let item = self.item(id)?;
        if item.state.is_active() {
            return Err(Error::SessionActive(*id));
        }
        self.apply(id, WorkState::InProgress)?;
        self.item_mut(id)?.local_attempts = 0;
        self.refresh()?;
        self.item(id)
    }

    /// Local verification passed: `in_progress -> code_complete`.
    pub fn mark_code_complete(&mut self, id: &WorkItemId) -> Result<()> {
        self.apply(id, WorkState::CodeComplete)?;
        self.refresh()
    }

    /// Count a local verification failure; fails the item when the budget is spent.
    pub fn record_local_failure(&mut self, id: &WorkItemId, details: &str) -> Result<LocalOutcome> {
        let budget = self.policy.local_attempts;
        let item = self.item_mut(id)?;
        if item.state != WorkState::InProgress {
            return Err(Error::InvalidTransition {
                id: *id,
                from: item.state,
                to: WorkState::Failed,
            });
        }
        item.local_attempts += 1;
        let attempt = item.local_attempts;
        if attempt >= budget {
            self.fail(
                id,
                FailureKind::Verification,
                &format!("local verification failed {} times: {}", attempt, details),
            )?;
            return Ok(LocalOutcome::Failed);
        }
        Ok(LocalOutcome::Retry {
            attempt,
            remaining: budget - attempt,
        })
    }

    /// End-to-end verification passed: `code_complete -> verified`.
    pub fn mark_verified(&mut self, id: &WorkItemId) -> Result<()> {
        self.apply(id, WorkState::Verified)?;
        self.refresh()
    }

    /// Count an end-to-end failure; returns the item for repair or fails it.
    pub fn record_e2e_failure(&mut self, id: &WorkItemId, details: &str) -> Result<EndToEndOutcome> {
        let budget = self.policy.e2e_attempts;
        let item = self.item_mut(id)?;
        if item.state != WorkState::CodeComplete {
            return Err(Error::InvalidTransition {
                id: *id,
                from: item.state,
                to: WorkState::InProgress,
            });
        }
        item.repair_attempts += 1;
        let attempt = item.repair_attempts;
        if attempt >= budget {
            self.fail(
                id,
                FailureKind::Verification,
                &format!("end-to-end verification failed {} times: {}", attempt, details),
            )?;
            return Ok(EndToEndOutcome::Failed);
        }
        self.apply(id, WorkState::InProgress)?;
        self.item_mut(id)?.local_attempts = 0;
        self.refresh()?;
        Ok(EndToEndOutcome::Repair {
            attempt,
            remaining: budget - attempt,
        })
    }

    /// Close a verified item against its commit: `verified -> closed`.
    pub fn close(&mut self, id: &WorkItemId, commit: CommitRef) -> Result<()> {
        if commit.is_empty() {
            return Err(Error::MissingCommitRef(*id));
        }
        self.apply(id, WorkState::Closed)?;
        self.item_mut(id)?.commit = Some(commit);
        self.refresh()
    }

    /// Fail an active item, keeping the reason for audit.
    pub fn fail(&mut self, id: &WorkItemId, kind: FailureKind, reason: &str) -> Result<()> {
        let item = self.item_mut(id)?;
        let from = item.state;
        if !can_transition(from, WorkState::Failed) {
            return Err(Error::InvalidTransition {
                id: *id,
                from,
                to: WorkState::Failed,
            });
        }
        item.record_failure(kind, reason);
        self.record(*id, from, WorkState::Failed);
        tracing::warn!(item = %id.short(), kind = ?kind, reason, "work item failed");
        self.refresh()
    }

    /// The session found a blocker for its own item: `in_progress -> blocked`.
    pub fn yield_item(&mut self, id: &WorkItemId, reason: &str) -> Result<()> {
        self.apply(id, WorkState::Blocked)?;
        self.item_mut(id)?.blocked_reason = Some(reason.to_string());
        self.refresh()
    }

    /// Cancel an item that no session is working on.
    pub fn cancel(&mut self, id: &WorkItemId) -> Result<()> {
        let item = self.item(id)?;
        if !can_transition(item.state, WorkState::Cancelled) {
            return Err(Error::NotCancellable {
                id: *id,
                state: item.state,
            });
        }
        self.apply(id, WorkState::Cancelled)?;
        tracing::info!(item = %id.short(), "work item cancelled");
        self.refresh()
    }

    /// Manually re-open a failed item: `failed -> pending`.
    ///
    /// Attempt counters reset; the last failure record is kept.
    pub fn reopen(&mut self, id: &WorkItemId) -> Result<()> {
        self.apply(id, WorkState::Pending)?;
        let item = self.item_mut(id)?;
        item.local_attempts = 0;
        item.repair_attempts = 0;
        tracing::info!(item = %id.short(), "work item re-opened");
        self.refresh()
    }

    /// Re-evaluate runnability of every waiting item.
    ///
    /// - a failed or cancelled ancestor blocks the item;
    /// - satisfied dependencies make it runnable;
    /// - an item that yielded stays blocked until its blockers finish;
    /// - anything else waits in `pending`.
    pub fn refresh(&mut self) -> Result<()> {
        for id in self.graph.ids() {
            let Some(item) = self.graph.get(&id) else {
                continue;
            };
            let current = item.state;
            if !matches!(
                current,
                WorkState::Pending | WorkState::Runnable | WorkState::Blocked
            ) {
                continue;
            }

            let (target, reason) = if let Some(dead) = self.graph.dead_ancestor(&id) {
                (
                    WorkState::Blocked,
                    Some(format!(
                        "ancestor {} \"{}\" is {}",
                        dead.id.short(),
                        dead.title,
                        dead.state
                    )),
                )
            } else if self.graph.dependencies_satisfied(&id) {
                (WorkState::Runnable, None)
            } else if current == WorkState::Blocked && self.waiting_on_blocker(&id) {
                (WorkState::Blocked, None)
            } else {
                (WorkState::Pending, None)
            };

            if target != current {
                self.apply(&id, target)?;
            }
            if let Some(reason) = reason {
                let item = self.item_mut(&id)?;
                if item.blocked_reason.as_ref() != Some(&reason) {
                    item.blocked_reason = Some(reason);
                    self.changed.push(id);
                }
            }
        }
        Ok(())
    }

    /// Whether an unfinished dependency was discovered by this item's own session.
    fn waiting_on_blocker(&self, id: &WorkItemId) -> bool {
        let lineage = Lineage::Session(*id);
        self.graph.dependencies(id).iter().any(|dep| {
            dep.discovered_from.as_ref() == Some(&lineage) && !dep.state.satisfies_dependents()
        })
    }

    fn link(&mut self, dependent: &WorkItemId, dependency: &WorkItemId) -> Result<()> {
        let known = self
            .graph
            .get(dependent)
            .is_some_and(|item| item.depends_on.contains(dependency));
        self.graph.add_dependency(dependent, dependency)?;
        if !known {
            self.new_dependencies.push((*dependent, *dependency));
        }
        Ok(())
    }

    fn apply(&mut self, id: &WorkItemId, to: WorkState) -> Result<()> {
        let item = self
            .graph
            .get_mut(id)
            .ok_or_else(|| Error::WorkItemNotFound(id.to_string()))?;
        let record = transition(item, to)?;
        tracing::debug!(item = %id.short(), from = %record.from, to = %record.to, "transition");
        self.changed.push(*id);
        self.history.push(record);
        Ok(())
    }

    fn record(&mut self, id: WorkItemId, from: WorkState, to: WorkState) {
        self.changed.push(id);
        self.history.push(TransitionRecord {
            id,
            from,
            to,
            at: chrono::Utc::now(),
        });
    }

    fn item(&self, id: &WorkItemId) -> Result<&WorkItem> {
        self.graph
            .get(id)
            .ok_or_else(|| Error::WorkItemNotFound(id.to_string()))
    }

    fn item_mut(&mut self, id: &WorkItemId) -> Result<&mut WorkItem> {
        self.graph
            .get_mut(id)
            .ok_or_else(|| Error::WorkItemNotFound(id.to_string()))
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerPolicy::default())
    }
}
