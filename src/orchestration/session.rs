//! Session orchestrator.
//!
//! Consumes runnable items from the scheduler and drives each through one
//! autonomous session:
//!
//! ```text
//! runnable -> in_progress -> [agent] -> local checks -> code_complete
//!          -> end-to-end checks -> commit -> verified -> closed
//! ```
//!
//! Local failures retry inside the session with the check output as
//! feedback; end-to-end failures send the item back to `in_progress` for a
//! repair attempt. Both are bounded by the scheduler policy. Work the agent
//! discovers is fed back into the graph; a discovered blocker makes the
//! session yield.
//!
//! Before the first session in a repository its baseline must pass, and
//! after the configured number of sessions (or wall time) a checkpoint review
//! runs before anything new starts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::classify::Classifier;
use crate::core::{
    CapabilityTier, CheckpointId, CommitRef, ComplexityTier, FailureKind, ItemKind, Lineage,
    RepositoryId, WorkItem, WorkItemId, WorkState,
};
use crate::error::{Error, Result, VerificationStage};
use crate::orchestration::agent::{DiscoveredWork, ExecutionAgent, SessionRequest};
use crate::orchestration::checkpoint::{
    CheckpointEvent, CheckpointPolicy, CheckpointTracker, CheckpointTrigger, Reviewer,
};
use crate::orchestration::health::BaselineGate;
use crate::orchestration::routing::{RepositoryContext, RoutingTable};
use crate::orchestration::verify::Verifier;
use crate::scheduler::{EndToEndOutcome, LocalOutcome, SharedScheduler};
use crate::tracker::{sync_changes, IssueTracker};
use crate::vcs::{Changeset, VersionControl};

/// The external systems a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub agent: Arc<dyn ExecutionAgent>,
    pub verifier: Arc<dyn Verifier>,
    pub reviewer: Arc<dyn Reviewer>,
    pub vcs: Arc<dyn VersionControl>,
    pub tracker: Arc<dyn IssueTracker>,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    pub checkpoint: CheckpointPolicy,
    pub routing: RoutingTable,
    pub repositories: Vec<RepositoryContext>,
    /// Cross-cutting requirements passed to every session.
    pub requirements: Vec<String>,
    pub complexity_override: Option<ComplexityTier>,
    pub capability_override: Option<CapabilityTier>,
}

/// Progress notifications for an optional observer.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    SessionStarted {
        item: WorkItemId,
        repository: RepositoryId,
        capability: CapabilityTier,
    },
    SessionFinished {
        item: WorkItemId,
        state: WorkState,
    },
    SelfHealScheduled {
        repository: RepositoryId,
        item: WorkItemId,
    },
    CheckpointCompleted {
        checkpoint: CheckpointId,
        findings: usize,
        created: usize,
    },
    WorkDiscovered {
        item: WorkItemId,
        from: WorkItemId,
        blocker: bool,
    },
}

/// Terminal result of one `run_next` step.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Nothing is runnable.
    Idle,
    Closed {
        id: WorkItemId,
        commit: CommitRef,
    },
    Failed {
        id: WorkItemId,
        reason: String,
    },
    /// The session found blockers and gave its item back.
    Yielded {
        id: WorkItemId,
        blockers: Vec<WorkItemId>,
    },
    Cancelled {
        id: WorkItemId,
    },
    /// The baseline check failed; no session ran.
    BaselineBroken {
        repository: RepositoryId,
        self_heal: Option<WorkItemId>,
    },
    /// A checkpoint is due but sessions are still running.
    Suspended,
}

impl SessionOutcome {
    /// The item a session ran for, if one ran.
    pub fn item(&self) -> Option<WorkItemId> {
        match self {
            SessionOutcome::Closed { id, .. }
            | SessionOutcome::Failed { id, .. }
            | SessionOutcome::Yielded { id, .. }
            | SessionOutcome::Cancelled { id } => Some(*id),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, SessionOutcome::Idle)
    }
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionOutcome::Idle => write!(f, "idle"),
            SessionOutcome::Closed { id, commit } => {
                write!(f, "{} closed at {:.7}", id.short(), commit.0)
            }
            SessionOutcome::Failed { id, reason } => write!(f, "{} failed: {}", id.short(), reason),
            SessionOutcome::Yielded { id, blockers } => write!(
                f,
                "{} yielded to {} blocker(s)",
                id.short(),
                blockers.len()
            ),
            SessionOutcome::Cancelled { id } => write!(f, "{} cancelled", id.short()),
            SessionOutcome::BaselineBroken {
                repository,
                self_heal,
            } => match self_heal {
                Some(item) => write!(
                    f,
                    "baseline of {} broken, self-heal {} scheduled",
                    repository,
                    item.short()
                ),
                None => write!(f, "baseline of {} broken", repository),
            },
            SessionOutcome::Suspended => write!(f, "suspended for checkpoint"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The item was not running and is now `cancelled`.
    Cancelled,
    /// Its session was signalled and fails at the next safe point.
    Signalled,
}

pub struct SessionOrchestrator {
    scheduler: SharedScheduler,
    collaborators: Collaborators,
    settings: OrchestratorSettings,
    classifier: Classifier,
    baseline: Mutex<BaselineGate>,
    checkpoints: Mutex<CheckpointTracker>,
    sessions: Mutex<HashMap<WorkItemId, CancellationToken>>,
    events: Option<mpsc::Sender<OrchestratorEvent>>,
}

impl SessionOrchestrator {
    pub fn new(
        scheduler: SharedScheduler,
        collaborators: Collaborators,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            scheduler,
            collaborators,
            classifier: Classifier::with_override(settings.complexity_override),
            checkpoints: Mutex::new(CheckpointTracker::new(settings.checkpoint)),
            baseline: Mutex::new(BaselineGate::new()),
            sessions: Mutex::new(HashMap::new()),
            settings,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<OrchestratorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn scheduler(&self) -> &SharedScheduler {
        &self.scheduler
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Checkpoint audit log, oldest first.
    pub async fn checkpoints(&self) -> Vec<CheckpointEvent> {
        self.checkpoints.lock().await.events().to_vec()
    }

    /// Items with a session in flight.
    pub async fn active_sessions(&self) -> Vec<WorkItemId> {
        self.sessions.lock().await.keys().copied().collect()
    }

    /// Run one session on the next runnable item.
    pub async fn run_next(&self) -> Result<SessionOutcome> {
        if let Some(outcome) = self.checkpoint_barrier().await? {
            return Ok(outcome);
        }
        match self.pick(1).await.first() {
            Some(id) => self.run_item(*id).await,
            None => Ok(SessionOutcome::Idle),
        }
    }

    /// Run sessions one after another until nothing is runnable or `limit`
    /// sessions have run.
    pub async fn run_until_idle(&self, limit: Option<usize>) -> Result<Vec<SessionOutcome>> {
        let mut outcomes = Vec::new();
        let mut sessions = 0;
        loop {
            if limit.is_some_and(|limit| sessions >= limit) {
                tracing::info!(sessions, "session limit reached");
                break;
            }
            let outcome = self.run_next().await?;
            match outcome {
                SessionOutcome::Idle | SessionOutcome::Suspended => break,
                _ => {}
            }
            if outcome.item().is_some() {
                sessions += 1;
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Start at most one session per repository and wait for all of them.
    pub async fn run_batch(&self) -> Result<Vec<SessionOutcome>> {
        if let Some(outcome) = self.checkpoint_barrier().await? {
            return Ok(vec![outcome]);
        }
        let picks = self.pick(usize::MAX).await;
        if picks.is_empty() {
            return Ok(vec![SessionOutcome::Idle]);
        }
        tracing::info!(sessions = picks.len(), "starting session batch");
        join_all(picks.into_iter().map(|id| self.run_item(id)))
            .await
            .into_iter()
            .collect()
    }

    /// Run a specific runnable item.
    pub async fn work_on(&self, id: &WorkItemId) -> Result<SessionOutcome> {
        if let Some(outcome) = self.checkpoint_barrier().await? {
            return Ok(outcome);
        }
        let state = self.snapshot(id).await?.state;
        if state.is_active() {
            return Err(Error::SessionActive(*id));
        }
        if state != WorkState::Runnable {
            return Err(Error::InvalidTransition {
                id: *id,
                from: state,
                to: WorkState::InProgress,
            });
        }
        self.run_item(*id).await
    }

    /// Cancel an item, or signal its running session.
    pub async fn cancel(&self, id: &WorkItemId) -> Result<CancelOutcome> {
        let sessions = self.sessions.lock().await;
        if let Some(token) = sessions.get(id) {
            tracing::info!(item = %id.short(), "cancelling running session");
            token.cancel();
            return Ok(CancelOutcome::Signalled);
        }
        self.scheduler.write().await.cancel(id)?;
        drop(sessions);
        self.sync().await;
        Ok(CancelOutcome::Cancelled)
    }

    /// Run a checkpoint if one is due and nothing is in flight.
    async fn checkpoint_barrier(&self) -> Result<Option<SessionOutcome>> {
        let due = self.checkpoints.lock().await.due();
        let Some(trigger) = due else {
            return Ok(None);
        };
        if !self.sessions.lock().await.is_empty() {
            tracing::debug!(%trigger, "checkpoint due, waiting for sessions");
            return Ok(Some(SessionOutcome::Suspended));
        }
        self.run_checkpoint(trigger).await?;
        Ok(None)
    }

    async fn run_checkpoint(&self, trigger: CheckpointTrigger) -> Result<CheckpointEvent> {
        let checkpoint = CheckpointId::new();
        let reviewed = self.checkpoints.lock().await.pending_review().to_vec();
        let items: Vec<WorkItem> = {
            let scheduler = self.scheduler.read().await;
            reviewed
                .iter()
                .filter_map(|id| scheduler.get(id).cloned())
                .collect()
        };
        tracing::info!(
            checkpoint = %checkpoint.short(),
            %trigger,
            items = items.len(),
            "checkpoint review started"
        );

        let findings = self
            .collaborators
            .reviewer
            .review(checkpoint, &items, &self.settings.repositories)
            .await?;

        let mut created = Vec::new();
        for finding in &findings {
            if !finding.is_critical() {
                tracing::info!(
                    area = %finding.area,
                    severity = ?finding.severity,
                    title = %finding.title,
                    "checkpoint finding"
                );
                continue;
            }
            let mut item = finding.to_work_item(checkpoint);
            if finding.repository.is_none() {
                item.repository = self
                    .settings
                    .routing
                    .match_labels(&item)
                    .cloned()
                    .or_else(|| items.first().map(|i| i.repository.clone()))
                    .unwrap_or_else(|| self.settings.routing.route(&item));
            }
            item.classification = Some(self.classifier.classify_item(&item));
            let id = self
                .scheduler
                .write()
                .await
                .intake(item, Lineage::Checkpoint(checkpoint), None)?;
            created.push(id);
        }

        let event = CheckpointEvent {
            id: checkpoint,
            trigger,
            at: Utc::now(),
            reviewed,
            findings,
            created,
        };
        tracing::info!(
            checkpoint = %checkpoint.short(),
            findings = event.findings.len(),
            critical = event.critical_count(),
            "checkpoint completed"
        );
        self.checkpoints.lock().await.complete(event.clone());
        if let Err(e) = self.collaborators.tracker.record_checkpoint(&event).await {
            tracing::warn!(error = %e, "failed to record checkpoint");
        }
        self.emit(OrchestratorEvent::CheckpointCompleted {
            checkpoint,
            findings: event.findings.len(),
            created: event.created.len(),
        })
        .await;
        self.sync().await;
        Ok(event)
    }

    /// Runnable items to start now, at most one per repository.
    ///
    /// Repositories with a session in flight are skipped, and so is work in
    /// repositories whose baseline is broken, unless it repairs that baseline.
    async fn pick(&self, limit: usize) -> Vec<WorkItemId> {
        let scheduler = self.scheduler.read().await;
        let gate = self.baseline.lock().await;
        let mut claimed: HashSet<RepositoryId> = scheduler
            .active()
            .into_iter()
            .map(|item| item.repository.clone())
            .collect();
        let mut picks = Vec::new();
        for item in scheduler.runnable() {
            if picks.len() >= limit {
                break;
            }
            if claimed.contains(&item.repository) {
                continue;
            }
            if gate.is_broken(&item.repository) && !scheduler.repairs_baseline(item) {
                continue;
            }
            claimed.insert(item.repository.clone());
            picks.push(item.id);
        }
        picks
    }

    fn repository(&self, id: &RepositoryId) -> Result<RepositoryContext> {
        self.settings
            .repositories
            .iter()
            .find(|repo| &repo.id == id)
            .cloned()
            .ok_or_else(|| Error::UnknownRepository(id.clone()))
    }

    /// Check the baseline if needed. Returns an outcome when it is broken.
    async fn ensure_baseline(&self, repo: &RepositoryContext) -> Result<Option<SessionOutcome>> {
        let (broken, needs_check) = {
            let gate = self.baseline.lock().await;
            (gate.is_broken(&repo.id), gate.needs_check(&repo.id))
        };
        if broken {
            let self_heal = self
                .scheduler
                .read()
                .await
                .open_self_heal(&repo.id)
                .map(|item| item.id);
            return Ok(Some(SessionOutcome::BaselineBroken {
                repository: repo.id.clone(),
                self_heal,
            }));
        }
        if !needs_check {
            return Ok(None);
        }

        tracing::info!(repository = %repo.id, "checking baseline");
        let report = self.collaborators.verifier.baseline(repo).await?;
        let recorded = self.baseline.lock().await.record(&repo.id, &report);
        match recorded {
            Ok(()) => Ok(None),
            Err(Error::BaselineBroken {
                repository,
                details,
            }) => {
                let self_heal = self
                    .scheduler
                    .write()
                    .await
                    .add_self_heal(&repository, &details)?;
                if let Some(item) = self_heal {
                    self.emit(OrchestratorEvent::SelfHealScheduled {
                        repository: repository.clone(),
                        item,
                    })
                    .await;
                }
                self.sync().await;
                Ok(Some(SessionOutcome::BaselineBroken {
                    repository,
                    self_heal,
                }))
            }
            Err(e) => Err(e),
        }
    }

    async fn run_item(&self, id: WorkItemId) -> Result<SessionOutcome> {
        let item = self.snapshot(&id).await?;
        let repo = match self.repository(&item.repository) {
            Ok(repo) => repo,
            Err(e) => return self.reject(&id, &e.to_string()).await,
        };
        let repairs_baseline = self.scheduler.read().await.repairs_baseline(&item);
        if !repairs_baseline {
            if let Some(outcome) = self.ensure_baseline(&repo).await? {
                return Ok(outcome);
            }
        }

        let tier = item
            .classification
            .as_ref()
            .map(|c| c.tier)
            .unwrap_or_else(|| self.classifier.classify_item(&item).tier);
        let capability = self
            .settings
            .capability_override
            .unwrap_or_else(|| tier.capability());

        let token = CancellationToken::new();
        {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(&id) {
                return Err(Error::SessionActive(id));
            }
            self.scheduler.write().await.begin(&id)?;
            sessions.insert(id, token.clone());
        }
        tracing::info!(
            item = %id.short(),
            title = %item.title,
            repository = %repo.id,
            %tier,
            %capability,
            "session started"
        );
        self.emit(OrchestratorEvent::SessionStarted {
            item: id,
            repository: repo.id.clone(),
            capability,
        })
        .await;
        self.sync().await;

        let result = self.drive(id, &repo, tier, capability, &token).await;
        self.sessions.lock().await.remove(&id);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(item = %id.short(), error = %e, "session aborted");
                self.abort(&id, &e.to_string()).await?
            }
        };

        let state = self.snapshot(&id).await?.state;
        self.checkpoints
            .lock()
            .await
            .record_session(id, state == WorkState::Closed);
        if item.kind == ItemKind::SelfHeal && state == WorkState::Closed {
            self.baseline.lock().await.invalidate(&repo.id);
        }
        tracing::info!(item = %id.short(), %state, "session finished");
        self.emit(OrchestratorEvent::SessionFinished { item: id, state })
            .await;
        self.sync().await;
        Ok(outcome)
    }

    /// The session loop for an item that is `in_progress`.
    async fn drive(
        &self,
        id: WorkItemId,
        repo: &RepositoryContext,
        tier: ComplexityTier,
        capability: CapabilityTier,
        token: &CancellationToken,
    ) -> Result<SessionOutcome> {
        let mut feedback: Option<String> = None;
        let mut attempt = 0;
        loop {
            if token.is_cancelled() {
                return self.cancelled(&id).await;
            }
            attempt += 1;
            let item = self.snapshot(&id).await?;
            let request = SessionRequest {
                item: item.clone(),
                tier,
                capability,
                repository: repo.clone(),
                requirements: self.settings.requirements.clone(),
                feedback: feedback.take(),
                attempt,
            };

            let report = match self.collaborators.agent.execute(&request, token.clone()).await {
                Ok(report) => report,
                Err(_) if token.is_cancelled() => return self.cancelled(&id).await,
                Err(e) if e.is_recoverable() => {
                    let details = e.to_string();
                    let outcome = self.scheduler.write().await.record_local_failure(&id, &details)?;
                    match outcome {
                        LocalOutcome::Retry { attempt, remaining } => {
                            tracing::warn!(item = %id.short(), attempt, remaining, error = %e, "agent session retry");
                            feedback = Some(format!("The previous attempt did not finish: {}", details));
                            continue;
                        }
                        LocalOutcome::Failed => return self.failed_outcome(&id).await,
                    }
                }
                Err(e) => return self.fail(&id, FailureKind::Unrecoverable, &e.to_string()).await,
            };
            tracing::debug!(item = %id.short(), summary = %report.summary, "agent finished");

            let blockers = self.intake_discovered(&id, repo, &report.discovered).await?;
            if !blockers.is_empty() {
                let reason = format!("waiting on {} discovered blocker(s)", blockers.len());
                self.scheduler.write().await.yield_item(&id, &reason)?;
                tracing::info!(item = %id.short(), blockers = blockers.len(), "session yielded");
                return Ok(SessionOutcome::Yielded { id, blockers });
            }
            if token.is_cancelled() {
                return self.cancelled(&id).await;
            }

            let local = self
                .collaborators
                .verifier
                .local(&item, repo)
                .await
                .and_then(|report| report.into_result(VerificationStage::Local));
            match local {
                Ok(_) => {}
                Err(Error::Verification { details, .. }) => {
                    let outcome = self.scheduler.write().await.record_local_failure(&id, &details)?;
                    match outcome {
                        LocalOutcome::Retry { attempt, remaining } => {
                            tracing::warn!(item = %id.short(), attempt, remaining, "local verification failed");
                            feedback = Some(details);
                            continue;
                        }
                        LocalOutcome::Failed => return self.failed_outcome(&id).await,
                    }
                }
                Err(e) => return self.fail(&id, FailureKind::Unrecoverable, &e.to_string()).await,
            }
            self.scheduler.write().await.mark_code_complete(&id)?;
            if token.is_cancelled() {
                return self.cancelled(&id).await;
            }

            let e2e = self
                .collaborators
                .verifier
                .end_to_end(&item, repo)
                .await
                .and_then(|report| report.into_result(VerificationStage::EndToEnd));
            match e2e {
                Ok(_) => {}
                Err(Error::Verification { details, .. }) => {
                    let outcome = self.scheduler.write().await.record_e2e_failure(&id, &details)?;
                    match outcome {
                        EndToEndOutcome::Repair { attempt, remaining } => {
                            tracing::warn!(item = %id.short(), attempt, remaining, "end-to-end verification failed");
                            feedback = Some(details);
                            continue;
                        }
                        EndToEndOutcome::Failed => return self.failed_outcome(&id).await,
                    }
                }
                Err(e) => return self.fail(&id, FailureKind::Unrecoverable, &e.to_string()).await,
            }

            let changeset = Changeset::for_item(&self.snapshot(&id).await?, &repo.path);
            let commit = match self.collaborators.vcs.commit(&changeset).await {
                Ok(commit) if !commit.is_empty() => commit,
                Ok(_) => {
                    return self
                        .fail(&id, FailureKind::Unrecoverable, "commit produced no reference")
                        .await
                }
                Err(e) => {
                    return self
                        .fail(&id, FailureKind::Unrecoverable, &format!("commit failed: {}", e))
                        .await
                }
            };
            {
                let mut scheduler = self.scheduler.write().await;
                scheduler.mark_verified(&id)?;
                scheduler.close(&id, commit.clone())?;
            }
            tracing::info!(item = %id.short(), commit = %commit, "work item closed");
            return Ok(SessionOutcome::Closed { id, commit });
        }
    }

    /// Feed discovered work into the graph. Returns the blockers of `from`.
    async fn intake_discovered(
        &self,
        from: &WorkItemId,
        repo: &RepositoryContext,
        discovered: &[DiscoveredWork],
    ) -> Result<Vec<WorkItemId>> {
        let mut blockers = Vec::new();
        for work in discovered {
            if work.title.trim().is_empty() {
                continue;
            }
            let mut item = work.to_work_item();
            item.repository = self
                .settings
                .routing
                .match_labels(&item)
                .cloned()
                .unwrap_or_else(|| repo.id.clone());
            item.classification = Some(self.classifier.classify_item(&item));
            let blocks = work.is_blocker().then_some(*from);

            let added = self
                .scheduler
                .write()
                .await
                .intake(item, Lineage::Session(*from), blocks);
            let id = match added {
                Ok(id) => id,
                Err(Error::CycleDetected { from, to }) => {
                    tracing::warn!(%from, %to, title = %work.title, "discovered work would create a cycle");
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.emit(OrchestratorEvent::WorkDiscovered {
                item: id,
                from: *from,
                blocker: blocks.is_some(),
            })
            .await;
            if blocks.is_some() {
                blockers.push(id);
            }
        }
        Ok(blockers)
    }

    async fn fail(&self, id: &WorkItemId, kind: FailureKind, reason: &str) -> Result<SessionOutcome> {
        self.scheduler.write().await.fail(id, kind, reason)?;
        Ok(SessionOutcome::Failed {
            id: *id,
            reason: reason.to_string(),
        })
    }

    /// Fail a runnable item that cannot get a session at all.
    async fn reject(&self, id: &WorkItemId, reason: &str) -> Result<SessionOutcome> {
        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.begin(id)?;
            scheduler.fail(id, FailureKind::Unrecoverable, reason)?;
        }
        tracing::error!(item = %id.short(), reason, "work item rejected");
        self.emit(OrchestratorEvent::SessionFinished {
            item: *id,
            state: WorkState::Failed,
        })
        .await;
        self.sync().await;
        Ok(SessionOutcome::Failed {
            id: *id,
            reason: reason.to_string(),
        })
    }

    async fn cancelled(&self, id: &WorkItemId) -> Result<SessionOutcome> {
        self.scheduler
            .write()
            .await
            .fail(id, FailureKind::Cancelled, "cancelled while in progress")?;
        Ok(SessionOutcome::Cancelled { id: *id })
    }

    /// Outcome for an item the scheduler already failed.
    async fn failed_outcome(&self, id: &WorkItemId) -> Result<SessionOutcome> {
        let reason = self
            .snapshot(id)
            .await?
            .failure
            .map(|f| f.reason)
            .unwrap_or_default();
        Ok(SessionOutcome::Failed { id: *id, reason })
    }

    /// Fail an item whose session hit an internal error, if it is still active.
    async fn abort(&self, id: &WorkItemId, reason: &str) -> Result<SessionOutcome> {
        let state = self.snapshot(id).await?.state;
        if state.is_active() {
            return self.fail(id, FailureKind::Unrecoverable, reason).await;
        }
        Ok(SessionOutcome::Failed {
            id: *id,
            reason: reason.to_string(),
        })
    }

    async fn snapshot(&self, id: &WorkItemId) -> Result<WorkItem> {
        self.scheduler
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::WorkItemNotFound(id.to_string()))
    }

    async fn emit(&self, event: OrchestratorEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event).await;
        }
    }

    /// Mirror scheduler changes; tracker errors never stop a session.
    async fn sync(&self) {
        if let Err(e) = sync_changes(&self.scheduler, self.collaborators.tracker.as_ref()).await {
            tracing::warn!(error = %e, "tracker sync failed");
        }
    }
}
