//! End-to-end orchestrator tests.
//!
//! These tests run whole sessions against scripted collaborators and check
//! the lifecycle, the verification retry budgets, discovered work and the
//! tracker mirror.

use std::time::Duration;

use harness::core::{
    CapabilityTier, ComplexityTier, FailureKind, IssueRef, ItemKind, Lineage, Priority,
    RepositoryId, WorkItem, WorkState,
};
use harness::orchestration::{OrchestratorEvent, SessionOutcome};
use harness::tracker::{IssueFilter, IssueTracker};
use harness::{Error, SchedulerPolicy};

use crate::fixtures::{discovered, fail, settings_for, AgentStep, TestHarness};

/// Test: Happy path
/// Given one runnable item and passing checks
/// When one session runs
/// Then the item is closed against a commit and the tracker agrees
#[tokio::test]
async fn test_session_closes_item_with_commit() {
    let item = WorkItem::new("Add cart", "Persist carts in the session store");
    let id = item.id;
    let mut harness = TestHarness::new(vec![item]).await;

    let outcome = harness.orchestrator.run_next().await.unwrap();
    let SessionOutcome::Closed { id: closed, commit } = outcome else {
        panic!("expected closed, got {outcome:?}");
    };
    assert_eq!(closed, id);
    assert!(!commit.is_empty());

    let item = harness.item(&id).await;
    assert_eq!(item.state, WorkState::Closed);
    assert_eq!(item.commit, Some(commit));
    assert!(item.finished_at.is_some());

    let calls = harness.agent.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].attempt, 1);
    assert!(calls[0].feedback.is_none());
    assert_eq!(harness.verifier.baseline_runs(), vec![RepositoryId::default()]);

    let commits = harness.vcs.commits();
    assert_eq!(commits.len(), 1);
    assert!(commits[0].message.starts_with("Add cart\n\n"));
    assert!(commits[0].message.contains(&format!("Harness-Item: {}", id)));
    assert!(commits[0].message.contains("Harness-Issue: HX-1"));

    let events = harness.drain_events();
    assert!(matches!(
        events.first(),
        Some(OrchestratorEvent::SessionStarted { item, .. }) if *item == id
    ));
    assert!(events.contains(&OrchestratorEvent::SessionFinished {
        item: id,
        state: WorkState::Closed,
    }));

    assert!(harness.orchestrator.run_next().await.unwrap().is_idle());
}

/// Test: Local verification retries in-session
/// Given local checks that fail once
/// When the session runs
/// Then the agent is re-invoked with the failure output and the item closes
#[tokio::test]
async fn test_local_failure_retries_with_feedback() {
    let item = WorkItem::new("Add cart", "");
    let id = item.id;
    let harness = TestHarness::new(vec![item]).await;
    harness
        .verifier
        .script_local("Add cart", vec![fail("assertion failed: cart.len() == 1")]);

    let outcome = harness.orchestrator.run_next().await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Closed { .. }), "{outcome:?}");

    let calls = harness.agent.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].attempt, 2);
    let feedback = calls[1].feedback.as_deref().unwrap();
    assert!(feedback.contains("cart.len() == 1"));
    assert_eq!(harness.item(&id).await.state, WorkState::Closed);
}

/// Test: Local budget exhausted fails the item
#[tokio::test]
async fn test_local_failures_exhaust_budget() {
    let item = WorkItem::new("Add cart", "");
    let mut dependent = WorkItem::new("Checkout", "");
    dependent.depends_on = vec![item.id];
    let (id, dependent_id) = (item.id, dependent.id);
    let harness = TestHarness::new(vec![item, dependent]).await;
    harness
        .verifier
        .script_local("Add cart", vec![fail("e1"), fail("e2"), fail("e3")]);

    let outcome = harness.orchestrator.run_next().await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Failed { id: failed, .. } if failed == id));

    let item = harness.item(&id).await;
    assert_eq!(item.state, WorkState::Failed);
    let failure = item.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Verification);
    assert!(failure.reason.contains("e3"));
    assert_eq!(harness.agent.calls().len(), 3);
    assert_eq!(harness.verifier.e2e_runs("Add cart"), 0);
    assert_eq!(harness.item(&dependent_id).await.state, WorkState::Blocked);
}

/// Test: End-to-end repair loop
/// Given e2e checks that fail three times
/// When the session runs
/// Then each failure goes back to the agent and the third one fails the item
#[tokio::test]
async fn test_e2e_failures_exhaust_budget() {
    let item = WorkItem::new("Checkout flow", "");
    let id = item.id;
    let harness = TestHarness::new(vec![item]).await;
    harness.verifier.script_e2e(
        "Checkout flow",
        vec![fail("payment declined"), fail("payment declined"), fail("payment declined")],
    );

    let outcome = harness.orchestrator.run_next().await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Failed { .. }), "{outcome:?}");

    assert_eq!(harness.verifier.e2e_runs("Checkout flow"), 3);
    let calls = harness.agent.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[1..]
        .iter()
        .all(|call| call.feedback.as_deref().unwrap().contains("payment declined")));

    let item = harness.item(&id).await;
    assert_eq!(item.state, WorkState::Failed);
    assert_eq!(item.repair_attempts, 3);
    assert!(item.commit.is_none());
    assert!(harness.vcs.commits().is_empty());
}

/// Test: A repaired item closes
#[tokio::test]
async fn test_e2e_repair_then_close() {
    let item = WorkItem::new("Checkout flow", "");
    let id = item.id;
    let harness = TestHarness::new(vec![item]).await;
    harness
        .verifier
        .script_e2e("Checkout flow", vec![fail("payment declined")]);

    let outcome = harness.orchestrator.run_next().await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Closed { .. }), "{outcome:?}");
    let item = harness.item(&id).await;
    assert_eq!(item.repair_attempts, 1);
    assert_eq!(item.state, WorkState::Closed);
}

/// Test: The e2e budget is configurable
#[tokio::test]
async fn test_e2e_budget_from_policy() {
    let item = WorkItem::new("Checkout flow", "");
    let policy = SchedulerPolicy {
        e2e_attempts: 1,
        ..Default::default()
    };
    let harness = TestHarness::build(vec![item], policy, settings_for(&["main"])).await;
    harness
        .verifier
        .script_e2e("Checkout flow", vec![fail("payment declined")]);

    let outcome = harness.orchestrator.run_next().await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Failed { .. }));
    assert_eq!(harness.agent.calls().len(), 1);
}

/// Test: Discovered blocker
/// Given a session that discovers blocking work
/// When the orchestrator runs until idle
/// Then the item yields, the blocker runs next, and the item closes after it
#[tokio::test]
async fn test_discovered_blocker_yields_then_resumes() {
    let item = WorkItem::new("Add cart", "");
    let later = WorkItem::new("Wishlist", "").with_priority(Priority::P1);
    let id = item.id;
    let mut harness = TestHarness::new(vec![item.with_priority(Priority::P1), later]).await;
    harness.agent.script(
        "Add cart",
        vec![AgentStep::Discover(vec![discovered("Migrate cart schema", &["blocker", "db"])])],
    );

    let first = harness.orchestrator.run_next().await.unwrap();
    let SessionOutcome::Yielded { id: yielded, blockers } = first else {
        panic!("expected yield, got {first:?}");
    };
    assert_eq!(yielded, id);
    assert_eq!(blockers.len(), 1);
    let blocker_id = blockers[0];

    let blocker = harness.item(&blocker_id).await;
    assert_eq!(blocker.discovered_from, Some(Lineage::Session(id)));
    assert_eq!(blocker.kind, ItemKind::AdHoc);
    assert_eq!(blocker.effective_priority(1), Priority::P1);
    assert_eq!(blocker.repository, RepositoryId::default());
    let yielded_item = harness.item(&id).await;
    assert_eq!(yielded_item.state, WorkState::Blocked);
    assert!(yielded_item.depends_on.contains(&blocker_id));
    // The session never reached verification
    assert_eq!(harness.verifier.e2e_runs("Add cart"), 0);

    let events = harness.drain_events();
    assert!(events.contains(&OrchestratorEvent::WorkDiscovered {
        item: blocker_id,
        from: id,
        blocker: true,
    }));

    let rest = harness.orchestrator.run_until_idle(None).await.unwrap();
    assert_eq!(rest.len(), 3);
    assert_eq!(
        harness.agent.started_titles(),
        vec!["Add cart", "Wishlist", "Migrate cart schema"]
    );
    assert_eq!(harness.item(&blocker_id).await.state, WorkState::Closed);
    assert_eq!(harness.item(&id).await.state, WorkState::Closed);
    assert_eq!(harness.agent.calls_for("Add cart").len(), 2);
}

/// Test: Non-blocking discoveries join the graph without interrupting
#[tokio::test]
async fn test_non_blocking_discovery_continues() {
    let item = WorkItem::new("Add cart", "");
    let id = item.id;
    let harness = TestHarness::new(vec![item]).await;
    harness.agent.script(
        "Add cart",
        vec![AgentStep::Discover(vec![discovered("Add cart metrics", &[])])],
    );

    let outcome = harness.orchestrator.run_next().await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Closed { .. }), "{outcome:?}");

    let added = harness.item_titled("Add cart metrics").await;
    assert_eq!(added.state, WorkState::Runnable);
    assert_eq!(added.discovered_from, Some(Lineage::Session(id)));
    assert_eq!(added.priority, Priority::P2);
    assert!(added.classification.is_some());

    let tracked = harness.tracker.list(&IssueFilter::all()).await.unwrap();
    assert!(tracked.iter().any(|i| i.title == "Add cart metrics"));
}

/// Test: Unrecoverable agent errors fail the item
#[tokio::test]
async fn test_agent_error_fails_item() {
    let item = WorkItem::new("Add cart", "");
    let id = item.id;
    let harness = TestHarness::new(vec![item]).await;
    harness
        .agent
        .script("Add cart", vec![AgentStep::Error("agent crashed".to_string())]);

    let outcome = harness.orchestrator.run_next().await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Failed { .. }));

    let failure = harness.item(&id).await.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Unrecoverable);
    assert!(failure.reason.contains("agent crashed"));
    assert_eq!(harness.agent.calls().len(), 1);
}

/// Test: A timed-out session counts as a local attempt and retries
#[tokio::test]
async fn test_agent_timeout_retries() {
    let item = WorkItem::new("Add cart", "");
    let id = item.id;
    let harness = TestHarness::new(vec![item]).await;
    harness.agent.script("Add cart", vec![AgentStep::Timeout]);

    let outcome = harness.orchestrator.run_next().await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Closed { .. }), "{outcome:?}");

    let calls = harness.agent.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].feedback.as_deref().unwrap().contains("did not finish"));
    assert_eq!(harness.item(&id).await.state, WorkState::Closed);
}

/// Test: Version control failures fail the item before it is verified
#[tokio::test]
async fn test_commit_failure_fails_item() {
    let item = WorkItem::new("Add cart", "");
    let id = item.id;
    let harness = TestHarness::new(vec![item]).await;
    harness.vcs.fail_next("index locked");

    let outcome = harness.orchestrator.run_next().await.unwrap();
    let SessionOutcome::Failed { reason, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(reason.contains("commit failed"));
    assert!(reason.contains("index locked"));
    assert_eq!(harness.item(&id).await.state, WorkState::Failed);
}

/// Test: An item never closes without a commit reference
#[tokio::test]
async fn test_empty_commit_reference_fails_item() {
    let item = WorkItem::new("Add cart", "");
    let id = item.id;
    let harness = TestHarness::new(vec![item]).await;
    harness.vcs.return_empty();

    let outcome = harness.orchestrator.run_next().await.unwrap();
    assert!(matches!(outcome, SessionOutcome::Failed { .. }), "{outcome:?}");
    let item = harness.item(&id).await;
    assert_eq!(item.state, WorkState::Failed);
    assert!(item.commit.is_none());
}

/// Test: Only one session per item
/// Given two concurrent requests to work on the same item
/// When both run
/// Then exactly one session executes and the other is rejected
#[tokio::test(start_paused = true)]
async fn test_one_session_per_item() {
    let item = WorkItem::new("Add cart", "");
    let id = item.id;
    let harness = TestHarness::new(vec![item]).await;
    harness
        .agent
        .script("Add cart", vec![AgentStep::Sleep(Duration::from_secs(5))]);

    let (first, second) = tokio::join!(
        harness.orchestrator.work_on(&id),
        harness.orchestrator.work_on(&id)
    );

    let results = [first, second];
    let closed = results
        .iter()
        .filter(|r| matches!(r, Ok(SessionOutcome::Closed { .. })))
        .count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(Error::SessionActive(active)) if *active == id))
        .count();
    assert_eq!((closed, rejected), (1, 1));
    assert_eq!(harness.agent.calls().len(), 1);
    assert_eq!(harness.agent.max_concurrent_per_item(), 1);
}

/// Test: Work on a specific item
#[tokio::test]
async fn test_work_on_requires_runnable() {
    let a = WorkItem::new("A", "");
    let mut b = WorkItem::new("B", "");
    b.depends_on = vec![a.id];
    let b_id = b.id;
    let harness = TestHarness::new(vec![a, b]).await;

    let err = harness.orchestrator.work_on(&b_id).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: WorkState::Pending,
            ..
        }
    ));
    assert!(harness.agent.calls().is_empty());
}

/// Test: Batches run one session per repository in parallel
#[tokio::test(start_paused = true)]
async fn test_run_batch_one_session_per_repository() {
    let web_a = WorkItem::new("Web A", "").with_repository(RepositoryId::from("web"));
    let web_b = WorkItem::new("Web B", "").with_repository(RepositoryId::from("web"));
    let api = WorkItem::new("Api", "").with_repository(RepositoryId::from("api"));
    let harness = TestHarness::build(
        vec![web_a, web_b, api],
        SchedulerPolicy::default(),
        settings_for(&["web", "api"]),
    )
    .await;
    for title in ["Web A", "Api"] {
        harness
            .agent
            .script(title, vec![AgentStep::Sleep(Duration::from_secs(5))]);
    }

    let outcomes = harness.orchestrator.run_batch().await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, SessionOutcome::Closed { .. })));
    assert_eq!(harness.agent.max_concurrent(), 2);

    let mut started = harness.agent.started_titles();
    started.sort();
    assert_eq!(started, vec!["Api", "Web A"]);
    assert_eq!(harness.item_titled("Web B").await.state, WorkState::Runnable);
}

/// Test: Items in unconfigured repositories are rejected
/// Given a P0 item routed to an unknown repository and a P1 item in "main"
/// When the orchestrator runs until idle
/// Then the unroutable item fails on its own and the other item still closes
#[tokio::test]
async fn test_unknown_repository_fails_only_that_item() {
    let ghost = WorkItem::new("Ghost", "")
        .with_repository(RepositoryId::from("ghost"))
        .with_priority(Priority::P0);
    let mut dependent = WorkItem::new("After ghost", "");
    dependent.depends_on = vec![ghost.id];
    let other = WorkItem::new("Add cart", "").with_priority(Priority::P1);
    let (ghost_id, dependent_id, other_id) = (ghost.id, dependent.id, other.id);
    let harness = TestHarness::new(vec![ghost, dependent, other]).await;

    let outcomes = harness.orchestrator.run_until_idle(None).await.unwrap();

    assert_eq!(outcomes.len(), 2);
    match &outcomes[0] {
        SessionOutcome::Failed { id, reason } => {
            assert_eq!(*id, ghost_id);
            assert!(reason.contains("ghost"));
        }
        other => panic!("expected failed outcome, got {other:?}"),
    }
    let ghost = harness.item(&ghost_id).await;
    assert_eq!(ghost.state, WorkState::Failed);
    assert_eq!(ghost.failure.unwrap().kind, FailureKind::Unrecoverable);
    assert_eq!(harness.item(&dependent_id).await.state, WorkState::Blocked);
    assert_eq!(harness.item(&other_id).await.state, WorkState::Closed);
    assert!(harness.agent.calls_for("Ghost").is_empty());

    let tracked = harness.tracker.list(&IssueFilter::all()).await.unwrap();
    assert!(tracked.iter().any(|i| i.id == ghost_id && i.state == WorkState::Failed));
}

/// Test: Tracker mirrors every transition
#[tokio::test]
async fn test_tracker_mirrors_lifecycle() {
    let a = WorkItem::new("A", "");
    let mut b = WorkItem::new("B", "");
    b.depends_on = vec![a.id];
    let (a_id, b_id) = (a.id, b.id);
    let harness = TestHarness::new(vec![a, b]).await;

    let tracked = harness.tracker.list(&IssueFilter::all()).await.unwrap();
    assert_eq!(tracked.len(), 2);
    assert_eq!(harness.item(&a_id).await.issue, Some(IssueRef("HX-1".to_string())));

    harness.orchestrator.run_next().await.unwrap();

    let tracked = harness.tracker.list(&IssueFilter::all()).await.unwrap();
    let a = tracked.iter().find(|i| i.id == a_id).unwrap();
    let b = tracked.iter().find(|i| i.id == b_id).unwrap();
    assert_eq!(a.state, WorkState::Closed);
    assert!(a.commit.is_some());
    assert_eq!(b.state, WorkState::Runnable);
    assert_eq!(b.depends_on, vec![a_id]);

    let closed = IssueFilter {
        state: Some(WorkState::Closed),
        ..IssueFilter::all()
    };
    assert_eq!(harness.tracker.list(&closed).await.unwrap().len(), 1);
}

/// Test: Complexity drives the agent's capability tier
#[tokio::test]
async fn test_capability_follows_complexity() {
    let files: Vec<String> = (0..16).map(|i| format!("src/module_{i}.rs")).collect();
    let wide = WorkItem::new("Rename types", "").with_files(files);
    let small = WorkItem::new("Fix typo", "");
    let harness = TestHarness::new(vec![wide, small]).await;

    harness.orchestrator.run_until_idle(None).await.unwrap();

    let wide = harness.agent.calls_for("Rename types");
    let small = harness.agent.calls_for("Fix typo");
    assert_eq!(wide[0].capability, CapabilityTier::Heavy);
    assert_eq!(small[0].capability, CapabilityTier::Light);
}

/// Test: Explicit overrides beat classification
#[tokio::test]
async fn test_complexity_and_capability_overrides() {
    let mut settings = settings_for(&["main"]);
    settings.complexity_override = Some(ComplexityTier::Standard);
    settings.requirements = vec!["no new dependencies".to_string()];
    let harness = TestHarness::build(
        vec![WorkItem::new("Fix typo", "")],
        SchedulerPolicy::default(),
        settings,
    )
    .await;
    harness.orchestrator.run_next().await.unwrap();
    let call = &harness.agent.calls()[0];
    assert_eq!(call.capability, CapabilityTier::Standard);
    assert_eq!(call.requirements, vec!["no new dependencies".to_string()]);

    let mut settings = settings_for(&["main"]);
    settings.capability_override = Some(CapabilityTier::Heavy);
    let harness = TestHarness::build(
        vec![WorkItem::new("Fix typo", "")],
        SchedulerPolicy::default(),
        settings,
    )
    .await;
    harness.orchestrator.run_next().await.unwrap();
    assert_eq!(harness.agent.calls()[0].capability, CapabilityTier::Heavy);
}
