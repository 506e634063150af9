//! Scheduler integration tests.
//!
//! These tests walk items through the lifecycle state machine directly and
//! check selection order, dependency gating and the blocker protocol.

use harness::core::{
    CommitRef, FailureKind, Lineage, Priority, WorkItem, WorkItemId, WorkState,
};
use harness::scheduler::{EndToEndOutcome, LocalOutcome};
use harness::{Error, Scheduler, SchedulerPolicy};

use crate::fixtures::in_order;

fn scheduler(items: Vec<WorkItem>) -> Scheduler {
    Scheduler::from_items(in_order(items), SchedulerPolicy::default()).unwrap()
}

fn close(scheduler: &mut Scheduler, id: &WorkItemId) {
    scheduler.begin(id).unwrap();
    scheduler.mark_code_complete(id).unwrap();
    scheduler.mark_verified(id).unwrap();
    scheduler
        .close(id, CommitRef("9f2c1e7a".to_string()))
        .unwrap();
}

/// Test: Dependencies win over priority
/// Given A (P1) and B (P0) where B depends on A
/// When the scheduler selects work
/// Then A runs first and B only becomes runnable once A is closed
#[test]
fn test_dependency_gates_higher_priority() {
    let a = WorkItem::new("A", "").with_priority(Priority::P1);
    let mut b = WorkItem::new("B", "").with_priority(Priority::P0);
    b.depends_on = vec![a.id];
    let (a_id, b_id) = (a.id, b.id);
    let mut s = scheduler(vec![a, b]);

    assert_eq!(s.next_runnable().unwrap().id, a_id);
    assert_eq!(s.get(&b_id).unwrap().state, WorkState::Pending);

    close(&mut s, &a_id);
    assert_eq!(s.get(&b_id).unwrap().state, WorkState::Runnable);
    assert_eq!(s.next_runnable().unwrap().id, b_id);
}

/// Test: Ties on priority fall back to declaration order
#[test]
fn test_priority_then_declaration_order() {
    let first = WorkItem::new("first", "").with_priority(Priority::P2);
    let second = WorkItem::new("second", "").with_priority(Priority::P2);
    let urgent = WorkItem::new("urgent", "").with_priority(Priority::P0);
    let s = scheduler(vec![first, second, urgent]);

    let order: Vec<&str> = s.runnable().iter().map(|i| i.title.as_str()).collect();
    assert_eq!(order, vec!["urgent", "first", "second"]);
}

/// Test: Verification stages cannot be skipped
#[test]
fn test_verified_requires_code_complete() {
    let a = WorkItem::new("A", "");
    let id = a.id;
    let mut s = scheduler(vec![a]);
    s.begin(&id).unwrap();

    let err = s.mark_verified(&id).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: WorkState::InProgress,
            to: WorkState::Verified,
            ..
        }
    ));
    assert_eq!(s.get(&id).unwrap().state, WorkState::InProgress);
}

/// Test: Closing needs a commit reference
#[test]
fn test_close_without_commit_rejected() {
    let a = WorkItem::new("A", "");
    let id = a.id;
    let mut s = scheduler(vec![a]);
    s.begin(&id).unwrap();
    s.mark_code_complete(&id).unwrap();
    s.mark_verified(&id).unwrap();

    let err = s.close(&id, CommitRef(String::new())).unwrap_err();
    assert!(matches!(err, Error::MissingCommitRef(failed) if failed == id));
    assert_eq!(s.get(&id).unwrap().state, WorkState::Verified);
}

/// Test: Discovered blockers take over the current item
/// Given A in progress
/// When its session discovers a blocker
/// Then A yields, the blocker is boosted and runs, and A returns afterwards
#[test]
fn test_blocker_yield_and_resume() {
    let a = WorkItem::new("A", "").with_priority(Priority::P2);
    let other = WorkItem::new("Other", "").with_priority(Priority::P1);
    let (a_id, other_id) = (a.id, other.id);
    let mut s = scheduler(vec![a, other]);
    s.begin(&a_id).unwrap();

    let blocker = WorkItem::new("Migrate schema", "").with_priority(Priority::P2);
    let blocker_id = s
        .intake(blocker, Lineage::Session(a_id), Some(a_id))
        .unwrap();
    s.yield_item(&a_id, "waiting on schema").unwrap();

    let item = s.get(&blocker_id).unwrap();
    assert_eq!(item.discovered_from, Some(Lineage::Session(a_id)));
    assert_eq!(item.effective_priority(1), Priority::P1);
    assert_eq!(s.get(&a_id).unwrap().state, WorkState::Blocked);
    assert_eq!(s.get(&a_id).unwrap().depends_on, vec![blocker_id]);

    // P1 by boost, declared after Other
    let order: Vec<WorkItemId> = s.runnable().iter().map(|i| i.id).collect();
    assert_eq!(order, vec![other_id, blocker_id]);

    close(&mut s, &blocker_id);
    assert_eq!(s.get(&a_id).unwrap().state, WorkState::Runnable);
}

/// Test: Boosts do not stack by default and never pass P0
#[test]
fn test_boost_clamped_at_p0() {
    let a = WorkItem::new("A", "");
    let a_id = a.id;
    let mut s = scheduler(vec![a]);
    s.begin(&a_id).unwrap();

    let urgent = WorkItem::new("Hotfix", "").with_priority(Priority::P0);
    let id = s.intake(urgent, Lineage::Session(a_id), Some(a_id)).unwrap();
    assert_eq!(s.get(&id).unwrap().effective_priority(1), Priority::P0);
    assert_eq!(s.get(&id).unwrap().boosts, 1);
}

/// Test: A failed ancestor blocks its descendants
/// Given A <- B <- C
/// When A fails
/// Then B and C are blocked, and re-opening A releases them to pending
#[test]
fn test_failed_ancestor_blocks_descendants() {
    let a = WorkItem::new("A", "");
    let mut b = WorkItem::new("B", "");
    b.depends_on = vec![a.id];
    let mut c = WorkItem::new("C", "");
    c.depends_on = vec![b.id];
    let (a_id, b_id, c_id) = (a.id, b.id, c.id);
    let mut s = scheduler(vec![a, b, c]);

    s.begin(&a_id).unwrap();
    s.fail(&a_id, FailureKind::Unrecoverable, "agent crashed").unwrap();

    for id in [b_id, c_id] {
        let item = s.get(&id).unwrap();
        assert_eq!(item.state, WorkState::Blocked);
        assert!(item.blocked_reason.as_deref().unwrap().contains("\"A\""));
    }
    assert!(s.runnable().is_empty());

    s.reopen(&a_id).unwrap();
    assert_eq!(s.get(&a_id).unwrap().state, WorkState::Runnable);
    assert_eq!(s.get(&b_id).unwrap().state, WorkState::Pending);
    assert_eq!(s.get(&c_id).unwrap().state, WorkState::Pending);
    // The failure record is kept for audit
    assert!(s.get(&a_id).unwrap().failure.is_some());
}

/// Test: Local failures retry within budget, then fail
#[test]
fn test_local_failure_budget() {
    let a = WorkItem::new("A", "");
    let id = a.id;
    let mut s = scheduler(vec![a]);
    s.begin(&id).unwrap();

    assert_eq!(
        s.record_local_failure(&id, "test failed").unwrap(),
        LocalOutcome::Retry { attempt: 1, remaining: 2 }
    );
    assert_eq!(
        s.record_local_failure(&id, "test failed").unwrap(),
        LocalOutcome::Retry { attempt: 2, remaining: 1 }
    );
    assert_eq!(
        s.record_local_failure(&id, "test failed").unwrap(),
        LocalOutcome::Failed
    );
    let item = s.get(&id).unwrap();
    assert_eq!(item.state, WorkState::Failed);
    assert_eq!(item.failure.as_ref().unwrap().kind, FailureKind::Verification);
}

/// Test: End-to-end failures send the item back for repair
#[test]
fn test_e2e_failure_returns_to_in_progress() {
    let a = WorkItem::new("A", "");
    let id = a.id;
    let mut s = scheduler(vec![a]);
    s.begin(&id).unwrap();
    s.mark_code_complete(&id).unwrap();

    let outcome = s.record_e2e_failure(&id, "checkout flow broken").unwrap();
    assert_eq!(outcome, EndToEndOutcome::Repair { attempt: 1, remaining: 2 });
    assert_eq!(s.get(&id).unwrap().state, WorkState::InProgress);
    assert_eq!(s.get(&id).unwrap().local_attempts, 0);
}

/// Test: Cancellation only applies to items no session owns
#[test]
fn test_cancel_rules() {
    let a = WorkItem::new("A", "");
    let mut b = WorkItem::new("B", "");
    b.depends_on = vec![a.id];
    let running = WorkItem::new("Running", "");
    let (a_id, b_id, running_id) = (a.id, b.id, running.id);
    let mut s = scheduler(vec![a, b, running]);
    s.begin(&running_id).unwrap();

    let err = s.cancel(&running_id).unwrap_err();
    assert!(matches!(
        err,
        Error::NotCancellable {
            state: WorkState::InProgress,
            ..
        }
    ));

    s.cancel(&a_id).unwrap();
    assert_eq!(s.get(&a_id).unwrap().state, WorkState::Cancelled);
    assert_eq!(s.get(&b_id).unwrap().state, WorkState::Blocked);
}

/// Test: Only one session per item
#[test]
fn test_begin_twice_rejected() {
    let a = WorkItem::new("A", "");
    let id = a.id;
    let mut s = scheduler(vec![a]);
    s.begin(&id).unwrap();
    assert!(matches!(s.begin(&id), Err(Error::SessionActive(active)) if active == id));
}

/// Test: Self-heal items jump the queue, once per repository
#[test]
fn test_self_heal_scheduled_once_and_first() {
    let urgent = WorkItem::new("Urgent", "").with_priority(Priority::P0);
    let mut s = scheduler(vec![urgent]);
    let repo = harness::core::RepositoryId::default();

    let heal = s.add_self_heal(&repo, "cargo test failed").unwrap().unwrap();
    assert!(s.add_self_heal(&repo, "cargo test failed").unwrap().is_none());

    let item = s.get(&heal).unwrap();
    assert_eq!(item.priority, Priority::P1);
    assert_eq!(item.discovered_from, Some(Lineage::Baseline(repo.clone())));
    assert_eq!(s.next_runnable().unwrap().id, heal);

    close(&mut s, &heal);
    assert!(s.open_self_heal(&repo).is_none());
}
