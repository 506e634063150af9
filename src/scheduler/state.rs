//! Work item state transitions.
//!
//! Every state change goes through [`transition`], which validates it against
//! [`can_transition`] and records a [`TransitionRecord`] for the audit trail.
//!
//! ```text
//! pending -> runnable -> in_progress -> code_complete -> verified -> closed
//!    |  ^        |            |   ^           |
//!    v  |        v            v   +-----------+ (repair)
//!   blocked <----+----- (yield)
//! ```
//!
//! `failed` is reachable from `in_progress` and `code_complete`, and re-opens
//! to `pending`. `cancelled` is reachable only before a session starts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{WorkItem, WorkItemId, WorkState};
use crate::error::{Error, Result};

/// A record of a state change with timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: WorkItemId,
    pub from: WorkState,
    pub to: WorkState,
    pub at: DateTime<Utc>,
}

/// Check if moving from `from` to `to` is allowed.
pub fn can_transition(from: WorkState, to: WorkState) -> bool {
    use WorkState::*;
    matches!(
        (from, to),
        (Pending, Runnable)
            | (Pending, Blocked)
            | (Pending, Cancelled)
            | (Blocked, Pending)
            | (Blocked, Runnable)
            | (Blocked, Cancelled)
            | (Runnable, Pending)
            | (Runnable, Blocked)
            | (Runnable, InProgress)
            | (Runnable, Cancelled)
            | (InProgress, CodeComplete)
            | (InProgress, Failed)
            | (InProgress, Blocked)
            | (CodeComplete, Verified)
            | (CodeComplete, InProgress)
            | (CodeComplete, Failed)
            | (Verified, Closed)
            | (Failed, Pending)
    )
}

/// Move `item` to `to`, failing if the change is not allowed.
///
/// Timestamps follow the state: entering `in_progress` from `runnable` sets
/// `started_at`, entering a finished state sets `finished_at`, and leaving
/// `failed` clears it again.
pub fn transition(item: &mut WorkItem, to: WorkState) -> Result<TransitionRecord> {
    let from = item.state;
    if !can_transition(from, to) {
        return Err(Error::InvalidTransition {
            id: item.id,
            from,
            to,
        });
    }

    let now = Utc::now();
    item.state = to;
    if from == WorkState::Runnable && to == WorkState::InProgress {
        item.started_at = Some(now);
    }
    if to.is_finished() {
        item.finished_at = Some(now);
    } else if from == WorkState::Failed {
        item.finished_at = None;
    }
    if to != WorkState::Blocked {
        item.blocked_reason = None;
    }

    Ok(TransitionRecord {
        id: item.id,
        from,
        to,
        at: now,
    })
}
