//! Orchestration layer of the harness.
//!
//! The [`SessionOrchestrator`] runs one autonomous session per work item
//! through an [`ExecutionAgent`], gates each item with two-stage
//! verification, checks repository baselines before the first session and
//! runs periodic checkpoint reviews. Label routing picks the repository
//! every item works in.

pub mod agent;
pub mod checkpoint;
pub mod health;
pub mod routing;
pub mod session;
pub mod verify;

pub use agent::{
    CommandAgent, DiscoveredWork, ExecutionAgent, SessionReport, SessionRequest,
};
pub use checkpoint::{
    CheckpointEvent, CheckpointPolicy, CheckpointTracker, CheckpointTrigger, CommandReviewer,
    Finding, ReviewArea, Reviewer, Severity,
};
pub use health::{BaselineGate, BaselineStatus};
pub use routing::{fan_out, RepositoryContext, RouteRule, RoutingTable};
pub use session::{
    CancelOutcome, Collaborators, OrchestratorEvent, OrchestratorSettings, SessionOrchestrator,
    SessionOutcome,
};
pub use verify::{run_checks, CheckOutcome, CommandVerifier, VerificationReport, Verifier};
