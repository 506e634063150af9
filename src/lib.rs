pub mod classify;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod scheduler;
pub mod spec;
pub mod tracker;
pub mod vcs;

pub use error::{Error, Result};
pub use orchestration::{SessionOrchestrator, SessionOutcome};
pub use scheduler::{Scheduler, SchedulerPolicy, SharedScheduler};
