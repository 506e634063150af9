//! Core domain models for the harness.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestrator: work items, the dependency graph and complexity tiers.

pub mod graph;
pub mod item;
pub mod tier;

pub use graph::WorkGraph;
pub use item::{
    AcceptanceCriterion, CheckpointId, CommitRef, FailureKind, FailureRecord, IssueRef, ItemKind,
    Lineage, Priority, RepositoryId, WorkItem, WorkItemId, WorkState,
};
pub use tier::{CapabilityTier, Classification, ComplexityTier};
