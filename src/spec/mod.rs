//! Work spec loading.
//!
//! A work spec declares the features of one run. It can be written in a
//! declarative key/value format (TOML or JSON) or as informal structured
//! text; both normalize to the same [`WorkSpec`].

pub mod document;
pub mod loader;
pub mod text;

use serde::{Deserialize, Serialize};

use crate::core::{ComplexityTier, RepositoryId, WorkItem};

pub use document::{FeatureDocument, SpecDocument};
pub use loader::{load_path, load_str, normalize, parse_document, SpecSyntax};

/// The normalized, validated collection of work items for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkSpec {
    pub title: String,
    /// Target property; the default repository of every item.
    pub property: Option<RepositoryId>,
    /// Explicit complexity override for every item.
    pub complexity: Option<ComplexityTier>,
    /// Items in declaration order, dependencies already resolved to ids.
    pub items: Vec<WorkItem>,
    pub requirements: Vec<String>,
    pub success: Vec<String>,
}

impl WorkSpec {
    /// Find an item by its exact title.
    pub fn item(&self, title: &str) -> Option<&WorkItem> {
        self.items.iter().find(|item| item.title == title)
    }
}
