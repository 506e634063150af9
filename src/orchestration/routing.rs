//! Repository contexts and label routing.
//!
//! A [`RoutingTable`] maps item labels to repositories. The first rule whose
//! label an item carries wins, then a repository the item already names, then
//! the table default. A compound feature whose labels select several
//! repositories is fanned out into one sibling per repository by
//! [`fan_out`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::{RepositoryId, WorkItem, WorkItemId};
use crate::orchestration::checkpoint::ReviewArea;
use crate::spec::WorkSpec;

/// Everything a session needs to know about the repository it works in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryContext {
    pub id: RepositoryId,
    pub path: PathBuf,
    /// Must pass before the first session against the repository.
    pub baseline: Vec<String>,
    /// Tests, type checks and lint run after each session.
    pub local: Vec<String>,
    /// Integration checks run before an item is verified.
    pub e2e: Vec<String>,
    pub review: BTreeMap<ReviewArea, Vec<String>>,
}

impl RepositoryContext {
    pub fn new(id: RepositoryId, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
            baseline: Vec::new(),
            local: Vec::new(),
            e2e: Vec::new(),
            review: BTreeMap::new(),
        }
    }

    pub fn review_commands(&self, area: ReviewArea) -> &[String] {
        self.review.get(&area).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Route items carrying `label` to `repository`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub label: String,
    pub repository: RepositoryId,
}

impl RouteRule {
    pub fn new(label: &str, repository: RepositoryId) -> Self {
        Self {
            label: label.to_string(),
            repository,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    pub default: Option<RepositoryId>,
    pub rules: Vec<RouteRule>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, repository: RepositoryId) -> Self {
        self.default = Some(repository);
        self
    }

    pub fn route_label(mut self, label: &str, repository: RepositoryId) -> Self {
        self.rules.push(RouteRule::new(label, repository));
        self
    }

    /// Repository of the first rule matching one of the item's labels.
    pub fn match_labels(&self, item: &WorkItem) -> Option<&RepositoryId> {
        self.rules
            .iter()
            .find(|rule| item.has_label(&rule.label))
            .map(|rule| &rule.repository)
    }

    /// The repository an item runs in.
    ///
    /// Label rules come first, then a repository the item already names.
    /// The table default only applies to items still on the default
    /// repository.
    pub fn route(&self, item: &WorkItem) -> RepositoryId {
        if let Some(repository) = self.match_labels(item) {
            return repository.clone();
        }
        if item.repository != RepositoryId::default() {
            return item.repository.clone();
        }
        self.default
            .clone()
            .unwrap_or_else(|| item.repository.clone())
    }

    /// Every distinct repository the item's labels select, in rule order.
    pub fn targets(&self, item: &WorkItem) -> Vec<RepositoryId> {
        let mut targets: Vec<RepositoryId> = Vec::new();
        for rule in &self.rules {
            if item.has_label(&rule.label) && !targets.contains(&rule.repository) {
                targets.push(rule.repository.clone());
            }
        }
        targets
    }
}

/// Assign repositories to every spec item and split compound features.
///
/// A feature targeting several repositories becomes siblings titled
/// `"<title> [<repository>]"`, each depending on the previous one in rule
/// order. Items that depended on the compound feature depend on every
/// sibling. Declaration order is renumbered so siblings keep the position of
/// the feature they replace.
pub fn fan_out(spec: &mut WorkSpec, table: &RoutingTable) {
    let mut expanded: Vec<WorkItem> = Vec::with_capacity(spec.items.len());
    let mut replaced: HashMap<WorkItemId, Vec<WorkItemId>> = HashMap::new();

    for item in spec.items.drain(..) {
        let targets = table.targets(&item);
        if targets.len() < 2 {
            let mut item = item;
            item.repository = table.route(&item);
            expanded.push(item);
            continue;
        }

        let mut siblings = Vec::with_capacity(targets.len());
        let mut previous: Option<WorkItemId> = None;
        for repository in targets {
            let mut sibling = item.clone();
            sibling.id = WorkItemId::new();
            sibling.title = format!("{} [{}]", item.title, repository);
            sibling.repository = repository;
            if let Some(previous) = previous {
                sibling.depends_on.push(previous);
            }
            previous = Some(sibling.id);
            siblings.push(sibling.id);
            expanded.push(sibling);
        }
        tracing::debug!(
            feature = %item.title,
            siblings = siblings.len(),
            "compound feature fanned out"
        );
        replaced.insert(item.id, siblings);
    }

    for (order, item) in expanded.iter_mut().enumerate() {
        item.order = order as u64;
        if replaced.is_empty() {
            continue;
        }
        let mut depends_on = Vec::with_capacity(item.depends_on.len());
        for dep in &item.depends_on {
            match replaced.get(dep) {
                Some(siblings) => depends_on.extend(siblings.iter().copied()),
                None => depends_on.push(*dep),
            }
        }
        let mut seen = HashSet::new();
        depends_on.retain(|dep| seen.insert(*dep));
        item.depends_on = depends_on;
    }
    spec.items = expanded;
}
