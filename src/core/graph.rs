//! Work graph (directed acyclic graph) of work items.
//!
//! Nodes are work items; an edge `a -> b` means `b` depends on `a`, so `a`
//! must reach `verified`/`closed` before `b` can run. Every edge insertion is
//! cycle-checked.

use std::collections::HashMap;

use petgraph::algo::{has_path_connecting, is_cyclic_directed};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;

use crate::core::item::{WorkItem, WorkItemId};
use crate::error::{Error, Result};

/// The work item dependency graph.
pub struct WorkGraph {
    graph: DiGraph<WorkItem, ()>,
    index: HashMap<WorkItemId, NodeIndex>,
    next_order: u64,
}

impl WorkGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
            next_order: 0,
        }
    }

    /// Build a graph from items whose `depends_on` lists are already filled in.
    ///
    /// Used when loading a spec or resuming from the issue tracker. Unknown
    /// dependency ids and cycles are rejected.
    pub fn from_items(items: Vec<WorkItem>) -> Result<Self> {
        let mut graph = Self::new();
        let edges: Vec<(WorkItemId, WorkItemId)> = items
            .iter()
            .flat_map(|item| item.depends_on.iter().map(move |dep| (*dep, item.id)))
            .collect();

        for item in items {
            graph.insert(item);
        }
        for (dependency, dependent) in edges {
            graph.link(&dependency, &dependent)?;
        }
        Ok(graph)
    }

    /// Insert an item keeping its declaration order.
    ///
    /// If an item with the same id exists, nothing changes.
    pub fn insert(&mut self, item: WorkItem) -> WorkItemId {
        let id = item.id;
        if self.index.contains_key(&id) {
            return id;
        }
        self.next_order = self.next_order.max(item.order + 1);
        let node = self.graph.add_node(item);
        self.index.insert(id, node);
        id
    }

    /// Append an item after every existing one in declaration order.
    pub fn push(&mut self, mut item: WorkItem) -> WorkItemId {
        item.order = self.next_order;
        self.insert(item)
    }

    /// Record that `dependent` depends on `dependency`.
    ///
    /// # Errors
    /// Returns an error if either item is unknown or the edge would create a cycle.
    pub fn add_dependency(&mut self, dependent: &WorkItemId, dependency: &WorkItemId) -> Result<()> {
        self.link(dependency, dependent)?;
        if let Some(item) = self.get_mut(dependent) {
            if !item.depends_on.contains(dependency) {
                item.depends_on.push(*dependency);
            }
        }
        Ok(())
    }

    fn link(&mut self, dependency: &WorkItemId, dependent: &WorkItemId) -> Result<()> {
        let from = self.node(dependency)?;
        let to = self.node(dependent)?;
        if self.graph.find_edge(from, to).is_some() {
            return Ok(());
        }

        // Temporarily add the edge to check for cycles
        let edge = self.graph.add_edge(from, to, ());
        if from == to || is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::CycleDetected {
                from: *dependent,
                to: *dependency,
            });
        }
        Ok(())
    }

    fn node(&self, id: &WorkItemId) -> Result<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::WorkItemNotFound(id.to_string()))
    }

    pub fn get(&self, id: &WorkItemId) -> Option<&WorkItem> {
        self.index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_mut(&mut self, id: &WorkItemId) -> Option<&mut WorkItem> {
        match self.index.get(id) {
            Some(&index) => self.graph.node_weight_mut(index),
            None => None,
        }
    }

    pub fn contains(&self, id: &WorkItemId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All items in declaration order.
    pub fn items(&self) -> Vec<&WorkItem> {
        let mut items: Vec<&WorkItem> = self.graph.node_weights().collect();
        items.sort_by_key(|item| item.order);
        items
    }

    /// Ids of all items in declaration order.
    pub fn ids(&self) -> Vec<WorkItemId> {
        self.items().into_iter().map(|item| item.id).collect()
    }

    /// Every dependency as `(dependent, dependency)`, in declaration order.
    pub fn edges(&self) -> Vec<(WorkItemId, WorkItemId)> {
        self.items()
            .into_iter()
            .flat_map(|item| item.depends_on.iter().map(move |dep| (item.id, *dep)))
            .collect()
    }

    /// Items the given item depends on (direct predecessors).
    pub fn dependencies(&self, id: &WorkItemId) -> Vec<&WorkItem> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &WorkItemId, direction: Direction) -> Vec<&WorkItem> {
        match self.index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Whether every direct dependency satisfies its dependents.
    pub fn dependencies_satisfied(&self, id: &WorkItemId) -> bool {
        self.dependencies(id)
            .iter()
            .all(|dep| dep.state.satisfies_dependents())
    }

    /// Whether `dependent` transitively depends on `dependency`.
    pub fn depends_on_transitively(&self, dependent: &WorkItemId, dependency: &WorkItemId) -> bool {
        match (self.index.get(dependency), self.index.get(dependent)) {
            (Some(&from), Some(&to)) => from != to && has_path_connecting(&self.graph, from, to, None),
            _ => false,
        }
    }

    /// First transitive ancestor that is failed or cancelled, if any.
    pub fn dead_ancestor(&self, id: &WorkItemId) -> Option<&WorkItem> {
        let &start = self.index.get(id)?;
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        while let Some(node) = dfs.next(reversed) {
            if node == start {
                continue;
            }
            if let Some(item) = self.graph.node_weight(node) {
                if item.state.is_dead_end() {
                    return Some(item);
                }
            }
        }
        None
    }
}

impl Default for WorkGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGraph")
            .field("items", &self.len())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
