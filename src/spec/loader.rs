//! Spec loading: syntax detection, parsing and normalization.
//!
//! Both surface syntaxes are parsed into a [`SpecDocument`] and then pass
//! through [`normalize`], the only place that builds a [`WorkSpec`]. It
//! validates:
//! - the spec has a title and at least one feature;
//! - feature titles are present and unique;
//! - the complexity override names a known tier;
//! - `depends_on` references point to features of the same spec;
//! - the dependency relation is acyclic.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;

use crate::core::{ComplexityTier, Priority, RepositoryId, WorkItem, WorkItemId};
use crate::error::{Error, Result};

use super::document::SpecDocument;
use super::{text, WorkSpec};

/// Surface syntax of a spec document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecSyntax {
    Toml,
    Json,
    Text,
}

impl SpecSyntax {
    /// Pick the syntax from a file extension; anything unknown is text.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
            .as_deref()
        {
            Some("toml") => SpecSyntax::Toml,
            Some("json") => SpecSyntax::Json,
            _ => SpecSyntax::Text,
        }
    }
}

/// Parse a document without validating it.
pub fn parse_document(content: &str, syntax: SpecSyntax) -> Result<SpecDocument> {
    match syntax {
        SpecSyntax::Toml => {
            toml::from_str(content).map_err(|e| Error::spec("document", e.message().to_string()))
        }
        SpecSyntax::Json => serde_json::from_str(content).map_err(|e| Error::spec("document", e.to_string())),
        SpecSyntax::Text => text::parse(content),
    }
}

/// Parse and normalize a spec from a string.
pub fn load_str(content: &str, syntax: SpecSyntax) -> Result<WorkSpec> {
    normalize(parse_document(content, syntax)?)
}

/// Read, parse and normalize a spec file.
pub fn load_path(path: &Path) -> Result<WorkSpec> {
    let content = std::fs::read_to_string(path)?;
    let spec = load_str(&content, SpecSyntax::from_path(path))?;
    tracing::info!(
        path = %path.display(),
        title = %spec.title,
        items = spec.items.len(),
        "spec loaded"
    );
    Ok(spec)
}

/// Validate a surface document and turn it into the canonical [`WorkSpec`].
pub fn normalize(doc: SpecDocument) -> Result<WorkSpec> {
    let title = doc.title.trim().to_string();
    if title.is_empty() {
        return Err(Error::spec("title", "spec must have a title"));
    }

    let complexity = doc
        .complexity
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.parse::<ComplexityTier>())
        .transpose()
        .map_err(|message| Error::spec("complexity", message))?;

    if doc.features.is_empty() {
        return Err(Error::spec("features", "spec must declare at least one feature"));
    }

    let property = doc
        .property
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(RepositoryId::new);

    // Titles must be present and unique before references can be resolved.
    let mut by_title: HashMap<String, usize> = HashMap::new();
    for (index, feature) in doc.features.iter().enumerate() {
        let name = feature.title.trim();
        if name.is_empty() {
            return Err(Error::spec(format!("features[{}].title", index), "missing title"));
        }
        if by_title.insert(name.to_string(), index).is_some() {
            return Err(Error::spec(
                format!("features[{}].title", index),
                format!("duplicate feature title {:?}", name),
            ));
        }
    }

    let ids: Vec<WorkItemId> = doc.features.iter().map(|_| WorkItemId::new()).collect();
    let mut dependency_indices: Vec<Vec<usize>> = Vec::with_capacity(doc.features.len());
    for (index, feature) in doc.features.iter().enumerate() {
        let mut deps = Vec::new();
        for name in &feature.depends_on {
            let dep = by_title.get(name.trim()).copied().ok_or_else(|| {
                Error::spec(
                    format!("features[{}].depends_on", index),
                    format!("unknown feature {:?}", name.trim()),
                )
            })?;
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        dependency_indices.push(deps);
    }

    check_for_cycles(&doc, &dependency_indices)?;

    let items = doc
        .features
        .iter()
        .enumerate()
        .map(|(index, feature)| {
            let mut item = WorkItem::new(feature.title.trim(), feature.description.trim())
                .with_priority(feature.priority.map(Priority).unwrap_or_default())
                .with_labels(feature.labels.iter().map(|l| l.trim().to_string()))
                .with_files(feature.files.iter().map(|f| PathBuf::from(f.trim())))
                .with_acceptance(feature.acceptance.clone())
                .with_repository(property.clone().unwrap_or_default());
            item.id = ids[index];
            item.order = index as u64;
            item.depends_on = dependency_indices[index].iter().map(|&d| ids[d]).collect();
            item
        })
        .collect();

    Ok(WorkSpec {
        title,
        property,
        complexity,
        items,
        requirements: trimmed(doc.requirements),
        success: trimmed(doc.success),
    })
}

fn trimmed(lines: Vec<String>) -> Vec<String> {
    lines
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Reject dependency cycles, naming every member of the first cycle found.
fn check_for_cycles(doc: &SpecDocument, deps: &[Vec<usize>]) -> Result<()> {
    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<_> = (0..deps.len()).map(|i| graph.add_node(i)).collect();
    for (index, feature_deps) in deps.iter().enumerate() {
        for &dep in feature_deps {
            graph.add_edge(nodes[dep], nodes[index], ());
        }
    }

    for component in tarjan_scc(&graph) {
        let is_cycle = component.len() > 1
            || component
                .first()
                .is_some_and(|&n| graph.find_edge(n, n).is_some());
        if !is_cycle {
            continue;
        }
        let mut members: Vec<usize> = component.iter().map(|&n| graph[n]).collect();
        members.sort_unstable();
        let names: Vec<&str> = members
            .iter()
            .map(|&i| doc.features[i].title.trim())
            .collect();
        return Err(Error::spec(
            format!("features[{}].depends_on", members[0]),
            format!("dependency cycle between: {}", names.join(", ")),
        ));
    }
    Ok(())
}
