//! Version control: durable changesets for verified items.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::{ErrorCode, IndexAddOption, Repository, Signature};

use crate::core::{CommitRef, RepositoryId, WorkItem, WorkItemId};
use crate::{Error, Result};

/// Everything needed to commit one verified item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changeset {
    pub item: WorkItemId,
    pub repository: RepositoryId,
    pub path: PathBuf,
    pub message: String,
}

impl Changeset {
    pub fn for_item(item: &WorkItem, path: &Path) -> Self {
        let mut message = format!("{}\n\nHarness-Item: {}", item.title, item.id);
        if let Some(issue) = &item.issue {
            message.push_str(&format!("\nHarness-Issue: {}", issue));
        }
        Self {
            item: item.id,
            repository: item.repository.clone(),
            path: path.to_path_buf(),
            message,
        }
    }
}

/// Produces a durable reference for verified work.
#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn commit(&self, changeset: &Changeset) -> Result<CommitRef>;
}

/// Commits the whole working tree with libgit2.
#[derive(Debug, Clone, Default)]
pub struct GitVcs;

impl GitVcs {
    pub fn new() -> Self {
        Self
    }

    /// Stage everything and commit on `HEAD`. An unborn branch gets a root commit.
    pub fn commit_all(path: &Path, message: &str) -> Result<CommitRef> {
        tracing::debug!(path = %path.display(), "committing working tree");
        let repo = Repository::discover(path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("Harness", "harness@localhost"))?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(CommitRef(commit_id.to_string()))
    }

    pub fn head_commit(path: &Path) -> Result<CommitRef> {
        let repo = Repository::discover(path)?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(CommitRef(commit.id().to_string()))
    }
}

#[async_trait]
impl VersionControl for GitVcs {
    async fn commit(&self, changeset: &Changeset) -> Result<CommitRef> {
        let path = changeset.path.clone();
        let message = changeset.message.clone();
        let commit = tokio::task::spawn_blocking(move || Self::commit_all(&path, &message))
            .await
            .map_err(|e| Error::UnrecoverableExecution(format!("commit task failed: {}", e)))??;
        tracing::info!(
            item = %changeset.item.short(),
            repository = %changeset.repository,
            commit = %commit,
            "changeset committed"
        );
        Ok(commit)
    }
}
