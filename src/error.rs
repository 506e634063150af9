use thiserror::Error;

use crate::core::{RepositoryId, WorkItemId, WorkState};

/// Which verification stage produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStage {
    /// Tests, type checks and lint in the item's repository.
    Local,
    /// Integration checks and acceptance verification commands.
    EndToEnd,
}

impl std::fmt::Display for VerificationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationStage::Local => write!(f, "local"),
            VerificationStage::EndToEnd => write!(f, "end-to-end"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Spec format error in `{field}`: {message}")]
    SpecFormat { field: String, message: String },

    #[error("Baseline broken in repository {repository}: {details}")]
    BaselineBroken {
        repository: RepositoryId,
        details: String,
    },

    #[error("{stage} verification failed: {details}")]
    Verification {
        stage: VerificationStage,
        details: String,
    },

    #[error("Unrecoverable execution error: {0}")]
    UnrecoverableExecution(String),

    #[error("Invalid state transition for {id} from {from} to {to}")]
    InvalidTransition {
        id: WorkItemId,
        from: WorkState,
        to: WorkState,
    },

    #[error("Work item not found: {0}")]
    WorkItemNotFound(String),

    #[error("Work item {0} already has an active session")]
    SessionActive(WorkItemId),

    #[error("Work item {0} cannot close without a commit reference")]
    MissingCommitRef(WorkItemId),

    #[error("Adding dependency {from} -> {to} would create a cycle")]
    CycleDetected { from: WorkItemId, to: WorkItemId },

    #[error("Work item {id} cannot be cancelled while {state}")]
    NotCancellable { id: WorkItemId, state: WorkState },

    #[error("Unknown repository: {0}")]
    UnknownRepository(RepositoryId),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Agent binary not found: {0}")]
    AgentBinaryNotFound(String),
}

impl Error {
    /// Shorthand for a [`Error::SpecFormat`] naming the offending field.
    pub fn spec(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::SpecFormat {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether a session may retry after this error instead of failing the item.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Verification { .. } | Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
