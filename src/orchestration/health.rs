//! Baseline health gate per repository.
//!
//! Before the first session against a repository its baseline checks must
//! pass. A failing baseline marks the repository broken: regular work there
//! is held back until a self-heal item closes, after which the baseline is
//! checked again.

use std::collections::HashMap;

use crate::core::RepositoryId;
use crate::error::{Error, Result};
use crate::orchestration::verify::VerificationReport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaselineStatus {
    /// Not checked yet, or invalidated by a repair.
    Unknown,
    Healthy,
    Broken { details: String },
}

#[derive(Debug, Clone, Default)]
pub struct BaselineGate {
    status: HashMap<RepositoryId, BaselineStatus>,
}

impl BaselineGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, repository: &RepositoryId) -> BaselineStatus {
        self.status
            .get(repository)
            .cloned()
            .unwrap_or(BaselineStatus::Unknown)
    }

    /// Whether the baseline must run before the next regular session.
    pub fn needs_check(&self, repository: &RepositoryId) -> bool {
        self.status(repository) == BaselineStatus::Unknown
    }

    pub fn is_broken(&self, repository: &RepositoryId) -> bool {
        matches!(self.status(repository), BaselineStatus::Broken { .. })
    }

    /// Record a baseline run.
    ///
    /// # Errors
    /// Returns [`Error::BaselineBroken`] when any check failed.
    pub fn record(&mut self, repository: &RepositoryId, report: &VerificationReport) -> Result<()> {
        if report.passed() {
            tracing::info!(repository = %repository, checks = report.checks.len(), "baseline healthy");
            self.status.insert(repository.clone(), BaselineStatus::Healthy);
            return Ok(());
        }
        let details = report.failure_summary();
        tracing::warn!(repository = %repository, "baseline broken");
        self.status.insert(
            repository.clone(),
            BaselineStatus::Broken {
                details: details.clone(),
            },
        );
        Err(Error::BaselineBroken {
            repository: repository.clone(),
            details,
        })
    }

    /// Forget the last result so the baseline runs again.
    pub fn invalidate(&mut self, repository: &RepositoryId) {
        self.status.remove(repository);
    }
}
