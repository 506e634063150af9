//! Two-stage verification and the shared check runner.
//!
//! Local verification runs the repository's test, type and lint commands.
//! End-to-end verification runs its integration commands plus every
//! acceptance criterion that carries a verify command.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::core::WorkItem;
use crate::error::{Error, Result, VerificationStage};
use crate::orchestration::routing::RepositoryContext;

/// Default timeout for a single check command (20 minutes).
pub const DEFAULT_CHECK_TIMEOUT_SECS: u64 = 20 * 60;

/// Output kept per check, from the end of the combined output.
const OUTPUT_TAIL_CHARS: usize = 4000;

/// Result of one check command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub command: String,
    pub success: bool,
    pub output: String,
}

/// Result of running a set of checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub checks: Vec<CheckOutcome>,
}

impl VerificationReport {
    /// A report with no checks; it passes.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks.iter().filter(|c| !c.success)
    }

    /// Feedback for the agent describing every failing check.
    pub fn failure_summary(&self) -> String {
        self.failures()
            .map(|c| format!("$ {}\n{}", c.command, c.output.trim()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Turn a failing report into [`Error::Verification`] for `stage`.
    pub fn into_result(self, stage: VerificationStage) -> Result<Self> {
        if self.passed() {
            return Ok(self);
        }
        Err(Error::Verification {
            stage,
            details: self.failure_summary(),
        })
    }

    pub fn merge(mut self, other: VerificationReport) -> Self {
        self.checks.extend(other.checks);
        self
    }
}

fn tail(text: &str) -> String {
    let count = text.chars().count();
    if count <= OUTPUT_TAIL_CHARS {
        return text.to_string();
    }
    text.chars().skip(count - OUTPUT_TAIL_CHARS).collect()
}

/// Run shell commands in order inside `cwd`.
///
/// Every command runs even after a failure so the report is complete. A
/// command exceeding `timeout` counts as failed.
pub async fn run_checks(commands: &[String], cwd: &Path, timeout: Duration) -> Result<VerificationReport> {
    let mut report = VerificationReport::default();
    for command in commands {
        tracing::debug!(command = %command, cwd = %cwd.display(), "running check");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(cwd).kill_on_drop(true);
        let outcome = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(output) => {
                let output = output?;
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                CheckOutcome {
                    command: command.clone(),
                    success: output.status.success(),
                    output: tail(&text),
                }
            }
            Err(_) => CheckOutcome {
                command: command.clone(),
                success: false,
                output: format!("timed out after {:?}", timeout),
            },
        };
        if !outcome.success {
            tracing::info!(command = %command, "check failed");
        }
        report.checks.push(outcome);
    }
    Ok(report)
}

/// Runs the verification stages for a repository.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Build, test, type check and lint before the first session.
    async fn baseline(&self, repo: &RepositoryContext) -> Result<VerificationReport>;

    /// Stage one: decides `in_progress -> code_complete`.
    async fn local(&self, item: &WorkItem, repo: &RepositoryContext) -> Result<VerificationReport>;

    /// Stage two: decides `code_complete -> verified`.
    async fn end_to_end(&self, item: &WorkItem, repo: &RepositoryContext) -> Result<VerificationReport>;
}

/// Verifier running the configured shell commands.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    timeout: Duration,
}

impl CommandVerifier {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for CommandVerifier {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_CHECK_TIMEOUT_SECS))
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    async fn baseline(&self, repo: &RepositoryContext) -> Result<VerificationReport> {
        run_checks(&repo.baseline, &repo.path, self.timeout).await
    }

    async fn local(&self, _item: &WorkItem, repo: &RepositoryContext) -> Result<VerificationReport> {
        run_checks(&repo.local, &repo.path, self.timeout).await
    }

    async fn end_to_end(&self, item: &WorkItem, repo: &RepositoryContext) -> Result<VerificationReport> {
        let integration = run_checks(&repo.e2e, &repo.path, self.timeout).await?;
        let acceptance: Vec<String> = item
            .acceptance
            .iter()
            .filter_map(|c| c.verify_command().map(str::to_string))
            .collect();
        let acceptance = run_checks(&acceptance, &repo.path, self.timeout).await?;
        Ok(integration.merge(acceptance))
    }
}
