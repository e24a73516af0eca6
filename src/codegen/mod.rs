// ABOUTME: Code generation and validation collaborators used by the pipeline.
// ABOUTME: Defines the CodeGenerator and Validator traits plus their artifacts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::agent::AgentHandle;
use crate::source::ItemId;

/// The problem statement extracted from a work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueSpec {
    pub item: ItemId,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// The planned approach for resolving an item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangePlan {
    pub summary: String,
    pub steps: Vec<String>,
}

/// Input to a generation attempt.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub spec: IssueSpec,
    pub plan: ChangePlan,
    /// Zero-based attempt number for this phase.
    pub attempt: u32,
    /// Report from the checks that rejected the previous attempt.
    pub feedback: Option<String>,
}

/// The output of a generation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedChanges {
    /// Checkout holding the changes.
    pub workspace: PathBuf,
    pub files_changed: Vec<PathBuf>,
    pub tests: Vec<String>,
}

/// Result of running checks over a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub passed: bool,
    pub report: String,
}

impl CheckReport {
    pub fn passed(report: impl Into<String>) -> Self {
        Self {
            passed: true,
            report: report.into(),
        }
    }

    pub fn failed(report: impl Into<String>) -> Self {
        Self {
            passed: false,
            report: report.into(),
        }
    }
}

/// Engine that turns an issue into file changes.
///
/// Both calls are treated as single blocking operations. Any error (and, for
/// `generate`, a timeout imposed by the caller) is retried by the pipeline.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Produce a plan for the given issue.
    async fn plan(&self, spec: &IssueSpec, agent: &AgentHandle) -> anyhow::Result<ChangePlan>;

    /// Produce file changes implementing the plan.
    async fn generate(
        &self,
        request: &GenerationRequest,
        agent: &AgentHandle,
    ) -> anyhow::Result<GeneratedChanges>;
}

/// Static analysis and test execution over a workspace.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn run_checks(&self, workspace: &Path) -> anyhow::Result<CheckReport>;
}
