// ABOUTME: Phase implementations - one method per step of the pipeline.
// ABOUTME: Collaborator errors become retries; rate limiter decisions gate every write.

use std::time::Duration;

use super::{Artifact, PhaseName, PhaseOutcome, PipelineOrchestrator, PipelineRun};
use crate::agent::AgentHandle;
use crate::codegen::{GenerationRequest, IssueSpec};
use crate::coordinator::{Admission, Operation, OperationKind};
use crate::error::PhaseError;
use crate::source::{BranchSpec, CloseReason, ItemId, WorkItem};

impl PipelineOrchestrator {
    /// Refresh the item from the source and extract its problem statement.
    pub(super) async fn fetch_spec(&self, item: &WorkItem) -> PhaseOutcome {
        match self.collaborators.source.get_status(&item.id).await {
            Ok(state) => PhaseOutcome::Advance(Artifact::Spec(IssueSpec {
                item: item.id.clone(),
                title: item.title.clone(),
                body: item.body.clone(),
                labels: state.labels,
            })),
            Err(e) => PhaseOutcome::retry(PhaseError::transient(&e)),
        }
    }

    pub(super) async fn plan_changes(&self, run: &PipelineRun, agent: &AgentHandle) -> PhaseOutcome {
        let Some(spec) = &run.artifacts.spec else {
            return PhaseOutcome::Abort(PhaseError::MissingArtifact(PhaseName::FetchSpec));
        };

        match self.collaborators.generator.plan(spec, agent).await {
            Ok(plan) => PhaseOutcome::Advance(Artifact::Plan(plan)),
            Err(e) => PhaseOutcome::retry(PhaseError::transient(&e)),
        }
    }

    /// Generate changes, bounded by the configured timeout.
    pub(super) async fn generate_changes(
        &self,
        run: &PipelineRun,
        agent: &AgentHandle,
    ) -> PhaseOutcome {
        let Some(spec) = &run.artifacts.spec else {
            return PhaseOutcome::Abort(PhaseError::MissingArtifact(PhaseName::FetchSpec));
        };
        let Some(plan) = &run.artifacts.plan else {
            return PhaseOutcome::Abort(PhaseError::MissingArtifact(PhaseName::PlanChanges));
        };

        // Feedback only applies when the last attempt was rejected by checks.
        let feedback = match run.records.last() {
            Some(record) if record.phase == PhaseName::ValidateChanges => match &record.error {
                Some(PhaseError::Validation(report)) => Some(report.clone()),
                _ => None,
            },
            _ => None,
        };

        let request = GenerationRequest {
            spec: spec.clone(),
            plan: plan.clone(),
            attempt: run.retry_count(PhaseName::GenerateChanges)
                + run.retry_count(PhaseName::ValidateChanges),
            feedback,
        };

        let limit = self.config.generate_timeout;
        let generated =
            tokio::time::timeout(limit, self.collaborators.generator.generate(&request, agent))
                .await;

        match generated {
            Ok(Ok(changes)) => PhaseOutcome::Advance(Artifact::Changes(changes)),
            Ok(Err(e)) => PhaseOutcome::retry(PhaseError::transient(&e)),
            Err(_) => PhaseOutcome::retry(PhaseError::Timeout(limit)),
        }
    }

    pub(super) async fn validate_changes(&self, run: &PipelineRun) -> PhaseOutcome {
        let Some(changes) = &run.artifacts.changes else {
            return PhaseOutcome::Abort(PhaseError::MissingArtifact(PhaseName::GenerateChanges));
        };

        match self.collaborators.validator.run_checks(&changes.workspace).await {
            Ok(report) if report.passed => PhaseOutcome::Advance(Artifact::Report(report)),
            Ok(report) => PhaseOutcome::retry(PhaseError::Validation(report.report)),
            Err(e) => PhaseOutcome::retry(PhaseError::transient(&e)),
        }
    }

    /// Open a change request for the validated changes.
    pub(super) async fn publish(&self, run: &PipelineRun, agent: &AgentHandle) -> PhaseOutcome {
        let Some(changes) = &run.artifacts.changes else {
            return PhaseOutcome::Abort(PhaseError::MissingArtifact(PhaseName::GenerateChanges));
        };
        let Some(spec) = &run.artifacts.spec else {
            return PhaseOutcome::Abort(PhaseError::MissingArtifact(PhaseName::FetchSpec));
        };

        let op = Operation::new(OperationKind::Publish, agent.agent_id.as_str()).on(&run.item_id);
        if let Some(outcome) = self.gate(&op) {
            return outcome;
        }

        let summary = run
            .artifacts
            .plan
            .as_ref()
            .map(|p| p.summary.as_str())
            .unwrap_or_default();
        let checks = run
            .artifacts
            .report
            .as_ref()
            .map(|r| r.report.as_str())
            .unwrap_or_default();

        let branch = BranchSpec {
            branch: branch_name(&run.item_id),
            title: format!("Fix #{}: {}", run.item_id.number, spec.title),
            body: format!(
                "Resolves #{}.\n\n{}\n\nChecks:\n{}",
                run.item_id.number, summary, checks
            ),
            files: changes.files_changed.clone(),
        };

        match self
            .collaborators
            .source
            .open_change(&run.item_id, &branch)
            .await
        {
            Ok(change) => {
                tracing::info!(item = %run.item_id, url = %change.url, "change published");
                PhaseOutcome::Advance(Artifact::Published(change))
            }
            Err(e) => PhaseOutcome::retry(PhaseError::transient(&e)),
        }
    }

    /// Close the item as resolved by the published change.
    pub(super) async fn finalize(&self, run: &PipelineRun, agent: &AgentHandle) -> PhaseOutcome {
        let Some(change) = &run.artifacts.change else {
            return PhaseOutcome::Abort(PhaseError::MissingArtifact(PhaseName::Publish));
        };

        let op =
            Operation::new(OperationKind::StatusChange, agent.agent_id.as_str()).on(&run.item_id);
        if let Some(outcome) = self.gate(&op) {
            return outcome;
        }

        let reason = CloseReason::Resolved(change.clone());
        match self.collaborators.source.close(&run.item_id, &reason).await {
            Ok(()) => PhaseOutcome::Advance(Artifact::Closed),
            Err(e) => PhaseOutcome::retry(PhaseError::transient(&e)),
        }
    }

    /// Admission check before an outbound write.
    ///
    /// Returns `None` when the write may go ahead.
    fn gate(&self, op: &Operation) -> Option<PhaseOutcome> {
        match self.limiter.admit(op, false) {
            Admission::Allowed => None,
            Admission::Deferred { retry_after } => Some(PhaseOutcome::retry_after(
                PhaseError::RateLimited {
                    kind: op.kind,
                    detail: format!("deferred for {:?}", retry_after),
                },
                retry_after.max(Duration::from_millis(1)),
            )),
            Admission::Rejected { reason } => Some(PhaseOutcome::Abort(PhaseError::RateLimited {
                kind: op.kind,
                detail: reason.to_string(),
            })),
        }
    }
}

/// Branch name for an item's change, safe for any source name.
fn branch_name(item: &ItemId) -> String {
    let source: String = item
        .source
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("fixloop/{}-{}", source, item.number)
}
