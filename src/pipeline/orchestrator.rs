// ABOUTME: PipelineOrchestrator drives one claimed item through the phase sequence.
// ABOUTME: Owns retry and abort handling, failure notification, and claim/agent release.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{PhaseName, PhaseOutcome, PipelineRun, RunStatus, RunSummary};
use crate::agent::{AgentHandle, AgentRegistry, Role};
use crate::clock::Clock;
use crate::codegen::{CodeGenerator, Validator};
use crate::config::Config;
use crate::coordinator::{Admission, ClaimRegistry, Operation, OperationKind, RateLimiter, RenewOutcome};
use crate::error::PhaseError;
use crate::hook::{HookAction, HookEvent, HookRegistry};
use crate::source::{IssueSource, WorkItem};

/// The external systems a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn IssueSource>,
    pub generator: Arc<dyn CodeGenerator>,
    pub validator: Arc<dyn Validator>,
}

/// Executes pipeline runs.
///
/// One orchestrator is shared by every run; each call to [`run`] owns its
/// own [`PipelineRun`] and executes phases strictly in order.
///
/// [`run`]: PipelineOrchestrator::run
pub struct PipelineOrchestrator {
    pub(super) config: Arc<Config>,
    pub(super) claims: Arc<ClaimRegistry>,
    pub(super) limiter: Arc<RateLimiter>,
    pub(super) agents: AgentRegistry,
    pub(super) hooks: Arc<HookRegistry>,
    pub(super) collaborators: Collaborators,
    pub(super) clock: Arc<dyn Clock>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: Arc<Config>,
        claims: Arc<ClaimRegistry>,
        limiter: Arc<RateLimiter>,
        agents: AgentRegistry,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            claims,
            limiter,
            agents,
            hooks: Arc::new(HookRegistry::new()),
            collaborators,
            clock,
        }
    }

    /// Use a shared hook registry.
    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Drive a claimed item to a terminal status.
    ///
    /// The claim held by `holder_id` is released before returning, whatever
    /// the outcome. A Failed run posts exactly one failure comment; an
    /// Aborted run posts nothing.
    pub async fn run(&self, item: WorkItem, holder_id: impl Into<String>) -> RunSummary {
        let mut run = PipelineRun::new(item.id.clone(), holder_id);
        tracing::info!(run = %run.run_id, item = %run.item_id, "run starting");

        let starting = HookEvent::RunStarting {
            run_id: run.run_id.clone(),
            item: run.item_id.clone(),
        };
        let blocked = match self.hooks.fire(&starting).await {
            Ok(HookAction::Continue) => None,
            Ok(HookAction::Block(msg)) => Some(msg),
            Err(e) => Some(format!("{e:#}")),
        };

        if let Some(reason) = blocked {
            tracing::info!(run = %run.run_id, %reason, "run blocked by hook");
            run.finish(RunStatus::Aborted, Some(PhaseError::Blocked(reason)));
        } else {
            match self.agents.ensure_running(Role::Developer).await {
                Ok(developer) => {
                    self.drive(&item, &mut run, &developer).await;
                    self.agents.release(&developer);
                }
                Err(e) => self.fail(&mut run, e.into()).await,
            }
        }

        self.claims.release(&run.item_id, &run.holder_id);

        let summary = run.summary();
        tracing::info!(
            run = %run.run_id,
            item = %run.item_id,
            status = %run.status,
            retries = run.total_retries(),
            "run finished"
        );
        self.hooks
            .notify(&HookEvent::RunFinished {
                run_id: run.run_id.clone(),
                item: run.item_id.clone(),
                status: run.status,
                error: run.last_error.as_ref().map(ToString::to_string),
            })
            .await;
        summary
    }

    async fn drive(&self, item: &WorkItem, run: &mut PipelineRun, developer: &AgentHandle) {
        while let Some(phase) = run.current_phase() {
            if !self.claims.is_still_holder(&run.item_id, &run.holder_id) {
                tracing::info!(run = %run.run_id, %phase, "claim lost, aborting run");
                run.finish(RunStatus::Aborted, None);
                return;
            }

            tracing::debug!(
                run = %run.run_id,
                %phase,
                attempt = run.retry_count(phase),
                "executing phase"
            );

            let outcome = self
                .with_lease(run, self.execute(phase, item, run, developer))
                .await;

            match outcome {
                PhaseOutcome::Advance(artifact) => {
                    run.advance(phase, artifact);
                    self.hooks
                        .notify(&HookEvent::PhaseAdvanced {
                            run_id: run.run_id.clone(),
                            item: run.item_id.clone(),
                            phase,
                        })
                        .await;

                    self.renew(run);
                }
                PhaseOutcome::Retry { error, delay } => {
                    let attempts = run.record_failure(phase, error.clone());
                    if attempts >= self.config.max_retries {
                        tracing::warn!(
                            run = %run.run_id,
                            %phase,
                            attempts,
                            error = %error,
                            "phase out of retries"
                        );
                        self.fail(run, error).await;
                        return;
                    }

                    tracing::info!(run = %run.run_id, %phase, attempts, error = %error, "retrying phase");
                    self.hooks
                        .notify(&HookEvent::PhaseRetried {
                            run_id: run.run_id.clone(),
                            item: run.item_id.clone(),
                            phase,
                            attempt: attempts,
                            error: error.to_string(),
                        })
                        .await;

                    run.resume_at(phase.resume_point());
                    if let Some(delay) = delay {
                        if self.renew(run) {
                            self.with_lease(run, self.clock.sleep(delay)).await;
                        }
                    }
                }
                PhaseOutcome::Abort(error) => {
                    run.record_error(phase, error.clone());
                    tracing::warn!(run = %run.run_id, %phase, error = %error, "phase aborted");
                    self.fail(run, error).await;
                    return;
                }
            }
        }

        run.finish(RunStatus::Completed, None);
    }

    /// Execute one phase attempt, leasing the phase's own agent if it needs one.
    async fn execute(
        &self,
        phase: PhaseName,
        item: &WorkItem,
        run: &PipelineRun,
        developer: &AgentHandle,
    ) -> PhaseOutcome {
        let leased = match phase.role() {
            Role::Developer => None,
            role => match self.agents.ensure_running(role).await {
                Ok(handle) => Some(handle),
                Err(e) => return PhaseOutcome::Abort(e.into()),
            },
        };
        let agent = leased.as_ref().unwrap_or(developer);

        let outcome = match phase {
            PhaseName::FetchSpec => self.fetch_spec(item).await,
            PhaseName::PlanChanges => self.plan_changes(run, agent).await,
            PhaseName::GenerateChanges => self.generate_changes(run, agent).await,
            PhaseName::ValidateChanges => self.validate_changes(run).await,
            PhaseName::Publish => self.publish(run, agent).await,
            PhaseName::Finalize => self.finalize(run, agent).await,
        };

        if let Some(handle) = leased {
            self.agents.release(&handle);
        }
        outcome
    }

    /// Extend the run's claim by a full lease. Returns false if it is gone.
    fn renew(&self, run: &PipelineRun) -> bool {
        match self.claims.renew(&run.item_id, &run.holder_id) {
            RenewOutcome::Renewed { .. } => true,
            outcome => {
                tracing::warn!(run = %run.run_id, ?outcome, "claim renewal failed");
                false
            }
        }
    }

    /// Gap between renewals while a run is waiting on something.
    fn renew_interval(&self) -> Duration {
        (self.config.lease_duration / 3).max(Duration::from_millis(1))
    }

    /// Await `work` while renewing the run's claim in the background.
    ///
    /// Renewal stops at the first failure; the phase loop's liveness check
    /// then ends the run once `work` completes.
    async fn with_lease<F: Future>(&self, run: &PipelineRun, work: F) -> F::Output {
        let heartbeat = async {
            loop {
                self.clock.sleep(self.renew_interval()).await;
                if !self.renew(run) {
                    break;
                }
            }
        };

        tokio::pin!(work);
        tokio::select! {
            biased;
            output = &mut work => output,
            () = heartbeat => work.await,
        }
    }

    /// Mark the run Failed and post the one failure comment.
    async fn fail(&self, run: &mut PipelineRun, error: PhaseError) {
        if !run.finish(RunStatus::Failed, Some(error)) || run.failure_notified {
            return;
        }
        run.failure_notified = true;

        let text = failure_comment(run);
        let op = Operation::new(OperationKind::Comment, self.config.actor.as_str())
            .on(&run.item_id)
            .payload(text.as_str());

        // Stop waiting for comment capacity once the item belongs to someone else.
        let claim_lost = async {
            while self.claims.is_still_holder(&run.item_id, &run.holder_id) {
                self.clock.sleep(self.renew_interval()).await;
            }
        };
        let decision = self
            .with_lease(run, self.limiter.admit_or_wait(&op, claim_lost))
            .await;

        match decision {
            Admission::Allowed => {
                if let Err(e) = self
                    .collaborators
                    .source
                    .comment(&run.item_id, &text)
                    .await
                {
                    tracing::warn!(run = %run.run_id, error = %e, "failure comment not posted");
                }
            }
            decision => {
                tracing::warn!(run = %run.run_id, ?decision, "failure comment skipped by rate limiter");
            }
        }
    }
}

fn failure_comment(run: &PipelineRun) -> String {
    let phase = run
        .records
        .last()
        .map(|r| r.phase.to_string())
        .unwrap_or_else(|| "start-up".to_string());
    let error = run
        .last_error
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown error".to_string());

    format!(
        "Automated fix failed during `{}` after {} retr{}: {}",
        phase,
        run.total_retries(),
        if run.total_retries() == 1 { "y" } else { "ies" },
        error
    )
}
