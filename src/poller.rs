// ABOUTME: Poller - the top-level driver that discovers, claims, and dispatches work items.
// ABOUTME: Each cycle claims candidates, spawns bounded runs, reconciles claims, and sweeps agents.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::agent::{AgentRegistry, AgentRuntime};
use crate::clock::Clock;
use crate::config::Config;
use crate::coordinator::{ClaimOutcome, ClaimRegistry, Operation, OperationKind, RateLimiter};
use crate::error::Error;
use crate::hook::{HookEvent, HookRegistry};
use crate::pipeline::{Collaborators, PipelineOrchestrator, RunSummary};
use crate::source::{IssueSource, ItemId, WorkItem};

/// What one poll cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Candidates returned by the source.
    pub candidates: usize,
    /// Items claimed and handed to a run.
    pub claimed: Vec<ItemId>,
    /// Candidates already claimed elsewhere.
    pub conflicts: usize,
    /// Candidates left for a later cycle because no run slot was free.
    pub capacity_skipped: usize,
    /// Claims taken away because their item no longer qualifies.
    pub force_released: Vec<ItemId>,
    pub stopped_agents: Vec<String>,
    pub unhealthy_agents: Vec<String>,
    /// Set if listing candidates failed.
    pub source_error: Option<String>,
}

/// Periodically polls the issue source and drives claimed items.
///
/// # Example
///
/// ```ignore
/// let mut poller = Poller::new(config, collaborators, runtime, Arc::new(SystemClock))?;
/// let summaries = poller.run(tokio::signal::ctrl_c().map(|_| ())).await;
/// ```
pub struct Poller {
    config: Arc<Config>,
    claims: Arc<ClaimRegistry>,
    limiter: Arc<RateLimiter>,
    agents: AgentRegistry,
    hooks: Arc<HookRegistry>,
    source: Arc<dyn IssueSource>,
    orchestrator: Arc<PipelineOrchestrator>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    runs: JoinSet<RunSummary>,
    finished: Vec<RunSummary>,
}

impl Poller {
    /// Validate the configuration and wire up every component.
    pub fn new(
        config: Config,
        collaborators: Collaborators,
        runtime: Arc<dyn AgentRuntime>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let config = Arc::new(config);

        let claims = Arc::new(ClaimRegistry::new(clock.clone()));
        let limiter = Arc::new(
            RateLimiter::new(&config.rate_limits, clock.clone()).with_max_defer(config.max_defer),
        );
        let agents = AgentRegistry::from_config(&config, runtime, clock.clone())?;
        let hooks = Arc::new(HookRegistry::new());
        let source = collaborators.source.clone();

        let orchestrator = PipelineOrchestrator::new(
            config.clone(),
            claims.clone(),
            limiter.clone(),
            agents.clone(),
            collaborators,
            clock.clone(),
        )
        .with_hooks(hooks.clone());

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_runs)),
            config,
            claims,
            limiter,
            agents,
            hooks,
            source,
            orchestrator: Arc::new(orchestrator),
            clock,
            runs: JoinSet::new(),
            finished: Vec::new(),
        })
    }

    pub fn claims(&self) -> &Arc<ClaimRegistry> {
        &self.claims
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    /// Hooks fired on claim and run lifecycle events.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Runs spawned and not yet collected.
    pub fn in_flight(&self) -> usize {
        self.runs.len()
    }

    /// Run one discovery, dispatch, and reconciliation pass.
    pub async fn poll_cycle(&mut self) -> CycleReport {
        self.collect_finished();
        let mut report = CycleReport::default();

        match self.source.list_candidates(&self.config.trigger).await {
            Ok(candidates) => {
                report.candidates = candidates.len();
                self.dispatch(candidates, &mut report).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "listing candidates failed");
                report.source_error = Some(format!("{e:#}"));
            }
        }

        report.force_released = self.reconcile().await;
        report.stopped_agents = self.agents.sweep().await;
        report.unhealthy_agents = self.agents.check_health().await;

        tracing::info!(
            candidates = report.candidates,
            claimed = report.claimed.len(),
            conflicts = report.conflicts,
            capacity_skipped = report.capacity_skipped,
            force_released = report.force_released.len(),
            in_flight = self.runs.len(),
            "poll cycle complete"
        );
        report
    }

    async fn dispatch(&mut self, candidates: Vec<WorkItem>, report: &mut CycleReport) {
        let total = candidates.len();

        for (idx, item) in candidates.into_iter().enumerate() {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                report.capacity_skipped = total - idx;
                tracing::debug!(skipped = report.capacity_skipped, "no run capacity left");
                break;
            };

            let holder = uuid::Uuid::new_v4().to_string();
            match self
                .claims
                .try_claim(&item.id, &holder, self.config.lease_duration)
            {
                ClaimOutcome::Claimed(_) => {
                    tracing::info!(item = %item.id, %holder, "item claimed");
                    self.acknowledge(&item.id).await;
                    report.claimed.push(item.id.clone());

                    let orchestrator = self.orchestrator.clone();
                    self.runs.spawn(async move {
                        let _permit = permit;
                        orchestrator.run(item, holder).await
                    });
                }
                ClaimOutcome::AlreadyClaimed { holder, .. } => {
                    tracing::debug!(item = %item.id, %holder, "item already claimed");
                    report.conflicts += 1;
                }
            }
        }
    }

    /// Tell the item's watchers that it has been picked up.
    async fn acknowledge(&self, item: &ItemId) {
        if !self.config.acknowledge_claims {
            return;
        }

        let text = format!(
            "Claimed by {}. An automated fix is in progress.",
            self.config.actor
        );
        let op = Operation::new(OperationKind::Comment, self.config.actor.as_str())
            .on(item)
            .payload(text.as_str());

        // Acknowledgements are the poller's own trusted writes.
        if self.limiter.admit(&op, true).is_allowed() {
            if let Err(e) = self.source.comment(item, &text).await {
                tracing::warn!(item = %item, error = %e, "acknowledgement not posted");
            }
        }
    }

    /// Force-release claims whose items no longer qualify.
    async fn reconcile(&self) -> Vec<ItemId> {
        let mut observations = Vec::new();
        for claim in self.claims.active_claims() {
            match self.source.get_status(&claim.item_id).await {
                Ok(state) => observations.push((claim.item_id, state)),
                Err(e) => {
                    tracing::warn!(item = %claim.item_id, error = %e, "status check failed");
                }
            }
        }

        let released = self.claims.reconcile(observations, &self.config.trigger);
        let mut ids = Vec::with_capacity(released.len());
        for claim in released {
            self.hooks
                .notify(&HookEvent::ClaimForceReleased {
                    item: claim.item_id.clone(),
                    holder: claim.holder_id,
                })
                .await;
            ids.push(claim.item_id);
        }
        ids
    }

    fn collect_finished(&mut self) {
        while let Some(joined) = self.runs.try_join_next() {
            self.record_joined(joined);
        }
    }

    fn record_joined(&mut self, joined: Result<RunSummary, tokio::task::JoinError>) {
        match joined {
            Ok(summary) => self.finished.push(summary),
            Err(e) => tracing::error!(error = %e, "run task panicked"),
        }
    }

    /// Summaries of runs that have finished since the last call.
    pub fn reap(&mut self) -> Vec<RunSummary> {
        self.collect_finished();
        std::mem::take(&mut self.finished)
    }

    /// Wait for every in-flight run to finish.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.runs.join_next().await {
            self.record_joined(joined);
        }
    }

    /// Poll every `poll_interval` until `shutdown` resolves.
    ///
    /// On shutdown, in-flight runs are allowed to finish and all agents are
    /// stopped. Returns the summaries not yet reaped.
    pub async fn run<F>(&mut self, shutdown: F) -> Vec<RunSummary>
    where
        F: Future<Output = ()>,
    {
        match self.agents.start_resident().await {
            Ok(started) => tracing::info!(started, "resident agents running"),
            Err(e) => tracing::warn!(error = %e, "resident agent failed to start"),
        }

        tokio::pin!(shutdown);
        loop {
            self.poll_cycle().await;

            tokio::select! {
                biased;
                () = &mut shutdown => break,
                () = self.clock.sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!(in_flight = self.runs.len(), "shutting down");
        self.drain().await;
        self.agents.shutdown().await;
        self.reap()
    }
}
