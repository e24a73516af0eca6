// ABOUTME: Agent lifecycle registry - starts, leases, idles out and restarts agents.
// ABOUTME: A per-agent start lock guarantees at most one start-up sequence at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use super::presets::preset_for;
use super::{
    AgentDescriptor, AgentHandle, AgentRuntime, AgentSpec, AgentStatus, LifecycleStrategy, Role,
};
use crate::clock::Clock;
use crate::config::{Config, RestartBackoff, validate_agents};
use crate::error::{AgentError, ConfigError};

/// Lifecycle state and start lock for one agent.
struct AgentSlot {
    /// Held for the whole of Starting and Stopping.
    lifecycle: tokio::sync::Mutex<()>,
    state: parking_lot::Mutex<AgentDescriptor>,
}

struct Inner {
    agents: HashMap<String, AgentSlot>,
    by_role: HashMap<Role, String>,
    runtime: Arc<dyn AgentRuntime>,
    clock: Arc<dyn Clock>,
    idle_timeout: Duration,
    backoff: RestartBackoff,
}

/// Registry of agents and their lifecycle.
///
/// Cloning is cheap and shares the same agents.
///
/// # Lifecycle
///
/// `Offline → Starting → Idle ⇄ Busy → Stopping → Offline`. Resident
/// (`AlwaysOn`) agents are restarted with backoff when reported unhealthy;
/// `OnDemand` agents are stopped by `sweep` once idle past the timeout.
#[derive(Clone)]
pub struct AgentRegistry {
    inner: Arc<Inner>,
}

impl AgentRegistry {
    /// Create a registry for the given agents. All start Offline.
    pub fn new(
        specs: &[AgentSpec],
        idle_timeout: Duration,
        backoff: RestartBackoff,
        runtime: Arc<dyn AgentRuntime>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        validate_agents(specs)?;

        let mut agents = HashMap::new();
        let mut by_role = HashMap::new();
        for spec in specs {
            let strategy = preset_for(spec.role).strategy_for(spec);
            let descriptor = AgentDescriptor::new(spec.agent_id.clone(), spec.role, strategy);
            agents.insert(
                spec.agent_id.clone(),
                AgentSlot {
                    lifecycle: tokio::sync::Mutex::new(()),
                    state: parking_lot::Mutex::new(descriptor),
                },
            );
            by_role.insert(spec.role, spec.agent_id.clone());
        }

        Ok(Self {
            inner: Arc::new(Inner {
                agents,
                by_role,
                runtime,
                clock,
                idle_timeout,
                backoff,
            }),
        })
    }

    /// Create a registry from the engine configuration.
    pub fn from_config(
        config: &Config,
        runtime: Arc<dyn AgentRuntime>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        Self::new(
            &config.agents,
            config.idle_timeout,
            config.restart_backoff.clone(),
            runtime,
            clock,
        )
    }

    fn slot_for(&self, role: Role) -> Result<&AgentSlot, AgentError> {
        self.inner
            .by_role
            .get(&role)
            .and_then(|id| self.inner.agents.get(id))
            .ok_or(AgentError::UnknownRole(role))
    }

    /// Mark the agent Busy and hand out a lease on its instance.
    fn lease(&self, state: &mut AgentDescriptor) -> Option<AgentHandle> {
        let instance = state.instance.clone()?;
        state.status = AgentStatus::Busy;
        state.active_leases += 1;
        state.idle_since = None;
        Some(AgentHandle {
            agent_id: state.agent_id.clone(),
            role: state.role,
            instance,
        })
    }

    /// Get a handle to the running agent for a role, starting it if needed.
    ///
    /// Concurrent callers for the same agent wait on its start lock, so at
    /// most one start-up sequence runs and every caller receives a handle to
    /// the same instance. A failed start leaves the agent Offline.
    pub async fn ensure_running(&self, role: Role) -> Result<AgentHandle, AgentError> {
        let slot = self.slot_for(role)?;
        let _lifecycle = slot.lifecycle.lock().await;

        let descriptor = {
            let mut state = slot.state.lock();
            if state.is_running() {
                if let Some(handle) = self.lease(&mut state) {
                    return Ok(handle);
                }
            }
            state.status = AgentStatus::Starting;
            state.instance = None;
            state.clone()
        };

        tracing::info!(agent = %descriptor.agent_id, %role, "starting agent");
        let started = self.inner.runtime.start(&descriptor).await;

        let mut state = slot.state.lock();
        match started {
            Ok(instance) => {
                let now = self.inner.clock.now();
                state.instance = Some(instance);
                state.starts += 1;
                state.last_heartbeat = Some(now);
                state.active_leases = 0;
                tracing::info!(agent = %state.agent_id, starts = state.starts, "agent running");
                self.lease(&mut state)
                    .ok_or_else(|| AgentError::NotFound(state.agent_id.clone()))
            }
            Err(source) => {
                state.status = AgentStatus::Offline;
                state.instance = None;
                tracing::warn!(agent = %state.agent_id, error = %source, "agent failed to start");
                Err(AgentError::StartFailed {
                    agent_id: state.agent_id.clone(),
                    source,
                })
            }
        }
    }

    /// Return a leased handle. The agent becomes Idle once no leases remain.
    ///
    /// Stale handles (from an instance that has since stopped) are ignored.
    pub fn release(&self, handle: &AgentHandle) {
        let Some(slot) = self.inner.agents.get(&handle.agent_id) else {
            return;
        };
        let mut state = slot.state.lock();

        if state.status != AgentStatus::Busy
            || state.instance.as_deref() != Some(handle.instance.as_str())
        {
            tracing::debug!(agent = %handle.agent_id, "ignoring stale handle");
            return;
        }

        state.active_leases = state.active_leases.saturating_sub(1);
        if state.active_leases == 0 {
            state.status = AgentStatus::Idle;
            state.idle_since = Some(self.inner.clock.now());
        }
    }

    /// Stop on-demand agents that have been idle longer than the timeout.
    ///
    /// Returns the ids of the agents stopped.
    pub async fn sweep(&self) -> Vec<String> {
        let mut stopped = Vec::new();

        for (agent_id, slot) in &self.inner.agents {
            let due = {
                let state = slot.state.lock();
                self.is_idle_past_timeout(&state)
            };
            if !due {
                continue;
            }

            let _lifecycle = slot.lifecycle.lock().await;
            let instance = {
                let mut state = slot.state.lock();
                // Re-check: a lease may have been taken while we waited.
                if !self.is_idle_past_timeout(&state) {
                    continue;
                }
                state.status = AgentStatus::Stopping;
                state.instance.take()
            };

            self.stop_instance(agent_id, instance).await;
            stopped.push(agent_id.clone());
        }

        stopped.sort();
        stopped
    }

    fn is_idle_past_timeout(&self, state: &AgentDescriptor) -> bool {
        if state.strategy != LifecycleStrategy::OnDemand || state.status != AgentStatus::Idle {
            return false;
        }
        let now = self.inner.clock.now();
        state
            .idle_since
            .is_some_and(|since| now.saturating_duration_since(since) > self.inner.idle_timeout)
    }

    /// Call the runtime's stop and leave the agent Offline regardless of outcome.
    async fn stop_instance(&self, agent_id: &str, instance: Option<String>) {
        if let Some(instance) = instance {
            if let Err(source) = self.inner.runtime.stop(&instance).await {
                let err = AgentError::StopFailed {
                    agent_id: agent_id.to_string(),
                    source,
                };
                tracing::warn!(error = %err, "agent stop failed");
            }
        }

        if let Some(slot) = self.inner.agents.get(agent_id) {
            let mut state = slot.state.lock();
            state.status = AgentStatus::Offline;
            state.idle_since = None;
            state.active_leases = 0;
        }
        tracing::info!(agent = agent_id, "agent stopped");
    }

    /// Force an agent Offline after a failed heartbeat or crash signal.
    ///
    /// Skips Stopping. Resident agents get a background restart with
    /// backoff. Returns false if the handle was already stale.
    pub async fn report_unhealthy(&self, handle: &AgentHandle) -> bool {
        let Some(slot) = self.inner.agents.get(&handle.agent_id) else {
            return false;
        };

        let strategy = {
            let mut state = slot.state.lock();
            if state.instance.as_deref() != Some(handle.instance.as_str()) {
                return false;
            }
            state.status = AgentStatus::Offline;
            state.instance = None;
            state.idle_since = None;
            state.active_leases = 0;
            state.strategy
        };

        tracing::warn!(agent = %handle.agent_id, instance = %handle.instance, "agent unhealthy");

        if strategy == LifecycleStrategy::AlwaysOn && self.inner.backoff.max_attempts > 0 {
            let registry = self.clone();
            let role = handle.role;
            tokio::spawn(async move { registry.restart_with_backoff(role).await });
        }
        true
    }

    async fn restart_with_backoff(&self, role: Role) {
        let backoff = self.inner.backoff.clone();

        for attempt in 1..=backoff.max_attempts {
            self.inner.clock.sleep(backoff.delay(attempt)).await;
            match self.ensure_running(role).await {
                Ok(handle) => {
                    self.release(&handle);
                    tracing::info!(%role, attempt, "resident agent restarted");
                    return;
                }
                Err(err) => {
                    tracing::warn!(%role, attempt, error = %err, "restart attempt failed");
                }
            }
        }

        tracing::error!(%role, attempts = backoff.max_attempts, "giving up restarting agent");
    }

    /// Start every resident agent and leave it Idle.
    ///
    /// Returns the number started, or the first start-up failure.
    pub async fn start_resident(&self) -> Result<usize, AgentError> {
        let roles: Vec<Role> = self
            .inner
            .agents
            .values()
            .filter_map(|slot| {
                let state = slot.state.lock();
                (state.strategy == LifecycleStrategy::AlwaysOn).then_some(state.role)
            })
            .collect();

        let results = join_all(roles.iter().map(|role| self.ensure_running(*role))).await;

        let mut started = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(handle) => {
                    self.release(&handle);
                    started += 1;
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(started),
        }
    }

    /// Heartbeat every running agent, reporting failures.
    ///
    /// Returns the ids of agents found unhealthy.
    pub async fn check_health(&self) -> Vec<String> {
        let running: Vec<AgentHandle> = self
            .inner
            .agents
            .values()
            .filter_map(|slot| {
                let state = slot.state.lock();
                if !state.is_running() {
                    return None;
                }
                state.instance.clone().map(|instance| AgentHandle {
                    agent_id: state.agent_id.clone(),
                    role: state.role,
                    instance,
                })
            })
            .collect();

        let mut unhealthy = Vec::new();
        for handle in running {
            if self.inner.runtime.heartbeat(&handle.instance).await {
                if let Some(slot) = self.inner.agents.get(&handle.agent_id) {
                    let mut state = slot.state.lock();
                    if state.instance.as_deref() == Some(handle.instance.as_str()) {
                        state.last_heartbeat = Some(self.inner.clock.now());
                    }
                }
            } else if self.report_unhealthy(&handle).await {
                unhealthy.push(handle.agent_id);
            }
        }

        unhealthy.sort();
        unhealthy
    }

    /// Stop every running agent.
    pub async fn shutdown(&self) {
        for (agent_id, slot) in &self.inner.agents {
            let _lifecycle = slot.lifecycle.lock().await;
            let instance = {
                let mut state = slot.state.lock();
                if state.status == AgentStatus::Offline {
                    continue;
                }
                state.status = AgentStatus::Stopping;
                state.instance.take()
            };
            self.stop_instance(agent_id, instance).await;
        }
    }

    /// Snapshot of one agent.
    pub fn descriptor(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.inner
            .agents
            .get(agent_id)
            .map(|slot| slot.state.lock().clone())
    }

    /// Snapshot of the agent serving a role.
    pub fn descriptor_for(&self, role: Role) -> Option<AgentDescriptor> {
        self.inner
            .by_role
            .get(&role)
            .and_then(|id| self.descriptor(id))
    }

    /// Snapshots of all agents, ordered by id.
    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        let mut all: Vec<AgentDescriptor> = self
            .inner
            .agents
            .values()
            .map(|slot| slot.state.lock().clone())
            .collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }
}
