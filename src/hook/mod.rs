// ABOUTME: Hook system for observing claim and pipeline run lifecycle.
// ABOUTME: Provides events, actions, and a registry for hook management.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::pipeline::{PhaseName, RunStatus};
use crate::source::ItemId;

/// Events that can trigger hooks.
#[derive(Debug, Clone)]
pub enum HookEvent {
    /// Fired after a claim is taken, before the first phase runs.
    RunStarting { run_id: String, item: ItemId },

    /// Fired when a phase completes and the run moves on.
    PhaseAdvanced {
        run_id: String,
        item: ItemId,
        phase: PhaseName,
    },

    /// Fired when a phase attempt fails and will be retried.
    PhaseRetried {
        run_id: String,
        item: ItemId,
        phase: PhaseName,
        attempt: u32,
        error: String,
    },

    /// Fired once per run, after it reaches a terminal status.
    RunFinished {
        run_id: String,
        item: ItemId,
        status: RunStatus,
        /// Last error, if the run did not complete.
        error: Option<String>,
    },

    /// Fired when reconciliation takes a live claim away from its holder.
    ClaimForceReleased { item: ItemId, holder: String },
}

impl HookEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HookEvent::RunStarting { .. } => "RunStarting",
            HookEvent::PhaseAdvanced { .. } => "PhaseAdvanced",
            HookEvent::PhaseRetried { .. } => "PhaseRetried",
            HookEvent::RunFinished { .. } => "RunFinished",
            HookEvent::ClaimForceReleased { .. } => "ClaimForceReleased",
        }
    }
}

/// Actions a hook can return to control execution flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HookAction {
    /// Continue with normal execution.
    #[default]
    Continue,

    /// Block the action with a message (only honoured for RunStarting).
    Block(String),
}

/// Trait for implementing hooks.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Called when an event occurs.
    ///
    /// Return `Ok(HookAction::Continue)` to proceed normally.
    /// Return `Ok(HookAction::Block(msg))` to stop a run before it starts.
    /// Return `Err` to signal a hook failure (treated as Block).
    async fn on_event(&self, event: &HookEvent) -> Result<HookAction, anyhow::Error>;

    /// Optional: Filter which events this hook cares about.
    /// Default returns true for all events.
    fn accepts(&self, event: &HookEvent) -> bool {
        let _ = event;
        true
    }
}

/// Registry for managing and firing hooks.
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<dyn Hook>>>,
}

impl HookRegistry {
    /// Create a new empty hook registry.
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Register a hook.
    pub async fn register(&self, hook: impl Hook + 'static) {
        self.hooks.write().await.push(Arc::new(hook));
    }

    /// Register a hook wrapped in Arc.
    pub async fn register_arc(&self, hook: Arc<dyn Hook>) {
        self.hooks.write().await.push(hook);
    }

    /// Fire an event to all registered hooks, in registration order.
    ///
    /// If any hook blocks, returns Block immediately and later hooks are
    /// not called.
    pub async fn fire(&self, event: &HookEvent) -> Result<HookAction, anyhow::Error> {
        let hooks = self.hooks.read().await;

        for hook in hooks.iter() {
            if !hook.accepts(event) {
                continue;
            }
            if let HookAction::Block(msg) = hook.on_event(event).await? {
                return Ok(HookAction::Block(msg));
            }
        }

        Ok(HookAction::Continue)
    }

    /// Fire an event whose outcome cannot be blocked, logging hook failures.
    pub async fn notify(&self, event: &HookEvent) {
        if let Err(e) = self.fire(event).await {
            tracing::warn!(event = event.name(), error = %e, "hook failed");
        }
    }

    /// Get the number of registered hooks.
    pub async fn len(&self) -> usize {
        self.hooks.read().await.len()
    }

    /// Check if the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.hooks.read().await.is_empty()
    }

    /// Register a hook that only handles RunStarting events.
    ///
    /// The callback receives (run_id, item).
    pub async fn on_run_starting<F>(&self, f: F)
    where
        F: Fn(&str, &ItemId) -> HookAction + Send + Sync + 'static,
    {
        self.register(RunStartingHook { callback: f }).await;
    }

    /// Register a hook that only handles RunFinished events.
    ///
    /// The callback receives (run_id, item, status, error).
    pub async fn on_run_finished<F>(&self, f: F)
    where
        F: Fn(&str, &ItemId, RunStatus, Option<&str>) + Send + Sync + 'static,
    {
        self.register(RunFinishedHook { callback: f }).await;
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Hook wrapper for RunStarting events.
struct RunStartingHook<F> {
    callback: F,
}

#[async_trait]
impl<F> Hook for RunStartingHook<F>
where
    F: Fn(&str, &ItemId) -> HookAction + Send + Sync,
{
    fn accepts(&self, event: &HookEvent) -> bool {
        matches!(event, HookEvent::RunStarting { .. })
    }

    async fn on_event(&self, event: &HookEvent) -> Result<HookAction, anyhow::Error> {
        if let HookEvent::RunStarting { run_id, item } = event {
            Ok((self.callback)(run_id, item))
        } else {
            Ok(HookAction::Continue)
        }
    }
}

/// Hook wrapper for RunFinished events.
struct RunFinishedHook<F> {
    callback: F,
}

#[async_trait]
impl<F> Hook for RunFinishedHook<F>
where
    F: Fn(&str, &ItemId, RunStatus, Option<&str>) + Send + Sync,
{
    fn accepts(&self, event: &HookEvent) -> bool {
        matches!(event, HookEvent::RunFinished { .. })
    }

    async fn on_event(&self, event: &HookEvent) -> Result<HookAction, anyhow::Error> {
        if let HookEvent::RunFinished {
            run_id,
            item,
            status,
            error,
        } = event
        {
            (self.callback)(run_id, item, *status, error.as_deref());
        }
        Ok(HookAction::Continue)
    }
}
