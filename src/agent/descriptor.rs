// ABOUTME: Agent descriptor types - roles, lifecycle strategies, statuses and handles.
// ABOUTME: AgentSpec maps a configured agent id to the role it serves.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// The closed set of roles agents can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Turns an issue into a change plan.
    Planner,
    /// Writes changes and talks to the issue source.
    Developer,
    /// Reviews generated changes before they are published.
    Reviewer,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Planner, Role::Developer, Role::Reviewer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::Developer => "developer",
            Role::Reviewer => "reviewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an agent is kept resident or started on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStrategy {
    /// Started at boot, restarted on failure, never idled out.
    AlwaysOn,
    /// Started on first request, stopped after sitting idle.
    OnDemand,
}

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Offline,
    Starting,
    Idle,
    Busy,
    Stopping,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Offline => write!(f, "offline"),
            AgentStatus::Starting => write!(f, "starting"),
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Stopping => write!(f, "stopping"),
        }
    }
}

/// A configured agent: which id serves which role.
///
/// When `strategy` is omitted the role's preset strategy applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub agent_id: String,
    pub role: Role,
    #[serde(default)]
    pub strategy: Option<LifecycleStrategy>,
}

impl AgentSpec {
    pub fn new(agent_id: impl Into<String>, role: Role) -> Self {
        Self {
            agent_id: agent_id.into(),
            role,
            strategy: None,
        }
    }

    /// Override the preset lifecycle strategy.
    pub fn strategy(mut self, strategy: LifecycleStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Lifecycle state of one agent, as tracked by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDescriptor {
    pub agent_id: String,
    pub role: Role,
    pub strategy: LifecycleStrategy,
    pub status: AgentStatus,
    pub last_heartbeat: Option<Instant>,
    /// Set while Idle.
    pub idle_since: Option<Instant>,
    /// Runtime instance token of the running agent.
    pub instance: Option<String>,
    /// Handles currently leased out.
    pub active_leases: usize,
    /// Number of completed start-ups.
    pub starts: u64,
}

impl AgentDescriptor {
    pub fn new(agent_id: impl Into<String>, role: Role, strategy: LifecycleStrategy) -> Self {
        Self {
            agent_id: agent_id.into(),
            role,
            strategy,
            status: AgentStatus::Offline,
            last_heartbeat: None,
            idle_since: None,
            instance: None,
            active_leases: 0,
            starts: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, AgentStatus::Idle | AgentStatus::Busy)
    }
}

/// A leased reference to a running agent instance.
///
/// Return it with `AgentRegistry::release`. A handle becomes stale once its
/// instance stops; releasing a stale handle is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentHandle {
    pub agent_id: String,
    pub role: Role,
    pub instance: String,
}
