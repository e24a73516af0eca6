// ABOUTME: Provides preset agent configurations for each role.
// ABOUTME: Supplies default agent ids and lifecycle strategies for Planner, Developer and Reviewer.

use super::{AgentSpec, LifecycleStrategy, Role};

/// Defaults for agents serving one role.
#[derive(Debug, Clone)]
pub struct RolePreset {
    pub role: Role,

    /// Default id for the agent serving this role.
    pub agent_id: &'static str,

    /// Strategy used when a spec does not choose one.
    pub strategy: LifecycleStrategy,

    pub description: &'static str,
}

impl RolePreset {
    /// The default agent spec for this role.
    pub fn spec(&self) -> AgentSpec {
        AgentSpec::new(self.agent_id, self.role).strategy(self.strategy)
    }

    /// Lifecycle strategy for a spec of this role, falling back to the preset.
    pub fn strategy_for(&self, spec: &AgentSpec) -> LifecycleStrategy {
        spec.strategy.unwrap_or(self.strategy)
    }
}

/// Planner preset - resident, since every run starts with planning.
pub static PLANNER: RolePreset = RolePreset {
    role: Role::Planner,
    agent_id: "planner",
    strategy: LifecycleStrategy::AlwaysOn,
    description: "Reads the issue and produces a step-by-step change plan",
};

/// Developer preset - resident, holds the run for its whole lifetime.
pub static DEVELOPER: RolePreset = RolePreset {
    role: Role::Developer,
    agent_id: "developer",
    strategy: LifecycleStrategy::AlwaysOn,
    description: "Generates changes and publishes them to the issue source",
};

/// Reviewer preset - started only when a run reaches validation.
pub static REVIEWER: RolePreset = RolePreset {
    role: Role::Reviewer,
    agent_id: "reviewer",
    strategy: LifecycleStrategy::OnDemand,
    description: "Runs checks over generated changes before publishing",
};

/// Returns all presets.
pub fn all_presets() -> [&'static RolePreset; 3] {
    [&PLANNER, &DEVELOPER, &REVIEWER]
}

/// The preset for a role.
pub fn preset_for(role: Role) -> &'static RolePreset {
    match role {
        Role::Planner => &PLANNER,
        Role::Developer => &DEVELOPER,
        Role::Reviewer => &REVIEWER,
    }
}

/// One agent per role, using preset defaults.
pub fn default_agents() -> Vec<AgentSpec> {
    all_presets().iter().map(|p| p.spec()).collect()
}
