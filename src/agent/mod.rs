// ABOUTME: Agent lifecycle module - roles, presets, runtime seam and the registry.
// ABOUTME: Agents are long-lived worker identities leased to pipeline runs by role.

mod descriptor;
mod presets;
mod registry;
mod runtime;

pub use descriptor::{
    AgentDescriptor, AgentHandle, AgentSpec, AgentStatus, LifecycleStrategy, Role,
};
pub use presets::{DEVELOPER, PLANNER, REVIEWER, RolePreset, all_presets, default_agents, preset_for};
pub use registry::AgentRegistry;
pub use runtime::AgentRuntime;
