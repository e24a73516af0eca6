// ABOUTME: Defines the AgentRuntime trait - how agent instances are started, stopped
// ABOUTME: and health-checked. The registry treats instances as opaque tokens.

use async_trait::async_trait;

use super::AgentDescriptor;

/// Runtime that hosts agent instances.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Start an instance for the described agent and return its token.
    async fn start(&self, descriptor: &AgentDescriptor) -> anyhow::Result<String>;

    /// Stop a running instance.
    async fn stop(&self, instance: &str) -> anyhow::Result<()>;

    /// Whether the instance is still healthy.
    async fn heartbeat(&self, instance: &str) -> bool;
}
