// ABOUTME: Defines all error types for fixloop using thiserror.
// ABOUTME: Each concern has its own error enum, unified under the top-level Error.

use std::time::Duration;

use crate::agent::Role;
use crate::coordinator::OperationKind;
use crate::pipeline::PhaseName;

/// Top-level error type for fixloop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Errors found while validating a resolved configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid label pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("agent id '{0}' is configured more than once")]
    DuplicateAgent(String),

    #[error("role '{0}' is mapped to more than one agent")]
    DuplicateRole(Role),

    #[error("role '{0}' has no agent configured")]
    UnmappedRole(Role),

    #[error("rate limit for {kind}: {reason}")]
    RateLimit { kind: OperationKind, reason: String },
}

/// Errors from agent lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("no agent configured for role '{0}'")]
    UnknownRole(Role),

    #[error("agent '{0}' not found")]
    NotFound(String),

    #[error("agent '{agent_id}' failed to start: {source}")]
    StartFailed {
        agent_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("agent '{agent_id}' failed to stop: {source}")]
    StopFailed {
        agent_id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors resolved inside a pipeline phase.
///
/// These never escape a phase as raw errors; the phase turns them into a
/// retry or an abort, and the last one is kept on the run for reporting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhaseError {
    #[error("transient collaborator error: {0}")]
    Transient(String),

    #[error("collaborator timed out after {0:?}")]
    Timeout(Duration),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited on {kind}: {detail}")]
    RateLimited { kind: OperationKind, detail: String },

    #[error("agent start-up failed: {0}")]
    LifecycleStart(String),

    #[error("no artifact from {0}")]
    MissingArtifact(PhaseName),

    #[error("blocked by hook: {0}")]
    Blocked(String),
}

impl PhaseError {
    /// Wrap a collaborator failure, keeping its full context chain.
    pub fn transient(err: &anyhow::Error) -> Self {
        PhaseError::Transient(format!("{err:#}"))
    }
}

impl From<AgentError> for PhaseError {
    fn from(err: AgentError) -> Self {
        PhaseError::LifecycleStart(err.to_string())
    }
}
