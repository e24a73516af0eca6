// ABOUTME: Prelude module - convenient imports for common use cases.
// ABOUTME: Use `use fixloop::prelude::*;` to get started quickly.

pub use crate::agent::{
    AgentDescriptor, AgentHandle, AgentRegistry, AgentRuntime, AgentSpec, AgentStatus,
    LifecycleStrategy, Role,
};
pub use crate::clock::{Clock, FakeClock, SystemClock};
pub use crate::codegen::{
    ChangePlan, CheckReport, CodeGenerator, GeneratedChanges, GenerationRequest, IssueSpec,
    Validator,
};
pub use crate::config::{Config, RestartBackoff};
pub use crate::coordinator::{
    Admission, Claim, ClaimOutcome, ClaimRegistry, KindLimits, Operation, OperationKind,
    RateLimiter, RejectReason, ReleaseOutcome, RenewOutcome, WindowLimit,
};
pub use crate::error::{AgentError, ConfigError, Error, PhaseError};
pub use crate::hook::{Hook, HookAction, HookEvent, HookRegistry};
pub use crate::pipeline::{Collaborators, PhaseName, PipelineOrchestrator, RunStatus, RunSummary};
pub use crate::poller::{CycleReport, Poller};
pub use crate::source::{
    BranchSpec, CandidateFilter, ChangeRef, CloseReason, ExternalState, IssueSource, ItemId,
    WorkItem,
};
