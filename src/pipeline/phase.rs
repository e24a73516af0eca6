// ABOUTME: The fixed phase sequence, phase outcomes, and the artifacts phases produce.
// ABOUTME: Each phase maps to the agent role that performs it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::Role;
use crate::codegen::{ChangePlan, CheckReport, GeneratedChanges, IssueSpec};
use crate::error::PhaseError;
use crate::source::ChangeRef;

/// A step of the pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    FetchSpec,
    PlanChanges,
    GenerateChanges,
    ValidateChanges,
    Publish,
    Finalize,
}

impl PhaseName {
    pub const ALL: [PhaseName; 6] = [
        PhaseName::FetchSpec,
        PhaseName::PlanChanges,
        PhaseName::GenerateChanges,
        PhaseName::ValidateChanges,
        PhaseName::Publish,
        PhaseName::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::FetchSpec => "fetch_spec",
            PhaseName::PlanChanges => "plan_changes",
            PhaseName::GenerateChanges => "generate_changes",
            PhaseName::ValidateChanges => "validate_changes",
            PhaseName::Publish => "publish",
            PhaseName::Finalize => "finalize",
        }
    }

    /// The phase after this one, if any.
    pub fn next(&self) -> Option<PhaseName> {
        let idx = Self::ALL.iter().position(|p| p == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    /// The role whose agent performs this phase.
    ///
    /// Developer-role phases use the run's own lease; the others lease their
    /// agent for the duration of the phase.
    pub fn role(&self) -> Role {
        match self {
            PhaseName::PlanChanges => Role::Planner,
            PhaseName::ValidateChanges => Role::Reviewer,
            _ => Role::Developer,
        }
    }

    /// Where a retry of this phase resumes.
    ///
    /// Failed checks cannot pass on the same changes, so validation retries
    /// resume at generation.
    pub fn resume_point(&self) -> PhaseName {
        match self {
            PhaseName::ValidateChanges => PhaseName::GenerateChanges,
            other => *other,
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a phase produced on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Spec(IssueSpec),
    Plan(ChangePlan),
    Changes(GeneratedChanges),
    Report(CheckReport),
    Published(ChangeRef),
    Closed,
}

/// Result of executing one phase attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    /// Move to the next phase.
    Advance(Artifact),
    /// Run the phase again, after `delay` if given.
    Retry {
        error: PhaseError,
        delay: Option<Duration>,
    },
    /// End the run as failed.
    Abort(PhaseError),
}

impl PhaseOutcome {
    pub fn retry(error: PhaseError) -> Self {
        PhaseOutcome::Retry { error, delay: None }
    }

    pub fn retry_after(error: PhaseError, delay: Duration) -> Self {
        PhaseOutcome::Retry {
            error,
            delay: Some(delay),
        }
    }
}
