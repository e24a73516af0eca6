// ABOUTME: Pipeline module - the fixed phase sequence that resolves one claimed item.
// ABOUTME: Provides phases, run state, and the orchestrator that executes them.

mod orchestrator;
mod phase;
mod phases;
mod run;

pub use orchestrator::{Collaborators, PipelineOrchestrator};
pub use phase::{Artifact, PhaseName, PhaseOutcome};
pub use run::{Artifacts, PhaseRecord, PipelineRun, RunStatus, RunSummary};
