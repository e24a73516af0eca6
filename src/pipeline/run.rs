// ABOUTME: PipelineRun tracks one item's progress through the phase sequence.
// ABOUTME: Holds retry counters, per-attempt records, artifacts, and the terminal status.

use std::collections::BTreeMap;
use std::fmt;

use super::{Artifact, PhaseName};
use crate::codegen::{ChangePlan, CheckReport, GeneratedChanges, IssueSpec};
use crate::error::PhaseError;
use crate::source::{ChangeRef, ItemId};

/// Represents the current state of a pipeline run.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunStatus {
    /// Phases are still executing.
    Running,
    /// Every phase advanced.
    Completed,
    /// A phase aborted or ran out of retries.
    Failed,
    /// The claim was lost or a hook blocked the run.
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// One executed phase attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseRecord {
    pub phase: PhaseName,
    /// Zero-based attempt number within the phase.
    pub attempt: u32,
    /// `None` if the attempt advanced.
    pub error: Option<PhaseError>,
}

/// Artifacts gathered so far. Later phases read what earlier ones stored.
#[derive(Debug, Clone, Default)]
pub struct Artifacts {
    pub spec: Option<IssueSpec>,
    pub plan: Option<ChangePlan>,
    pub changes: Option<GeneratedChanges>,
    pub report: Option<CheckReport>,
    pub change: Option<ChangeRef>,
    pub closed: bool,
}

impl Artifacts {
    fn store(&mut self, artifact: Artifact) {
        match artifact {
            Artifact::Spec(spec) => self.spec = Some(spec),
            Artifact::Plan(plan) => self.plan = Some(plan),
            Artifact::Changes(changes) => self.changes = Some(changes),
            Artifact::Report(report) => self.report = Some(report),
            Artifact::Published(change) => self.change = Some(change),
            Artifact::Closed => self.closed = true,
        }
    }
}

/// State of one item's pass through the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: String,
    pub item_id: ItemId,
    pub holder_id: String,
    pub phases: Vec<PhaseName>,
    pub current_phase_index: usize,
    pub status: RunStatus,
    pub retry_counts: BTreeMap<PhaseName, u32>,
    pub last_error: Option<PhaseError>,
    pub records: Vec<PhaseRecord>,
    pub artifacts: Artifacts,
    /// Set once the failure comment has been attempted.
    pub failure_notified: bool,
}

impl PipelineRun {
    pub fn new(item_id: ItemId, holder_id: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            item_id,
            holder_id: holder_id.into(),
            phases: PhaseName::ALL.to_vec(),
            current_phase_index: 0,
            status: RunStatus::Running,
            retry_counts: BTreeMap::new(),
            last_error: None,
            records: Vec::new(),
            artifacts: Artifacts::default(),
            failure_notified: false,
        }
    }

    /// The phase to execute next, or `None` once finished.
    pub fn current_phase(&self) -> Option<PhaseName> {
        if self.status.is_terminal() {
            return None;
        }
        self.phases.get(self.current_phase_index).copied()
    }

    pub fn retry_count(&self, phase: PhaseName) -> u32 {
        self.retry_counts.get(&phase).copied().unwrap_or(0)
    }

    /// Store the artifact of the current phase and move to the next one.
    pub fn advance(&mut self, phase: PhaseName, artifact: Artifact) {
        self.records.push(PhaseRecord {
            phase,
            attempt: self.retry_count(phase),
            error: None,
        });
        self.artifacts.store(artifact);
        self.current_phase_index += 1;
    }

    /// Record a failed attempt of `phase` without counting it as a retry.
    pub fn record_error(&mut self, phase: PhaseName, error: PhaseError) {
        self.records.push(PhaseRecord {
            phase,
            attempt: self.retry_count(phase),
            error: Some(error.clone()),
        });
        self.last_error = Some(error);
    }

    /// Count a failed attempt of `phase` and return the new retry count.
    pub fn record_failure(&mut self, phase: PhaseName, error: PhaseError) -> u32 {
        self.record_error(phase, error);
        let count = self.retry_counts.entry(phase).or_insert(0);
        *count += 1;
        *count
    }

    /// Move back to an earlier phase to re-run from there.
    pub fn resume_at(&mut self, phase: PhaseName) {
        if let Some(idx) = self.phases.iter().position(|p| *p == phase) {
            if idx <= self.current_phase_index {
                self.current_phase_index = idx;
            }
        }
    }

    /// Enter a terminal status. Returns false if the run had already finished.
    pub fn finish(&mut self, status: RunStatus, error: Option<PhaseError>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        if error.is_some() {
            self.last_error = error;
        }
        true
    }

    /// Total failed attempts across all phases.
    pub fn total_retries(&self) -> u32 {
        self.retry_counts.values().sum()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            item_id: self.item_id.clone(),
            status: self.status,
            retry_counts: self.retry_counts.clone(),
            last_error: self.last_error.clone(),
            change: self.artifacts.change.clone(),
            completed_phases: self
                .records
                .iter()
                .filter(|r| r.error.is_none())
                .map(|r| r.phase)
                .collect(),
        }
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub item_id: ItemId,
    pub status: RunStatus,
    pub retry_counts: BTreeMap<PhaseName, u32>,
    pub last_error: Option<PhaseError>,
    /// The published change, if the run got that far.
    pub change: Option<ChangeRef>,
    /// Phases that advanced, in the order they did.
    pub completed_phases: Vec<PhaseName>,
}

impl RunSummary {
    pub fn retry_count(&self, phase: PhaseName) -> u32 {
        self.retry_counts.get(&phase).copied().unwrap_or(0)
    }

    pub fn total_retries(&self) -> u32 {
        self.retry_counts.values().sum()
    }
}
