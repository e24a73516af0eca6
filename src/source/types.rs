// ABOUTME: Core data types exchanged with the external issue tracker - item ids,
// ABOUTME: mirrored item state, trigger filters, change requests and close reasons.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// External identity of a work item: the tracker it lives in plus its number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId {
    /// Tracker-specific source, e.g. `"acme/widgets"`.
    pub source: String,
    /// Numeric id within the source.
    pub number: u64,
}

impl ItemId {
    pub fn new(source: impl Into<String>, number: u64) -> Self {
        Self {
            source: source.into(),
            number,
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source, self.number)
    }
}

/// A work item as last reported by the issue source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: ItemId,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
    pub open: bool,
}

impl WorkItem {
    /// Create an open, unlabeled, unassigned item.
    pub fn new(id: ItemId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            body: String::new(),
            labels: Vec::new(),
            assignees: Vec::new(),
            open: true,
        }
    }

    /// Set the body text.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    /// Add an assignee.
    pub fn assignee(mut self, login: impl Into<String>) -> Self {
        self.assignees.push(login.into());
        self
    }

    /// The trigger-relevant part of this item's state.
    pub fn state(&self) -> ExternalState {
        ExternalState {
            open: self.open,
            labels: self.labels.clone(),
            assignees: self.assignees.clone(),
        }
    }
}

/// Ground-truth state of an item, as returned by `IssueSource::get_status`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExternalState {
    pub open: bool,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
}

impl ExternalState {
    /// State of an item that has been closed.
    pub fn closed() -> Self {
        Self::default()
    }
}

/// The trigger condition that makes an item a candidate for automated work.
///
/// Label entries are glob patterns (`"autofix*"`). Invalid patterns never
/// match; `Config::validate` rejects them up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateFilter {
    /// An item must carry at least one label matching one of these.
    pub trigger_labels: Vec<String>,
    /// An item carrying a label matching any of these is ignored.
    pub exclude_labels: Vec<String>,
    /// When set, items assigned to anybody else are ignored.
    pub assignee: Option<String>,
    /// Upper bound on candidates returned per poll.
    pub limit: Option<usize>,
}

impl Default for CandidateFilter {
    fn default() -> Self {
        Self {
            trigger_labels: vec!["autofix".to_string()],
            exclude_labels: vec!["wontfix".to_string(), "blocked".to_string()],
            assignee: None,
            limit: None,
        }
    }
}

impl CandidateFilter {
    /// Whether an item in this state still satisfies the trigger condition.
    pub fn matches(&self, state: &ExternalState) -> bool {
        if !state.open {
            return false;
        }

        let triggered = state
            .labels
            .iter()
            .any(|label| matches_any(&self.trigger_labels, label));
        if !triggered {
            return false;
        }

        if state
            .labels
            .iter()
            .any(|label| matches_any(&self.exclude_labels, label))
        {
            return false;
        }

        match &self.assignee {
            Some(login) => state.assignees.iter().all(|a| a == login),
            None => true,
        }
    }
}

fn matches_any(patterns: &[String], label: &str) -> bool {
    patterns.iter().any(|p| {
        glob::Pattern::new(p)
            .map(|pattern| pattern.matches(label))
            .unwrap_or(false)
    })
}

/// Everything needed to open a change request for an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSpec {
    pub branch: String,
    pub title: String,
    pub body: String,
    pub files: Vec<PathBuf>,
}

/// Reference to a published change request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRef {
    pub id: u64,
    pub url: String,
}

/// Why an item is being closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Resolved by a published change.
    Resolved(ChangeRef),
    /// Closed without a change.
    NotPlanned(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Resolved(change) => write!(f, "resolved by {}", change.url),
            CloseReason::NotPlanned(why) => write!(f, "not planned: {}", why),
        }
    }
}
