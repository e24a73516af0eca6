// ABOUTME: Defines the IssueSource trait - the narrow interface the engine uses
// ABOUTME: to list, inspect, comment on, publish against and close work items.

use async_trait::async_trait;

use super::{BranchSpec, CandidateFilter, ChangeRef, CloseReason, ExternalState, ItemId, WorkItem};

/// Client for the external issue tracker.
///
/// Mutating calls (`comment`, `open_change`, `close`) are always gated by the
/// rate limiter before they are made. Errors are opaque to the engine and are
/// treated as transient.
#[async_trait]
pub trait IssueSource: Send + Sync {
    /// List items currently matching the trigger condition.
    async fn list_candidates(&self, filter: &CandidateFilter) -> anyhow::Result<Vec<WorkItem>>;

    /// Post a comment on an item.
    async fn comment(&self, item: &ItemId, text: &str) -> anyhow::Result<()>;

    /// Open a change request for an item.
    async fn open_change(&self, item: &ItemId, branch: &BranchSpec) -> anyhow::Result<ChangeRef>;

    /// Close an item.
    async fn close(&self, item: &ItemId, reason: &CloseReason) -> anyhow::Result<()>;

    /// Fetch the current ground-truth state of an item.
    async fn get_status(&self, item: &ItemId) -> anyhow::Result<ExternalState>;
}
