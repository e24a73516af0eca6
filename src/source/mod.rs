// ABOUTME: Issue source module - the external tracker the engine polls and writes to.
// ABOUTME: Defines item types, the trigger filter, and the IssueSource trait.

mod client;
mod types;

pub use client::*;
pub use types::*;
