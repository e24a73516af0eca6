// ABOUTME: Root module for fixloop - claim-based orchestration for automated issue resolution.
// ABOUTME: Re-exports the engine components from submodules.

pub mod agent;
pub mod clock;
pub mod codegen;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hook;
pub mod pipeline;
pub mod poller;
pub mod prelude;
pub mod source;

pub use error::Error;

#[cfg(test)]
mod testkit;
