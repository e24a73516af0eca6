// ABOUTME: Coordinator module for shared state guarding outbound work.
// ABOUTME: Contains the claim registry over work items and the outbound rate limiter.

mod claims;
mod rate_limiter;

pub use claims::{Claim, ClaimOutcome, ClaimRegistry, ReleaseOutcome, RenewOutcome};
pub use rate_limiter::{
    Admission, KindLimits, Operation, OperationKind, RateLimitTable, RateLimiter, RateStats,
    RejectReason, WindowKind, WindowLimit, default_rate_limits,
};
