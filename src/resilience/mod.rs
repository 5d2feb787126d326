//! Retry and circuit breaking for calls to unreliable upstreams.
//!
//! The two pieces compose but do not depend on each other:
//!
//! - [`retry`] re-runs a fallible operation with capped exponential backoff
//!   and full jitter, consulting a caller-supplied retryability classifier.
//! - [`CircuitBreaker`] fails fast once an upstream has produced enough
//!   consecutive failures, and probes it again after a cool-down.
//!
//! Each provider owns exactly one breaker; breakers are never shared, so a
//! failing provider cannot degrade a healthy one. The composed form lives in
//! [`crate::provider::ResilientProvider`]: breaker outside, retries inside.

mod breaker;
mod retry;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker, CircuitOpen};
pub use retry::{RetryPolicy, retry};
