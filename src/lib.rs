//! Modelmux - a multi-tenant gateway daemon for unreliable AI model providers.
//!
//! Clients hold long-lived connections and issue tool-style requests that the
//! gateway forwards to upstream model providers. The crate's job is to keep
//! thousands of concurrently in-flight requests safe, bounded, deduplicated,
//! and recoverable across restarts:
//!
//! - [`admission`] gates new transport connections before any session exists
//! - [`session`] owns session identity, persistence, and startup recovery
//! - [`limiter`] bounds simultaneous work per named scope with leak detection
//! - [`coalesce`] deduplicates concurrent identical requests
//! - [`resilience`] wraps provider calls in retry + circuit breaking
//! - [`gateway`] wires the pipeline together

pub mod admission;
pub mod background;
pub mod build_info;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod limiter;
pub mod provider;
pub mod resilience;
pub mod server;
pub mod session;
