//! Session lifecycle, persistence, and recovery.
//!
//! A session is the logical unit of client work, addressable across
//! reconnects. Records are persisted to a durable store so sessions survive a
//! daemon restart; mutations go through optimistic concurrency (a version
//! counter checked on every conditional write) rather than long-held locks.

mod error;
mod manager;
mod record;
mod store;

pub use error::SessionError;
pub use manager::{ActivityDelta, SessionDiagnostics, SessionManager};
pub use record::{SESSION_ID_PREFIX, SessionRecord, SessionState};
pub use store::{FileSessionStore, SessionStore, StoreError};
