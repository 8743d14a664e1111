//! Connection and session reuse.
//!
//! This module provides two key guarantees:
//! - All sessions are opened on a single, shared physical connection, which is recreated
//!   on-demand once broken.
//! - Idle sessions are cached (up to a fixed capacity) and reused instead of being opened from
//!   scratch for each operation.

mod connection;
mod session;

pub(crate) use connection::open_connection;
pub use connection::{ConnectionManager, ConnectionPool};
pub use session::{CachedSession, SessionCache, SessionCacheStatus};
