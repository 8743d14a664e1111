//! `carrot-harness` makes it easy to stand up a message-broker setup for applications and
//! integration tests: an optional in-process broker, a caching [`ConnectionFactory`], a
//! readiness check, a [`DispatchTemplate`] to send messages and [`ListenerContainer`]s to
//! consume them.
//!
//! [`Harness`](crate::harness::Harness) is the best starting point: it wires all of the above
//! together from a single [`HarnessSettings`](crate::harness::HarnessSettings).
//!
//! [`ConnectionFactory`]: crate::broker::ConnectionFactory
//! [`DispatchTemplate`]: crate::dispatch::DispatchTemplate
//! [`ListenerContainer`]: crate::listener::ListenerContainer

pub mod broker;
pub mod dispatch;
mod error;
pub mod harness;
pub mod listener;
pub mod pool;
pub mod readiness;

pub use error::{ConfigurationError, TransportError};
