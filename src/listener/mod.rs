//! Asynchronous message consumption.
//!
//! A [`ListenerContainer`] runs a pool of consumers against a single destination, invoking a
//! [`MessageListener`] for each received message. Containers are built by a
//! [`ListenerContainerFactory`], which holds the defaults shared by all of them.
mod configuration;
mod container;
mod message_listener;

pub use configuration::{ConcurrencyRange, ListenerConfig};
pub use container::{ListenerContainer, ListenerContainerFactory, ListenerEndpoint};
pub use message_listener::{ClosureListener, MessageListener};
