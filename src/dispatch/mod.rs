//! Facilities to send messages to the broker. Check out [`DispatchTemplate`] as a starting point.
mod delivery_options;
mod template;

pub use delivery_options::DeliveryOptions;
pub use template::{DispatchError, DispatchSettings, DispatchTemplate, DispatchTemplateBuilder};

pub use crate::broker::DeliveryMode;
