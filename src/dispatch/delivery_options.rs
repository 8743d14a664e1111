use crate::broker::configuration::deserialize_optional_millis;
use crate::broker::transport::{DeliveryMode, MessageProperties, DEFAULT_PRIORITY};
use crate::error::ConfigurationError;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use std::time::Duration;

const MAX_PRIORITY: u8 = 9;

/// Quality-of-service flags applied to every message sent by a
/// [`DispatchTemplate`](super::DispatchTemplate).
///
/// All flags are always set explicitly on outgoing messages, so the behaviour does not depend
/// on the defaults of a particular broker.
///
/// The default is **non-persistent** delivery: messages may be lost if the broker restarts.
/// That is fine for tests and ephemeral traffic, but use [`DeliveryOptions::persistent`] for
/// anything you cannot afford to lose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DeliveryOptions {
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    /// 0 (lowest) to 9 (highest). Defaults to 4.
    #[serde(
        default = "default_priority",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub priority: u8,
    /// How long the message stays deliverable. `None` means it never expires.
    #[serde(
        rename = "time_to_live_ms",
        default,
        deserialize_with = "deserialize_optional_millis"
    )]
    pub time_to_live: Option<Duration>,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::NonPersistent,
            priority: DEFAULT_PRIORITY,
            time_to_live: None,
        }
    }
}

impl DeliveryOptions {
    /// Ask the broker to write messages to durable storage.
    #[must_use]
    pub fn persistent(mut self) -> Self {
        self.delivery_mode = DeliveryMode::Persistent;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_time_to_live(mut self, time_to_live: Duration) -> Self {
        self.time_to_live = Some(time_to_live);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.priority > MAX_PRIORITY {
            return Err(ConfigurationError::new(format!(
                "Message priority must be between 0 and {MAX_PRIORITY}, got {}",
                self.priority
            )));
        }
        if self.time_to_live == Some(Duration::ZERO) {
            return Err(ConfigurationError::new(
                "A zero time-to-live would expire messages before delivery, leave it unset instead",
            ));
        }
        Ok(())
    }

    pub(crate) fn apply(&self, properties: &mut MessageProperties) {
        properties.delivery_mode = self.delivery_mode;
        properties.priority = self.priority;
        properties.time_to_live = self.time_to_live;
    }
}
