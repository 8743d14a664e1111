use crate::broker::configuration::deserialize_millis;
use crate::broker::transport::{Destination, MessageProperties, OutgoingMessage};
use crate::broker::ConnectionFactory;
use crate::dispatch::DeliveryOptions;
use crate::error::{ConfigurationError, TransportError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

const JSON_CONTENT_TYPE: &str = "application/json";

/// A high-level interface to send messages.
///
/// Every message goes through a session borrowed from the [`ConnectionFactory`] cache, which
/// is handed back as soon as the send completes. The [`DeliveryOptions`] are always set
/// explicitly on the message, a message id and a timestamp are added if missing.
///
/// Sends are not retried: a failure is returned to the caller as a [`DispatchError`].
///
/// # How do I build a `DispatchTemplate`?
///
/// The starting point is [`DispatchTemplate::builder`].
///
/// ```rust
/// use carrot_harness::broker::{ConnectionFactory, Destination};
/// use carrot_harness::dispatch::{DeliveryOptions, DispatchTemplate};
///
/// fn get_template(factory: ConnectionFactory) -> DispatchTemplate {
///     DispatchTemplate::builder(factory)
///         .default_destination(Destination::queue("orders"))
///         .delivery_options(DeliveryOptions::default().persistent())
///         .send_timeout(std::time::Duration::from_secs(3))
///         .build()
/// }
/// ```
#[derive(Clone)]
pub struct DispatchTemplate {
    factory: ConnectionFactory,
    default_destination: Option<Destination>,
    delivery_options: DeliveryOptions,
    send_timeout: Duration,
    pub_sub_domain: bool,
}

/// Error returned when trying to send a message using [`DispatchTemplate`].
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("Failed to hand the message over to the broker")]
    Transport(#[source] TransportError),
    #[error("The timeout threshold was reached while trying to send the message")]
    Timeout,
    #[error("Invalid delivery options")]
    InvalidOptions(#[source] ConfigurationError),
    #[error("Failed to serialize the message payload")]
    Serialization(#[source] serde_json::Error),
    #[error("No destination was given and the template has no default destination")]
    NoDestination,
    #[error("The connection factory has been closed")]
    Closed,
}

impl DispatchTemplate {
    /// Start building a [`DispatchTemplate`] on top of `factory`.
    pub fn builder(factory: ConnectionFactory) -> DispatchTemplateBuilder {
        DispatchTemplateBuilder::new(factory)
    }

    pub fn connection_factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    pub fn default_destination(&self) -> Option<&Destination> {
        self.default_destination.as_ref()
    }

    /// The options applied by [`DispatchTemplate::send_default`].
    pub fn delivery_options(&self) -> &DeliveryOptions {
        &self.delivery_options
    }

    /// Resolve a bare destination name to a topic or a queue, depending on whether the
    /// template was configured for publish/subscribe.
    pub fn destination(&self, name: impl Into<String>) -> Destination {
        if self.pub_sub_domain {
            Destination::topic(name)
        } else {
            Destination::queue(name)
        }
    }

    /// Send `payload` to `destination` with the given delivery options.
    pub async fn send(
        &self,
        destination: &Destination,
        payload: impl Into<Vec<u8>>,
        options: &DeliveryOptions,
    ) -> Result<(), DispatchError> {
        let message = OutgoingMessage {
            payload: payload.into(),
            properties: MessageProperties::default(),
        };
        self.send_message(destination, message, options).await
    }

    /// Send `payload` to the default destination, with the template's delivery options.
    pub async fn send_default(&self, payload: impl Into<Vec<u8>>) -> Result<(), DispatchError> {
        let destination = self
            .default_destination
            .as_ref()
            .ok_or(DispatchError::NoDestination)?;
        self.send(destination, payload, &self.delivery_options).await
    }

    /// Serialize `value` as JSON and send it to `destination`.
    ///
    /// The message declares its payload type, so receivers can only read it back if they trust
    /// `T` (see [`SerializedTypePolicy`](crate::broker::SerializedTypePolicy)).
    pub async fn send_json<T>(
        &self,
        destination: &Destination,
        value: &T,
        options: &DeliveryOptions,
    ) -> Result<(), DispatchError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(value).map_err(DispatchError::Serialization)?;
        let message = OutgoingMessage {
            payload,
            properties: MessageProperties {
                content_type: Some(JSON_CONTENT_TYPE.into()),
                payload_type: Some(std::any::type_name::<T>().into()),
                ..MessageProperties::default()
            },
        };
        self.send_message(destination, message, options).await
    }

    /// Send a fully-formed message.
    ///
    /// `options` override the delivery fields of `message.properties`; everything else is kept
    /// as-is.
    #[tracing::instrument(
        name = "dispatch_send",
        skip(self, destination, message, options),
        fields(%destination, priority = options.priority)
    )]
    pub async fn send_message(
        &self,
        destination: &Destination,
        mut message: OutgoingMessage,
        options: &DeliveryOptions,
    ) -> Result<(), DispatchError> {
        options.validate().map_err(DispatchError::InvalidOptions)?;
        if self.factory.is_closed() {
            return Err(DispatchError::Closed);
        }
        options.apply(&mut message.properties);
        inject_properties(&mut message.properties);

        let send = async move {
            let session = self.factory.session().await?;
            session.send(destination, message).await
        };
        match tokio::time::timeout(self.send_timeout, send).await {
            Ok(outcome) => outcome.map_err(DispatchError::Transport),
            Err(_) => Err(DispatchError::Timeout),
        }
    }
}

/// A builder for [`DispatchTemplate`].
///
/// Use [`DispatchTemplate::builder`] as entrypoint.
pub struct DispatchTemplateBuilder {
    factory: ConnectionFactory,
    default_destination: Option<Destination>,
    delivery_options: DeliveryOptions,
    send_timeout: Duration,
    pub_sub_domain: bool,
}

impl DispatchTemplateBuilder {
    fn new(factory: ConnectionFactory) -> Self {
        Self {
            factory,
            default_destination: None,
            delivery_options: DeliveryOptions::default(),
            send_timeout: default_send_timeout(),
            pub_sub_domain: false,
        }
    }

    #[must_use]
    pub fn default_destination(mut self, destination: Destination) -> Self {
        self.default_destination = Some(destination);
        self
    }

    /// Options used by [`DispatchTemplate::send_default`].
    /// Non-persistent, priority 4 and no expiry if left unspecified.
    #[must_use]
    pub fn delivery_options(mut self, options: DeliveryOptions) -> Self {
        self.delivery_options = options;
        self
    }

    /// Timeout applied when attempting to send a message.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Resolve bare destination names to topics instead of queues.
    #[must_use]
    pub fn pub_sub_domain(mut self, pub_sub_domain: bool) -> Self {
        self.pub_sub_domain = pub_sub_domain;
        self
    }

    /// Apply every field of `settings`.
    #[must_use]
    pub fn settings(self, settings: &DispatchSettings) -> Self {
        let builder = self
            .pub_sub_domain(settings.pub_sub_domain)
            .delivery_options(settings.delivery)
            .send_timeout(settings.send_timeout);
        match &settings.default_destination {
            Some(name) => {
                let destination = if settings.pub_sub_domain {
                    Destination::topic(name.as_str())
                } else {
                    Destination::queue(name.as_str())
                };
                builder.default_destination(destination)
            }
            None => builder,
        }
    }

    /// Finalise the builder and get an instance of [`DispatchTemplate`].
    pub fn build(self) -> DispatchTemplate {
        DispatchTemplate {
            factory: self.factory,
            default_destination: self.default_destination,
            delivery_options: self.delivery_options,
            send_timeout: self.send_timeout,
            pub_sub_domain: self.pub_sub_domain,
        }
    }
}

/// Configuration of the [`DispatchTemplate`] created by a [`Harness`](crate::harness::Harness).
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSettings {
    #[serde(default)]
    pub pub_sub_domain: bool,
    /// Name of the destination used by [`DispatchTemplate::send_default`].
    #[serde(default)]
    pub default_destination: Option<String>,
    #[serde(default)]
    pub delivery: DeliveryOptions,
    #[serde(
        rename = "send_timeout_ms",
        default = "default_send_timeout",
        deserialize_with = "deserialize_millis"
    )]
    pub send_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            pub_sub_domain: false,
            default_destination: None,
            delivery: DeliveryOptions::default(),
            send_timeout: default_send_timeout(),
        }
    }
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(3)
}

fn inject_properties(properties: &mut MessageProperties) {
    if properties.timestamp.is_none() {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(now) => properties.timestamp = Some(now.as_secs()),
            Err(_) => warn!("System time is before 1970"),
        }
    }
    if properties.message_id.is_none() {
        properties.message_id = Some(Uuid::new_v4().to_string());
    }
}

impl From<TransportError> for DispatchError {
    fn from(e: TransportError) -> Self {
        DispatchError::Transport(e)
    }
}
