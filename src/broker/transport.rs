//! The seam between the harness and a concrete broker client.
//!
//! [`Transport`] opens physical connections, [`BrokerConnection`] hands out sessions and
//! [`BrokerSession`] moves messages. The harness ships two implementations: AMQP over the
//! network ([`AmqpTransport`]) and an in-process broker ([`InProcessTransport`]).
//!
//! [`AmqpTransport`]: crate::broker::amqp::AmqpTransport
//! [`InProcessTransport`]: crate::broker::embedded::InProcessTransport
use crate::broker::configuration::SerializedTypePolicy;
use crate::broker::embedded::EmbeddedAcker;
use crate::error::TransportError;
use futures_util::stream::BoxStream;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Opens physical connections to a broker.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a brand new physical connection.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

/// A live physical connection to a broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Start the connection, i.e. confirm the broker is accepting traffic on it.
    async fn start(&self) -> Result<(), TransportError>;

    /// Open a new logical session on top of this connection.
    async fn create_session(&self) -> Result<Box<dyn BrokerSession>, TransportError>;

    /// `false` once the connection has been closed, by us or by the broker.
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A logical channel within a connection, used to send and receive messages.
#[async_trait::async_trait]
pub trait BrokerSession: Send + Sync + 'static {
    /// Send a message to `destination`.
    async fn send(
        &self,
        destination: &Destination,
        message: OutgoingMessage,
    ) -> Result<(), TransportError>;

    /// Start consuming messages from `destination`.
    ///
    /// The stream yields an error and ends if the session is lost.
    async fn consume(
        &self,
        destination: &Destination,
        acknowledgement: AcknowledgementMode,
    ) -> Result<BoxStream<'static, Result<Delivery, TransportError>>, TransportError>;

    /// `false` once the session (or its connection) has been closed.
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Where a message is sent to or consumed from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Destination {
    /// Point-to-point: each message is delivered to a single consumer.
    Queue(String),
    /// Publish/subscribe: each message is delivered to every live subscriber.
    Topic(String),
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Destination::Queue(name.into())
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Destination::Topic(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(name) | Destination::Topic(name) => name,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue(name) => write!(f, "queue://{name}"),
            Destination::Topic(name) => write!(f, "topic://{name}"),
        }
    }
}

/// How consumed messages are acknowledged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcknowledgementMode {
    /// Messages are acknowledged as soon as they are handed out.
    Auto,
    /// Messages stay with the consumer until they are acknowledged or rolled back.
    Client,
}

/// Delivery mode of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The message may be lost if the broker restarts.
    #[default]
    NonPersistent,
    /// The broker is asked to write the message to durable storage.
    Persistent,
}

/// Priority of messages that do not specify one.
pub const DEFAULT_PRIORITY: u8 = 4;

/// Metadata travelling with a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    /// Seconds since the UNIX epoch.
    pub timestamp: Option<u64>,
    pub content_type: Option<String>,
    /// The type name of the serialized payload, if the sender declared one.
    pub payload_type: Option<String>,
    pub delivery_mode: DeliveryMode,
    /// 0 (lowest) to 9 (highest).
    pub priority: u8,
    /// `None` means the message never expires.
    pub time_to_live: Option<Duration>,
    pub headers: BTreeMap<String, String>,
}

impl Default for MessageProperties {
    fn default() -> Self {
        Self {
            message_id: None,
            timestamp: None,
            content_type: None,
            payload_type: None,
            delivery_mode: DeliveryMode::NonPersistent,
            priority: DEFAULT_PRIORITY,
            time_to_live: None,
            headers: BTreeMap::new(),
        }
    }
}

/// A message on its way to the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

/// A message received from the broker.
#[derive(Clone, Debug)]
pub struct Message {
    pub destination: Destination,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
    /// Whether this message was delivered before and rolled back.
    pub redelivered: bool,
    pub(crate) type_policy: Arc<SerializedTypePolicy>,
}

/// Error returned when reading a typed payload out of a [`Message`].
#[derive(thiserror::Error, Debug)]
pub enum PayloadError {
    #[error("The payload declares the type `{0}`, which is not trusted for deserialization")]
    UntrustedType(String),
    #[error("Failed to deserialize the payload")]
    Deserialization(#[source] serde_json::Error),
}

impl Message {
    pub fn new(destination: Destination, payload: Vec<u8>, properties: MessageProperties) -> Self {
        Self {
            destination,
            payload,
            properties,
            redelivered: false,
            type_policy: Arc::new(SerializedTypePolicy::default()),
        }
    }

    /// Replace the policy deciding which declared payload types can be deserialized.
    #[must_use]
    pub fn with_type_policy(mut self, policy: Arc<SerializedTypePolicy>) -> Self {
        self.type_policy = policy;
        self
    }

    /// The payload as UTF-8 text, replacing invalid sequences.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Deserialize a JSON payload.
    ///
    /// Fails with [`PayloadError::UntrustedType`] if the message declares a payload type that
    /// the connection factory does not trust.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        if let Some(payload_type) = &self.properties.payload_type {
            if !self.type_policy.is_trusted(payload_type) {
                return Err(PayloadError::UntrustedType(payload_type.clone()));
            }
        }
        serde_json::from_slice(&self.payload).map_err(PayloadError::Deserialization)
    }
}

/// A received message together with the handle used to settle it with the broker.
pub struct Delivery {
    pub message: Message,
    // Not exposed: listeners never settle messages themselves, the container does it
    // according to the outcome of processing.
    pub(crate) acker: Acker,
}

impl Delivery {
    /// A delivery that needs no acknowledgement.
    pub fn acknowledged(message: Message) -> Self {
        Self {
            message,
            acker: Acker(AckerKind::Settled),
        }
    }

    pub(crate) fn new(message: Message, acker: Acker) -> Self {
        Self { message, acker }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Settles a delivery with the broker that handed it out.
pub(crate) struct Acker(pub(crate) AckerKind);

pub(crate) enum AckerKind {
    Settled,
    Amqp(lapin::acker::Acker),
    Embedded(EmbeddedAcker),
}

impl Acker {
    /// Confirm the message has been processed.
    pub(crate) async fn ack(self) -> Result<(), TransportError> {
        match self.0 {
            AckerKind::Settled => Ok(()),
            AckerKind::Amqp(acker) => Ok(acker
                .ack(lapin::options::BasicAckOptions::default())
                .await?),
            AckerKind::Embedded(acker) => acker.ack(),
        }
    }

    /// Hand the message back to the broker for redelivery.
    pub(crate) async fn requeue(self) -> Result<(), TransportError> {
        match self.0 {
            AckerKind::Settled => Ok(()),
            AckerKind::Amqp(acker) => Ok(acker
                .nack(lapin::options::BasicNackOptions {
                    multiple: false,
                    requeue: true,
                })
                .await?),
            AckerKind::Embedded(acker) => acker.requeue(),
        }
    }
}
