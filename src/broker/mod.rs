//! Everything needed to reach a broker: addresses, configuration, transports and the
//! [`ConnectionFactory`].

pub mod address;
pub mod amqp;
pub mod configuration;
pub mod embedded;
mod factory;
pub mod transport;

pub use address::BrokerAddress;
pub use configuration::{ConnectionFactoryConfig, SerializedTypePolicy};
pub use embedded::{BrokerRegistry, EmbeddedBroker, EmbeddedBrokerSettings};
pub use factory::{ConnectionFactory, ConnectionFactoryBuilder};
pub use transport::{
    AcknowledgementMode, BrokerConnection, BrokerSession, Delivery, DeliveryMode, Destination,
    Message, MessageProperties, OutgoingMessage, PayloadError, Transport, DEFAULT_PRIORITY,
};
