//! [`Transport`] for network brokers speaking AMQP 0.9.1, built on top of [`lapin`].
use crate::broker::address::NetworkAddress;
use crate::broker::configuration::ConnectionFactoryConfig;
use crate::broker::transport::{
    AcknowledgementMode, Acker, AckerKind, BrokerConnection, BrokerSession, Delivery, DeliveryMode,
    Destination, Message, MessageProperties, OutgoingMessage, Transport, DEFAULT_PRIORITY,
};
use crate::error::{ConfigurationError, TransportError};
use amq_protocol_types::{AMQPValue, FieldTable, LongString, ShortString};
use futures_util::stream::{BoxStream, StreamExt};
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, ConnectionProperties, ExchangeKind,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

// Reply code for a clean shutdown, see https://www.rabbitmq.com/amqp-0-9-1-reference.html
const REPLY_SUCCESS: u16 = 200;

#[derive(Clone)]
/// All the information required to connect to a network broker.
pub struct AmqpTransport {
    uri: AMQPUri,
    /// The timeout observed when trying to connect.
    connection_timeout: Duration,
    /// Custom TLS configuration.
    /// If `None`, `amqps://` addresses use the system trust root and `amqp://` ones are
    /// not encrypted.
    tls: Option<Arc<Tls>>,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl AmqpTransport {
    /// Create a new transport from the factory configuration.
    pub fn new(
        address: &NetworkAddress,
        config: &ConnectionFactoryConfig,
    ) -> Result<Self, ConfigurationError> {
        let mut uri = address.uri().clone();
        if let Some(credentials) = &config.credentials {
            uri.authority.userinfo = AMQPUserInfo {
                username: credentials.username.clone(),
                password: credentials.password.expose_secret().clone(),
            };
        }

        let tls = config
            .tls
            .as_ref()
            .map::<Result<Tls, ConfigurationError>, _>(|tls_settings| {
                let domain_name = tls_settings
                    .domain
                    .clone()
                    .unwrap_or_else(|| uri.authority.host.clone());

                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }
                let connector = connector_builder.build().map_err(|e| {
                    ConfigurationError::new(format!("TLS configuration failed: {e}"))
                })?;
                Ok(Tls {
                    connector,
                    domain_name,
                })
            })
            .transpose()?;

        Ok(Self {
            uri,
            connection_timeout: config.connection_timeout(),
            tls: tls.map(Arc::new),
        })
    }

    /// Replaces the TLS connector, along with the expected domain name for the certificate.
    pub fn set_tls_connector_with_domain(
        &mut self,
        connector: NativeTlsConnector,
        domain_name: String,
    ) {
        self.tls = Some(Arc::new(Tls {
            connector,
            domain_name,
        }));
    }

    /// Establish a new connection, honouring the connection timeout.
    #[tracing::instrument(name = "amqp_connect", skip(self), fields(host = %self.uri.authority.host))]
    async fn new_connection(&self) -> Result<lapin::Connection, TransportError> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => lapin::Connection::connect_uri(self.uri.clone(), properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        })
        .await
        .map_err(|_| {
            TransportError::msg(format!(
                "Timed out after {:?} while connecting to the broker",
                self.connection_timeout
            ))
        })??;
        // Register a callback to log connection errors.
        connection.on_error(|e| {
            warn!("Broken broker connection: {:?}", e);
        });
        Ok(connection)
    }

    /// Establish a new TLS connection with a custom connector.
    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // First establish a plain TCP connection using the AMQP protocol
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    // Then perform a TLS handshake with the expected server domain
                    .and_then(|tcp| tcp.into_native_tls(&tls.connector, &tls.domain_name))
            }),
            properties,
        )
        .await
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        Ok(Arc::new(AmqpConnection(self.new_connection().await?)))
    }
}

struct AmqpConnection(lapin::Connection);

#[async_trait::async_trait]
impl BrokerConnection for AmqpConnection {
    // AMQP connections are usable as soon as the handshake completes.
    async fn start(&self) -> Result<(), TransportError> {
        if self.0.status().connected() {
            Ok(())
        } else {
            Err(TransportError::msg(format!(
                "The connection is not in an healthy state {:?}",
                self.0.status().state()
            )))
        }
    }

    async fn create_session(&self) -> Result<Box<dyn BrokerSession>, TransportError> {
        Ok(Box::new(AmqpSession(self.0.create_channel().await?)))
    }

    fn is_open(&self) -> bool {
        self.0.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.0.status().connected() {
            self.0.close(REPLY_SUCCESS, "OK").await?;
        }
        Ok(())
    }
}

/// An AMQP channel plays the role of a session.
struct AmqpSession(lapin::Channel);

impl AmqpSession {
    /// Topics map onto non-durable fanout exchanges named after the topic.
    async fn declare_topic(&self, topic: &str) -> Result<(), TransportError> {
        self.0
            .exchange_declare(
                topic,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Queues are created on first use, whether by a sender or by a consumer.
    async fn declare_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.0
            .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
            .await?;
        Ok(())
    }

    /// The name of the queue to consume from, declaring whatever is missing.
    async fn declare_source(&self, destination: &Destination) -> Result<String, TransportError> {
        match destination {
            Destination::Queue(name) => {
                self.declare_queue(name).await?;
                Ok(name.clone())
            }
            Destination::Topic(name) => {
                self.declare_topic(name).await?;
                // A private, server-named queue for this subscriber.
                let queue = self
                    .0
                    .queue_declare(
                        "",
                        QueueDeclareOptions {
                            exclusive: true,
                            auto_delete: true,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await?;
                self.0
                    .queue_bind(
                        queue.name().as_str(),
                        name,
                        "",
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await?;
                Ok(queue.name().as_str().to_owned())
            }
        }
    }
}

#[async_trait::async_trait]
impl BrokerSession for AmqpSession {
    #[tracing::instrument(level = "debug", skip(self, destination, message), fields(%destination))]
    async fn send(
        &self,
        destination: &Destination,
        message: OutgoingMessage,
    ) -> Result<(), TransportError> {
        let (exchange, routing_key) = match destination {
            Destination::Queue(name) => {
                // The default exchange drops messages routed to a queue that does not exist.
                self.declare_queue(name).await?;
                ("", name.as_str())
            }
            Destination::Topic(name) => {
                self.declare_topic(name).await?;
                (name.as_str(), "")
            }
        };
        let confirmation = self
            .0
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                to_basic_properties(&message.properties),
            )
            .await?
            .await?;
        match confirmation {
            Confirmation::Nack(_) => Err(TransportError::msg(format!(
                "The broker refused the message sent to {destination}"
            ))),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn consume(
        &self,
        destination: &Destination,
        acknowledgement: AcknowledgementMode,
    ) -> Result<BoxStream<'static, Result<Delivery, TransportError>>, TransportError> {
        let queue = self.declare_source(destination).await?;
        // One message in flight per consumer: concurrency is driven by the number of consumers.
        self.0
            .basic_qos(1, BasicQosOptions { global: false })
            .await?;
        let consumer = self
            .0
            .basic_consume(
                &queue,
                &Uuid::new_v4().to_string(),
                BasicConsumeOptions {
                    no_ack: acknowledgement == AcknowledgementMode::Auto,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let destination = destination.clone();
        Ok(consumer
            .map(move |delivery| {
                delivery
                    .map(|d| into_delivery(&destination, d, acknowledgement))
                    .map_err(TransportError::from)
            })
            .boxed())
    }

    fn is_open(&self) -> bool {
        self.0.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.0.status().connected() {
            self.0.close(REPLY_SUCCESS, "OK").await?;
        }
        Ok(())
    }
}

fn into_delivery(
    destination: &Destination,
    delivery: lapin::message::Delivery,
    acknowledgement: AcknowledgementMode,
) -> Delivery {
    let mut message = Message::new(
        destination.clone(),
        delivery.data,
        from_basic_properties(&delivery.properties),
    );
    message.redelivered = delivery.redelivered;
    let acker = match acknowledgement {
        AcknowledgementMode::Auto => AckerKind::Settled,
        AcknowledgementMode::Client => AckerKind::Amqp(delivery.acker),
    };
    Delivery::new(message, Acker(acker))
}

/// Every quality-of-service flag is set explicitly, nothing is left to broker defaults.
pub(crate) fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    // Delivery mode: Non-persistent (1) or persistent (2).
    let delivery_mode = match properties.delivery_mode {
        DeliveryMode::NonPersistent => 1,
        DeliveryMode::Persistent => 2,
    };
    let mut basic = BasicProperties::default()
        .with_delivery_mode(delivery_mode)
        .with_priority(properties.priority);
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(payload_type) = &properties.payload_type {
        basic = basic.with_type(ShortString::from(payload_type.clone()));
    }
    if let Some(ttl) = properties.time_to_live {
        // AMQP expresses the expiration as a string of milliseconds.
        basic = basic.with_expiration(ShortString::from(ttl.as_millis().to_string()));
    }
    if !properties.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (name, value) in &properties.headers {
            headers.insert(
                ShortString::from(name.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
        basic = basic.with_headers(headers);
    }
    basic
}

pub(crate) fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let headers = basic
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(name, value)| {
                    header_str(value).map(|value| (name.as_str().to_owned(), value))
                })
                .collect()
        })
        .unwrap_or_else(BTreeMap::new);
    MessageProperties {
        message_id: basic.message_id().as_ref().map(|s| s.as_str().to_owned()),
        timestamp: *basic.timestamp(),
        content_type: basic.content_type().as_ref().map(|s| s.as_str().to_owned()),
        payload_type: basic.kind().as_ref().map(|s| s.as_str().to_owned()),
        delivery_mode: match basic.delivery_mode() {
            Some(2) => DeliveryMode::Persistent,
            _ => DeliveryMode::NonPersistent,
        },
        priority: basic.priority().unwrap_or(DEFAULT_PRIORITY),
        time_to_live: basic
            .expiration()
            .as_ref()
            .and_then(|ms| ms.as_str().parse::<u64>().ok())
            .map(Duration::from_millis),
        headers,
    }
}

/// Header values we surface are the string-like ones.
fn header_str(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_owned()),
        _ => None,
    }
}
