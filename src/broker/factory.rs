use crate::broker::address::BrokerAddress;
use crate::broker::amqp::AmqpTransport;
use crate::broker::configuration::{ConnectionFactoryConfig, SerializedTypePolicy};
use crate::broker::embedded::{BrokerRegistry, InProcessTransport};
use crate::broker::transport::{BrokerConnection, Transport};
use crate::error::{ConfigurationError, TransportError};
use crate::pool::{
    open_connection, CachedSession, ConnectionManager, SessionCache, SessionCacheStatus,
};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
/// Produces connections and sessions to a broker.
///
/// A `ConnectionFactory` decorates a raw [`Transport`] with a caching layer: every session is
/// opened on the same physical connection, and idle sessions are kept around (up to
/// `session_cache_size`) for reuse. Cloning a `ConnectionFactory` is cheap and all clones share
/// the same connection and cache.
///
/// The factory is safe to use concurrently from many tasks.
///
/// ```rust
/// use carrot_harness::broker::{BrokerAddress, ConnectionFactory, ConnectionFactoryConfig};
///
/// # fn example() -> Result<(), carrot_harness::ConfigurationError> {
/// let address = BrokerAddress::parse("vm://test-broker")?;
/// let config = ConnectionFactoryConfig::new(address).with_session_cache_size(10);
/// let factory = ConnectionFactory::create(config)?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionFactory {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionFactoryConfig,
    transport: Arc<dyn Transport>,
    sessions: Arc<SessionCache>,
    type_policy: Arc<SerializedTypePolicy>,
}

impl ConnectionFactory {
    /// Create a connection factory from its configuration.
    ///
    /// In-process addresses are resolved against a fresh, empty [`BrokerRegistry`]: use
    /// [`ConnectionFactory::builder`] to share a registry with the code starting the broker.
    pub fn create(config: ConnectionFactoryConfig) -> Result<Self, ConfigurationError> {
        Self::builder(config).build()
    }

    /// Start building a [`ConnectionFactory`].
    pub fn builder(config: ConnectionFactoryConfig) -> ConnectionFactoryBuilder {
        ConnectionFactoryBuilder {
            config,
            registry: None,
            transport: None,
        }
    }

    pub fn config(&self) -> &ConnectionFactoryConfig {
        &self.inner.config
    }

    pub fn address(&self) -> &BrokerAddress {
        &self.inner.config.address
    }

    /// Open a brand new, uncached, started connection.
    ///
    /// The caller owns the connection and is in charge of closing it.
    #[tracing::instrument(name = "broker_connect", skip(self), fields(address = %self.address()))]
    pub async fn create_connection(&self) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        if self.inner.sessions.is_closed() {
            return Err(TransportError::msg("The connection factory has been closed"));
        }
        open_connection(self.inner.transport.as_ref()).await
    }

    /// Get a session on the shared connection, reusing a cached one if available.
    pub async fn session(&self) -> Result<CachedSession, TransportError> {
        self.inner.sessions.acquire().await
    }

    /// The policy applied to typed payloads received through this factory.
    ///
    /// Listener containers attach it to every message. Messages consumed straight from a
    /// [`session`](ConnectionFactory::session) trust no declared type until it is attached with
    /// [`Message::with_type_policy`](crate::broker::Message::with_type_policy).
    pub fn type_policy(&self) -> Arc<SerializedTypePolicy> {
        Arc::clone(&self.inner.type_policy)
    }

    pub fn status(&self) -> SessionCacheStatus {
        self.inner.sessions.status()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.sessions.is_closed()
    }

    /// Close the cached sessions and the shared connection.
    ///
    /// Any further attempt to get a connection or a session fails.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.inner.sessions.close().await?;
        info!(address = %self.address(), "Connection factory closed");
        Ok(())
    }
}

/// A builder for [`ConnectionFactory`].
///
/// Use [`ConnectionFactory::builder`] as entrypoint.
pub struct ConnectionFactoryBuilder {
    config: ConnectionFactoryConfig,
    registry: Option<BrokerRegistry>,
    transport: Option<Arc<dyn Transport>>,
}

impl ConnectionFactoryBuilder {
    /// Resolve `vm://` addresses against `registry`.
    #[must_use]
    pub fn broker_registry(mut self, registry: BrokerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use a custom raw transport instead of the one implied by the address.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Finalise the builder and get an instance of [`ConnectionFactory`].
    ///
    /// Fails with a [`ConfigurationError`] if the configuration is invalid. No connection is
    /// opened at this stage.
    pub fn build(self) -> Result<ConnectionFactory, ConfigurationError> {
        let Self {
            config,
            registry,
            transport,
        } = self;
        config.validate()?;

        let transport = match transport {
            Some(transport) => transport,
            None => raw_transport(&config, registry.unwrap_or_default())?,
        };
        let connections = ConnectionManager::new(Arc::clone(&transport))
            .into_pool()
            .map_err(|e| ConfigurationError::new(e.to_string()))?;
        let sessions = SessionCache::new(connections, config.session_cache_size);
        let type_policy = Arc::new(config.serialized_type_policy());

        Ok(ConnectionFactory {
            inner: Arc::new(Inner {
                config,
                transport,
                sessions,
                type_policy,
            }),
        })
    }
}

fn raw_transport(
    config: &ConnectionFactoryConfig,
    registry: BrokerRegistry,
) -> Result<Arc<dyn Transport>, ConfigurationError> {
    match &config.address {
        BrokerAddress::InProcess(address) => {
            if address.create() && address.persistent() {
                return Err(ConfigurationError::new(format!(
                    "`{}` asks for a persistent embedded broker: durable storage is not supported",
                    config.address
                )));
            }
            Ok(Arc::new(InProcessTransport::new(address.clone(), registry)))
        }
        BrokerAddress::Network(address) => Ok(Arc::new(AmqpTransport::new(address, config)?)),
    }
}
