//! Wire everything together: embedded broker, connection factory, readiness check, dispatch
//! template and listener containers.
use crate::broker::{
    BrokerRegistry, ConnectionFactory, ConnectionFactoryConfig, EmbeddedBroker,
    EmbeddedBrokerSettings,
};
use crate::dispatch::{DispatchSettings, DispatchTemplate};
use crate::error::{ConfigurationError, TransportError};
use crate::listener::{
    ListenerConfig, ListenerContainer, ListenerContainerFactory, ListenerEndpoint,
};
use crate::readiness::{ReadinessError, ReadinessProbe, RetryPolicy};
use serde::Deserialize;
use shutdown_handler::ShutdownHandler;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything needed to assemble a [`Harness`], usually loaded from a configuration file.
///
/// ```yaml
/// embedded_broker:
///   name: test-broker
/// connection_factory:
///   address: vm://test-broker?create=false
///   session_cache_size: 10
/// readiness:
///   max_attempts: 10
///   delay_between_attempts_ms: 500
/// dispatch:
///   default_destination: orders
/// listener:
///   concurrency: 3-10
///   transacted: true
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct HarnessSettings {
    /// Start an in-process broker before connecting. Leave it out to use an external broker.
    #[serde(default)]
    pub embedded_broker: Option<EmbeddedBrokerSettings>,
    pub connection_factory: ConnectionFactoryConfig,
    #[serde(default)]
    pub readiness: RetryPolicy,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    /// Defaults for every listener container.
    #[serde(default)]
    pub listener: ListenerConfig,
}

impl HarnessSettings {
    pub fn new(connection_factory: ConnectionFactoryConfig) -> Self {
        Self {
            embedded_broker: None,
            connection_factory,
            readiness: RetryPolicy::default(),
            dispatch: DispatchSettings::default(),
            listener: ListenerConfig::default(),
        }
    }
}

/// Error returned when a [`Harness`] fails to start or to shut down.
#[derive(thiserror::Error, Debug)]
pub enum HarnessError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("The broker never became ready")]
    Readiness(#[from] ReadinessError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Failed to install the SIGTERM handler")]
    Signal(#[source] std::io::Error),
}

/// A running messaging setup.
///
/// Build one with [`Harness::builder`]. Startup follows a fixed order:
/// 1. the embedded broker, if any, is started;
/// 2. the [`ConnectionFactory`] is created;
/// 3. the readiness probe waits until the broker accepts connections;
/// 4. the [`DispatchTemplate`] and the [`ListenerContainerFactory`] are created;
/// 5. registered listener containers with `auto_startup` are started.
///
/// [`Harness::shutdown`] tears everything down in reverse: listener containers first, then the
/// connection factory, then the embedded broker.
pub struct Harness {
    registry: BrokerRegistry,
    embedded_broker: Option<EmbeddedBroker>,
    connection_factory: ConnectionFactory,
    dispatch_template: DispatchTemplate,
    listener_container_factory: ListenerContainerFactory,
    containers: Vec<ListenerContainer>,
}

impl Harness {
    pub fn builder(settings: HarnessSettings) -> HarnessBuilder {
        HarnessBuilder {
            settings,
            registry: None,
            endpoints: Vec::new(),
        }
    }

    pub fn broker_registry(&self) -> &BrokerRegistry {
        &self.registry
    }

    pub fn embedded_broker(&self) -> Option<&EmbeddedBroker> {
        self.embedded_broker.as_ref()
    }

    pub fn connection_factory(&self) -> &ConnectionFactory {
        &self.connection_factory
    }

    pub fn dispatch_template(&self) -> &DispatchTemplate {
        &self.dispatch_template
    }

    pub fn listener_container_factory(&self) -> &ListenerContainerFactory {
        &self.listener_container_factory
    }

    /// Containers registered through [`HarnessBuilder::listener`], in registration order.
    pub fn containers(&self) -> &[ListenerContainer] {
        &self.containers
    }

    /// Stop every listener container, close the connection factory and stop the embedded
    /// broker.
    #[tracing::instrument(skip_all, name = "harness_shutdown")]
    pub async fn shutdown(self) -> Result<(), HarnessError> {
        for container in &self.containers {
            container.stop().await;
        }
        let closed = self.connection_factory.close().await;
        if let Some(broker) = &self.embedded_broker {
            broker.stop();
        }
        closed?;
        info!("Harness shut down");
        Ok(())
    }

    /// Run until the process receives SIGTERM, then shut down.
    pub async fn run_until_sigterm(self) -> Result<(), HarnessError> {
        let shutdown = ShutdownHandler::sigterm().map_err(HarnessError::Signal)?;
        self.run_until_signal(shutdown).await
    }

    /// Run until `shutdown` is signalled, then shut down.
    pub async fn run_until_signal(self, shutdown: Arc<ShutdownHandler>) -> Result<(), HarnessError> {
        self.run_until_shutdown(shutdown.wait_for_signal()).await
    }

    /// Run until `shutdown` completes, then shut down.
    pub async fn run_until_shutdown(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), HarnessError> {
        shutdown.await;
        info!("Shutdown requested");
        self.shutdown().await
    }
}

/// A builder for [`Harness`].
///
/// Use [`Harness::builder`] as entrypoint.
pub struct HarnessBuilder {
    settings: HarnessSettings,
    registry: Option<BrokerRegistry>,
    endpoints: Vec<(ListenerEndpoint, Option<ListenerConfig>)>,
}

impl HarnessBuilder {
    /// Start and look up in-process brokers in `registry` instead of a private one.
    #[must_use]
    pub fn broker_registry(mut self, registry: BrokerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Register a listener container using the default [`ListenerConfig`].
    #[must_use]
    pub fn listener(mut self, endpoint: ListenerEndpoint) -> Self {
        self.endpoints.push((endpoint, None));
        self
    }

    /// Register a listener container with its own [`ListenerConfig`].
    #[must_use]
    pub fn listener_with_config(mut self, endpoint: ListenerEndpoint, config: ListenerConfig) -> Self {
        self.endpoints.push((endpoint, Some(config)));
        self
    }

    /// Start the harness. See [`Harness`] for the startup order.
    pub async fn start(self) -> Result<Harness, HarnessError> {
        self.start_or_shutdown(std::future::pending()).await
    }

    /// Same as [`HarnessBuilder::start`], but gives up waiting for the broker as soon as
    /// `shutdown` completes.
    #[tracing::instrument(skip_all, name = "harness_start")]
    pub async fn start_or_shutdown(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<Harness, HarnessError> {
        let Self {
            settings,
            registry,
            endpoints,
        } = self;
        let registry = registry.unwrap_or_default();

        let embedded_broker = settings
            .embedded_broker
            .as_ref()
            .map(|broker| registry.start_broker(broker))
            .transpose()?;

        let started = connect(&settings, &registry, shutdown).await;
        let connection_factory = match started {
            Ok(factory) => factory,
            Err(e) => {
                if let Some(broker) = &embedded_broker {
                    broker.stop();
                }
                return Err(e);
            }
        };

        let dispatch_template = DispatchTemplate::builder(connection_factory.clone())
            .settings(&settings.dispatch)
            .build();
        let listener_container_factory =
            ListenerContainerFactory::new(connection_factory.clone(), settings.listener.clone());

        let containers: Vec<_> = endpoints
            .into_iter()
            .map(|(endpoint, config)| match config {
                Some(config) => listener_container_factory.build(config, endpoint),
                None => listener_container_factory.create_container(endpoint),
            })
            .collect();
        for container in containers.iter().filter(|c| c.auto_startup()) {
            container.start();
        }

        info!(
            address = %connection_factory.address(),
            containers = containers.len(),
            "Harness started"
        );
        Ok(Harness {
            registry,
            embedded_broker,
            connection_factory,
            dispatch_template,
            listener_container_factory,
            containers,
        })
    }
}

async fn connect(
    settings: &HarnessSettings,
    registry: &BrokerRegistry,
    shutdown: impl Future<Output = ()>,
) -> Result<ConnectionFactory, HarnessError> {
    let connection_factory = ConnectionFactory::builder(settings.connection_factory.clone())
        .broker_registry(registry.clone())
        .build()?;
    let ready = ReadinessProbe::new(settings.readiness)
        .wait_until_ready_or_shutdown(&connection_factory, shutdown)
        .await;
    if let Err(e) = ready {
        if let Err(close_error) = connection_factory.close().await {
            warn!(error = %close_error, "Failed to close the connection factory");
        }
        return Err(e.into());
    }
    Ok(connection_factory)
}
