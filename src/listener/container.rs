use crate::broker::transport::{AcknowledgementMode, Delivery, Destination};
use crate::broker::ConnectionFactory;
use crate::error::TransportError;
use crate::listener::{ListenerConfig, MessageListener};
use crate::pool::CachedSession;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// A destination paired with the [`MessageListener`] processing its messages.
#[derive(Clone)]
pub struct ListenerEndpoint {
    destination: Destination,
    listener: Arc<dyn MessageListener>,
}

impl ListenerEndpoint {
    pub fn new<L: MessageListener>(destination: Destination, listener: L) -> Self {
        Self::with_dyn_listener(destination, Arc::new(listener))
    }

    pub fn with_dyn_listener(destination: Destination, listener: Arc<dyn MessageListener>) -> Self {
        Self {
            destination,
            listener,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }
}

/// Builds [`ListenerContainer`]s sharing the same [`ConnectionFactory`] and default
/// [`ListenerConfig`].
#[derive(Clone)]
pub struct ListenerContainerFactory {
    connection_factory: ConnectionFactory,
    config: ListenerConfig,
}

impl ListenerContainerFactory {
    pub fn new(connection_factory: ConnectionFactory, config: ListenerConfig) -> Self {
        Self {
            connection_factory,
            config,
        }
    }

    /// The configuration used by [`ListenerContainerFactory::create_container`].
    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn connection_factory(&self) -> &ConnectionFactory {
        &self.connection_factory
    }

    /// Build a container for `endpoint` using the factory defaults.
    pub fn create_container(&self, endpoint: ListenerEndpoint) -> ListenerContainer {
        self.build(self.config.clone(), endpoint)
    }

    /// Build a container for `endpoint` with its own configuration.
    ///
    /// The container is not started: see [`ListenerContainer::start`].
    pub fn build(&self, config: ListenerConfig, endpoint: ListenerEndpoint) -> ListenerContainer {
        ListenerContainer {
            shared: Arc::new(Shared {
                factory: self.connection_factory.clone(),
                destination: endpoint.destination,
                listener: endpoint.listener,
                config,
                consumers: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                tasks: Mutex::new(Vec::new()),
            }),
            stop: Mutex::new(None),
        }
    }
}

/// Runs a pool of consumers against a single destination.
///
/// # Lifecycle
///
/// A container does nothing until [`ListenerContainer::start`] is called. It then keeps
/// `concurrency.min()` consumers alive, each on its own cached session. When every consumer is
/// busy processing a message, a new one is added, up to `concurrency.max()`. Consumers above the
/// minimum stop after `idle_consumer_timeout` without messages.
///
/// If the broker connection is lost, consumers log the failure and try again every
/// `recovery_interval` until the broker is back or the container is stopped.
///
/// [`ListenerContainer::stop`] waits for in-flight messages to be processed before returning.
/// Dropping a running container stops its consumers without waiting for them.
pub struct ListenerContainer {
    shared: Arc<Shared>,
    stop: Mutex<Option<watch::Sender<bool>>>,
}

struct Shared {
    factory: ConnectionFactory,
    destination: Destination,
    listener: Arc<dyn MessageListener>,
    config: ListenerConfig,
    /// Consumers alive, whether busy or waiting for messages.
    consumers: AtomicUsize,
    /// Consumers currently running the listener.
    busy: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Why a consumer stopped consuming without an error.
enum ConsumerExit {
    Stopped,
    Idle,
}

impl ListenerContainer {
    pub fn destination(&self) -> &Destination {
        &self.shared.destination
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.shared.config
    }

    pub fn auto_startup(&self) -> bool {
        self.shared.config.auto_startup
    }

    pub fn is_running(&self) -> bool {
        lock(&self.stop).is_some()
    }

    /// The number of consumers currently alive.
    pub fn active_consumers(&self) -> usize {
        self.shared.consumers.load(Ordering::SeqCst)
    }

    /// Spawn the minimum number of consumers. Does nothing if the container is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut stop = lock(&self.stop);
        if stop.is_some() {
            return;
        }
        let (sender, receiver) = watch::channel(false);
        for _ in 0..self.shared.config.concurrency.min() {
            if self.shared.try_reserve_consumer() {
                self.shared.spawn_consumer(receiver.clone(), true);
            }
        }
        *stop = Some(sender);
        info!(
            destination = %self.shared.destination,
            concurrency = %self.shared.config.concurrency,
            "Listener container started"
        );
    }

    /// Stop every consumer and wait for in-flight messages to be processed.
    pub async fn stop(&self) {
        let sender = lock(&self.stop).take();
        let Some(sender) = sender else { return };
        // Receivers observe the change even if they are not waiting on it right now.
        let _ = sender.send(true);

        loop {
            let tasks = std::mem::take(&mut *lock(&self.shared.tasks));
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    error!(error = %e, "A consumer task panicked");
                }
            }
        }
        info!(destination = %self.shared.destination, "Listener container stopped");
    }
}

impl Shared {
    /// Claim a consumer slot, unless `concurrency.max()` consumers are already alive.
    fn try_reserve_consumer(&self) -> bool {
        let max = self.config.concurrency.max();
        self.consumers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    /// Spawn a consumer for a slot claimed with [`Shared::try_reserve_consumer`].
    ///
    /// Permanent consumers are the first `concurrency.min()`: they never stop for idleness.
    fn spawn_consumer(self: &Arc<Self>, stop: watch::Receiver<bool>, permanent: bool) {
        let span = tracing::info_span!(
            "listener_consumer",
            destination = %self.destination,
            permanent
        );
        let handle = tokio::spawn(run_consumer(Arc::clone(self), stop, permanent).instrument(span));
        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Add a consumer if every live consumer is busy.
    fn scale_up_if_saturated(self: &Arc<Self>, stop: &watch::Receiver<bool>) {
        if *stop.borrow() {
            return;
        }
        let busy = self.busy.load(Ordering::SeqCst);
        if busy < self.consumers.load(Ordering::SeqCst) {
            return;
        }
        if self.try_reserve_consumer() {
            debug!(consumers = busy + 1, "All consumers are busy, adding one");
            self.spawn_consumer(stop.clone(), false);
        }
    }

    async fn consume(
        self: &Arc<Self>,
        stop: &mut watch::Receiver<bool>,
        permanent: bool,
    ) -> Result<ConsumerExit, TransportError> {
        let session = self.factory.session().await?;
        let exit = self.consume_on(&session, stop, permanent).await;
        // A session that had a consumer attached is never reused.
        if let Err(e) = session.discard().await {
            debug!(error = %e, "Failed to close a consumer session");
        }
        exit
    }

    async fn consume_on(
        self: &Arc<Self>,
        session: &CachedSession,
        stop: &mut watch::Receiver<bool>,
        permanent: bool,
    ) -> Result<ConsumerExit, TransportError> {
        let acknowledgement = if self.config.transacted {
            AcknowledgementMode::Client
        } else {
            AcknowledgementMode::Auto
        };
        let mut deliveries = session.consume(&self.destination, acknowledgement).await?;

        loop {
            let next = tokio::select! {
                // Stop requests win over pending messages.
                biased;

                _ = stop.changed() => return Ok(ConsumerExit::Stopped),
                _ = idle_timeout(permanent, self.config.idle_consumer_timeout) => {
                    return Ok(ConsumerExit::Idle)
                }
                next = deliveries.next() => next,
            };
            match next {
                None => return Err(TransportError::msg("The broker cancelled the consumer")),
                Some(Err(e)) => return Err(e),
                Some(Ok(delivery)) => self.process(delivery, stop).await,
            }
        }
    }

    #[tracing::instrument(name = "process_message", skip_all, level = tracing::Level::DEBUG)]
    async fn process(self: &Arc<Self>, delivery: Delivery, stop: &watch::Receiver<bool>) {
        self.busy.fetch_add(1, Ordering::SeqCst);
        self.scale_up_if_saturated(stop);

        let Delivery { message, acker } = delivery;
        let message = message.with_type_policy(self.factory.type_policy());
        let listener = Arc::clone(&self.listener);
        // A panicking listener must not take the consumer down with it.
        let outcome = match tokio::spawn(async move { listener.on_message(message).await }).await
        {
            Ok(outcome) => outcome,
            Err(e) => Err(anyhow::anyhow!("The listener panicked: {e}")),
        };

        match (outcome, self.config.transacted) {
            (Ok(()), true) => {
                if let Err(e) = acker.ack().await {
                    warn!(error = %e, "Failed to acknowledge a message");
                }
            }
            (Err(e), true) => {
                warn!(error = ?e, "The listener failed, rolling the message back");
                if let Err(e) = acker.requeue().await {
                    warn!(error = %e, "Failed to roll back a message");
                }
            }
            (Err(e), false) => {
                error!(error = ?e, "The listener failed to process a message");
            }
            (Ok(()), false) => {}
        }
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_consumer(shared: Arc<Shared>, mut stop: watch::Receiver<bool>, permanent: bool) {
    loop {
        if *stop.borrow() {
            break;
        }
        match shared.consume(&mut stop, permanent).await {
            Ok(ConsumerExit::Stopped) => break,
            Ok(ConsumerExit::Idle) => {
                debug!("Stopping an idle consumer");
                break;
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Lost the connection to the broker, recovering in {:?}",
                    shared.config.recovery_interval
                );
                tokio::select! {
                    biased;

                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(shared.config.recovery_interval) => {}
                }
            }
        }
    }
    shared.consumers.fetch_sub(1, Ordering::SeqCst);
}

async fn idle_timeout(permanent: bool, timeout: Duration) {
    if permanent {
        std::future::pending::<()>().await
    } else {
        tokio::time::sleep(timeout).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
