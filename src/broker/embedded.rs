//! An in-process broker reachable through `vm://<name>` addresses.
//!
//! The embedded broker exists so that tests and single-process deployments can exercise the
//! harness without a network broker. It keeps non-durable, in-memory FIFO queues, fans topic
//! messages out to live subscribers, drops expired messages and puts rolled back messages back
//! at the head of their queue. It offers no persistence and no delivery guarantees.
use crate::broker::address::InProcessAddress;
use crate::broker::transport::{
    AcknowledgementMode, Acker, AckerKind, BrokerConnection, BrokerSession, Delivery, Destination,
    Message, MessageProperties, OutgoingMessage, Transport,
};
use crate::error::{ConfigurationError, TransportError};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
/// How to start an [`EmbeddedBroker`].
pub struct EmbeddedBrokerSettings {
    /// The name clients use to reach the broker, e.g. `test-broker` for `vm://test-broker`.
    pub name: String,
    /// Durable storage is not supported: setting this to `true` is a configuration error.
    #[serde(default)]
    pub persistent: bool,
    /// Management hooks are not available; when `true` a warning is logged.
    #[serde(default)]
    pub use_management: bool,
}

impl EmbeddedBrokerSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            persistent: false,
            use_management: false,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A broker living in the current process.
///
/// Cloning an `EmbeddedBroker` gives you another handle to the same broker.
#[derive(Clone)]
pub struct EmbeddedBroker {
    state: Arc<BrokerState>,
}

struct BrokerState {
    name: String,
    running: watch::Sender<bool>,
    queues: Mutex<HashMap<String, Arc<MessageQueue>>>,
    subscriptions: Mutex<HashMap<String, Vec<Weak<MessageQueue>>>>,
}

impl EmbeddedBroker {
    /// Start a new broker. It is not reachable by name until it is added to a [`BrokerRegistry`].
    pub fn start(settings: &EmbeddedBrokerSettings) -> Result<Self, ConfigurationError> {
        if settings.name.is_empty() {
            return Err(ConfigurationError::new("An embedded broker needs a name"));
        }
        if settings.persistent {
            return Err(ConfigurationError::new(format!(
                "The embedded broker `{}` cannot be persistent: durable storage is not supported",
                settings.name
            )));
        }
        if settings.use_management {
            warn!(
                broker = %settings.name,
                "Management hooks are not available for embedded brokers, ignoring"
            );
        }
        let (running, _) = watch::channel(true);
        info!(broker = %settings.name, "Embedded broker started");
        Ok(Self {
            state: Arc::new(BrokerState {
                name: settings.name.clone(),
                running,
                queues: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn is_running(&self) -> bool {
        *self.state.running.borrow()
    }

    /// Stop the broker. Every connection, session and consumer opened against it is closed
    /// and all in-flight messages are dropped.
    pub fn stop(&self) {
        if self.state.running.send_replace(false) {
            lock(&self.state.queues).clear();
            lock(&self.state.subscriptions).clear();
            info!(broker = %self.state.name, "Embedded broker stopped");
        }
    }

    /// Number of messages waiting in `queue`, expired ones excluded.
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.state.queues)
            .get(queue)
            .map(|q| q.depth())
            .unwrap_or(0)
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(TransportError::msg(format!(
                "The embedded broker `{}` has been stopped",
                self.state.name
            )))
        }
    }

    fn queue(&self, name: &str) -> Arc<MessageQueue> {
        lock(&self.state.queues)
            .entry(name.to_owned())
            .or_default()
            .clone()
    }

    fn subscribe(&self, topic: &str) -> Arc<MessageQueue> {
        let queue = Arc::new(MessageQueue::default());
        lock(&self.state.subscriptions)
            .entry(topic.to_owned())
            .or_default()
            .push(Arc::downgrade(&queue));
        queue
    }

    fn enqueue(
        &self,
        destination: &Destination,
        message: OutgoingMessage,
    ) -> Result<(), TransportError> {
        self.ensure_running()?;
        let stored = StoredMessage::new(message);
        match destination {
            Destination::Queue(name) => self.queue(name).push_back(stored),
            Destination::Topic(name) => {
                let mut subscriptions = lock(&self.state.subscriptions);
                if let Some(subscribers) = subscriptions.get_mut(name) {
                    subscribers.retain(|s| s.strong_count() > 0);
                    for subscriber in subscribers.iter().filter_map(Weak::upgrade) {
                        subscriber.push_back(stored.clone());
                    }
                } else {
                    debug!(topic = %name, "No subscribers, dropping message");
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct MessageQueue {
    messages: Mutex<VecDeque<StoredMessage>>,
    available: Notify,
}

impl MessageQueue {
    fn push_back(&self, message: StoredMessage) {
        lock(&self.messages).push_back(message);
        self.available.notify_one();
    }

    fn push_front(&self, message: StoredMessage) {
        lock(&self.messages).push_front(message);
        self.available.notify_one();
    }

    fn pop(&self) -> Option<StoredMessage> {
        let now = Instant::now();
        let mut messages = lock(&self.messages);
        while let Some(message) = messages.pop_front() {
            if message.is_expired(now) {
                debug!("Dropping expired message");
                continue;
            }
            return Some(message);
        }
        None
    }

    fn depth(&self) -> usize {
        let now = Instant::now();
        lock(&self.messages)
            .iter()
            .filter(|m| !m.is_expired(now))
            .count()
    }
}

#[derive(Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
    expires_at: Option<Instant>,
}

impl StoredMessage {
    fn new(message: OutgoingMessage) -> Self {
        let expires_at = message
            .properties
            .time_to_live
            .map(|ttl| Instant::now() + ttl);
        Self {
            payload: message.payload,
            properties: message.properties,
            redelivered: false,
            expires_at,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Settles a message handed out by an embedded broker in client acknowledgement mode.
///
/// A message that is dropped without being acknowledged goes back to its queue.
pub(crate) struct EmbeddedAcker {
    queue: Arc<MessageQueue>,
    message: Option<StoredMessage>,
}

impl EmbeddedAcker {
    pub(crate) fn ack(mut self) -> Result<(), TransportError> {
        self.message = None;
        Ok(())
    }

    pub(crate) fn requeue(mut self) -> Result<(), TransportError> {
        self.put_back();
        Ok(())
    }

    fn put_back(&mut self) {
        if let Some(mut message) = self.message.take() {
            message.redelivered = true;
            self.queue.push_front(message);
        }
    }
}

impl Drop for EmbeddedAcker {
    fn drop(&mut self) {
        self.put_back();
    }
}

/// Embedded brokers reachable by name.
///
/// The registry is an explicit object: whoever builds connection factories for `vm://`
/// addresses decides which registry they resolve against.
#[derive(Clone, Default)]
pub struct BrokerRegistry {
    brokers: Arc<Mutex<HashMap<String, EmbeddedBroker>>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a broker and make it reachable by name.
    pub fn start_broker(
        &self,
        settings: &EmbeddedBrokerSettings,
    ) -> Result<EmbeddedBroker, ConfigurationError> {
        let mut brokers = lock(&self.brokers);
        if brokers.get(&settings.name).is_some_and(EmbeddedBroker::is_running) {
            return Err(ConfigurationError::new(format!(
                "An embedded broker named `{}` is already running",
                settings.name
            )));
        }
        let broker = EmbeddedBroker::start(settings)?;
        brokers.insert(settings.name.clone(), broker.clone());
        Ok(broker)
    }

    /// Look up a running broker by name.
    pub fn lookup(&self, name: &str) -> Option<EmbeddedBroker> {
        let mut brokers = lock(&self.brokers);
        match brokers.get(name) {
            Some(broker) if broker.is_running() => Some(broker.clone()),
            Some(_) => {
                brokers.remove(name);
                None
            }
            None => None,
        }
    }

    /// Stop every broker in the registry.
    pub fn stop_all(&self) {
        for (_, broker) in lock(&self.brokers).drain() {
            broker.stop();
        }
    }

    fn lookup_or_create(&self, address: &InProcessAddress) -> Result<EmbeddedBroker, TransportError> {
        if let Some(broker) = self.lookup(address.name()) {
            return Ok(broker);
        }
        if !address.create() {
            return Err(TransportError::msg(format!(
                "No embedded broker named `{}` is running",
                address.name()
            )));
        }
        let settings = EmbeddedBrokerSettings {
            name: address.name().to_owned(),
            persistent: address.persistent(),
            use_management: address.use_management(),
        };
        match self.start_broker(&settings) {
            Ok(broker) => Ok(broker),
            // Somebody else might have provisioned it in the meantime.
            Err(e) => self
                .lookup(address.name())
                .ok_or_else(|| TransportError::from(anyhow::Error::new(e))),
        }
    }
}

/// [`Transport`] connecting to an [`EmbeddedBroker`] through a [`BrokerRegistry`].
pub struct InProcessTransport {
    address: InProcessAddress,
    registry: BrokerRegistry,
}

impl InProcessTransport {
    pub fn new(address: InProcessAddress, registry: BrokerRegistry) -> Self {
        Self { address, registry }
    }
}

#[async_trait::async_trait]
impl Transport for InProcessTransport {
    #[tracing::instrument(name = "embedded_connect", skip(self), fields(broker = %self.address.name()))]
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let broker = self.registry.lookup_or_create(&self.address)?;
        let (open, _) = watch::channel(true);
        Ok(Arc::new(EmbeddedConnection { broker, open }))
    }
}

struct EmbeddedConnection {
    broker: EmbeddedBroker,
    open: watch::Sender<bool>,
}

#[async_trait::async_trait]
impl BrokerConnection for EmbeddedConnection {
    async fn start(&self) -> Result<(), TransportError> {
        self.broker.ensure_running()?;
        if !*self.open.borrow() {
            return Err(TransportError::msg("The connection has been closed"));
        }
        Ok(())
    }

    async fn create_session(&self) -> Result<Box<dyn BrokerSession>, TransportError> {
        self.start().await?;
        let (open, _) = watch::channel(true);
        Ok(Box::new(EmbeddedSession {
            broker: self.broker.clone(),
            connection_open: self.open.subscribe(),
            open,
        }))
    }

    fn is_open(&self) -> bool {
        *self.open.borrow() && self.broker.is_running()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.send_replace(false);
        Ok(())
    }
}

struct EmbeddedSession {
    broker: EmbeddedBroker,
    connection_open: watch::Receiver<bool>,
    open: watch::Sender<bool>,
}

impl EmbeddedSession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        self.broker.ensure_running()?;
        if *self.open.borrow() && *self.connection_open.borrow() {
            Ok(())
        } else {
            Err(TransportError::msg("The session has been closed"))
        }
    }
}

#[async_trait::async_trait]
impl BrokerSession for EmbeddedSession {
    async fn send(
        &self,
        destination: &Destination,
        message: OutgoingMessage,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker.enqueue(destination, message)
    }

    async fn consume(
        &self,
        destination: &Destination,
        acknowledgement: AcknowledgementMode,
    ) -> Result<BoxStream<'static, Result<Delivery, TransportError>>, TransportError> {
        self.ensure_open()?;
        let queue = match destination {
            Destination::Queue(name) => self.broker.queue(name),
            Destination::Topic(name) => self.broker.subscribe(name),
        };
        let consumer = EmbeddedConsumer {
            broker_name: self.broker.name().to_owned(),
            queue,
            destination: destination.clone(),
            acknowledgement,
            broker_running: self.broker.state.running.subscribe(),
            connection_open: self.connection_open.clone(),
            session_open: self.open.subscribe(),
            failed: false,
        };
        Ok(stream::unfold(consumer, |mut consumer| async move {
            if consumer.failed {
                return None;
            }
            let next = consumer.next_delivery().await;
            consumer.failed = next.is_err();
            Some((next, consumer))
        })
        .boxed())
    }

    fn is_open(&self) -> bool {
        *self.open.borrow() && *self.connection_open.borrow() && self.broker.is_running()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.send_replace(false);
        Ok(())
    }
}

struct EmbeddedConsumer {
    broker_name: String,
    queue: Arc<MessageQueue>,
    destination: Destination,
    acknowledgement: AcknowledgementMode,
    broker_running: watch::Receiver<bool>,
    connection_open: watch::Receiver<bool>,
    session_open: watch::Receiver<bool>,
    failed: bool,
}

impl EmbeddedConsumer {
    fn closed(&self) -> TransportError {
        TransportError::msg(format!(
            "Lost the consumer on {} of the embedded broker `{}`",
            self.destination, self.broker_name
        ))
    }

    async fn next_delivery(&mut self) -> Result<Delivery, TransportError> {
        loop {
            let alive = *self.broker_running.borrow_and_update()
                && *self.connection_open.borrow_and_update()
                && *self.session_open.borrow_and_update();
            if !alive {
                return Err(self.closed());
            }
            if let Some(stored) = self.queue.pop() {
                return Ok(self.into_delivery(stored));
            }
            let lost = tokio::select! {
                _ = self.queue.available.notified() => false,
                changed = self.broker_running.changed() => changed.is_err(),
                changed = self.connection_open.changed() => changed.is_err(),
                changed = self.session_open.changed() => changed.is_err(),
            };
            if lost {
                return Err(self.closed());
            }
        }
    }

    fn into_delivery(&self, stored: StoredMessage) -> Delivery {
        let mut message = Message::new(
            self.destination.clone(),
            stored.payload.clone(),
            stored.properties.clone(),
        );
        message.redelivered = stored.redelivered;
        let acker = match self.acknowledgement {
            AcknowledgementMode::Auto => AckerKind::Settled,
            AcknowledgementMode::Client => AckerKind::Embedded(EmbeddedAcker {
                queue: self.queue.clone(),
                message: Some(stored),
            }),
        };
        Delivery::new(message, Acker(acker))
    }
}
