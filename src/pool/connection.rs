//! Implements [`Manager`] for the shared physical connection.
use crate::broker::transport::{BrokerConnection, Transport};
use crate::error::TransportError;
use deadpool::managed::{self, Manager};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// `ConnectionPool` holds the physical connection shared by every session.
///
/// The harness always builds it with `max_size(1)`: callers share a single connection and a
/// new one is only opened once the previous one is broken.
pub type ConnectionPool = deadpool::managed::Pool<ConnectionManager>;

/// `ConnectionManager` implements [`Manager`] on top of a raw [`Transport`].
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    opened: AtomicUsize,
    current: Mutex<Option<Arc<dyn BrokerConnection>>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            opened: AtomicUsize::new(0),
            current: Mutex::new(None),
        }
    }

    /// Build a pool sharing a single physical connection.
    pub fn into_pool(self) -> Result<ConnectionPool, TransportError> {
        ConnectionPool::builder(self)
            .max_size(1)
            .build()
            .map_err(|e| TransportError::msg(format!("Failed to build the connection pool: {e}")))
    }

    /// How many physical connections have been opened so far.
    pub fn connections_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// The most recently opened connection, if any.
    pub fn current(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl Manager for ConnectionManager {
    type Type = Arc<dyn BrokerConnection>;
    type Error = TransportError;

    async fn create(&self) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let connection = open_connection(self.transport.as_ref()).await?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(connection.clone());
        Ok(connection)
    }

    async fn recycle(
        &self,
        obj: &mut Arc<dyn BrokerConnection>,
    ) -> managed::RecycleResult<TransportError> {
        if obj.is_open() {
            Ok(())
        } else {
            Err(managed::RecycleError::Message(
                "Connection is not in an healthy state".to_owned(),
            ))
        }
    }
}

/// Connect and start a connection. A connection that fails to start is closed before the start
/// error is returned.
pub(crate) async fn open_connection(
    transport: &dyn Transport,
) -> Result<Arc<dyn BrokerConnection>, TransportError> {
    let connection = transport.connect().await?;
    if let Err(e) = connection.start().await {
        if let Err(close_error) = connection.close().await {
            warn!(error = %close_error, "Failed to close a connection that did not start");
        }
        return Err(e);
    }
    Ok(connection)
}
