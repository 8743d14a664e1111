//! A bounded cache of idle sessions that never makes callers wait.
use crate::broker::transport::BrokerSession;
use crate::error::TransportError;
use crate::pool::connection::ConnectionPool;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Keeps up to `capacity` idle sessions around for reuse.
///
/// - [`SessionCache::acquire`] hands out a cached session if one is available and opens a new
///   one on the shared connection otherwise. It never waits for a session to be released.
/// - Releasing a session puts it back in the cache unless the cache is already full, in which
///   case the session is closed and discarded.
///
/// The cache therefore never retains more than `capacity` sessions, while the number of
/// sessions in use at any given time is unbounded.
pub struct SessionCache {
    connections: ConnectionPool,
    capacity: usize,
    idle: Mutex<Vec<Box<dyn BrokerSession>>>,
    opened: AtomicUsize,
    closed: AtomicBool,
}

/// A point-in-time view of a [`SessionCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCacheStatus {
    /// Maximum number of idle sessions retained.
    pub capacity: usize,
    /// Idle sessions currently retained.
    pub cached: usize,
    /// Sessions opened since the cache was created.
    pub sessions_opened: usize,
    /// Physical connections opened since the cache was created.
    pub connections_opened: usize,
}

impl SessionCache {
    pub fn new(connections: ConnectionPool, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            connections,
            capacity,
            idle: Mutex::new(Vec::with_capacity(capacity)),
            opened: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn idle(&self) -> MutexGuard<'_, Vec<Box<dyn BrokerSession>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a session, reusing a cached one when possible.
    pub async fn acquire(self: &Arc<Self>) -> Result<CachedSession, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::msg("The connection factory has been closed"));
        }
        loop {
            let candidate = self.idle().pop();
            match candidate {
                Some(session) if session.is_open() => {
                    return Ok(CachedSession::new(session, Arc::clone(self)))
                }
                Some(session) => {
                    debug!("Discarding a broken cached session");
                    discard(session);
                }
                None => break,
            }
        }

        let session = {
            let connection = self.connections.get().await?;
            connection.create_session().await?
        };
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(CachedSession::new(session, Arc::clone(self)))
    }

    /// Give a session back. Equivalent to dropping it.
    pub fn release(&self, session: CachedSession) {
        drop(session);
    }

    fn give_back(&self, session: Box<dyn BrokerSession>) {
        if self.closed.load(Ordering::SeqCst) || !session.is_open() {
            discard(session);
            return;
        }
        let mut idle = self.idle();
        if idle.len() < self.capacity {
            idle.push(session);
        } else {
            drop(idle);
            debug!(capacity = self.capacity, "Session cache is full, discarding session");
            discard(session);
        }
    }

    pub fn status(&self) -> SessionCacheStatus {
        SessionCacheStatus {
            capacity: self.capacity,
            cached: self.idle().len(),
            sessions_opened: self.opened.load(Ordering::SeqCst),
            connections_opened: self.connections.manager().connections_opened(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every cached session and the shared connection.
    ///
    /// Sessions still in use are closed when they are released.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        let idle: Vec<_> = self.idle().drain(..).collect();
        for session in idle {
            if let Err(e) = session.close().await {
                debug!(error = ?e, "Failed to close a cached session");
            }
        }
        if let Some(connection) = self.connections.manager().current() {
            connection.close().await?;
        }
        Ok(())
    }
}

/// Sessions are closed in the background: `Drop` cannot await.
fn discard(session: Box<dyn BrokerSession>) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            if let Err(e) = session.close().await {
                debug!(error = ?e, "Failed to close a discarded session");
            }
        });
    }
}

/// A session borrowed from a [`SessionCache`]. It goes back to the cache when dropped.
pub struct CachedSession {
    session: Option<Box<dyn BrokerSession>>,
    cache: Arc<SessionCache>,
}

impl CachedSession {
    fn new(session: Box<dyn BrokerSession>, cache: Arc<SessionCache>) -> Self {
        Self {
            session: Some(session),
            cache,
        }
    }

    /// Close the session instead of handing it back to the cache.
    ///
    /// Used for sessions left in a state that makes them unfit for reuse, such as sessions
    /// that had a consumer attached.
    pub async fn discard(mut self) -> Result<(), TransportError> {
        match self.session.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }
}

impl Deref for CachedSession {
    type Target = dyn BrokerSession;

    fn deref(&self) -> &Self::Target {
        self.session
            .as_deref()
            .expect("A cached session is only taken out when dropped")
    }
}

impl Drop for CachedSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.cache.give_back(session);
        }
    }
}
