//! Error types shared across the harness.

/// The configuration handed to the harness is invalid.
///
/// Configuration errors are fatal: they are surfaced at construction time and are never retried.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid broker configuration: {message}")]
pub struct ConfigurationError {
    message: String,
}

impl ConfigurationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// A human readable description of what is wrong with the configuration.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A single connect/send/receive failure against the broker.
///
/// Transport errors are recoverable: the [`ReadinessProbe`] retries them under an explicit
/// policy, every other component surfaces them directly to its caller.
///
/// [`ReadinessProbe`]: crate::readiness::ReadinessProbe
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct TransportError(#[from] anyhow::Error);

impl TransportError {
    /// Build a transport error out of a plain message.
    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self(anyhow::Error::msg(message))
    }
}

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        Self(err.into())
    }
}

impl From<deadpool::managed::PoolError<TransportError>> for TransportError {
    fn from(err: deadpool::managed::PoolError<TransportError>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => e,
            err => Self(anyhow::Error::msg(err.to_string())),
        }
    }
}
