//! Configuration types holding the parameters required to connect to a broker.
use crate::broker::address::BrokerAddress;
use crate::error::ConfigurationError;
use native_tls::Certificate;
use redact::Secret;
use serde::Deserialize;
use serde_aux::field_attributes::{
    deserialize_number_from_string, deserialize_option_number_from_string,
};
use std::collections::BTreeSet;

const DEFAULT_CONNECTION_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Deserialize, Clone)]
/// Configuration of a [`ConnectionFactory`](crate::broker::ConnectionFactory).
///
/// It is built once at startup and never mutated afterwards.
pub struct ConnectionFactoryConfig {
    /// Where the broker lives.
    ///
    /// E.g. `vm://test-broker?create=false` for an in-process broker or
    /// `amqp://localhost:5672/%2f` for a local RabbitMq instance.
    pub address: BrokerAddress,
    /// How many idle sessions are kept around for reuse. Must be at least 1.
    #[serde(
        default = "default_session_cache_size",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub session_cache_size: usize,
    /// Whether payloads declaring an arbitrary type may be deserialized.
    ///
    /// This is security-relevant: keep it `false` outside of tests and list the types you
    /// expect in `trusted_types` instead.
    #[serde(default)]
    pub trust_all_serialized_types: bool,
    /// Payload type names that can be deserialized even if `trust_all_serialized_types` is off.
    #[serde(default)]
    pub trusted_types: Vec<String>,
    /// How long you should wait when trying to connect to the broker before giving up,
    /// in seconds.
    #[serde(default)]
    pub connection_timeout_seconds: Option<u64>,
    /// Credentials for network brokers. They override any user info embedded in the address.
    #[serde(default)]
    pub credentials: Option<BrokerCredentials>,
    /// Configuration to establish an encrypted connection with a network broker.
    /// If omitted the connection will be in plain text, unless the address uses `amqps://`.
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

fn default_session_cache_size() -> usize {
    1
}

/// Deserialize a number of milliseconds (or a string holding one) into a [`Duration`].
///
/// [`Duration`]: std::time::Duration
pub(crate) fn deserialize_millis<'de, D>(deserializer: D) -> Result<std::time::Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis: u64 = deserialize_number_from_string(deserializer)?;
    Ok(std::time::Duration::from_millis(millis))
}

/// Same as [`deserialize_millis`], for optional durations.
pub(crate) fn deserialize_optional_millis<'de, D>(
    deserializer: D,
) -> Result<Option<std::time::Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis: Option<u64> = deserialize_option_number_from_string(deserializer)?;
    Ok(millis.map(std::time::Duration::from_millis))
}

impl ConnectionFactoryConfig {
    /// A configuration pointing at `address` with every other knob left to its default.
    pub fn new(address: BrokerAddress) -> Self {
        Self {
            address,
            session_cache_size: default_session_cache_size(),
            trust_all_serialized_types: false,
            trusted_types: Vec::new(),
            connection_timeout_seconds: None,
            credentials: None,
            tls: None,
        }
    }

    #[must_use]
    pub fn with_session_cache_size(mut self, session_cache_size: usize) -> Self {
        self.session_cache_size = session_cache_size;
        self
    }

    #[must_use]
    pub fn trust_all_serialized_types(mut self, trust_all: bool) -> Self {
        self.trust_all_serialized_types = trust_all;
        self
    }

    #[must_use]
    pub fn with_trusted_type(mut self, type_name: impl Into<String>) -> Self {
        self.trusted_types.push(type_name.into());
        self
    }

    /// Checks the invariants that cannot be expressed in the types.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.session_cache_size == 0 {
            return Err(ConfigurationError::new(
                "`session_cache_size` must be at least 1",
            ));
        }
        if let Some(tls) = &self.tls {
            tls.ca_certificate_chain()?;
        }
        Ok(())
    }

    /// Retrieve the timeout observed when trying to connect to the broker.
    /// Defaults to 10 seconds if left unspecified.
    pub fn connection_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.connection_timeout_seconds
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_SECONDS),
        )
    }

    /// The policy applied when deserializing typed payloads.
    pub fn serialized_type_policy(&self) -> SerializedTypePolicy {
        SerializedTypePolicy {
            trust_all: self.trust_all_serialized_types,
            trusted: self.trusted_types.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
/// Username and password used to authenticate with a network broker.
pub struct BrokerCredentials {
    pub username: String,
    pub password: Secret<String>,
}

#[derive(Debug, Deserialize, Clone)]
/// Configuration to establish an encrypted connection with a network broker.
pub struct TlsSettings {
    /// The domain we expect as CN on the server certificate.
    /// If left unspecified, it defaults to the uri host.
    pub domain: Option<String>,
    /// Root certificate chain to be trusted when validating server certificates,
    /// in PEM format.
    ///
    /// If set to `None`, the system's trust root will be used by default.
    pub ca_certificate_chain_pem: Option<String>,
}

impl TlsSettings {
    /// It parses the CA certificate chain and returns it in the strongly-typed format
    /// provided by the `native_tls` crate.
    pub fn ca_certificate_chain(&self) -> Result<Option<Certificate>, ConfigurationError> {
        self.ca_certificate_chain_pem
            .as_ref()
            .map(String::as_bytes)
            .map(Certificate::from_pem)
            .transpose()
            .map_err(|e| {
                ConfigurationError::new(format!(
                    "Failed to decode PEM certificate chain for the broker TLS connection: {e}"
                ))
            })
    }
}

/// Decides which declared payload types may be deserialized.
///
/// Messages that do not declare a payload type are always readable: the reader picks the
/// target type. Messages that do declare one are only readable if the type is trusted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializedTypePolicy {
    trust_all: bool,
    trusted: BTreeSet<String>,
}

impl SerializedTypePolicy {
    /// A policy trusting every declared type. Only meant for tests.
    pub fn trust_all() -> Self {
        Self {
            trust_all: true,
            trusted: BTreeSet::new(),
        }
    }

    /// A policy trusting exactly the listed type names.
    pub fn trusting<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            trust_all: false,
            trusted: types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_trusted(&self, type_name: &str) -> bool {
        self.trust_all || self.trusted.contains(type_name)
    }
}
