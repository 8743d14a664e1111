//! Where to connect: an in-process broker or a network-reachable one.
use crate::error::ConfigurationError;
use lapin::uri::{AMQPScheme, AMQPUri};
use std::fmt;
use std::str::FromStr;

const IN_PROCESS_SCHEME: &str = "vm://";

/// Transport address of a broker.
///
/// Two families of addresses are recognised:
///
/// - `vm://<name>[?options]` points at an [`EmbeddedBroker`] living in the same process.
///   No socket is involved.
/// - `amqp://...` / `amqps://...` point at a network-reachable broker.
///
/// A `BrokerAddress` is immutable once parsed.
///
/// ```rust
/// use carrot_harness::broker::BrokerAddress;
///
/// let address = BrokerAddress::parse("vm://test-broker?create=false").unwrap();
/// assert!(address.is_in_process());
/// ```
///
/// [`EmbeddedBroker`]: crate::broker::embedded::EmbeddedBroker
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(try_from = "String")]
pub enum BrokerAddress {
    InProcess(InProcessAddress),
    Network(NetworkAddress),
}

/// Address of a named in-process broker, plus the options used if the client has to
/// provision it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InProcessAddress {
    name: String,
    /// `create`: whether connecting may auto-provision the broker if it is absent.
    create: bool,
    /// `broker.persistent`: durable storage for an auto-provisioned broker.
    persistent: bool,
    /// `broker.useJmx`: management hooks for an auto-provisioned broker.
    use_management: bool,
}

impl InProcessAddress {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create(&self) -> bool {
        self.create
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn use_management(&self) -> bool {
        self.use_management
    }
}

/// Address of a broker reachable over the network via AMQP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkAddress {
    uri: AMQPUri,
}

impl NetworkAddress {
    pub fn uri(&self) -> &AMQPUri {
        &self.uri
    }

    pub fn is_tls(&self) -> bool {
        self.uri.scheme == AMQPScheme::AMQPS
    }
}

impl BrokerAddress {
    /// Parse a broker address, failing with a [`ConfigurationError`] if it is malformed.
    pub fn parse(raw: &str) -> Result<Self, ConfigurationError> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix(IN_PROCESS_SCHEME) {
            return parse_in_process(rest).map(BrokerAddress::InProcess);
        }
        if raw.starts_with("amqp://") || raw.starts_with("amqps://") {
            let uri = AMQPUri::from_str(raw).map_err(|e| {
                ConfigurationError::new(format!("`{raw}` is not a valid AMQP uri: {e}"))
            })?;
            return Ok(BrokerAddress::Network(NetworkAddress { uri }));
        }
        Err(ConfigurationError::new(format!(
            "`{raw}` is not a supported broker address. Expected `vm://<name>`, `amqp://...` or `amqps://...`"
        )))
    }

    /// Address of an in-process broker with default options (`create=true`).
    pub fn in_process(name: impl Into<String>) -> Result<Self, ConfigurationError> {
        let name = name.into();
        validate_broker_name(&name)?;
        Ok(BrokerAddress::InProcess(InProcessAddress {
            name,
            create: true,
            persistent: false,
            use_management: false,
        }))
    }

    pub fn is_in_process(&self) -> bool {
        matches!(self, BrokerAddress::InProcess(_))
    }
}

fn validate_broker_name(name: &str) -> Result<(), ConfigurationError> {
    if name.is_empty() {
        return Err(ConfigurationError::new(
            "An in-process broker address must name the broker, e.g. `vm://my-broker`",
        ));
    }
    if name.contains(['/', '?', '&', '=']) || name.chars().any(char::is_whitespace) {
        return Err(ConfigurationError::new(format!(
            "`{name}` is not a valid in-process broker name"
        )));
    }
    Ok(())
}

fn parse_in_process(rest: &str) -> Result<InProcessAddress, ConfigurationError> {
    let (name, query) = match rest.split_once('?') {
        Some((name, query)) => (name, Some(query)),
        None => (rest, None),
    };
    validate_broker_name(name)?;

    let mut address = InProcessAddress {
        name: name.to_owned(),
        create: true,
        persistent: false,
        use_management: false,
    };
    for pair in query.into_iter().flat_map(|q| q.split('&')) {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            ConfigurationError::new(format!("Address option `{pair}` is missing a value"))
        })?;
        let value = parse_bool_option(key, value)?;
        match key {
            "create" => address.create = value,
            "broker.persistent" => address.persistent = value,
            "broker.useJmx" => address.use_management = value,
            unknown => {
                return Err(ConfigurationError::new(format!(
                    "Unknown in-process address option `{unknown}`"
                )))
            }
        }
    }
    Ok(address)
}

fn parse_bool_option(key: &str, value: &str) -> Result<bool, ConfigurationError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ConfigurationError::new(format!(
            "Address option `{key}` must be `true` or `false`, got `{other}`"
        ))),
    }
}

impl TryFrom<String> for BrokerAddress {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl FromStr for BrokerAddress {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// Credentials are never printed.
impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerAddress::InProcess(address) => write!(f, "{IN_PROCESS_SCHEME}{}", address.name),
            BrokerAddress::Network(address) => {
                let scheme = if address.is_tls() { "amqps" } else { "amqp" };
                let authority = &address.uri.authority;
                write!(
                    f,
                    "{scheme}://{}:{}/{}",
                    authority.host, authority.port, address.uri.vhost
                )
            }
        }
    }
}
