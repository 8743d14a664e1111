use crate::broker::configuration::deserialize_millis;
use crate::error::ConfigurationError;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How many consumers a [`ListenerContainer`](super::ListenerContainer) runs.
///
/// Written as `"min-max"` (e.g. `"3-10"`) or as a single upper bound `"max"`, which is short for
/// `"1-max"`. The container always keeps `min` consumers alive and adds more, up to `max`, while
/// all of them are busy. A fixed range (`"5-5"`) pins the number of consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct ConcurrencyRange {
    min: usize,
    max: usize,
}

impl ConcurrencyRange {
    pub fn new(min: usize, max: usize) -> Result<Self, ConfigurationError> {
        if min == 0 {
            return Err(ConfigurationError::new(
                "A listener container needs at least one consumer",
            ));
        }
        if max < min {
            return Err(ConfigurationError::new(format!(
                "The maximum number of consumers ({max}) is lower than the minimum ({min})"
            )));
        }
        Ok(Self { min, max })
    }

    /// Exactly `consumers` consumers, no scaling.
    pub fn fixed(consumers: usize) -> Result<Self, ConfigurationError> {
        Self::new(consumers, consumers)
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn is_fixed(&self) -> bool {
        self.min == self.max
    }
}

impl Default for ConcurrencyRange {
    fn default() -> Self {
        Self { min: 1, max: 1 }
    }
}

impl FromStr for ConcurrencyRange {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |bound: &str| {
            bound.trim().parse::<usize>().map_err(|_| {
                ConfigurationError::new(format!(
                    "Invalid concurrency `{s}`: expected `min-max` or a single number"
                ))
            })
        };
        match s.split_once('-') {
            Some((min, max)) => Self::new(parse(min)?, parse(max)?),
            None => Self::new(1, parse(s)?),
        }
    }
}

impl TryFrom<String> for ConcurrencyRange {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ConcurrencyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Configuration of a [`ListenerContainer`](super::ListenerContainer).
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default)]
    pub concurrency: ConcurrencyRange,
    /// Acknowledge each message only once the listener succeeded, and roll it back for
    /// redelivery if the listener fails.
    #[serde(default)]
    pub transacted: bool,
    /// Whether the container is started as soon as it is registered with a
    /// [`Harness`](crate::harness::Harness).
    #[serde(default = "default_auto_startup")]
    pub auto_startup: bool,
    /// Pause between reconnection attempts after the broker connection is lost.
    #[serde(
        rename = "recovery_interval_ms",
        default = "default_recovery_interval",
        deserialize_with = "deserialize_millis"
    )]
    pub recovery_interval: Duration,
    /// How long a consumer above the minimum can stay without receiving messages before it
    /// is stopped.
    #[serde(
        rename = "idle_consumer_timeout_ms",
        default = "default_idle_consumer_timeout",
        deserialize_with = "deserialize_millis"
    )]
    pub idle_consumer_timeout: Duration,
}

fn default_auto_startup() -> bool {
    true
}

fn default_recovery_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_idle_consumer_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyRange::default(),
            transacted: false,
            auto_startup: default_auto_startup(),
            recovery_interval: default_recovery_interval(),
            idle_consumer_timeout: default_idle_consumer_timeout(),
        }
    }
}

impl ListenerConfig {
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: ConcurrencyRange) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn transacted(mut self, transacted: bool) -> Self {
        self.transacted = transacted;
        self
    }

    #[must_use]
    pub fn auto_startup(mut self, auto_startup: bool) -> Self {
        self.auto_startup = auto_startup;
        self
    }

    #[must_use]
    pub fn with_recovery_interval(mut self, recovery_interval: Duration) -> Self {
        self.recovery_interval = recovery_interval;
        self
    }

    #[must_use]
    pub fn with_idle_consumer_timeout(mut self, idle_consumer_timeout: Duration) -> Self {
        self.idle_consumer_timeout = idle_consumer_timeout;
        self
    }
}
