//! Transport configuration.
//!
//! Every field carries a serde default so a partial file, or no file at all,
//! still produces a usable configuration. Values are layered in this order,
//! later sources overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. an optional configuration file (format taken from its extension)
//! 3. environment variables prefixed `COURIER__` with `__` as the nesting
//!    separator, e.g. `COURIER__POOL__SIZE=20` sets `pool.size`

use courier_runtime::{
    ConfigurationError, Destination, IsolationLevel, PoolSettings, TransactionOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Prefix of the environment variables read by [`TransportConfig::load`]
pub const ENV_PREFIX: &str = "COURIER";

/// Settings for a [`Transport`](crate::Transport)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Queue the workers receive from, as an alias or `QUEUE@MANAGER/HOST/PORT/CHANNEL`
    pub input_queue: String,

    /// Queue that receives messages which cannot be processed
    pub error_queue: String,

    /// Queue every received message is copied to before processing
    pub forward_received_messages_to: Option<String>,

    /// Workers started by `start`
    pub number_of_worker_threads: usize,

    /// Failed attempts after which a message is dead-lettered.
    /// Only counted when the transport is transactional.
    pub max_retries: u32,

    /// Receive, processing and sends of each cycle share one transaction
    pub is_transactional: bool,

    pub isolation_level: IsolationLevel,

    pub transaction_timeout_seconds: u64,

    /// Drain the input queue before the workers start
    pub purge_on_startup: bool,

    /// Hand the raw body bytes to the application instead of decoding them
    pub skip_deserialization: bool,

    /// Longest a worker waits for a message before starting a new cycle
    pub milliseconds_to_wait_for_message: u64,

    /// Logical queue names mapped to destination strings
    pub aliases: HashMap<String, String>,

    pub pool: PoolSettings,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            input_queue: String::new(),
            error_queue: String::new(),
            forward_received_messages_to: None,
            number_of_worker_threads: 1,
            max_retries: 5,
            is_transactional: false,
            isolation_level: IsolationLevel::default(),
            transaction_timeout_seconds: 60,
            purge_on_startup: false,
            skip_deserialization: false,
            milliseconds_to_wait_for_message: 10_000,
            aliases: HashMap::new(),
            pool: PoolSettings::default(),
        }
    }
}

impl TransportConfig {
    pub fn new(input_queue: impl Into<String>, error_queue: impl Into<String>) -> Self {
        Self {
            input_queue: input_queue.into(),
            error_queue: error_queue.into(),
            ..Self::default()
        }
    }

    /// Load from an optional file overlaid with `COURIER__` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading transport configuration from file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Check that the configured destinations resolve and the limits make sense
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.input_queue.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "input_queue".to_string(),
            });
        }
        if self.error_queue.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "error_queue".to_string(),
            });
        }

        self.destination(&self.input_queue)?;
        self.destination(&self.error_queue)?;
        if let Some(forward) = &self.forward_received_messages_to {
            self.destination(forward)?;
        }

        if self.is_transactional && self.transaction_timeout_seconds == 0 {
            return Err(ConfigurationError::Invalid {
                message: "transaction timeout must be greater than zero".to_string(),
            });
        }

        self.pool.validate()
    }

    /// Look `name` up in the alias table, falling back to `name` itself
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Resolve an alias and parse the resulting destination string
    pub fn destination(&self, name: &str) -> Result<Destination, ConfigurationError> {
        self.resolve(name).parse()
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.milliseconds_to_wait_for_message)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_seconds)
    }

    /// Options for the transaction wrapping each receive cycle
    pub fn transaction_options(&self) -> TransactionOptions {
        TransactionOptions {
            isolation_level: self.isolation_level,
            timeout: Some(self.transaction_timeout()),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
