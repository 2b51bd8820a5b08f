//! Configuration for the client engine.

use canopy_sync_protocol::PROTOCOL_VERSION;
use rand::Rng;
use std::time::Duration;

/// Default number of attempts a transaction makes before giving up.
pub const DEFAULT_TRANSACTION_RETRIES: u32 = 25;

/// Configuration for a database instance.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Base URL of the database, e.g. `https://demo.canopy.test`.
    pub database_url: String,
    /// Namespace served at the URL.
    pub namespace: String,
    /// Attempts a transaction makes before failing with
    /// [`SyncError::MaxRetriesExceeded`](crate::SyncError::MaxRetriesExceeded).
    pub max_transaction_retries: u32,
    /// Reconnect behavior.
    pub reconnect: RetryConfig,
    /// Protocol version.
    pub protocol_version: u16,
}

impl DatabaseConfig {
    /// Creates a configuration for `database_url`. The namespace defaults to
    /// the first label of the host.
    pub fn new(database_url: impl Into<String>) -> Self {
        let database_url = database_url.into().trim_end_matches('/').to_string();
        let namespace = host_of(&database_url)
            .split(['.', ':'])
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            database_url,
            namespace,
            max_transaction_retries: DEFAULT_TRANSACTION_RETRIES,
            reconnect: RetryConfig::default(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Sets the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the transaction attempt ceiling.
    pub fn with_max_transaction_retries(mut self, attempts: u32) -> Self {
        self.max_transaction_retries = attempts.max(1);
        self
    }

    /// Sets the reconnect configuration.
    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the protocol version.
    pub fn with_protocol_version(mut self, version: u16) -> Self {
        self.protocol_version = version;
        self
    }

    /// Host (and port) of the database URL.
    pub fn host(&self) -> &str {
        host_of(&self.database_url)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::new("https://localhost")
    }
}

/// Returns the authority part of `url`.
pub(crate) fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    &rest[..end]
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // up to 25%
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(10)
    }
}
