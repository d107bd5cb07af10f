use crate::error::Error;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Configuration for a single logical connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL (ws:// or wss://). Required before `connect()`.
    pub url: Option<String>,
    /// Whether to reconnect automatically after unintentional closes
    pub reconnect: bool,
    /// Consecutive failed attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Capacity of the outbound queue used while not connected
    pub queue_capacity: usize,
    /// Hard deadline for the auth handshake after socket open
    pub auth_timeout: Duration,
    /// Timeout for establishing the socket itself
    pub connect_timeout: Duration,
    /// Backoff settings for reconnection
    pub backoff: BackoffConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: None,
            reconnect: true,
            max_reconnect_attempts: 10,
            queue_capacity: 100,
            auth_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Create a new builder for configuration
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// Default configuration pointing at the given URL
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Built-in environment default for a connection type.
    ///
    /// Reads the URL from `WS_URL_<NAME>` with the name uppercased and
    /// non-alphanumeric characters mapped to `_`. Returns `None` when the
    /// variable is unset, so callers can fall through to an explicit error.
    pub fn from_env(name: &str) -> Option<Self> {
        let var = env_var_for(name);
        std::env::var(&var).ok().map(Self::with_url)
    }

    /// Validate and return the URL for dialing.
    pub(crate) fn validated_url(&self) -> Result<String, Error> {
        let url = self.url.as_deref().ok_or(Error::MissingUrl)?;
        let parsed = Url::parse(url).map_err(|e| Error::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        match parsed.scheme() {
            "ws" | "wss" => Ok(url.to_string()),
            scheme => Err(Error::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme \"{}\"", scheme),
            }),
        }
    }
}

/// Environment variable name used for the built-in URL default
fn env_var_for(name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("WS_URL_{}", suffix)
}

/// Builder for ConnectionConfig
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Set the WebSocket URL
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = Some(url.into());
        self
    }

    /// Enable or disable auto-reconnection
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect = enabled;
        self
    }

    /// Set the maximum number of consecutive reconnect attempts
    pub fn max_reconnect_attempts(mut self, max: u32) -> Self {
        self.config.max_reconnect_attempts = max;
        self
    }

    /// Set the outbound queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the auth handshake timeout
    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.config.auth_timeout = timeout;
        self
    }

    /// Set the socket connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Build the configuration with validation.
    ///
    /// Returns an error for invalid configurations (e.g., queue capacity 0).
    pub fn build(self) -> Result<ConnectionConfig, ConfigError> {
        if self.config.queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity(
                "queue_capacity cannot be 0".to_string(),
            ));
        }

        if self.config.auth_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "auth_timeout cannot be zero".to_string(),
            ));
        }

        if self.config.backoff.max_delay < self.config.backoff.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }

        if self.config.backoff.multiplier <= 0.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be > 0".to_string(),
            ));
        }

        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid queue capacity
    #[error("Invalid queue capacity: {0}")]
    InvalidQueueCapacity(String),
    /// Invalid timeout
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay before the first reconnection attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            // The handshake protocol specifies deterministic delays
            jitter: false,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }
}

/// Pool-level configuration: per-name connection defaults.
///
/// Resolution order when `connect(name, config)` runs is explicit config,
/// then this map, then the `WS_URL_<NAME>` environment default.
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    defaults: HashMap<String, ConnectionConfig>,
}

impl PoolConfig {
    /// Create an empty pool configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a default configuration for a connection type
    pub fn with_default(mut self, name: impl Into<String>, config: ConnectionConfig) -> Self {
        self.defaults.insert(name.into(), config);
        self
    }

    pub(crate) fn default_for(&self, name: &str) -> Option<&ConnectionConfig> {
        self.defaults.get(name)
    }
}
