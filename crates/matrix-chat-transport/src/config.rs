//! Server configuration.

use std::time::Duration;

use thiserror::Error;

/// Errors found when validating a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Host must not be empty")]
    EmptyHost,
    #[error("Outbound queue capacity must be at least 1")]
    ZeroQueueCapacity,
    #[error("Broadcast queue capacity must be at least 1")]
    ZeroBroadcastCapacity,
    #[error("Delivery timeout must be positive")]
    ZeroDeliveryTimeout,
    #[error("Maximum line length must be at least 1")]
    ZeroLineLength,
}

/// Settings for one chat server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host or address to bind to.
    pub host: String,
    /// Port to listen on; 0 picks a free port.
    pub port: u16,
    /// Lines buffered per session before the hub starts waiting.
    pub outbound_queue_capacity: usize,
    /// Broadcasts waiting for delivery before submitters have to wait.
    pub broadcast_queue_capacity: usize,
    /// How long the hub waits on a full session queue before force-closing it.
    pub delivery_timeout: Duration,
    /// Longest accepted input line in bytes.
    pub max_line_length: usize,
}

impl ServerConfig {
    /// `host:port` for logging and error messages. IPv6 hosts are bracketed.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.broadcast_queue_capacity == 0 {
            return Err(ConfigError::ZeroBroadcastCapacity);
        }
        if self.delivery_timeout.is_zero() {
            return Err(ConfigError::ZeroDeliveryTimeout);
        }
        if self.max_line_length == 0 {
            return Err(ConfigError::ZeroLineLength);
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7878,
            outbound_queue_capacity: 64,
            broadcast_queue_capacity: 256,
            delivery_timeout: Duration::from_secs(2),
            max_line_length: 8192,
        }
    }
}
