//! Unified error types for pcmhub

use thiserror::Error;

/// Main error type for hub operations
#[derive(Error, Debug)]
pub enum HubError {
    /// Client limit reached
    #[error("Client limit reached ({max} clients)")]
    CapacityExceeded { max: usize },

    /// Client handles could not be prepared for non-blocking I/O
    #[error("Client setup failed: {0}")]
    ClientSetup(#[source] std::io::Error),

    /// Client buffer could not be initialized
    #[error("Client initialization failed: {0}")]
    ClientInit(String),

    /// Worker thread could not be started
    #[error("Cannot create hub worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// Invalid configuration or stream format
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Hub has been destroyed and accepts no more clients
    #[error("Hub has been destroyed")]
    Destroyed,
}

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, HubError>;

impl HubError {
    /// Create a client initialization error with context
    pub fn client_init(message: impl Into<String>) -> Self {
        Self::ClientInit(message.into())
    }

    /// Check if this error is recoverable (the same request may succeed later)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HubError::CapacityExceeded { .. } | HubError::ClientInit(_) | HubError::Spawn(_)
        )
    }
}

/// Configuration file errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for HubError {
    fn from(e: ConfigError) -> Self {
        HubError::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(HubError::CapacityExceeded { max: 32 }.is_recoverable());
        assert!(HubError::client_init("out of memory").is_recoverable());
        assert!(!HubError::Destroyed.is_recoverable());
        assert!(!HubError::InvalidConfig("zero channels".into()).is_recoverable());
    }

    #[test]
    fn test_config_error_converts() {
        let err: HubError = ConfigError::Invalid("buffer_periods must be > 0".into()).into();
        assert!(matches!(err, HubError::InvalidConfig(msg) if msg.contains("buffer_periods")));
    }
}
