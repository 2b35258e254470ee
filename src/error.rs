//! Error types for Nova WebExt
//!
//! Errors outside the extension contracts: configuration files and I/O.

use thiserror::Error;

/// Errors that can occur while setting up the runtime
#[derive(Debug, Error)]
pub enum NovaError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("Config parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("Config serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Result type alias for Nova operations
pub type NovaResult<T> = Result<T, NovaError>;
