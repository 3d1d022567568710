//! Error types for configuration and startup.
//!
//! Admission denials are not errors; see [`crate::security::rejection::Rejection`].

use thiserror::Error;

/// Errors raised while loading or replacing configuration and while booting the server.
#[derive(Error, Debug)]
pub enum GateError {
    /// Configuration source could not be read or deserialized
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A security threshold failed validation
    #[error("Invalid security configuration: {0}")]
    InvalidSecurityConfig(String),

    /// A whitelist entry is neither an address range nor a usable substring
    #[error("Invalid whitelist entry '{0}'")]
    InvalidWhitelistEntry(String),

    /// An address argument could not be parsed
    #[error("Invalid IP address '{0}'")]
    InvalidAddress(String),

    /// Socket or signal setup failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gate setup operations
pub type GateResult<T> = Result<T, GateError>;
