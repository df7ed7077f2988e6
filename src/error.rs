//! Error types for the zproxy application.
//!
//! Errors fall into three groups with different propagation rules:
//! per-request rewrite/dial failures, cycle-local refresh failures, and
//! startup configuration failures (the only fatal ones).

use crate::socks::Reply;
use thiserror::Error;

/// Main error type for the zproxy application.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Requested address is not a valid `host:port` pair.
    #[error("Invalid address: {address}")]
    InvalidAddress { address: String },

    /// Host is an IP literal and IP literals are not permitted.
    #[error("IP literal hosts are not allowed: {host}")]
    DisallowedIp { host: String },

    /// Host does not end with the configured virtual domain suffix.
    #[error("domain must end with {suffix}: {host}")]
    SuffixMismatch { host: String, suffix: String },

    /// Store-backed lookup found no entry for the name.
    #[error("zeabur service not found: {key}")]
    UnknownVirtualName { key: String },

    /// The configured server id is not present in the fetched topology.
    #[error("server with ID {server_id} does not exist")]
    UnknownTarget { server_id: String },

    /// Remote topology request failed (transport or non-success status).
    #[error("Topology fetch failed: {message}")]
    FetchFailure { message: String },

    /// Remote topology response could not be decoded.
    #[error("Topology decode failed: {message}")]
    DecodeFailure { message: String },

    /// Configuration file could not be found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}")]
    ConfigValidation { message: String },

    /// Malformed SOCKS5 traffic from a client.
    #[error("SOCKS5 protocol error: {message}")]
    Protocol { message: String },

    /// SOCKS5 command other than CONNECT.
    #[error("Unsupported SOCKS5 command: {0:#04x}")]
    UnsupportedCommand(u8),

    /// SOCKS5 address type outside IPv4/IPv6/domain.
    #[error("Unsupported SOCKS5 address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Client offered no acceptable auth method or wrong credentials.
    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    /// Outbound connect did not complete in time.
    #[error("Connect to {address} timed out")]
    ConnectTimeout { address: String },

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Creates a new invalid address error.
    pub fn invalid_address(address: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
        }
    }

    /// Creates a new fetch failure.
    pub fn fetch_failure(message: impl Into<String>) -> Self {
        Self::FetchFailure {
            message: message.into(),
        }
    }

    /// Creates a new decode failure.
    pub fn decode_failure(message: impl Into<String>) -> Self {
        Self::DecodeFailure {
            message: message.into(),
        }
    }

    /// Creates a new configuration parse error.
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    /// Creates a new configuration validation error.
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Creates a new protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a new authentication error.
    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed {
            message: message.into(),
        }
    }

    /// Whether this error fails a single connection attempt only.
    pub fn is_rewrite_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidAddress { .. }
                | Self::DisallowedIp { .. }
                | Self::SuffixMismatch { .. }
                | Self::UnknownVirtualName { .. }
        )
    }

    /// Whether this error aborts a refresh cycle (and nothing more).
    pub fn is_refresh_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownTarget { .. } | Self::FetchFailure { .. } | Self::DecodeFailure { .. }
        )
    }

    /// The SOCKS5 reply reported to the client for this failure.
    pub fn reply(&self) -> Reply {
        match self {
            Self::DisallowedIp { .. } | Self::SuffixMismatch { .. } => Reply::NotAllowed,
            Self::InvalidAddress { .. } | Self::UnknownVirtualName { .. } => {
                Reply::HostUnreachable
            }
            Self::ConnectTimeout { .. } => Reply::HostUnreachable,
            Self::UnsupportedCommand(_) => Reply::CommandNotSupported,
            Self::UnsupportedAddressType(_) => Reply::AddressTypeNotSupported,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
                std::io::ErrorKind::TimedOut => Reply::HostUnreachable,
                _ => Reply::GeneralFailure,
            },
            _ => Reply::GeneralFailure,
        }
    }
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;
