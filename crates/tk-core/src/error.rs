//! Core error types for tunnelkeeper

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the secure transport or the local network
#[derive(Error, Debug)]
pub enum TransportError {
    /// The secure session has ended (or is ending)
    #[error("Secure session closed")]
    SessionClosed,

    /// A local socket operation failed
    #[error("Network operation on {address} failed: {source}")]
    Io {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The remote side refused a request (forward or channel open)
    #[error("Request rejected by remote: {0}")]
    Rejected(String),

    /// SSH protocol level failure
    #[error("SSH error: {0}")]
    Protocol(String),

    /// Authentication was rejected by the server
    #[error("Authentication rejected for user '{0}'")]
    AuthRejected(String),

    /// Host key verification failed
    #[error("Host key verification failed: {0}")]
    HostKeyRejected(String),

    /// Operation did not complete in time
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl TransportError {
    /// Build an I/O error tagged with the address it concerned
    pub fn io(address: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            address: address.into(),
            source,
        }
    }

    /// Whether this error means the secure session is gone
    pub fn is_session_end(&self) -> bool {
        matches!(self, Self::SessionClosed)
    }

    /// Whether this error came from a socket-level network operation
    pub fn is_network_operation(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

/// How a failure should be handled by a retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying is futile; give up immediately
    Fatal,
    /// Worth another attempt after the retry interval
    Transient,
}

/// Errors parsing a tunnel description such as `L 8080:127.0.0.1:80`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    /// No direction marker before the addresses
    #[error("Unable to find tunnel type in '{0}'")]
    MissingDirection(String),

    /// Direction marker is not L/-L/R/-R
    #[error("Unknown tunnel type: '{0}'")]
    UnknownDirection(String),

    /// Address part does not have 3 or 4 colon separated fields
    #[error("Unable to parse addresses from '{0}'")]
    BadAddresses(String),

    /// A port field is not a valid port number
    #[error("Invalid port '{0}'")]
    BadPort(String),

    /// A host field is empty
    #[error("Empty host in '{0}'")]
    EmptyHost(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Tunnel description error
    #[error("Bad tunnel: {0}")]
    Tunnel(#[from] SpecError),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
