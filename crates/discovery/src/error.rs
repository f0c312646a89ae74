//! Error types for the discovery crate.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Discovery error type covering the failures a source or relay can surface
/// to its owner. Transient per-connection errors never reach this type; they
/// are logged and recovered where they happen.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// A listening socket could not be set up.
    #[error("failed to bind {what} on {addr}: {source}")]
    Bind {
        /// Which component tried to bind.
        what: &'static str,
        /// Requested local address.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The local network configuration could not be read.
    #[error("network inventory unavailable: {0}")]
    Inventory(String),

    /// The service directory rejected a browse request.
    #[error("service directory error: {0}")]
    Directory(String),

    /// Operation requires a running tokio runtime.
    #[error("no async runtime available: {0}")]
    Runtime(String),

    /// Generic I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

impl From<mdns_sd::Error> for DiscoveryError {
    fn from(err: mdns_sd::Error) -> Self {
        DiscoveryError::Directory(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_display() {
        let err = DiscoveryError::Bind {
            what: "trigger listener",
            addr: "0.0.0.0:5289".parse().unwrap(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        };
        let msg = err.to_string();
        assert!(msg.contains("trigger listener"));
        assert!(msg.contains("0.0.0.0:5289"));
        assert!(msg.contains("address in use"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err: DiscoveryError = io_err.into();
        assert!(matches!(err, DiscoveryError::Io(_)));
    }
}
