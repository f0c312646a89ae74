//! Discovered endpoints and the well-known ports of the projection service.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Port the wireless launcher on the headunit listens on. Probed first.
pub const PRIMARY_DISCOVERY_PORT: u16 = 5289;

/// Port of older headunit server builds. Probed after the primary port.
pub const LEGACY_DISCOVERY_PORT: u16 = 5277;

/// Port the local trigger listener binds; the headunit connects here to
/// announce itself.
pub const TRIGGER_PORT: u16 = 5289;

/// Port of the projection service the consumer is handed off to.
pub const SERVICE_PORT: u16 = 5288;

/// A candidate `(host, port)` reported by a discovery source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: IpAddr,
    port: u16,
}

impl Endpoint {
    /// Creates a new endpoint.
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self { host, port }
    }

    /// The host address.
    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// The port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the same host with a different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.host, port)
    }

    /// The socket address to connect to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}
