//! # Wireless Helper Discovery Library
//!
//! This crate finds a headunit offering the wireless projection service on the
//! local network and provides the local TCP relay used when the consumer cannot
//! address the headunit directly.
//!
//! ## Overview
//!
//! - **Port Prober**: bounded-timeout TCP reachability checks
//! - **Active Scanner**: gateway-first, then full-subnet probing
//! - **Trigger Listener**: passive TCP port where the headunit announces itself
//! - **Directory Listener**: mDNS / DNS-SD browsing for the service type
//! - **Relay Proxy**: loopback TCP bridge to the discovered endpoint
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │ActiveScanner │  │TriggerListen.│  │DirectoryList.│   DiscoverySource
//! └──────┬───────┘  └──────┬───────┘  └──────┬───────┘
//!        │                 │                 │
//!        └────── DiscoveryEvent (mpsc) ──────┘
//!                          │
//!                          ▼
//!                  launch coordinator  ──►  RelayProxy (optional)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use discovery::probe::{PortProber, TcpProber};
//!
//! # async fn run() {
//! let prober = TcpProber;
//! let host = "192.168.1.1".parse().unwrap();
//! if prober.probe(host, 5289, Duration::from_millis(300)).await {
//!     println!("headunit answers on 5289");
//! }
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`endpoint`]: endpoint type and well-known ports
//! - [`probe`]: port prober and busy check
//! - [`inventory`]: local interface and gateway enumeration
//! - [`scanner`]: active network scanner
//! - [`trigger`]: passive trigger listener
//! - [`directory`]: service directory listener
//! - [`relay`]: relay proxy
//! - [`source`]: discovery source capability and events
//! - [`error`]: error types

pub mod directory;
pub mod endpoint;
pub mod error;
pub mod inventory;
pub mod probe;
pub mod relay;
pub mod scanner;
pub mod source;
pub mod trigger;

pub use directory::{
    Announcement, DirectoryConfig, DirectoryListener, MdnsDirectory, ServiceDirectory,
    DEFAULT_SERVICE_TYPE, DEFAULT_TYPE_FILTER,
};
pub use endpoint::{
    Endpoint, LEGACY_DISCOVERY_PORT, PRIMARY_DISCOVERY_PORT, SERVICE_PORT, TRIGGER_PORT,
};
pub use error::{DiscoveryError, Result};
pub use inventory::{InterfaceAddr, NetworkInventory, SystemInventory};
pub use probe::{check_busy, BusyState, PortProber, TcpProber, DEFAULT_PROBE_TIMEOUT};
pub use relay::{RelayEvent, RelayProxy, RELAY_BUFFER_SIZE};
pub use scanner::{ActiveScanner, ScanConfig};
pub use source::{DiscoveryEvent, DiscoverySource, EventSink, SourceKind};
pub use trigger::TriggerListener;
