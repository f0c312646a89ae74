//! # Wireless Helper Daemon Library
//!
//! Finds a projection headunit on the local network and hands the session to
//! the platform's projection client, at most one launch at a time.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Strategy Selector                          │
//! │         (mode → sources, state machine, status polling)         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │ Active       │  │   Trigger    │  │  Service Directory   │  │
//! │  │ Scanner      │  │   Listener   │  │  Listener            │  │
//! │  └──────┬───────┘  └──────┬───────┘  └──────────┬───────────┘  │
//! │         └────────── Found(host, port) ──────────┘              │
//! │                            │                                    │
//! │  ┌─────────────────────────▼──────────────────────────────────┐ │
//! │  │          Launch Coordinator (single-flight guard)          │ │
//! │  └──────────────┬─────────────────────────────┬───────────────┘ │
//! │                 │                             │                 │
//! │  ┌──────────────▼──────┐        ┌─────────────▼──────────────┐  │
//! │  │    Relay Proxy      │        │     Platform Handoff       │  │
//! │  └─────────────────────┘        └────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, ConnectionMode, StrategySelector};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let selector = StrategySelector::from_config(&config)?;
//!     selector.start(ConnectionMode::PhoneHotspot).await?;
//!
//!     // ... wait for a shutdown signal ...
//!
//!     selector.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`handoff`]: Starting the projection client against an endpoint
//! - [`status`]: Connection-status oracle
//! - [`launch`]: Single-flight launch coordinator
//! - [`strategy`]: Connection modes and the selector state machine
//! - [`ipc`]: CLI-daemon communication over a Unix socket

pub mod config;
pub mod handoff;
pub mod ipc;
pub mod launch;
pub mod status;
pub mod strategy;

// Re-export the discovery crate for convenience
pub use discovery;

pub use config::Config;

pub use handoff::{
    CommandHandoff, HandoffError, HandoffTarget, LogHandoff, NetworkContextHint, PlatformHandoff,
};

pub use status::{CommandStatus, ConnectionStatus, NoStatus};

pub use launch::{
    LaunchCoordinator, LaunchError, LaunchEvent, LaunchGuard, LaunchOutcome, LaunchSettings,
    SourceSet,
};

pub use strategy::{
    ConnectionMode, RelayPolicy, SelectorError, SelectorSettings, SelectorState, SelectorStatus,
    SourceFactory, StrategySelector, SystemSources,
};
