//! IPC message types for CLI-daemon communication.
//!
//! Requests and responses are serialized as one JSON object per line.

use serde::{Deserialize, Serialize};

use crate::strategy::{ConnectionMode, SelectorState};

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the selector state.
    Status,
    /// (Re)start discovery in the given mode.
    Start { mode: ConnectionMode },
    /// Stop discovery and any relay; the daemon keeps running.
    Stop,
    /// Request the daemon to exit.
    Shutdown,
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        /// Whether the daemon is running.
        running: bool,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Selector state.
        state: SelectorState,
        /// Active connection mode, if discovery is started.
        mode: Option<ConnectionMode>,
        /// Whether the launch guard is held.
        engaged: bool,
        /// Loopback port of the relay, if one is running.
        relay_port: Option<u16>,
    },
    /// Discovery was started.
    Started { mode: ConnectionMode },
    /// Discovery was stopped.
    Stopped,
    /// Acknowledgment that the daemon is exiting.
    ShuttingDown,
    /// An error occurred processing the request.
    Error {
        /// Human-readable error message.
        message: String,
    },
}
