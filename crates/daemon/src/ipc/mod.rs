//! Unix Domain Socket IPC between the CLI and a running daemon.
//!
//! The protocol is newline-delimited JSON: one [`IpcRequest`] per line from
//! the client, one [`IpcResponse`] per line back.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/wireless-helper/daemon.sock`
//! - Fallback: `/tmp/wireless-helper-$UID/daemon.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{IpcClient, get_socket_path};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!
//!     if client.ping().await? {
//!         println!("Daemon is running");
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse};
pub use server::{IpcConnection, IpcError, IpcServer, RequestHandler};

use std::path::PathBuf;

/// Directory name used under the runtime directory.
const SOCKET_DIR_NAME: &str = "wireless-helper";

/// Get the socket path for IPC communication.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/wireless-helper/daemon.sock`
/// 2. Otherwise: `/tmp/wireless-helper-$UID/daemon.sock`
#[cfg(unix)]
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) if !runtime_dir.is_empty() => PathBuf::from(runtime_dir)
            .join(SOCKET_DIR_NAME)
            .join("daemon.sock"),
        _ => {
            // UID of the owner of our own /proc entry
            let uid = std::fs::metadata("/proc/self")
                .map(|m| m.uid())
                .unwrap_or(0);

            PathBuf::from(format!("/tmp/{}-{}", SOCKET_DIR_NAME, uid)).join("daemon.sock")
        }
    }
}

#[cfg(not(unix))]
pub fn get_socket_path() -> PathBuf {
    PathBuf::from(format!("/tmp/{}-unsupported/daemon.sock", SOCKET_DIR_NAME))
}
