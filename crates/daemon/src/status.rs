//! Connection-status oracle.
//!
//! Tells the selector whether a projection session is already active, so that
//! discovery is skipped (or a lost session noticed) without relying on the
//! relay alone.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

/// Default time a status command may take.
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(3);

/// Reports whether a projection session is currently active.
pub trait ConnectionStatus: Send + Sync {
    fn is_connected<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

/// Oracle with no knowledge; never reports a connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStatus;

impl ConnectionStatus for NoStatus {
    fn is_connected<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async { false })
    }
}

/// Oracle backed by a program: exit status 0 means connected.
#[derive(Debug, Clone)]
pub struct CommandStatus {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandStatus {
    /// Returns `None` for an empty command line.
    pub fn new(argv: Vec<String>) -> Option<Self> {
        if argv.first().map_or(true, |program| program.is_empty()) {
            return None;
        }
        Some(Self {
            argv,
            timeout: DEFAULT_STATUS_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl ConnectionStatus for CommandStatus {
    fn is_connected<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            let Some((program, args)) = self.argv.split_first() else {
                return false;
            };

            let status = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status();

            match tokio::time::timeout(self.timeout, status).await {
                Ok(Ok(status)) => status.success(),
                Ok(Err(e)) => {
                    debug!("Status command {} failed to run: {}", program, e);
                    false
                }
                Err(_) => {
                    debug!("Status command {} timed out", program);
                    false
                }
            }
        })
    }
}

/// Builds the oracle described by a configured command line.
pub fn from_command(argv: &[String]) -> Box<dyn ConnectionStatus> {
    match CommandStatus::new(argv.to_vec()) {
        Some(status) => Box::new(status),
        None => Box::new(NoStatus),
    }
}
