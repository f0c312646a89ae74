//! IPC server: accepts CLI connections on a Unix socket and dispatches their
//! requests to the strategy selector.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{IpcRequest, IpcResponse};
use crate::strategy::StrategySelector;

/// Pause after a failed accept, so a persistent error (e.g. out of file
/// descriptors) does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A server that listens for IPC connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Parent directories are created and a stale socket file is replaced.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }

    /// Accepts connections and answers their requests until `token` is
    /// cancelled. Each connection runs on its own task.
    pub async fn serve(self, handler: Arc<RequestHandler>, token: CancellationToken) {
        info!("IPC server listening on {:?}", self.path);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                result = self.accept() => match result {
                    Ok(conn) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(handle_connection(conn, handler));
                    }
                    Err(e) => {
                        warn!("Failed to accept IPC connection: {}", e);
                        if !back_off(&token).await {
                            break;
                        }
                    }
                },
            }
        }
        debug!("IPC server stopped");
    }
}

/// Waits out [`ACCEPT_RETRY_DELAY`]. Returns false if cancelled first.
async fn back_off(token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_connection(mut conn: IpcConnection, handler: Arc<RequestHandler>) {
    loop {
        let request = match conn.read_request().await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(IpcError::Json(e)) => {
                let response = IpcResponse::Error {
                    message: format!("invalid request: {}", e),
                };
                if conn.send_response(&response).await.is_err() {
                    break;
                }
                continue;
            }
            Err(e) => {
                debug!("IPC connection closed: {}", e);
                break;
            }
        };

        debug!("IPC request: {:?}", request);
        let response = handler.handle(request).await;
        if let Err(e) = conn.send_response(&response).await {
            debug!("Failed to send IPC response: {}", e);
            break;
        }
    }
}

/// Answers IPC requests on behalf of the daemon.
pub struct RequestHandler {
    selector: Arc<StrategySelector>,
    started_at: Instant,
    shutdown: CancellationToken,
}

impl RequestHandler {
    /// `shutdown` is cancelled when a client asks the daemon to exit.
    pub fn new(selector: Arc<StrategySelector>, shutdown: CancellationToken) -> Self {
        Self {
            selector,
            started_at: Instant::now(),
            shutdown,
        }
    }

    pub async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => {
                let status = self.selector.status().await;
                IpcResponse::Status {
                    running: true,
                    uptime_secs: self.started_at.elapsed().as_secs(),
                    state: status.state,
                    mode: status.mode,
                    engaged: status.launch_engaged,
                    relay_port: status.relay_port,
                }
            }
            IpcRequest::Start { mode } => match self.selector.start(mode).await {
                Ok(()) => IpcResponse::Started { mode },
                Err(e) => IpcResponse::Error {
                    message: e.to_string(),
                },
            },
            IpcRequest::Stop => {
                self.selector.stop().await;
                IpcResponse::Stopped
            }
            IpcRequest::Shutdown => {
                info!("Shutdown requested over IPC");
                self.shutdown.cancel();
                IpcResponse::ShuttingDown
            }
        }
    }
}

/// A connection to an IPC client.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request from the client. `None` once the client hung up.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        let request = serde_json::from_str(line.trim())?;
        Ok(Some(request))
    }

    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        Ok(())
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
