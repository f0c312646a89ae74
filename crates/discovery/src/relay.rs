//! Loopback TCP relay to a discovered endpoint.
//!
//! Used when the consumer cannot address the headunit directly: the consumer
//! is handed `127.0.0.1:<local port>` and every connection it makes there is
//! bridged to the remote endpoint.
//!
//! Each bridge owns both sockets and runs two independent pumps. The relay
//! counts active bridges and reports the edges of that count:
//! [`RelayEvent::Connected`] when the first bridge since the count was last
//! zero reaches the remote, [`RelayEvent::Disconnected`] when the count drops
//! back to zero. A bridge whose remote connect fails still counts, so a lone
//! failed bridge produces `Disconnected` without a preceding `Connected`.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{DiscoveryError, Result};

/// Per-direction pump buffer size.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Data-path edges reported by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEvent {
    /// A bridge reached the remote while no other bridge was active.
    Connected,
    /// The last active bridge ended.
    Disconnected,
}

/// Bridge count and whether its current non-zero run was announced.
/// Updated and reported under one lock so edges go out in order.
#[derive(Debug, Default)]
struct BridgeCount {
    active: usize,
    announced: bool,
}

struct BridgeState {
    remote: SocketAddr,
    count: Mutex<BridgeCount>,
    events: mpsc::UnboundedSender<RelayEvent>,
    token: CancellationToken,
}

impl BridgeState {
    fn new(
        remote: SocketAddr,
        events: mpsc::UnboundedSender<RelayEvent>,
        token: CancellationToken,
    ) -> Self {
        Self {
            remote,
            count: Mutex::new(BridgeCount::default()),
            events,
            token,
        }
    }

    fn count(&self) -> MutexGuard<'_, BridgeCount> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> usize {
        self.count().active
    }

    fn acquire(&self) -> usize {
        let mut count = self.count();
        count.active += 1;
        count.active
    }

    fn established(&self) {
        let mut count = self.count();
        if !count.announced {
            count.announced = true;
            info!("Relay data path to {} established", self.remote);
            self.notify(RelayEvent::Connected);
        }
    }

    fn release(&self) {
        let mut count = self.count();
        count.active = count.active.saturating_sub(1);
        if count.active == 0 {
            count.announced = false;
            info!("All relay bridges to {} closed", self.remote);
            self.notify(RelayEvent::Disconnected);
        }
    }

    fn notify(&self, event: RelayEvent) {
        if self.token.is_cancelled() {
            return;
        }
        let _ = self.events.send(event);
    }
}

/// A running relay.
pub struct RelayProxy {
    local_addr: SocketAddr,
    state: Arc<BridgeState>,
    tracker: TaskTracker,
}

impl RelayProxy {
    /// Binds an ephemeral loopback port and starts relaying to `remote`.
    pub async fn start(remote: Endpoint, events: mpsc::UnboundedSender<RelayEvent>) -> Result<Self> {
        let bind_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| DiscoveryError::Bind {
                what: "relay proxy",
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(BridgeState::new(
            remote.socket_addr(),
            events,
            CancellationToken::new(),
        ));
        let tracker = TaskTracker::new();

        tracker.spawn(accept_loop(listener, Arc::clone(&state), tracker.clone()));
        info!("Relay listening on {} for {}", local_addr, remote);

        Ok(Self {
            local_addr,
            state,
            tracker,
        })
    }

    /// Loopback port the consumer should connect to.
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Full loopback address the relay listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The endpoint bridges connect to.
    pub fn remote(&self) -> Endpoint {
        Endpoint::from(self.state.remote)
    }

    /// Number of bridges currently alive.
    pub fn active_bridges(&self) -> usize {
        self.state.active()
    }

    /// Stops accepting, closes the listener and tears down all bridges.
    /// No events are delivered afterwards.
    pub fn stop(&self) {
        if self.state.token.is_cancelled() {
            return;
        }
        self.state.token.cancel();
        self.tracker.close();
        info!("Relay on {} stopped", self.local_addr);
    }

    /// Waits until the listener and every bridge have finished.
    pub async fn stopped(&self) {
        self.tracker.wait().await;
    }
}

impl Drop for RelayProxy {
    fn drop(&mut self) {
        self.state.token.cancel();
        self.tracker.close();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<BridgeState>, tracker: TaskTracker) {
    loop {
        let accepted = tokio::select! {
            _ = state.token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((consumer, peer)) => {
                let active = state.acquire();
                debug!("Relay accepted {} ({} active)", peer, active);
                tracker.spawn(run_bridge(consumer, Arc::clone(&state)));
            }
            Err(e) => {
                warn!("Relay accept failed: {}", e);
                tokio::select! {
                    _ = state.token.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                }
            }
        }
    }
    debug!("Relay accept loop exited");
}

async fn run_bridge(consumer: TcpStream, state: Arc<BridgeState>) {
    let connected = tokio::select! {
        _ = state.token.cancelled() => None,
        result = TcpStream::connect(state.remote) => Some(result),
    };

    match connected {
        Some(Ok(remote)) => {
            state.established();
            let _ = consumer.set_nodelay(true);
            let _ = remote.set_nodelay(true);

            let (consumer_rx, consumer_tx) = consumer.into_split();
            let (remote_rx, remote_tx) = remote.into_split();

            tokio::select! {
                _ = state.token.cancelled() => {
                    debug!("Bridge to {} cancelled", state.remote);
                }
                (up, down) = async {
                    tokio::join!(
                        pump(consumer_rx, remote_tx, "consumer -> remote"),
                        pump(remote_rx, consumer_tx, "remote -> consumer"),
                    )
                } => {
                    debug!("Bridge to {} finished ({} bytes up, {} bytes down)", state.remote, up, down);
                }
            }
        }
        Some(Err(e)) => {
            warn!("Relay could not reach {}: {}", state.remote, e);
            drop(consumer);
        }
        None => drop(consumer),
    }

    state.release();
}

/// Copies `from` into `to` until end of stream or an I/O error, then shuts
/// down the write side of `to`. Returns the number of bytes moved.
async fn pump<R, W>(mut from: R, mut to: W, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Relay {} read error: {}", direction, e);
                break;
            }
        };

        if let Err(e) = to.write_all(&buf[..n]).await {
            debug!("Relay {} write error: {}", direction, e);
            break;
        }
        if let Err(e) = to.flush().await {
            debug!("Relay {} flush error: {}", direction, e);
            break;
        }
        total += n as u64;
    }

    let _ = to.shutdown().await;
    total
}
