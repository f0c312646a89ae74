//! Passive trigger listener.
//!
//! The headunit announces itself by opening a TCP connection to the trigger
//! port. The connection carries no payload: it is closed right away and the
//! peer address is reported as the discovered host.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, TRIGGER_PORT};
use crate::error::{DiscoveryError, Result};
use crate::source::{emit, DiscoveryEvent, DiscoverySource, EventSink, SourceKind};

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

const LISTEN_BACKLOG: u32 = 16;

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Accepts announcement connections on the trigger port.
pub struct TriggerListener {
    bind_addr: SocketAddr,
    events: EventSink,
    running: Option<Running>,
}

impl TriggerListener {
    /// Creates a listener for `0.0.0.0:<port>`.
    pub fn new(port: u16, events: EventSink) -> Self {
        Self::with_bind_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), events)
    }

    /// Creates a listener on the default trigger port.
    pub fn with_default_port(events: EventSink) -> Self {
        Self::new(TRIGGER_PORT, events)
    }

    /// Creates a listener for an explicit local address.
    pub fn with_bind_addr(bind_addr: SocketAddr, events: EventSink) -> Self {
        Self {
            bind_addr,
            events,
            running: None,
        }
    }

    /// Address actually bound, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    fn bind(&self) -> Result<TcpListener> {
        let bind_err = |source| DiscoveryError::Bind {
            what: "trigger listener",
            addr: self.bind_addr,
            source,
        };

        let socket = if self.bind_addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;

        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(self.bind_addr).map_err(bind_err)?;
        socket.listen(LISTEN_BACKLOG).map_err(bind_err)
    }
}

impl DiscoverySource for TriggerListener {
    fn kind(&self) -> SourceKind {
        SourceKind::Trigger
    }

    fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        tokio::runtime::Handle::try_current()
            .map_err(|e| DiscoveryError::Runtime(e.to_string()))?;

        let listener = self.bind()?;
        let local_addr = listener.local_addr()?;
        info!("Trigger listener started on {}", local_addr);

        let token = CancellationToken::new();
        let handle = tokio::spawn(accept_loop(
            listener,
            local_addr.port(),
            self.events.clone(),
            token.clone(),
        ));

        self.running = Some(Running {
            token,
            handle,
            local_addr,
        });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.token.cancel();
            // Aborting drops the listener, which closes the socket.
            running.handle.abort();
            info!("Trigger listener stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for TriggerListener {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.token.cancel();
            running.handle.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    trigger_port: u16,
    events: EventSink,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                drop(stream);
                info!("Trigger received from {}", peer.ip());
                emit(
                    &events,
                    &token,
                    DiscoveryEvent::Found {
                        source: SourceKind::Trigger,
                        endpoint: Endpoint::new(peer.ip(), trigger_port),
                    },
                );
            }
            Err(e) => {
                warn!("Trigger accept failed: {}", e);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                }
            }
        }
    }
    debug!("Trigger accept loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    fn loopback_listener(events: EventSink) -> TriggerListener {
        TriggerListener::with_bind_addr("127.0.0.1:0".parse().unwrap(), events)
    }

    #[tokio::test]
    async fn test_trigger_reports_peer_and_closes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener = loopback_listener(tx);
        listener.start().unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            DiscoveryEvent::Found {
                source: SourceKind::Trigger,
                endpoint: Endpoint::new("127.0.0.1".parse().unwrap(), addr.port()),
            }
        );

        // The listener hung up without sending anything.
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        listener.stop();
    }

    #[tokio::test]
    async fn test_every_connection_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener = loopback_listener(tx);
        listener.start().unwrap();
        let addr = listener.local_addr().unwrap();

        for _ in 0..3 {
            let _ = TcpStream::connect(addr).await.unwrap();
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(event, DiscoveryEvent::Found { source: SourceKind::Trigger, .. }));
        }

        listener.stop();
    }

    #[tokio::test]
    async fn test_stop_closes_socket() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut listener = loopback_listener(tx);
        listener.start().unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(listener.is_running());

        listener.stop();
        listener.stop();
        assert!(!listener.is_running());
        assert!(listener.local_addr().is_none());

        // Give the runtime a moment to drop the aborted task.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener = loopback_listener(tx);

        listener.start().unwrap();
        listener.stop();
        listener.start().unwrap();

        let addr = listener.local_addr().unwrap();
        let _ = TcpStream::connect(addr).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(event.is_some());
        listener.stop();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut listener = TriggerListener::with_bind_addr(addr, tx);
        let err = listener.start().unwrap_err();
        assert!(matches!(err, DiscoveryError::Bind { what: "trigger listener", .. }));
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut listener = loopback_listener(tx);
        assert!(matches!(listener.start(), Err(DiscoveryError::Runtime(_))));
    }
}
