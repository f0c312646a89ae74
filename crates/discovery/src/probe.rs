//! Port probing and the pre-flight busy check.
//!
//! A probe answers one question: does `(host, port)` accept a TCP connection
//! within the timeout? The socket is closed as soon as the answer is known,
//! whatever the outcome. Probes never retry; retry policy belongs to callers.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Default connect timeout for discovery probes.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// Tests TCP reachability of a single `(host, port)` pair.
pub trait PortProber: Send + Sync {
    /// Returns true iff a TCP connection to `(host, port)` succeeds within
    /// `timeout`. Timeouts and connection errors both yield false.
    fn probe<'a>(
        &'a self,
        host: IpAddr,
        port: u16,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

/// Production prober backed by `tokio::net::TcpStream`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

impl PortProber for TcpProber {
    fn probe<'a>(
        &'a self,
        host: IpAddr,
        port: u16,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            let addr = SocketAddr::new(host, port);
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    drop(stream);
                    true
                }
                Ok(Err(e)) => {
                    debug!("Probe {} failed: {}", addr, e);
                    false
                }
                Err(_) => false,
            }
        })
    }
}

/// Probes `host` against `ports` in the given priority order and returns the
/// first port that answers. Remaining ports are skipped after a hit.
pub async fn probe_ports<P>(
    prober: &P,
    host: IpAddr,
    ports: &[u16],
    timeout: Duration,
) -> Option<u16>
where
    P: PortProber + ?Sized,
{
    for &port in ports {
        if prober.probe(host, port, timeout).await {
            return Some(port);
        }
    }
    None
}

/// Outcome of the pre-flight busy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyState {
    /// The service closed the connection straight away: it is already
    /// serving another consumer.
    Busy,
    /// The service held the connection open (waiting for a handshake), or
    /// could not be checked at all.
    Ready,
}

/// Checks whether the projection service at `addr` is already serving a
/// session.
///
/// A free service accepts the connection and waits silently for the client's
/// handshake, so the read times out. A busy service accepts and closes
/// immediately, so the read sees end-of-stream. Any failure to connect or read
/// is reported as [`BusyState::Ready`] so that the launch is attempted anyway.
pub async fn check_busy(
    addr: SocketAddr,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> BusyState {
    info!("Checking if headunit at {} is busy", addr);

    let mut stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            info!("Busy check could not connect ({}), assuming ready", e);
            return BusyState::Ready;
        }
        Err(_) => {
            info!("Busy check connect timed out, assuming ready");
            return BusyState::Ready;
        }
    };

    let mut byte = [0u8; 1];
    match tokio::time::timeout(read_timeout, stream.read(&mut byte)).await {
        Ok(Ok(0)) => {
            info!("Headunit at {} closed the connection immediately: busy", addr);
            BusyState::Busy
        }
        // The service never speaks first; unsolicited data means someone else
        // owns the session.
        Ok(Ok(_)) => BusyState::Busy,
        Ok(Err(e)) => {
            info!("Busy check read failed ({}), assuming ready", e);
            BusyState::Ready
        }
        Err(_) => {
            info!("Headunit at {} is holding the connection: ready", addr);
            BusyState::Ready
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;
    use tokio::net::TcpListener;

    /// Returns a loopback port with nothing listening on it.
    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    struct RecordingProber {
        open: Vec<u16>,
        calls: Mutex<Vec<u16>>,
        count: AtomicUsize,
    }

    impl PortProber for RecordingProber {
        fn probe<'a>(
            &'a self,
            _host: IpAddr,
            port: u16,
            _timeout: Duration,
        ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
            Box::pin(async move {
                self.count.fetch_add(1, Ordering::SeqCst);
                self.calls.lock().unwrap().push(port);
                self.open.contains(&port)
            })
        }
    }

    #[tokio::test]
    async fn test_probe_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let reachable = TcpProber
            .probe("127.0.0.1".parse().unwrap(), port, Duration::from_millis(500))
            .await;
        assert!(reachable);
    }

    #[tokio::test]
    async fn test_probe_closed_port() {
        let port = unused_port().await;

        let reachable = TcpProber
            .probe("127.0.0.1".parse().unwrap(), port, Duration::from_millis(500))
            .await;
        assert!(!reachable);
    }

    #[tokio::test]
    async fn test_probe_respects_timeout() {
        // Non-routable address: either times out or fails fast, never hangs.
        let timeout = Duration::from_millis(200);
        let start = Instant::now();

        let reachable = TcpProber
            .probe("10.255.255.1".parse().unwrap(), 5289, timeout)
            .await;

        assert!(!reachable);
        assert!(start.elapsed() < timeout + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_probe_ports_priority_order() {
        let prober = RecordingProber {
            open: vec![5289, 5277],
            calls: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        };

        let hit = probe_ports(
            &prober,
            "10.0.0.1".parse().unwrap(),
            &[5289, 5277],
            DEFAULT_PROBE_TIMEOUT,
        )
        .await;

        assert_eq!(hit, Some(5289));
        // The legacy port must not be probed after the primary port answered.
        assert_eq!(*prober.calls.lock().unwrap(), vec![5289]);
    }

    #[tokio::test]
    async fn test_probe_ports_falls_back_to_legacy() {
        let prober = RecordingProber {
            open: vec![5277],
            calls: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        };

        let hit = probe_ports(
            &prober,
            "10.0.0.1".parse().unwrap(),
            &[5289, 5277],
            DEFAULT_PROBE_TIMEOUT,
        )
        .await;

        assert_eq!(hit, Some(5277));
        assert_eq!(*prober.calls.lock().unwrap(), vec![5289, 5277]);
    }

    #[tokio::test]
    async fn test_probe_ports_none_open() {
        let prober = RecordingProber {
            open: vec![],
            calls: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        };

        let hit = probe_ports(
            &prober,
            "10.0.0.1".parse().unwrap(),
            &[5289, 5277],
            DEFAULT_PROBE_TIMEOUT,
        )
        .await;

        assert_eq!(hit, None);
        assert_eq!(prober.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_check_busy_when_service_closes_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let state = check_busy(addr, Duration::from_secs(1), Duration::from_millis(500)).await;
        assert_eq!(state, BusyState::Busy);
    }

    #[tokio::test]
    async fn test_check_busy_when_service_holds_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let state = check_busy(addr, Duration::from_secs(1), Duration::from_millis(200)).await;
        assert_eq!(state, BusyState::Ready);
        server.abort();
    }

    #[tokio::test]
    async fn test_check_busy_without_service_assumes_ready() {
        let port = unused_port().await;
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

        let state = check_busy(addr, Duration::from_millis(500), Duration::from_millis(200)).await;
        assert_eq!(state, BusyState::Ready);
    }
}
