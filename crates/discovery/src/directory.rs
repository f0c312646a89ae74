//! Service directory listener.
//!
//! Browses the local network's service directory (mDNS / DNS-SD) for the
//! projection service type and reports every announcement that resolves to
//! an address.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{DiscoveryError, Result};
use crate::source::{emit, DiscoveryEvent, DiscoverySource, EventSink, SourceKind};

/// Service type browsed by default.
pub const DEFAULT_SERVICE_TYPE: &str = "_aawireless._tcp.local.";

/// Substring an announcement's type must contain to be considered.
pub const DEFAULT_TYPE_FILTER: &str = "_aawireless._tcp";

/// How often the mDNS bridge checks whether its consumer went away.
const BRIDGE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A service announcement after the resolve step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    /// The announcement resolved to one or more addresses.
    Resolved {
        service_type: String,
        name: String,
        addresses: Vec<IpAddr>,
        port: u16,
    },
    /// The announcement could not be resolved.
    ResolveFailed {
        service_type: String,
        name: String,
        reason: String,
    },
}

/// A browsable service directory.
pub trait ServiceDirectory: Send + Sync {
    /// Subscribes to announcements of `service_type`.
    fn browse(&self, service_type: &str) -> Result<mpsc::UnboundedReceiver<Announcement>>;

    /// Cancels a subscription made with [`ServiceDirectory::browse`].
    fn stop_browse(&self, service_type: &str) -> Result<()>;
}

/// [`ServiceDirectory`] backed by the `mdns-sd` daemon.
pub struct MdnsDirectory {
    daemon: ServiceDaemon,
}

impl MdnsDirectory {
    /// Starts an mDNS daemon.
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()?;
        Ok(Self { daemon })
    }
}

impl ServiceDirectory for MdnsDirectory {
    fn browse(&self, service_type: &str) -> Result<mpsc::UnboundedReceiver<Announcement>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DiscoveryError::Runtime(e.to_string()))?;

        let receiver = self.daemon.browse(service_type)?;
        let (tx, rx) = mpsc::unbounded_channel();

        // mdns-sd hands out a synchronous channel; drain it off the async
        // workers until the browse stops or the consumer drops its end.
        runtime.spawn_blocking(move || loop {
            if tx.is_closed() {
                break;
            }
            let event = match receiver.recv_timeout(BRIDGE_POLL_INTERVAL) {
                Ok(event) => event,
                Err(_) if receiver.is_disconnected() => break,
                Err(_) => continue,
            };

            let announcement = match event {
                ServiceEvent::ServiceFound(service_type, name) => {
                    debug!("mDNS: service found - {} ({})", name, service_type);
                    continue;
                }
                ServiceEvent::ServiceResolved(info) => {
                    let mut addresses: Vec<IpAddr> =
                        info.get_addresses().iter().copied().collect();
                    addresses.sort();
                    let service_type = info.get_type().to_string();
                    let name = info.get_fullname().to_string();

                    if addresses.is_empty() {
                        Announcement::ResolveFailed {
                            service_type,
                            name,
                            reason: "no addresses in resolved record".to_string(),
                        }
                    } else {
                        Announcement::Resolved {
                            service_type,
                            name,
                            addresses,
                            port: info.get_port(),
                        }
                    }
                }
                ServiceEvent::SearchStopped(service_type) => {
                    debug!("mDNS: search stopped for {}", service_type);
                    break;
                }
                other => {
                    debug!("mDNS: {:?}", other);
                    continue;
                }
            };

            if tx.send(announcement).is_err() {
                break;
            }
        });

        Ok(rx)
    }

    fn stop_browse(&self, service_type: &str) -> Result<()> {
        self.daemon.stop_browse(service_type)?;
        Ok(())
    }
}

impl Drop for MdnsDirectory {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            debug!("mDNS daemon shutdown failed: {}", e);
        }
    }
}

/// Directory listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryConfig {
    /// Service type to browse.
    pub service_type: String,
    /// Case-sensitive substring announcements must contain in their type.
    pub type_filter: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            type_filter: DEFAULT_TYPE_FILTER.to_string(),
        }
    }
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Discovery source that listens to service announcements.
pub struct DirectoryListener {
    config: DirectoryConfig,
    directory: Arc<dyn ServiceDirectory>,
    events: EventSink,
    running: Option<Running>,
}

impl DirectoryListener {
    /// Creates a stopped listener. Browsing begins on
    /// [`start`](DiscoverySource::start); hits are sent to `events`.
    pub fn new(
        config: DirectoryConfig,
        directory: Arc<dyn ServiceDirectory>,
        events: EventSink,
    ) -> Self {
        Self {
            config,
            directory,
            events,
            running: None,
        }
    }
}

impl DiscoverySource for DirectoryListener {
    fn kind(&self) -> SourceKind {
        SourceKind::Directory
    }

    fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        tokio::runtime::Handle::try_current()
            .map_err(|e| DiscoveryError::Runtime(e.to_string()))?;

        let announcements = self.directory.browse(&self.config.service_type)?;
        info!("Browsing for {}", self.config.service_type);

        let token = CancellationToken::new();
        let handle = tokio::spawn(listen(
            announcements,
            self.config.type_filter.clone(),
            self.events.clone(),
            token.clone(),
        ));

        self.running = Some(Running { token, handle });
        Ok(())
    }

    fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.token.cancel();
        running.handle.abort();

        if let Err(e) = self.directory.stop_browse(&self.config.service_type) {
            debug!("Ignoring stop_browse failure: {}", e);
        }
        info!("Directory listener stopped");
    }

    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for DirectoryListener {
    fn drop(&mut self) {
        DiscoverySource::stop(self);
    }
}

async fn listen(
    mut announcements: mpsc::UnboundedReceiver<Announcement>,
    type_filter: String,
    events: EventSink,
    token: CancellationToken,
) {
    loop {
        let announcement = tokio::select! {
            _ = token.cancelled() => break,
            announcement = announcements.recv() => match announcement {
                Some(announcement) => announcement,
                None => {
                    debug!("Directory announcement stream ended");
                    break;
                }
            },
        };

        match announcement {
            Announcement::Resolved {
                service_type,
                name,
                addresses,
                port,
            } => {
                if !service_type.contains(&type_filter) {
                    debug!("Ignoring {} of type {}", name, service_type);
                    continue;
                }
                let Some(host) = preferred_address(&addresses) else {
                    warn!("Resolve failed for {}: no usable address", name);
                    continue;
                };

                info!("Service resolved: {} at {}:{}", name, host, port);
                emit(
                    &events,
                    &token,
                    DiscoveryEvent::Found {
                        source: SourceKind::Directory,
                        endpoint: Endpoint::new(host, port),
                    },
                );
            }
            Announcement::ResolveFailed {
                service_type,
                name,
                reason,
            } => {
                if service_type.contains(&type_filter) {
                    warn!("Resolve failed for {}: {}", name, reason);
                }
            }
        }
    }
}

/// First IPv4 address if there is one, otherwise the first address.
fn preferred_address(addresses: &[IpAddr]) -> Option<IpAddr> {
    addresses
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addresses.first())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDirectory {
        sender: Mutex<Option<mpsc::UnboundedSender<Announcement>>>,
        browsed: Mutex<Vec<String>>,
        stops: AtomicUsize,
        fail_stop: bool,
    }

    impl FakeDirectory {
        fn announce(&self, announcement: Announcement) {
            let sender = self.sender.lock().unwrap();
            sender.as_ref().unwrap().send(announcement).unwrap();
        }
    }

    impl ServiceDirectory for FakeDirectory {
        fn browse(&self, service_type: &str) -> Result<mpsc::UnboundedReceiver<Announcement>> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.sender.lock().unwrap() = Some(tx);
            self.browsed.lock().unwrap().push(service_type.to_string());
            Ok(rx)
        }

        fn stop_browse(&self, _service_type: &str) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop {
                return Err(DiscoveryError::Directory("not browsing".to_string()));
            }
            Ok(())
        }
    }

    fn resolved(service_type: &str, addresses: &[&str], port: u16) -> Announcement {
        Announcement::Resolved {
            service_type: service_type.to_string(),
            name: "Headunit._aawireless._tcp.local.".to_string(),
            addresses: addresses.iter().map(|a| a.parse().unwrap()).collect(),
            port,
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<DiscoveryEvent>) -> Option<DiscoveryEvent> {
        tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[test]
    fn test_preferred_address_picks_ipv4() {
        let addrs: Vec<IpAddr> = vec!["fe80::1".parse().unwrap(), "192.168.43.20".parse().unwrap()];
        assert_eq!(preferred_address(&addrs), Some("192.168.43.20".parse().unwrap()));

        let v6_only: Vec<IpAddr> = vec!["fe80::1".parse().unwrap()];
        assert_eq!(preferred_address(&v6_only), Some("fe80::1".parse().unwrap()));

        assert_eq!(preferred_address(&[]), None);
    }

    #[tokio::test]
    async fn test_matching_announcement_is_reported() {
        let directory = Arc::new(FakeDirectory::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener = DirectoryListener::new(DirectoryConfig::default(), directory.clone(), tx);
        listener.start().unwrap();

        assert_eq!(*directory.browsed.lock().unwrap(), vec![DEFAULT_SERVICE_TYPE.to_string()]);

        directory.announce(resolved(
            "_aawireless._tcp.local.",
            &["fe80::2", "192.168.43.20"],
            5288,
        ));

        assert_eq!(
            recv(&mut rx).await,
            Some(DiscoveryEvent::Found {
                source: SourceKind::Directory,
                endpoint: Endpoint::new("192.168.43.20".parse().unwrap(), 5288),
            })
        );
        listener.stop();
    }

    #[tokio::test]
    async fn test_filter_is_case_sensitive() {
        let directory = Arc::new(FakeDirectory::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener = DirectoryListener::new(DirectoryConfig::default(), directory.clone(), tx);
        listener.start().unwrap();

        directory.announce(resolved("_AAWIRELESS._tcp.local.", &["10.0.0.2"], 5288));
        directory.announce(resolved("_printer._tcp.local.", &["10.0.0.3"], 631));

        assert_eq!(recv(&mut rx).await, None);
        listener.stop();
    }

    #[tokio::test]
    async fn test_resolve_failure_is_ignored() {
        let directory = Arc::new(FakeDirectory::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener = DirectoryListener::new(DirectoryConfig::default(), directory.clone(), tx);
        listener.start().unwrap();

        directory.announce(Announcement::ResolveFailed {
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            name: "Headunit".to_string(),
            reason: "timeout".to_string(),
        });
        directory.announce(resolved(DEFAULT_SERVICE_TYPE, &[], 5288));
        assert_eq!(recv(&mut rx).await, None);

        // The listener keeps going after failures.
        directory.announce(resolved(DEFAULT_SERVICE_TYPE, &["10.0.0.9"], 5288));
        assert!(matches!(recv(&mut rx).await, Some(DiscoveryEvent::Found { .. })));
        listener.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_swallows_errors() {
        let directory = Arc::new(FakeDirectory {
            fail_stop: true,
            ..FakeDirectory::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener = DirectoryListener::new(DirectoryConfig::default(), directory.clone(), tx);
        listener.start().unwrap();

        listener.stop();
        listener.stop();
        assert_eq!(directory.stops.load(Ordering::SeqCst), 1);
        assert!(!listener.is_running());

        // Late announcements are not delivered.
        let _ = directory
            .sender
            .lock()
            .unwrap()
            .as_ref()
            .map(|tx| tx.send(resolved(DEFAULT_SERVICE_TYPE, &["10.0.0.9"], 5288)));
        assert_eq!(recv(&mut rx).await, None);
    }
}
