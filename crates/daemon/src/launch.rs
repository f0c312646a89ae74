//! Launch coordinator.
//!
//! Turns discovery hits into at most one handoff at a time. The
//! [`LaunchGuard`] is the only serialization point between discovery sources:
//! whoever wins its compare-and-set stops every source, optionally starts the
//! relay, and hands the endpoint to the platform. The guard then stays held
//! until the connection ends or the cooldown expires without a confirmed
//! connection.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use discovery::{
    check_busy, BusyState, DiscoveryError, DiscoverySource, Endpoint, NetworkInventory,
    RelayEvent, RelayProxy, SourceKind,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::LaunchConfig;
use crate::handoff::{HandoffError, HandoffTarget, NetworkContextHint, PlatformHandoff};

/// Broadcast channel capacity for launch events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Single-flight flag. Only ever mutated through compare-and-set.
#[derive(Debug, Default)]
pub struct LaunchGuard {
    held: AtomicBool,
}

impl LaunchGuard {
    /// A released guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the guard. Returns false if it was already held.
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Releases the guard. Returns false if it was not held.
    pub fn release(&self) -> bool {
        self.held
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Whether an attempt or a confirmed connection holds the guard.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

/// Events emitted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchEvent {
    /// The guard was acquired for `endpoint`.
    Launching { endpoint: Endpoint, relay: bool },
    /// The platform handoff succeeded.
    HandedOff { target: HandoffTarget },
    /// The headunit is already serving another client; handoff skipped.
    Busy { endpoint: Endpoint },
    /// A data path was confirmed.
    Connected,
    /// The confirmed data path ended.
    Disconnected,
    /// The cooldown expired without a confirmed connection.
    Released,
    /// The attempt failed and the guard was cleared.
    Failed { endpoint: Endpoint, reason: String },
}

/// Result of a launch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Another attempt holds the guard; nothing was done.
    Contended,
    /// The busy check found the headunit serving another client.
    Busy,
    /// The consumer was handed off to `target`.
    HandedOff(HandoffTarget),
}

/// Launch failures. The guard is already released when one is returned.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to start relay: {0}")]
    Relay(#[from] DiscoveryError),

    #[error("handoff failed: {0}")]
    Handoff(#[from] HandoffError),
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub cooldown: Duration,
    pub busy_check: bool,
    pub busy_connect_timeout: Duration,
    pub busy_read_timeout: Duration,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self::from(&LaunchConfig::default())
    }
}

impl From<&LaunchConfig> for LaunchSettings {
    fn from(config: &LaunchConfig) -> Self {
        Self {
            cooldown: config.cooldown(),
            busy_check: config.busy_check,
            busy_connect_timeout: config.busy_connect_timeout(),
            busy_read_timeout: config.busy_read_timeout(),
        }
    }
}

/// The running discovery sources, shared between the selector (which
/// creates and restarts them) and the coordinator (which stops them).
#[derive(Clone, Default)]
pub struct SourceSet {
    inner: Arc<Mutex<Vec<Box<dyn DiscoverySource>>>>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops the current sources and installs `sources` (not started).
    pub async fn replace(&self, sources: Vec<Box<dyn DiscoverySource>>) {
        let mut inner = self.inner.lock().await;
        for source in inner.iter_mut() {
            source.stop();
        }
        *inner = sources;
    }

    /// Starts every source. Failures are logged and returned per kind.
    pub async fn start_all(&self) -> Vec<(SourceKind, DiscoveryError)> {
        let mut inner = self.inner.lock().await;
        let mut failures = Vec::new();
        for source in inner.iter_mut() {
            if let Err(e) = source.start() {
                error!("Failed to start {} source: {}", source.kind(), e);
                failures.push((source.kind(), e));
            }
        }
        failures
    }

    /// Starts the sources of one kind.
    pub async fn start_kind(&self, kind: SourceKind) {
        let mut inner = self.inner.lock().await;
        for source in inner.iter_mut().filter(|s| s.kind() == kind) {
            if let Err(e) = source.start() {
                error!("Failed to restart {} source: {}", kind, e);
            }
        }
    }

    pub async fn stop_all(&self) {
        let mut inner = self.inner.lock().await;
        for source in inner.iter_mut() {
            source.stop();
        }
    }

    /// Stops and drops every source.
    pub async fn clear(&self) {
        self.replace(Vec::new()).await;
    }

    pub async fn kinds(&self) -> Vec<SourceKind> {
        self.inner.lock().await.iter().map(|s| s.kind()).collect()
    }

    pub async fn running(&self) -> usize {
        self.inner
            .lock()
            .await
            .iter()
            .filter(|s| s.is_running())
            .count()
    }
}

/// Single-flight launch coordinator.
pub struct LaunchCoordinator {
    guard: LaunchGuard,
    /// Whether the current attempt's data path has been confirmed.
    confirmed: AtomicBool,
    /// Attempt generation; bumping it voids pending cooldowns.
    attempt: AtomicU64,
    settings: LaunchSettings,
    sources: SourceSet,
    handoff: Arc<dyn PlatformHandoff>,
    inventory: Arc<dyn NetworkInventory>,
    relay: Mutex<Option<RelayProxy>>,
    events: broadcast::Sender<LaunchEvent>,
}

impl LaunchCoordinator {
    pub fn new(
        settings: LaunchSettings,
        sources: SourceSet,
        handoff: Arc<dyn PlatformHandoff>,
        inventory: Arc<dyn NetworkInventory>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            guard: LaunchGuard::new(),
            confirmed: AtomicBool::new(false),
            attempt: AtomicU64::new(0),
            settings,
            sources,
            handoff,
            inventory,
            relay: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LaunchEvent> {
        self.events.subscribe()
    }

    pub fn sources(&self) -> &SourceSet {
        &self.sources
    }

    /// Whether a launch is in progress or a connection is believed active.
    pub fn is_engaged(&self) -> bool {
        self.guard.is_held()
    }

    pub fn is_connected(&self) -> bool {
        self.confirmed.load(Ordering::SeqCst)
    }

    /// Loopback port of the running relay, if any.
    pub async fn relay_port(&self) -> Option<u16> {
        self.relay.lock().await.as_ref().map(|r| r.local_port())
    }

    /// Attempts a handoff to `(host, port)`. A no-op if another attempt
    /// holds the guard.
    pub async fn launch(
        self: &Arc<Self>,
        host: IpAddr,
        port: u16,
        use_relay: bool,
    ) -> Result<LaunchOutcome, LaunchError> {
        let endpoint = Endpoint::new(host, port);

        if !self.guard.try_acquire() {
            info!("Launch already in progress, ignoring {}", endpoint);
            return Ok(LaunchOutcome::Contended);
        }

        self.confirmed.store(false, Ordering::SeqCst);
        let generation = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Launching for {} (relay: {})", endpoint, use_relay);
        self.emit(LaunchEvent::Launching {
            endpoint,
            relay: use_relay,
        });

        self.sources.stop_all().await;
        self.stop_relay().await;

        match self.attempt_handoff(endpoint, use_relay, generation).await {
            Ok(Some(target)) => {
                info!("Handed off to {}", target);
                self.emit(LaunchEvent::HandedOff {
                    target: target.clone(),
                });
                self.arm_cooldown(generation);
                Ok(LaunchOutcome::HandedOff(target))
            }
            Ok(None) => {
                warn!("Headunit at {} is busy, holding off for {:?}", endpoint, self.settings.cooldown);
                self.emit(LaunchEvent::Busy { endpoint });
                self.arm_cooldown(generation);
                Ok(LaunchOutcome::Busy)
            }
            Err(e) => {
                error!("Launch for {} failed: {}", endpoint, e);
                self.stop_relay().await;
                self.guard.release();
                self.emit(LaunchEvent::Failed {
                    endpoint,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Busy check, relay and handoff. `Ok(None)` means busy.
    async fn attempt_handoff(
        self: &Arc<Self>,
        endpoint: Endpoint,
        use_relay: bool,
        generation: u64,
    ) -> Result<Option<HandoffTarget>, LaunchError> {
        if self.settings.busy_check {
            let state = check_busy(
                endpoint.socket_addr(),
                self.settings.busy_connect_timeout,
                self.settings.busy_read_timeout,
            )
            .await;
            if state == BusyState::Busy {
                return Ok(None);
            }
        }

        let network = NetworkContextHint::for_host(self.inventory.as_ref(), endpoint.host());
        let target = if use_relay {
            let port = self.start_relay(endpoint, generation).await?;
            HandoffTarget {
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port,
                network,
            }
        } else {
            HandoffTarget {
                address: endpoint.host(),
                port: endpoint.port(),
                network,
            }
        };

        self.handoff.hand_off(&target).await?;
        Ok(Some(target))
    }

    /// Starts the relay for attempt `generation`. Its events only count while
    /// that attempt is current.
    async fn start_relay(
        self: &Arc<Self>,
        remote: Endpoint,
        generation: u64,
    ) -> Result<u16, DiscoveryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = RelayProxy::start(remote, tx).await?;
        let port = relay.local_port();

        tokio::spawn(watch_relay(Arc::downgrade(self), rx, generation));
        *self.relay.lock().await = Some(relay);
        Ok(port)
    }

    async fn stop_relay(&self) {
        if let Some(relay) = self.relay.lock().await.take() {
            relay.stop();
        }
    }

    fn arm_cooldown(self: &Arc<Self>, generation: u64) {
        let coordinator = Arc::downgrade(self);
        let cooldown = self.settings.cooldown;

        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            let Some(coordinator) = coordinator.upgrade() else {
                return;
            };
            coordinator.cooldown_expired(generation);
        });
    }

    fn cooldown_expired(&self, generation: u64) {
        if self.attempt.load(Ordering::SeqCst) != generation {
            debug!("Cooldown for attempt {} superseded", generation);
            return;
        }
        if self.confirmed.load(Ordering::SeqCst) {
            debug!("Connection confirmed, keeping launch guard");
            return;
        }
        if self.guard.release() {
            info!("No connection after {:?}, re-arming discovery", self.settings.cooldown);
            self.emit(LaunchEvent::Released);
        }
    }

    /// Records a confirmed data path (from the relay or the status oracle).
    /// Takes the guard if nobody holds it, so discovery hits are ignored while
    /// connected.
    pub fn mark_connected(&self) {
        self.guard.try_acquire();
        if !self.confirmed.swap(true, Ordering::SeqCst) {
            info!("Connection confirmed");
            self.emit(LaunchEvent::Connected);
        }
    }

    /// Records the end of the data path: clears the guard, stops the relay
    /// and asks for discovery to be restarted.
    pub async fn mark_disconnected(&self) {
        self.attempt.fetch_add(1, Ordering::SeqCst);
        self.end_connection().await;
    }

    fn relay_connected(&self, generation: u64) {
        if self.attempt.load(Ordering::SeqCst) != generation {
            debug!("Ignoring connect from relay of attempt {}", generation);
            return;
        }
        self.mark_connected();
    }

    async fn relay_disconnected(&self, generation: u64) {
        if self
            .attempt
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Ignoring disconnect from relay of attempt {}", generation);
            return;
        }
        self.end_connection().await;
    }

    async fn end_connection(&self) {
        self.confirmed.store(false, Ordering::SeqCst);
        self.stop_relay().await;
        self.guard.release();
        info!("Connection ended, re-arming discovery");
        self.emit(LaunchEvent::Disconnected);
    }

    /// Clears all launch state for an operator stop. Silent.
    pub async fn reset(&self) {
        self.attempt.fetch_add(1, Ordering::SeqCst);
        self.sources.stop_all().await;
        self.stop_relay().await;
        self.handoff.stop();
        self.confirmed.store(false, Ordering::SeqCst);
        self.guard.release();
        debug!("Launch coordinator reset");
    }

    fn emit(&self, event: LaunchEvent) {
        let _ = self.events.send(event);
    }
}

async fn watch_relay(
    coordinator: Weak<LaunchCoordinator>,
    mut events: mpsc::UnboundedReceiver<RelayEvent>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        match event {
            RelayEvent::Connected => coordinator.relay_connected(generation),
            RelayEvent::Disconnected => coordinator.relay_disconnected(generation).await,
        }
    }
}
