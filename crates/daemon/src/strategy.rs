//! Strategy selector: which discovery sources run, and the connection state
//! machine around the launch coordinator.
//!
//! ```text
//!  Idle ──start(mode)──► Discovering ──Found──► Launching ──Connected──► Connected
//!   ▲                        ▲  ▲                   │                       │
//!   │                        │  └─Released/Failed───┘                       │
//!   │                        └──────────────Disconnected────────────────────┘
//!   └──────────────────────────── stop() from any state
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use discovery::{
    ActiveScanner, DiscoveryError, DiscoveryEvent, DiscoverySource, DirectoryListener, EventSink,
    MdnsDirectory, NetworkInventory, PortProber, ServiceDirectory, SourceKind, SystemInventory,
    TcpProber, TriggerListener,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::handoff::{self, HandoffError};
use crate::launch::{LaunchCoordinator, LaunchEvent, LaunchSettings, SourceSet};
use crate::status::{self, ConnectionStatus};

/// How the phone and the headunit share a network.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    /// Both devices joined the same WLAN.
    #[default]
    SharedNetwork,
    /// The headunit joined the phone's hotspot.
    PhoneHotspot,
    /// The phone joined the headunit's (tablet's) hotspot; the headunit
    /// announces itself on the trigger port.
    TabletHotspot,
    /// Wi-Fi Direct group.
    WifiDirect,
}

impl ConnectionMode {
    /// Discovery sources run in this mode.
    pub fn plan(self) -> &'static [SourceKind] {
        match self {
            ConnectionMode::SharedNetwork => &[SourceKind::Directory, SourceKind::ActiveScan],
            ConnectionMode::PhoneHotspot => &[SourceKind::Trigger, SourceKind::Directory],
            ConnectionMode::TabletHotspot => &[SourceKind::Trigger],
            ConnectionMode::WifiDirect => &[SourceKind::Directory],
        }
    }

    /// Whether the relay is used when the policy is `auto`.
    pub fn relay_by_default(self) -> bool {
        matches!(self, ConnectionMode::PhoneHotspot)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionMode::SharedNetwork => "shared-network",
            ConnectionMode::PhoneHotspot => "phone-hotspot",
            ConnectionMode::TabletHotspot => "tablet-hotspot",
            ConnectionMode::WifiDirect => "wifi-direct",
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "shared-network" => Ok(ConnectionMode::SharedNetwork),
            "phone-hotspot" => Ok(ConnectionMode::PhoneHotspot),
            "tablet-hotspot" => Ok(ConnectionMode::TabletHotspot),
            "wifi-direct" => Ok(ConnectionMode::WifiDirect),
            other => Err(format!("unknown connection mode: {}", other)),
        }
    }
}

/// Whether handoffs go through the local relay.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RelayPolicy {
    /// Per-mode default.
    #[default]
    Auto,
    Always,
    Never,
}

impl RelayPolicy {
    pub fn use_relay(self, mode: ConnectionMode) -> bool {
        match self {
            RelayPolicy::Auto => mode.relay_by_default(),
            RelayPolicy::Always => true,
            RelayPolicy::Never => false,
        }
    }
}

/// Selector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorState {
    Idle,
    Discovering,
    Launching,
    Connected,
}

impl fmt::Display for SelectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SelectorState::Idle => "idle",
            SelectorState::Discovering => "discovering",
            SelectorState::Launching => "launching",
            SelectorState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorStatus {
    pub state: SelectorState,
    pub mode: Option<ConnectionMode>,
    pub launch_engaged: bool,
    pub relay_port: Option<u16>,
}

/// Selector failures.
#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("failed to create {kind} source: {source}")]
    Source {
        kind: SourceKind,
        #[source]
        source: DiscoveryError,
    },

    #[error("no discovery source could be started for {0} mode")]
    NoSources(ConnectionMode),
}

/// Creates discovery sources for a mode.
pub trait SourceFactory: Send + Sync {
    fn build(
        &self,
        kind: SourceKind,
        events: EventSink,
    ) -> Result<Box<dyn DiscoverySource>, DiscoveryError>;
}

/// Factory for the real network sources.
pub struct SystemSources {
    config: Config,
    prober: Arc<dyn PortProber>,
    inventory: Arc<dyn NetworkInventory>,
    directory: StdMutex<Option<Arc<dyn ServiceDirectory>>>,
}

impl SystemSources {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            prober: Arc::new(TcpProber),
            inventory: Arc::new(SystemInventory),
            directory: StdMutex::new(None),
        }
    }

    /// The mDNS daemon is started on first use and shared afterwards.
    fn directory(&self) -> Result<Arc<dyn ServiceDirectory>, DiscoveryError> {
        let mut slot = self.directory.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(directory) = slot.as_ref() {
            return Ok(Arc::clone(directory));
        }
        let directory: Arc<dyn ServiceDirectory> = Arc::new(MdnsDirectory::new()?);
        *slot = Some(Arc::clone(&directory));
        Ok(directory)
    }
}

impl SourceFactory for SystemSources {
    fn build(
        &self,
        kind: SourceKind,
        events: EventSink,
    ) -> Result<Box<dyn DiscoverySource>, DiscoveryError> {
        let source: Box<dyn DiscoverySource> = match kind {
            SourceKind::ActiveScan => Box::new(
                ActiveScanner::new(self.config.scan.scan_config(&self.config.ports), events)
                    .with_prober(Arc::clone(&self.prober))
                    .with_inventory(Arc::clone(&self.inventory)),
            ),
            SourceKind::Trigger => Box::new(TriggerListener::new(self.config.ports.trigger, events)),
            SourceKind::Directory => Box::new(DirectoryListener::new(
                self.config.directory.directory_config(),
                self.directory()?,
                events,
            )),
        };
        Ok(source)
    }
}

/// Selector timing and routing settings.
#[derive(Debug, Clone)]
pub struct SelectorSettings {
    /// Port discovered hosts are launched against.
    pub service_port: u16,
    pub relay_policy: RelayPolicy,
    pub rescan_delay: Duration,
    pub poll_interval: Duration,
}

impl From<&Config> for SelectorSettings {
    fn from(config: &Config) -> Self {
        Self {
            service_port: config.ports.service,
            relay_policy: config.launch.relay,
            rescan_delay: config.scan.rescan_delay(),
            poll_interval: config.status.poll_interval(),
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: SelectorState,
    mode: Option<ConnectionMode>,
}

struct ControlLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs the discovery sources of a mode and drives the launch coordinator.
pub struct StrategySelector {
    settings: SelectorSettings,
    coordinator: Arc<LaunchCoordinator>,
    factory: Arc<dyn SourceFactory>,
    status: Arc<dyn ConnectionStatus>,
    shared: Arc<RwLock<Shared>>,
    control: Mutex<Option<ControlLoop>>,
}

impl StrategySelector {
    pub fn new(
        settings: SelectorSettings,
        coordinator: Arc<LaunchCoordinator>,
        factory: Arc<dyn SourceFactory>,
        status: Arc<dyn ConnectionStatus>,
    ) -> Self {
        Self {
            settings,
            coordinator,
            factory,
            status,
            shared: Arc::new(RwLock::new(Shared {
                state: SelectorState::Idle,
                mode: None,
            })),
            control: Mutex::new(None),
        }
    }

    /// Wires the production collaborators described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, HandoffError> {
        let handoff = handoff::from_command(&config.handoff.command)?;
        let status = status::from_command(&config.status.command);

        let coordinator = LaunchCoordinator::new(
            LaunchSettings::from(&config.launch),
            SourceSet::new(),
            Arc::from(handoff),
            Arc::new(SystemInventory),
        );

        Ok(Self::new(
            SelectorSettings::from(config),
            coordinator,
            Arc::new(SystemSources::new(config.clone())),
            Arc::from(status),
        ))
    }

    /// The launch coordinator shared with the control loop.
    pub fn coordinator(&self) -> &Arc<LaunchCoordinator> {
        &self.coordinator
    }

    /// Current selector state.
    pub async fn state(&self) -> SelectorState {
        self.shared.read().await.state
    }

    /// Mode of the running discovery, `None` while idle.
    pub async fn mode(&self) -> Option<ConnectionMode> {
        self.shared.read().await.mode
    }

    pub async fn status(&self) -> SelectorStatus {
        let (state, mode) = {
            let shared = self.shared.read().await;
            (shared.state, shared.mode)
        };
        SelectorStatus {
            state,
            mode,
            launch_engaged: self.coordinator.is_engaged(),
            relay_port: self.coordinator.relay_port().await,
        }
    }

    /// Starts discovery for `mode`, replacing whatever was running.
    ///
    /// Calls to `start` and [`stop`](Self::stop) are serialized: the control
    /// slot stays locked until the new loop is stored.
    pub async fn start(&self, mode: ConnectionMode) -> Result<(), SelectorError> {
        let mut control = self.control.lock().await;
        self.shut_down(&mut control).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut sources = Vec::with_capacity(mode.plan().len());
        for &kind in mode.plan() {
            let source = self
                .factory
                .build(kind, tx.clone())
                .map_err(|source| SelectorError::Source { kind, source })?;
            sources.push(source);
        }
        self.coordinator.sources().replace(sources).await;

        let use_relay = self.settings.relay_policy.use_relay(mode);
        info!("Starting {} mode (relay: {})", mode, use_relay);

        let already_connected = self.status.is_connected().await;
        let state = if already_connected {
            info!("Projection session already active, skipping discovery");
            self.coordinator.mark_connected();
            SelectorState::Connected
        } else {
            info!("Searching for headunit...");
            let failures = self.coordinator.sources().start_all().await;
            if failures.len() == mode.plan().len() {
                self.coordinator.sources().clear().await;
                return Err(SelectorError::NoSources(mode));
            }
            SelectorState::Discovering
        };

        {
            let mut shared = self.shared.write().await;
            shared.state = state;
            shared.mode = Some(mode);
        }

        let ctx = ControlContext {
            coordinator: Arc::clone(&self.coordinator),
            status: Arc::clone(&self.status),
            shared: Arc::clone(&self.shared),
            service_port: self.settings.service_port,
            use_relay,
            rescan_delay: self.settings.rescan_delay,
            poll_interval: self.settings.poll_interval,
        };
        let token = CancellationToken::new();
        let handle = tokio::spawn(control_loop(
            ctx,
            rx,
            self.coordinator.subscribe(),
            token.clone(),
            already_connected,
        ));

        *control = Some(ControlLoop { token, handle });
        Ok(())
    }

    /// Stops every source, the relay and the control loop; clears the guard.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;
        self.shut_down(&mut control).await;
    }

    async fn shut_down(&self, control: &mut Option<ControlLoop>) {
        let was_running = control.is_some();
        if let Some(control) = control.take() {
            control.token.cancel();
            control.handle.abort();
            // Wait for the task so it cannot touch shared state afterwards.
            let _ = control.handle.await;
        }

        self.coordinator.reset().await;
        self.coordinator.sources().clear().await;

        let mut shared = self.shared.write().await;
        shared.state = SelectorState::Idle;
        shared.mode = None;
        if was_running {
            info!("Discovery stopped");
        }
    }
}

struct ControlContext {
    coordinator: Arc<LaunchCoordinator>,
    status: Arc<dyn ConnectionStatus>,
    shared: Arc<RwLock<Shared>>,
    service_port: u16,
    use_relay: bool,
    rescan_delay: Duration,
    poll_interval: Duration,
}

impl ControlContext {
    async fn state(&self) -> SelectorState {
        self.shared.read().await.state
    }

    async fn set_state(&self, state: SelectorState) {
        let mut shared = self.shared.write().await;
        if shared.state != state {
            debug!("Selector state: {} -> {}", shared.state, state);
            shared.state = state;
        }
    }

    async fn on_discovery(&self, event: DiscoveryEvent, rescan_at: &mut Option<Instant>) {
        match event {
            DiscoveryEvent::Found { source, endpoint } => {
                info!("{} source found headunit at {}", source, endpoint);
                // Discovery ports and the service port differ; only the host
                // carries over.
                if let Err(e) = self
                    .coordinator
                    .launch(endpoint.host(), self.service_port, self.use_relay)
                    .await
                {
                    warn!("Launch for {} failed: {}", endpoint.host(), e);
                }
            }
            DiscoveryEvent::PassComplete { source } => {
                if self.state().await == SelectorState::Discovering
                    && !self.coordinator.is_engaged()
                {
                    info!(
                        "{} pass finished, rescanning in {:?}",
                        source, self.rescan_delay
                    );
                    *rescan_at = Some(Instant::now() + self.rescan_delay);
                }
            }
        }
    }

    async fn on_launch_event(&self, event: LaunchEvent, rescan_at: &mut Option<Instant>) {
        match event {
            LaunchEvent::Launching { .. } => {
                *rescan_at = None;
                self.set_state(SelectorState::Launching).await;
            }
            LaunchEvent::HandedOff { target } => debug!("Waiting for consumer on {}", target),
            LaunchEvent::Busy { endpoint } => debug!("Waiting out busy headunit {}", endpoint),
            LaunchEvent::Connected => {
                *rescan_at = None;
                self.coordinator.sources().stop_all().await;
                self.set_state(SelectorState::Connected).await;
            }
            LaunchEvent::Disconnected | LaunchEvent::Released | LaunchEvent::Failed { .. } => {
                self.set_state(SelectorState::Discovering).await;
                info!("Restarting discovery");
                self.coordinator.sources().start_all().await;
            }
        }
    }

    async fn rescan(&self) {
        if self.state().await == SelectorState::Discovering && !self.coordinator.is_engaged() {
            info!("Restarting active scan...");
            self.coordinator.sources().start_kind(SourceKind::ActiveScan).await;
        }
    }

    async fn poll_status(&self, oracle_connected: &mut bool) {
        let connected = self.status.is_connected().await;
        if connected && !*oracle_connected {
            info!("Status oracle reports an active session");
            self.coordinator.mark_connected();
        } else if !connected && *oracle_connected && self.coordinator.is_connected() {
            info!("Status oracle reports the session ended");
            self.coordinator.mark_disconnected().await;
        }
        *oracle_connected = connected;
    }
}

async fn control_loop(
    ctx: ControlContext,
    mut discoveries: mpsc::UnboundedReceiver<DiscoveryEvent>,
    mut launches: broadcast::Receiver<LaunchEvent>,
    token: CancellationToken,
    mut oracle_connected: bool,
) {
    let mut rescan_at: Option<Instant> = None;
    let mut poll = tokio::time::interval_at(Instant::now() + ctx.poll_interval, ctx.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            Some(event) = discoveries.recv() => {
                ctx.on_discovery(event, &mut rescan_at).await;
            }
            result = launches.recv() => match result {
                Ok(event) => ctx.on_launch_event(event, &mut rescan_at).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Selector missed {} launch events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = wait_until(rescan_at) => {
                rescan_at = None;
                ctx.rescan().await;
            }
            _ = poll.tick() => {
                ctx.poll_status(&mut oracle_connected).await;
            }
        }
    }
    debug!("Selector control loop exited");
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_plans() {
        assert_eq!(
            ConnectionMode::SharedNetwork.plan(),
            &[SourceKind::Directory, SourceKind::ActiveScan]
        );
        assert_eq!(
            ConnectionMode::PhoneHotspot.plan(),
            &[SourceKind::Trigger, SourceKind::Directory]
        );
        assert_eq!(ConnectionMode::TabletHotspot.plan(), &[SourceKind::Trigger]);
        assert_eq!(ConnectionMode::WifiDirect.plan(), &[SourceKind::Directory]);
    }

    #[test]
    fn test_relay_policy() {
        assert!(RelayPolicy::Auto.use_relay(ConnectionMode::PhoneHotspot));
        assert!(!RelayPolicy::Auto.use_relay(ConnectionMode::SharedNetwork));
        assert!(RelayPolicy::Always.use_relay(ConnectionMode::WifiDirect));
        assert!(!RelayPolicy::Never.use_relay(ConnectionMode::PhoneHotspot));
    }

    #[test]
    fn test_mode_parse_and_display() {
        for mode in [
            ConnectionMode::SharedNetwork,
            ConnectionMode::PhoneHotspot,
            ConnectionMode::TabletHotspot,
            ConnectionMode::WifiDirect,
        ] {
            assert_eq!(mode.to_string().parse::<ConnectionMode>(), Ok(mode));
        }
        assert_eq!("  Phone-Hotspot ".parse(), Ok(ConnectionMode::PhoneHotspot));
        assert!("usb".parse::<ConnectionMode>().is_err());
    }

    #[test]
    fn test_mode_serde_matches_display() {
        let json = serde_json::to_string(&ConnectionMode::TabletHotspot).unwrap();
        assert_eq!(json, r#""tablet-hotspot""#);

        let policy: RelayPolicy = serde_json::from_str(r#""always""#).unwrap();
        assert_eq!(policy, RelayPolicy::Always);
    }

    #[test]
    fn test_mode_value_enum_names() {
        use clap::ValueEnum;
        let names: Vec<String> = ConnectionMode::value_variants()
            .iter()
            .filter_map(|m| m.to_possible_value())
            .map(|v| v.get_name().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["shared-network", "phone-hotspot", "tablet-hotspot", "wifi-direct"]
        );
    }

    #[test]
    fn test_selector_settings_from_config() {
        let mut config = Config::default();
        config.launch.relay = RelayPolicy::Never;
        config.status.poll_interval_secs = 7;

        let settings = SelectorSettings::from(&config);
        assert_eq!(settings.service_port, 5288);
        assert_eq!(settings.relay_policy, RelayPolicy::Never);
        assert_eq!(settings.rescan_delay, Duration::from_secs(10));
        assert_eq!(settings.poll_interval, Duration::from_secs(7));
    }
}
