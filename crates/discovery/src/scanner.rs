//! Active network scanner.
//!
//! Each pass runs two phases:
//!
//! 1. **Gateway first**: default gateways and the `<subnet>.1` guess of every
//!    interface are probed one after another. A hit ends the pass.
//! 2. **Full subnet**: every `/24` of the active interfaces is swept, hosts
//!    `.1` to `.254`, with bounded concurrency. The first hit is reported as
//!    soon as it lands; the remaining probes finish and are discarded.
//!
//! A [`DiscoveryEvent::PassComplete`] closes every pass. Scheduling the next
//! pass is the caller's job.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, LEGACY_DISCOVERY_PORT, PRIMARY_DISCOVERY_PORT};
use crate::error::Result;
use crate::inventory::{gateway_candidates, subnet_hosts, subnet_prefixes, NetworkInventory, SystemInventory};
use crate::probe::{probe_ports, PortProber, TcpProber, DEFAULT_PROBE_TIMEOUT};
use crate::source::{emit, DiscoveryEvent, DiscoverySource, EventSink, SourceKind};

/// Default number of subnet probes allowed in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 128;

/// Scanner settings.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Ports probed on every candidate, highest priority first.
    pub ports: Vec<u16>,
    /// Connect timeout of a single probe.
    pub probe_timeout: Duration,
    /// Maximum subnet probes in flight.
    pub max_concurrency: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            ports: vec![PRIMARY_DISCOVERY_PORT, LEGACY_DISCOVERY_PORT],
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

/// State shared by the tasks of one scan pass.
#[derive(Clone)]
struct PassContext {
    ports: Arc<[u16]>,
    probe_timeout: Duration,
    max_concurrency: usize,
    prober: Arc<dyn PortProber>,
    inventory: Arc<dyn NetworkInventory>,
    events: EventSink,
    token: CancellationToken,
}

/// A running pass.
struct ScanPass {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Finds the headunit by probing likely hosts on the local network.
pub struct ActiveScanner {
    config: ScanConfig,
    prober: Arc<dyn PortProber>,
    inventory: Arc<dyn NetworkInventory>,
    events: EventSink,
    pass: Option<ScanPass>,
}

impl ActiveScanner {
    /// Creates a scanner using real TCP probes and the system inventory.
    pub fn new(config: ScanConfig, events: EventSink) -> Self {
        Self {
            config,
            prober: Arc::new(TcpProber),
            inventory: Arc::new(SystemInventory),
            events,
            pass: None,
        }
    }

    /// Replaces the port prober.
    pub fn with_prober(mut self, prober: Arc<dyn PortProber>) -> Self {
        self.prober = prober;
        self
    }

    /// Replaces the network inventory.
    pub fn with_inventory(mut self, inventory: Arc<dyn NetworkInventory>) -> Self {
        self.inventory = inventory;
        self
    }

    /// Starts a scan pass unless one is already running.
    pub fn start_scan(&mut self) {
        if self.is_scanning() {
            debug!("Scan pass already running");
            return;
        }

        info!("Starting scan...");
        let token = CancellationToken::new();
        let ctx = PassContext {
            ports: Arc::from(self.config.ports.as_slice()),
            probe_timeout: self.config.probe_timeout,
            max_concurrency: self.config.max_concurrency.max(1),
            prober: Arc::clone(&self.prober),
            inventory: Arc::clone(&self.inventory),
            events: self.events.clone(),
            token: token.clone(),
        };

        let handle = tokio::spawn(async move {
            let pass_token = ctx.token.clone();
            tokio::select! {
                _ = pass_token.cancelled() => {
                    debug!("Scan pass cancelled");
                }
                _ = run_pass(ctx) => {}
            }
        });

        self.pass = Some(ScanPass { token, handle });
    }

    /// Cancels the running pass, if any. In-flight probes are dropped, which
    /// closes their sockets, and no further events are delivered.
    pub fn stop(&mut self) {
        if let Some(pass) = self.pass.take() {
            pass.token.cancel();
            pass.handle.abort();
            info!("Active scan stopped");
        }
    }

    /// Whether a pass is in progress.
    pub fn is_scanning(&self) -> bool {
        self.pass
            .as_ref()
            .map(|pass| !pass.handle.is_finished())
            .unwrap_or(false)
    }
}

impl DiscoverySource for ActiveScanner {
    fn kind(&self) -> SourceKind {
        SourceKind::ActiveScan
    }

    fn start(&mut self) -> Result<()> {
        self.start_scan();
        Ok(())
    }

    fn stop(&mut self) {
        ActiveScanner::stop(self);
    }

    fn is_running(&self) -> bool {
        self.is_scanning()
    }
}

impl Drop for ActiveScanner {
    fn drop(&mut self) {
        if let Some(pass) = self.pass.take() {
            pass.token.cancel();
            pass.handle.abort();
        }
    }
}

async fn run_pass(ctx: PassContext) {
    info!("Step 1 - Quick gateway scan");
    if gateway_phase(&ctx).await {
        info!("Gateway found service, skipping subnet scan");
    } else {
        info!("Step 2 - Full subnet scan");
        subnet_phase(&ctx).await;
    }

    emit(
        &ctx.events,
        &ctx.token,
        DiscoveryEvent::PassComplete {
            source: SourceKind::ActiveScan,
        },
    );
}

/// Probes gateway candidates in order. Returns true on the first hit.
async fn gateway_phase(ctx: &PassContext) -> bool {
    let suspects = gateway_candidates(ctx.inventory.as_ref());
    if suspects.is_empty() {
        debug!("No gateway candidates");
        return false;
    }

    info!("Checking suspects: {:?}", suspects);
    for suspect in suspects {
        let host = IpAddr::V4(suspect);
        if let Some(port) =
            probe_ports(ctx.prober.as_ref(), host, &ctx.ports, ctx.probe_timeout).await
        {
            report(ctx, Endpoint::new(host, port));
            return true;
        }
    }
    false
}

/// Sweeps every `/24` of the active interfaces concurrently.
async fn subnet_phase(ctx: &PassContext) {
    let interfaces = match ctx.inventory.interfaces() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            warn!("Could not list interfaces for deep scan: {}", e);
            return;
        }
    };

    let prefixes = subnet_prefixes(&interfaces);
    if prefixes.is_empty() {
        warn!("Could not determine subnet for deep scan");
        return;
    }

    let permits = Arc::new(Semaphore::new(ctx.max_concurrency));
    let mut probes = JoinSet::new();

    for prefix in prefixes {
        let [a, b, c] = prefix;
        info!("Scanning subnet: {}.{}.{}.*", a, b, c);

        for host in subnet_hosts(prefix) {
            let permits = Arc::clone(&permits);
            let prober = Arc::clone(&ctx.prober);
            let ports = Arc::clone(&ctx.ports);
            let timeout = ctx.probe_timeout;

            probes.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                probe_host(prober.as_ref(), host, &ports, timeout).await
            });
        }
    }

    let mut reported = false;
    while let Some(result) = probes.join_next().await {
        match result {
            Ok(Some(endpoint)) if !reported => {
                reported = true;
                report(ctx, endpoint);
            }
            Ok(Some(endpoint)) => debug!("Discarding additional match {}", endpoint),
            Ok(None) => {}
            Err(e) => debug!("Probe task failed: {}", e),
        }
    }
}

async fn probe_host(
    prober: &dyn PortProber,
    host: Ipv4Addr,
    ports: &[u16],
    timeout: Duration,
) -> Option<Endpoint> {
    let host = IpAddr::V4(host);
    probe_ports(prober, host, ports, timeout)
        .await
        .map(|port| Endpoint::new(host, port))
}

fn report(ctx: &PassContext, endpoint: Endpoint) {
    info!("Found headunit service on {}", endpoint);
    emit(
        &ctx.events,
        &ctx.token,
        DiscoveryEvent::Found {
            source: SourceKind::ActiveScan,
            endpoint,
        },
    );
}
