//! Local network inventory: active IPv4 interfaces and default gateways.
//!
//! The scanner derives its candidate sets from this module. Everything is
//! recomputed per scan pass, since interfaces come and go as hotspots are
//! toggled.

use std::net::{IpAddr, Ipv4Addr};

use tracing::debug;

use crate::error::{DiscoveryError, Result};

/// Routing table flag marking a route that goes through a gateway.
#[cfg(any(target_os = "linux", test))]
const RTF_GATEWAY: u32 = 0x0002;

/// An IPv4 address assigned to an active, non-loopback interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    /// Interface name (`wlan0`, `ap0`, ...).
    pub name: String,
    /// Address assigned to the interface.
    pub ip: Ipv4Addr,
    /// Network mask of the assigned address.
    pub netmask: Ipv4Addr,
}

impl InterfaceAddr {
    /// Returns true if `host` lies in this interface's subnet.
    pub fn contains(&self, host: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(self.ip) & mask == u32::from(host) & mask
    }

    /// The `/24`-equivalent prefix used for the full-subnet scan.
    pub fn prefix24(&self) -> [u8; 3] {
        let [a, b, c, _] = self.ip.octets();
        [a, b, c]
    }
}

/// Source of interface and gateway information.
pub trait NetworkInventory: Send + Sync {
    /// Active, non-loopback IPv4 interface addresses.
    fn interfaces(&self) -> Result<Vec<InterfaceAddr>>;

    /// Default-route gateway addresses of the active interfaces.
    fn gateways(&self) -> Result<Vec<Ipv4Addr>>;
}

/// Inventory read from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInventory;

impl NetworkInventory for SystemInventory {
    fn interfaces(&self) -> Result<Vec<InterfaceAddr>> {
        let addrs = if_addrs::get_if_addrs()
            .map_err(|e| DiscoveryError::Inventory(format!("failed to list interfaces: {}", e)))?;

        Ok(addrs
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .filter_map(|iface| match iface.addr {
                if_addrs::IfAddr::V4(v4) => Some(InterfaceAddr {
                    name: iface.name,
                    ip: v4.ip,
                    netmask: v4.netmask,
                }),
                if_addrs::IfAddr::V6(_) => None,
            })
            .collect())
    }

    #[cfg(target_os = "linux")]
    fn gateways(&self) -> Result<Vec<Ipv4Addr>> {
        match std::fs::read_to_string("/proc/net/route") {
            Ok(contents) => Ok(parse_route_table(&contents)),
            Err(e) => {
                debug!("Routing table unavailable: {}", e);
                Ok(Vec::new())
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn gateways(&self) -> Result<Vec<Ipv4Addr>> {
        debug!("Gateway lookup not supported on this platform, relying on heuristics");
        Ok(Vec::new())
    }
}

/// Extracts default-route gateways from the contents of `/proc/net/route`.
///
/// Addresses in that file are the in-memory (network order) bytes printed as
/// a native-endian hex word.
#[cfg(any(target_os = "linux", test))]
pub(crate) fn parse_route_table(contents: &str) -> Vec<Ipv4Addr> {
    let mut gateways = Vec::new();

    for line in contents.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }

        let (Ok(destination), Ok(gateway), Ok(flags)) = (
            u32::from_str_radix(fields[1], 16),
            u32::from_str_radix(fields[2], 16),
            u32::from_str_radix(fields[3], 16),
        ) else {
            continue;
        };

        if destination != 0 || gateway == 0 || flags & RTF_GATEWAY == 0 {
            continue;
        }

        let addr = Ipv4Addr::from(gateway.to_ne_bytes());
        if !gateways.contains(&addr) {
            gateways.push(addr);
        }
    }

    gateways
}

/// Builds the gateway-phase candidate list: real default gateways first,
/// then the `<subnet>.1` guess for every interface. Order is preserved and
/// duplicates removed.
pub fn gateway_candidates<I>(inventory: &I) -> Vec<Ipv4Addr>
where
    I: NetworkInventory + ?Sized,
{
    let mut candidates = Vec::new();

    match inventory.gateways() {
        Ok(gateways) => candidates.extend(gateways),
        Err(e) => debug!("Gateway lookup failed: {}", e),
    }

    match inventory.interfaces() {
        Ok(interfaces) => {
            for iface in interfaces {
                let [a, b, c, _] = iface.ip.octets();
                candidates.push(Ipv4Addr::new(a, b, c, 1));
            }
        }
        Err(e) => debug!("Interface lookup failed: {}", e),
    }

    let mut unique = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !unique.contains(&candidate) {
            unique.push(candidate);
        }
    }
    unique
}

/// Distinct `/24` prefixes of the given interfaces, in interface order.
pub fn subnet_prefixes(interfaces: &[InterfaceAddr]) -> Vec<[u8; 3]> {
    let mut prefixes = Vec::new();
    for iface in interfaces {
        let prefix = iface.prefix24();
        if !prefixes.contains(&prefix) {
            prefixes.push(prefix);
        }
    }
    prefixes
}

/// Host addresses `.1` through `.254` of a `/24` prefix.
pub fn subnet_hosts(prefix: [u8; 3]) -> impl Iterator<Item = Ipv4Addr> {
    let [a, b, c] = prefix;
    (1..=254u8).map(move |d| Ipv4Addr::new(a, b, c, d))
}

/// Finds the local interface whose subnet contains `host`.
pub fn interface_for<I>(inventory: &I, host: IpAddr) -> Option<InterfaceAddr>
where
    I: NetworkInventory + ?Sized,
{
    let IpAddr::V4(host) = host else {
        return None;
    };
    inventory
        .interfaces()
        .ok()?
        .into_iter()
        .find(|iface| iface.contains(host))
}
