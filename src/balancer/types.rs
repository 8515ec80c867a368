//! Domain types of a balancer configuration.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// Transport protocol of a virtual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProto {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for TransportProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Real selection algorithm of a virtual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheduler {
    /// Hash of the client address and port.
    #[default]
    SourceHash,
    /// Round robin over enabled reals.
    RoundRobin,
}

/// Identity of a virtual service: address, port and protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VsIdentifier {
    pub addr: IpAddr,
    pub port: u16,
    pub proto: TransportProto,
}

impl fmt::Display for VsIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(addr) => write!(f, "{addr}:{}/{}", self.port, self.proto),
            IpAddr::V6(addr) => write!(f, "[{addr}]:{}/{}", self.port, self.proto),
        }
    }
}

/// Identity of a real: the virtual service it serves plus its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RealIdentifier {
    pub vs: VsIdentifier,
    pub addr: IpAddr,
}

impl fmt::Display for RealIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.vs, self.addr)
    }
}

/// Per virtual service feature flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VsFlags {
    /// Encapsulate forwarded packets in GRE instead of IP-in-IP.
    pub gre: bool,
    /// One packet scheduling: no session is created.
    pub ops: bool,
    /// Balance on L3 only; the port must be zero.
    pub pure_l3: bool,
    /// Clamp TCP MSS of forwarded SYN packets.
    pub fix_mss: bool,
    /// Reweight reals with weighted least connections.
    pub wlc: bool,
}

/// Backend server of a virtual service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Real {
    /// Slot assigned by the session table registry.
    pub registry_idx: usize,
    pub identifier: RealIdentifier,
    /// Configured weight.
    pub weight: u16,
    /// Weight published to the dataplane when WLC is enabled.
    pub effective_weight: u16,
    /// Source address used for tunneled packets.
    pub src_addr: IpAddr,
    pub src_mask: IpAddr,
    pub enabled: bool,
}

impl Real {
    /// Creates a real whose effective weight starts at the configured one.
    pub fn new(
        identifier: RealIdentifier,
        weight: u16,
        src_addr: IpAddr,
        src_mask: IpAddr,
        enabled: bool,
    ) -> Self {
        Self {
            registry_idx: 0,
            identifier,
            weight,
            effective_weight: weight,
            src_addr,
            src_mask,
            enabled,
        }
    }
}

/// A balanced service and its reals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualService {
    /// Slot assigned by the session table registry.
    pub registry_idx: usize,
    pub identifier: VsIdentifier,
    pub flags: VsFlags,
    pub scheduler: Scheduler,
    /// Client prefixes allowed to reach the service; empty allows everyone.
    pub allowed_sources: Vec<IpNet>,
    /// Peer balancers sharing sessions of this service.
    pub peers: Vec<IpAddr>,
    pub reals: Vec<Real>,
}

impl VirtualService {
    /// Weight the dataplane should use for the real at `idx`.
    ///
    /// WLC services publish the effective weight, the rest the configured one.
    pub fn published_weight(&self, idx: usize) -> u16 {
        let real = &self.reals[idx];
        if self.flags.wlc {
            real.effective_weight
        } else {
            real.weight
        }
    }

    pub fn find_real_mut(&mut self, addr: IpAddr) -> Option<&mut Real> {
        self.reals.iter_mut().find(|real| real.identifier.addr == addr)
    }
}

/// Addresses owned by the balancer itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalancerAddresses {
    /// Source of IPv4 tunnels.
    pub source_v4: Ipv4Addr,
    /// Source of IPv6 tunnels.
    pub source_v6: Ipv6Addr,
    /// Destinations whose packets are decapsulated before balancing.
    pub decap: Vec<IpAddr>,
}

impl Default for BalancerAddresses {
    fn default() -> Self {
        Self {
            source_v4: Ipv4Addr::UNSPECIFIED,
            source_v6: Ipv6Addr::UNSPECIFIED,
            decap: Vec::new(),
        }
    }
}

/// Session timeouts in seconds, per TCP state and for UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionsTimeouts {
    pub tcp_syn_ack: u32,
    pub tcp_syn: u32,
    pub tcp_fin: u32,
    pub tcp: u32,
    pub udp: u32,
    pub default: u32,
}

/// Weighted least connections parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WlcConfig {
    /// Amplification of the load imbalance.
    pub power: u64,
    /// Upper bound of an effective weight.
    pub max_weight: u16,
    /// Period of the background reweighting; zero disables it.
    pub update_period: Duration,
}

/// Change to a single real.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealUpdate {
    pub real: RealIdentifier,
    pub weight: Option<u16>,
    pub enabled: Option<bool>,
}

/// Real updates accumulated until an explicit flush.
#[derive(Debug, Clone, Default)]
pub struct RealUpdateBuffer {
    updates: Vec<RealUpdate>,
}

impl RealUpdateBuffer {
    pub fn append(&mut self, updates: impl IntoIterator<Item = RealUpdate>) {
        self.updates.extend(updates);
    }

    /// Removes and returns every buffered update, oldest first.
    pub fn take(&mut self) -> Vec<RealUpdate> {
        std::mem::take(&mut self.updates)
    }

    pub fn clear(&mut self) {
        self.updates.clear();
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}
