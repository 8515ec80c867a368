//! Runtime info of a balancer: active sessions, registry entries and sessions.

use super::stats::{ModuleStats, RealStats, VsStats};
use super::types::{RealIdentifier, VsIdentifier};
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

/// A value refreshed in the background, with the time of its last refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncInfo {
    pub value: usize,
    pub updated_at: SystemTime,
}

impl Default for AsyncInfo {
    fn default() -> Self {
        Self {
            value: 0,
            updated_at: SystemTime::UNIX_EPOCH,
        }
    }
}

/// Configuration independent info about a virtual service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsInfo {
    pub registry_idx: usize,
    pub identifier: VsIdentifier,
    pub active_sessions: AsyncInfo,
    /// `UNIX_EPOCH` when no packet was seen yet.
    pub last_packet_timestamp: SystemTime,
    pub stats: VsStats,
}

/// Configuration independent info about a real.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealInfo {
    pub registry_idx: usize,
    pub identifier: RealIdentifier,
    pub active_sessions: AsyncInfo,
    /// `UNIX_EPOCH` when no packet was seen yet.
    pub last_packet_timestamp: SystemTime,
    pub stats: RealStats,
}

/// Snapshot of the balancer state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalancerInfo {
    pub active_sessions: AsyncInfo,
    pub module: ModuleStats,
    /// Every registered virtual service, ordered by registry index.
    pub vs_info: Vec<VsInfo>,
    /// Every registered real, ordered by registry index.
    pub real_info: Vec<RealInfo>,
}

/// A client session pinned to a real.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub client_addr: IpAddr,
    pub client_port: u16,
    pub real: RealIdentifier,
    pub create_timestamp: SystemTime,
    pub last_packet_timestamp: SystemTime,
    pub timeout: Duration,
}

/// Active sessions of a balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionsInfo {
    pub sessions_count: usize,
    pub sessions: Vec<SessionInfo>,
}
