//! Wire messages of the balancer API.
//!
//! Messages are plain serde structs so they travel as JSON or TOML. Rules:
//!
//! - 64-bit integers are written as decimal strings and read from either a
//!   string or a number
//! - timestamps are RFC 3339 strings
//! - durations are integer milliseconds
//! - addresses in requests are strings; they are validated when parsed into
//!   domain types

use super::info::{AsyncInfo as DomainAsyncInfo, BalancerInfo as DomainBalancerInfo};
use super::info::{SessionInfo as DomainSessionInfo, SessionsInfo as DomainSessionsInfo};
use super::stats::{self, ModuleStats, RealStats, VsStats};
use super::types::{Scheduler, TransportProto, VsFlags};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Serde helpers for `u64` written as a decimal string.
pub mod decimal {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| D::Error::custom(format!("invalid unsigned integer '{text}'"))),
        }
    }
}

/// Serde helpers for `Option<u64>` written as a decimal string.
pub mod decimal_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    struct Wrapper(#[serde(with = "super::decimal")] u64);

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.collect_str(value),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(value)| value))
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Real {
    pub dst_addr: String,
    pub src_addr: String,
    pub src_mask: String,
    pub weight: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualService {
    pub addr: String,
    pub port: u32,
    pub proto: TransportProto,
    pub scheduler: Scheduler,
    pub flags: VsFlags,
    /// Allowed client prefixes, e.g. `10.0.0.0/8`.
    pub allowed_srcs: Vec<String>,
    pub reals: Vec<Real>,
    pub peers: Vec<String>,
}

/// Session timeouts in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsTimeouts {
    pub tcp_syn_ack: u32,
    pub tcp_syn: u32,
    pub tcp_fin: u32,
    pub tcp: u32,
    pub udp: u32,
    pub default: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WlcConfig {
    #[serde(with = "decimal_opt", skip_serializing_if = "Option::is_none")]
    pub power: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_weight: Option<u32>,
    #[serde(with = "decimal")]
    pub update_period_ms: u64,
}

/// Packet handling configuration of a balancer module.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    pub source_address_v4: String,
    pub source_address_v6: String,
    pub decap_addresses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions_timeouts: Option<SessionsTimeouts>,
    pub virtual_services: Vec<VirtualService>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wlc: Option<WlcConfig>,
}

/// Session table configuration of a balancer module.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleStateConfig {
    /// Requested capacity; zero keeps the current one.
    #[serde(with = "decimal")]
    pub session_table_capacity: u64,
    #[serde(with = "decimal_opt", skip_serializing_if = "Option::is_none")]
    pub session_table_scan_period_ms: Option<u64>,
    pub session_table_max_load_factor: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RealUpdate {
    pub virtual_ip: String,
    pub port: u32,
    pub proto: TransportProto,
    pub real_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
}

// ============================================================================
// Runtime Info
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncInfo {
    #[serde(with = "decimal")]
    pub value: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<&DomainAsyncInfo> for AsyncInfo {
    fn from(info: &DomainAsyncInfo) -> Self {
        Self {
            value: info.value as u64,
            updated_at: info.updated_at.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VsInfo {
    #[serde(with = "decimal")]
    pub vs_registry_idx: u64,
    pub ip: IpAddr,
    pub port: u16,
    pub proto: TransportProto,
    pub active_sessions: AsyncInfo,
    pub last_packet_timestamp: DateTime<Utc>,
    pub stats: VsStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealInfo {
    #[serde(with = "decimal")]
    pub real_registry_idx: u64,
    pub vs_ip: IpAddr,
    pub vs_port: u16,
    pub vs_proto: TransportProto,
    pub real_ip: IpAddr,
    pub active_sessions: AsyncInfo,
    pub last_packet_timestamp: DateTime<Utc>,
    pub stats: RealStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerInfo {
    pub active_sessions: AsyncInfo,
    pub module: ModuleStats,
    pub vs_info: Vec<VsInfo>,
    pub real_info: Vec<RealInfo>,
}

impl From<&DomainBalancerInfo> for BalancerInfo {
    fn from(info: &DomainBalancerInfo) -> Self {
        Self {
            active_sessions: (&info.active_sessions).into(),
            module: info.module,
            vs_info: info
                .vs_info
                .iter()
                .map(|vs| VsInfo {
                    vs_registry_idx: vs.registry_idx as u64,
                    ip: vs.identifier.addr,
                    port: vs.identifier.port,
                    proto: vs.identifier.proto,
                    active_sessions: (&vs.active_sessions).into(),
                    last_packet_timestamp: vs.last_packet_timestamp.into(),
                    stats: vs.stats,
                })
                .collect(),
            real_info: info
                .real_info
                .iter()
                .map(|real| RealInfo {
                    real_registry_idx: real.registry_idx as u64,
                    vs_ip: real.identifier.vs.addr,
                    vs_port: real.identifier.vs.port,
                    vs_proto: real.identifier.vs.proto,
                    real_ip: real.identifier.addr,
                    active_sessions: (&real.active_sessions).into(),
                    last_packet_timestamp: real.last_packet_timestamp.into(),
                    stats: real.stats,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub client_addr: IpAddr,
    pub client_port: u16,
    pub vs_addr: IpAddr,
    pub vs_port: u16,
    pub real_addr: IpAddr,
    pub real_port: u16,
    pub create_timestamp: DateTime<Utc>,
    pub last_packet_timestamp: DateTime<Utc>,
    #[serde(with = "decimal")]
    pub timeout_ms: u64,
}

impl From<&DomainSessionInfo> for SessionInfo {
    fn from(session: &DomainSessionInfo) -> Self {
        Self {
            client_addr: session.client_addr,
            client_port: session.client_port,
            vs_addr: session.real.vs.addr,
            vs_port: session.real.vs.port,
            real_addr: session.real.addr,
            real_port: session.real.vs.port,
            create_timestamp: session.create_timestamp.into(),
            last_packet_timestamp: session.last_packet_timestamp.into(),
            timeout_ms: session.timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionsInfo {
    #[serde(with = "decimal")]
    pub sessions_count: u64,
    pub sessions: Vec<SessionInfo>,
}

impl From<&DomainSessionsInfo> for SessionsInfo {
    fn from(info: &DomainSessionsInfo) -> Self {
        Self {
            sessions_count: info.sessions_count as u64,
            sessions: info.sessions.iter().map(Into::into).collect(),
        }
    }
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VsStatsInfo {
    #[serde(with = "decimal")]
    pub vs_registry_idx: u64,
    pub ip: IpAddr,
    pub port: u16,
    pub proto: TransportProto,
    pub stats: VsStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealStatsInfo {
    #[serde(with = "decimal")]
    pub real_registry_idx: u64,
    pub vs_ip: IpAddr,
    pub port: u16,
    pub proto: TransportProto,
    pub real_ip: IpAddr,
    pub stats: RealStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerStats {
    pub module: ModuleStats,
    pub vs: Vec<VsStatsInfo>,
    pub reals: Vec<RealStatsInfo>,
}

impl From<&stats::BalancerStats> for BalancerStats {
    fn from(stats: &stats::BalancerStats) -> Self {
        Self {
            module: stats.module,
            vs: stats
                .vs
                .iter()
                .map(|vs| VsStatsInfo {
                    vs_registry_idx: vs.registry_idx as u64,
                    ip: vs.identifier.addr,
                    port: vs.identifier.port,
                    proto: vs.identifier.proto,
                    stats: vs.stats,
                })
                .collect(),
            reals: stats
                .reals
                .iter()
                .map(|real| RealStatsInfo {
                    real_registry_idx: real.registry_idx as u64,
                    vs_ip: real.identifier.vs.addr,
                    port: real.identifier.vs.port,
                    proto: real.identifier.vs.proto,
                    real_ip: real.identifier.addr,
                    stats: real.stats,
                })
                .collect(),
        }
    }
}

// ============================================================================
// Service Requests
// ============================================================================

/// Balancer instance addressed by a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigTarget {
    pub config_name: String,
    pub dataplane_instance: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfigRequest {
    pub target: Option<ConfigTarget>,
    pub module_config: Option<ModuleConfig>,
    pub module_state_config: Option<ModuleStateConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateRealsRequest {
    pub target: Option<ConfigTarget>,
    pub updates: Vec<RealUpdate>,
    /// Buffer the updates until the next flush instead of applying them.
    pub buffer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetRequest {
    pub target: Option<ConfigTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlushRealUpdatesResponse {
    pub updates_flushed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowConfigResponse {
    pub target: ConfigTarget,
    pub module_config: ModuleConfig,
    pub module_state_config: ModuleStateConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListConfigsResponse {
    pub configs: Vec<ConfigTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigStatsRequest {
    pub target: Option<ConfigTarget>,
    pub device: String,
    pub pipeline: String,
    pub function: String,
    pub chain: String,
}
