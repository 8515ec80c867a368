//! Packet counters reported by the dataplane.
//!
//! Counters serialize as decimal strings, like every 64-bit field on the wire.

use super::pb::decimal;
use super::types::{RealIdentifier, VirtualService, VsIdentifier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// L4 balancing counters of the whole module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct L4Stats {
    #[serde(with = "decimal")]
    pub incoming_packets: u64,
    #[serde(with = "decimal")]
    pub select_vs_failed: u64,
    #[serde(with = "decimal")]
    pub invalid_packets: u64,
    #[serde(with = "decimal")]
    pub select_real_failed: u64,
    #[serde(with = "decimal")]
    pub outgoing_packets: u64,
}

/// ICMP handling counters, kept separately for ICMPv4 and ICMPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IcmpStats {
    #[serde(with = "decimal")]
    pub incoming_packets: u64,
    #[serde(with = "decimal")]
    pub echo_responses: u64,
    #[serde(with = "decimal")]
    pub payload_too_short_ip: u64,
    #[serde(with = "decimal")]
    pub unmatching_src_from_original: u64,
    #[serde(with = "decimal")]
    pub payload_too_short_port: u64,
    #[serde(with = "decimal")]
    pub unexpected_transport: u64,
    #[serde(with = "decimal")]
    pub unrecognized_vs: u64,
    #[serde(with = "decimal")]
    pub forwarded_packets: u64,
    #[serde(with = "decimal")]
    pub broadcasted_packets: u64,
    #[serde(with = "decimal")]
    pub packet_clones_sent: u64,
    #[serde(with = "decimal")]
    pub packet_clones_received: u64,
    #[serde(with = "decimal")]
    pub packet_clone_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonStats {
    #[serde(with = "decimal")]
    pub incoming_packets: u64,
    #[serde(with = "decimal")]
    pub incoming_bytes: u64,
    #[serde(with = "decimal")]
    pub unexpected_network_proto: u64,
    #[serde(with = "decimal")]
    pub decap_successful: u64,
    #[serde(with = "decimal")]
    pub decap_failed: u64,
    #[serde(with = "decimal")]
    pub outgoing_packets: u64,
    #[serde(with = "decimal")]
    pub outgoing_bytes: u64,
}

/// Counters of a single virtual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VsStats {
    #[serde(with = "decimal")]
    pub incoming_packets: u64,
    #[serde(with = "decimal")]
    pub incoming_bytes: u64,
    #[serde(with = "decimal")]
    pub packet_src_not_allowed: u64,
    #[serde(with = "decimal")]
    pub no_reals: u64,
    #[serde(with = "decimal")]
    pub ops_packets: u64,
    #[serde(with = "decimal")]
    pub session_table_overflow: u64,
    #[serde(with = "decimal")]
    pub echo_icmp_packets: u64,
    #[serde(with = "decimal")]
    pub error_icmp_packets: u64,
    #[serde(with = "decimal")]
    pub real_is_disabled: u64,
    #[serde(with = "decimal")]
    pub real_is_removed: u64,
    #[serde(with = "decimal")]
    pub not_rescheduled_packets: u64,
    #[serde(with = "decimal")]
    pub broadcasted_icmp_packets: u64,
    #[serde(with = "decimal")]
    pub created_sessions: u64,
    #[serde(with = "decimal")]
    pub outgoing_packets: u64,
    #[serde(with = "decimal")]
    pub outgoing_bytes: u64,
}

/// Counters of a single real.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RealStats {
    #[serde(with = "decimal")]
    pub packets_real_disabled: u64,
    #[serde(with = "decimal")]
    pub packets_real_not_present: u64,
    #[serde(with = "decimal")]
    pub ops_packets: u64,
    #[serde(with = "decimal")]
    pub error_icmp_packets: u64,
    #[serde(with = "decimal")]
    pub created_sessions: u64,
    #[serde(with = "decimal")]
    pub packets: u64,
    #[serde(with = "decimal")]
    pub bytes: u64,
}

/// Module wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleStats {
    pub l4: L4Stats,
    pub icmpv4: IcmpStats,
    pub icmpv6: IcmpStats,
    pub common: CommonStats,
}

/// Counters read at one attachment point, indexed by registry slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleCounters {
    pub module: ModuleStats,
    pub vs: HashMap<usize, VsStats>,
    pub reals: HashMap<usize, RealStats>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsStatsInfo {
    pub registry_idx: usize,
    pub identifier: VsIdentifier,
    pub stats: VsStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealStatsInfo {
    pub registry_idx: usize,
    pub identifier: RealIdentifier,
    pub stats: RealStats,
}

/// Counters of a balancer joined with its configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalancerStats {
    pub module: ModuleStats,
    pub vs: Vec<VsStatsInfo>,
    pub reals: Vec<RealStatsInfo>,
}

impl BalancerStats {
    /// Joins configured services and reals with counters by registry index.
    ///
    /// Entries without counters are skipped.
    pub fn join(services: &[VirtualService], counters: &ModuleCounters) -> Self {
        let vs = services
            .iter()
            .filter_map(|vs| {
                counters.vs.get(&vs.registry_idx).map(|stats| VsStatsInfo {
                    registry_idx: vs.registry_idx,
                    identifier: vs.identifier,
                    stats: *stats,
                })
            })
            .collect();

        let reals = services
            .iter()
            .flat_map(|vs| &vs.reals)
            .filter_map(|real| {
                counters.reals.get(&real.registry_idx).map(|stats| RealStatsInfo {
                    registry_idx: real.registry_idx,
                    identifier: real.identifier,
                    stats: *stats,
                })
            })
            .collect();

        Self {
            module: counters.module,
            vs,
            reals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_serialize_as_strings() {
        let stats = L4Stats {
            incoming_packets: u64::MAX,
            ..L4Stats::default()
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["incoming_packets"], "18446744073709551615");
        assert_eq!(json["outgoing_packets"], "0");
    }

    #[test]
    fn test_counters_accept_numbers_and_strings() {
        let stats: RealStats =
            serde_json::from_str(r#"{"packets": "42", "bytes": 4200}"#).unwrap();
        assert_eq!(stats.packets, 42);
        assert_eq!(stats.bytes, 4200);
        assert_eq!(stats.created_sessions, 0);
    }
}
