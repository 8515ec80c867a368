//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use yanet_balancer::balancer::pb;
use yanet_balancer::balancer::types::{RealIdentifier, TransportProto, VsFlags, VsIdentifier};
use yanet_balancer::dataplane::{Agent, MemoryAgent, MemorySessionTable};
use yanet_balancer::service::BalancerService;

pub const VIP: &str = "10.0.0.1";
pub const VIP_PORT: u16 = 80;

/// Service over `instances` in-memory agents.
pub struct TestService {
    pub service: BalancerService,
    pub agents: Vec<Arc<MemoryAgent>>,
}

impl TestService {
    pub fn new(instances: usize) -> Self {
        let agents: Vec<Arc<MemoryAgent>> = (0..instances).map(|_| Arc::new(MemoryAgent::new())).collect();
        let dyn_agents: Vec<Arc<dyn Agent>> = agents.iter().map(|agent| agent.clone() as Arc<dyn Agent>).collect();
        Self {
            service: BalancerService::new(dyn_agents),
            agents,
        }
    }

    /// Live session table of `instance`, most recent first.
    pub fn table(&self, instance: usize) -> MemorySessionTable {
        self.agents[instance]
            .last_session_table()
            .expect("no session table on dataplane instance")
    }

    /// Weights published for the first virtual service of `name`.
    pub fn published_weights(&self, instance: usize, name: &str) -> Vec<u16> {
        self.agents[instance]
            .published(name)
            .expect("module is not published")
            .virtual_services[0]
            .reals
            .iter()
            .map(|real| real.weight)
            .collect()
    }
}

pub fn target(name: &str, instance: u32) -> pb::ConfigTarget {
    pb::ConfigTarget {
        config_name: name.to_string(),
        dataplane_instance: instance,
    }
}

pub fn target_request(name: &str, instance: u32) -> pb::TargetRequest {
    pb::TargetRequest {
        target: Some(target(name, instance)),
    }
}

pub fn real(addr: &str, weight: u32) -> pb::Real {
    pb::Real {
        dst_addr: addr.to_string(),
        src_addr: "10.1.0.0".to_string(),
        src_mask: "255.255.0.0".to_string(),
        weight,
        enabled: true,
    }
}

/// One TCP service on `VIP:VIP_PORT` with the given reals.
pub fn module_config(reals: Vec<pb::Real>, wlc: bool, wlc_period_ms: u64) -> pb::ModuleConfig {
    pb::ModuleConfig {
        source_address_v4: "5.5.5.5".to_string(),
        source_address_v6: "fe80::5".to_string(),
        sessions_timeouts: Some(pb::SessionsTimeouts {
            tcp: 600,
            udp: 60,
            default: 60,
            ..pb::SessionsTimeouts::default()
        }),
        virtual_services: vec![pb::VirtualService {
            addr: VIP.to_string(),
            port: u32::from(VIP_PORT),
            proto: TransportProto::Tcp,
            flags: VsFlags {
                wlc,
                ..VsFlags::default()
            },
            reals,
            ..pb::VirtualService::default()
        }],
        wlc: Some(pb::WlcConfig {
            power: Some(10),
            max_weight: Some(1000),
            update_period_ms: wlc_period_ms,
        }),
        ..pb::ModuleConfig::default()
    }
}

pub fn state_config(capacity: u64, scan_period_ms: u64, max_load_factor: f32) -> pb::ModuleStateConfig {
    pb::ModuleStateConfig {
        session_table_capacity: capacity,
        session_table_scan_period_ms: Some(scan_period_ms),
        session_table_max_load_factor: max_load_factor,
    }
}

pub fn update_request(
    name: &str,
    instance: u32,
    module: pb::ModuleConfig,
    state: pb::ModuleStateConfig,
) -> pb::UpdateConfigRequest {
    pb::UpdateConfigRequest {
        target: Some(target(name, instance)),
        module_config: Some(module),
        module_state_config: Some(state),
    }
}

pub fn real_id(addr: &str) -> RealIdentifier {
    RealIdentifier {
        vs: VsIdentifier {
            addr: VIP.parse().unwrap(),
            port: VIP_PORT,
            proto: TransportProto::Tcp,
        },
        addr: addr.parse().unwrap(),
    }
}

/// Opens `count` sessions from distinct client ports of `client` to `real`.
pub fn open_sessions(table: &MemorySessionTable, client: &str, real: &str, count: u16, now: SystemTime) {
    for port in 0..count {
        table
            .open_session(client.parse().unwrap(), port, &real_id(real), now, Duration::from_secs(600))
            .unwrap();
    }
}

/// Advances paused tokio time and lets spawned tasks run.
pub async fn advance(duration: Duration) {
    tokio::time::advance(duration).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
