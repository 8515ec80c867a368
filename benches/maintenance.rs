//! Balancer maintenance benchmarks.
//!
//! Benchmarks:
//! - WLC recompute of one virtual service for growing real counts
//! - Full maintenance pass (session scan + WLC + resize check) for growing
//!   session counts
//!
//! Run with:
//! ```bash
//! cargo bench --bench maintenance
//! ```
//!
//! For HTML reports:
//! ```bash
//! cargo bench --bench maintenance -- --verbose
//! open target/criterion/report/index.html
//! ```

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::collections::HashMap;
use std::hint::black_box;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use yanet_balancer::balancer::types::{
    Real, RealIdentifier, Scheduler, TransportProto, VirtualService, VsFlags, VsIdentifier, WlcConfig,
};
use yanet_balancer::balancer::{Balancer, pb, wlc};
use yanet_balancer::dataplane::MemoryAgent;

const VIP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

fn vs_id() -> VsIdentifier {
    VsIdentifier {
        addr: IpAddr::V4(VIP),
        port: 80,
        proto: TransportProto::Tcp,
    }
}

fn real_addr(idx: usize) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 168, (idx / 256) as u8, (idx % 256) as u8))
}

fn wlc_service(reals: usize) -> (VirtualService, HashMap<RealIdentifier, usize>) {
    let mut active = HashMap::new();
    let reals = (0..reals)
        .map(|idx| {
            let identifier = RealIdentifier {
                vs: vs_id(),
                addr: real_addr(idx),
            };
            active.insert(identifier, (idx % 7) * 100);
            Real::new(
                identifier,
                100,
                "10.1.0.0".parse().unwrap(),
                "255.255.0.0".parse().unwrap(),
                true,
            )
        })
        .collect();

    let vs = VirtualService {
        registry_idx: 0,
        identifier: vs_id(),
        flags: VsFlags {
            wlc: true,
            ..VsFlags::default()
        },
        scheduler: Scheduler::default(),
        allowed_sources: Vec::new(),
        peers: Vec::new(),
        reals,
    };
    (vs, active)
}

fn wlc_recompute(c: &mut Criterion) {
    let mut group = c.benchmark_group("wlc");
    let config = WlcConfig {
        power: 10,
        max_weight: 1000,
        update_period: Duration::from_secs(1),
    };

    for reals in [4, 64, 1024] {
        let (vs, active) = wlc_service(reals);
        group.bench_with_input(BenchmarkId::new("update_effective_weights", reals), &reals, |b, _| {
            b.iter_batched(
                || vs.clone(),
                |mut vs| black_box(wlc::update_effective_weights(&mut vs, &config, &active)),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn balancer_with_sessions(sessions: usize) -> (Arc<MemoryAgent>, Balancer) {
    let agent = Arc::new(MemoryAgent::new());
    let reals = (0..8)
        .map(|idx| pb::Real {
            dst_addr: real_addr(idx).to_string(),
            src_addr: "10.1.0.0".to_string(),
            src_mask: "255.255.0.0".to_string(),
            weight: 100,
            enabled: true,
        })
        .collect();
    let module = pb::ModuleConfig {
        sessions_timeouts: Some(pb::SessionsTimeouts {
            tcp: 3600,
            ..pb::SessionsTimeouts::default()
        }),
        virtual_services: vec![pb::VirtualService {
            addr: VIP.to_string(),
            port: 80,
            proto: TransportProto::Tcp,
            flags: VsFlags {
                wlc: true,
                ..VsFlags::default()
            },
            reals,
            ..pb::VirtualService::default()
        }],
        wlc: Some(pb::WlcConfig {
            power: Some(10),
            max_weight: Some(1000),
            update_period_ms: 0,
        }),
        ..pb::ModuleConfig::default()
    };
    // Large enough that the benchmark never triggers a resize.
    let state = pb::ModuleStateConfig {
        session_table_capacity: (sessions * 4) as u64,
        session_table_scan_period_ms: Some(0),
        session_table_max_load_factor: 0.75,
    };

    let balancer = Balancer::new(agent.clone(), "bench", Some(&module), Some(&state))
        .expect("failed to create balancer");
    let table = agent.last_session_table().expect("no session table");
    let now = SystemTime::now();
    for session in 0..sessions {
        let real = RealIdentifier {
            vs: vs_id(),
            addr: real_addr(session % 8),
        };
        let client = IpAddr::V4(Ipv4Addr::from(0x0100_0000 + (session / 65536) as u32));
        table
            .open_session(client, (session % 65536) as u16, &real, now, Duration::from_secs(3600))
            .expect("failed to open session");
    }
    (agent, balancer)
}

fn maintenance_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("maintenance");
    group.measurement_time(Duration::from_secs(10));

    for sessions in [1_000, 10_000, 100_000] {
        let (_agent, balancer) = balancer_with_sessions(sessions);
        group.bench_with_input(BenchmarkId::new("sync_wlc_resize", sessions), &sessions, |b, _| {
            b.iter(|| {
                balancer
                    .sync_active_sessions_and_wlc_and_resize_table_on_demand(SystemTime::now())
                    .expect("maintenance pass failed")
            })
        });
        balancer.free();
    }

    group.finish();
}

criterion_group!(benches, wlc_recompute, maintenance_pass);
criterion_main!(benches);
