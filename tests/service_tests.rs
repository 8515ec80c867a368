//! Service-level tests over the in-memory dataplane.
//!
//! Drives [`BalancerService`] the way an RPC frontend would: wire requests
//! in, wire responses out.

#[path = "common.rs"]
mod common;

use common::*;
use std::time::SystemTime;
use yanet_balancer::balancer::{ErrorKind, pb};
use yanet_balancer::balancer::types::TransportProto;
use yanet_balancer::dataplane::Fault;

fn real_update(real_ip: &str, weight: Option<u32>, enable: Option<bool>) -> pb::RealUpdate {
    pb::RealUpdate {
        virtual_ip: VIP.to_string(),
        port: u32::from(VIP_PORT),
        proto: TransportProto::Tcp,
        real_ip: real_ip.to_string(),
        weight,
        enable,
    }
}

// =============================================================================
// Config Lifecycle
// =============================================================================

#[test]
fn test_update_config_creates_then_updates() {
    let test = TestService::new(1);
    let module = module_config(vec![real("192.168.0.1", 10)], false, 0);
    test.service
        .update_config(&update_request("lb0", 0, module, state_config(64, 0, 0.75)))
        .unwrap();
    assert_eq!(test.published_weights(0, "lb0"), vec![10]);

    let module = module_config(vec![real("192.168.0.1", 10), real("192.168.0.2", 30)], false, 0);
    test.service
        .update_config(&update_request("lb0", 0, module, state_config(128, 0, 0.75)))
        .unwrap();
    assert_eq!(test.published_weights(0, "lb0"), vec![10, 30]);

    let shown = test.service.show_config(&target_request("lb0", 0)).unwrap();
    assert_eq!(shown.module_state_config.session_table_capacity, 128);
    assert_eq!(shown.module_config.virtual_services[0].reals.len(), 2);
    // The table was resized in place, not recreated.
    assert_eq!(test.agents[0].session_tables().len(), 1);
}

#[test]
fn test_update_config_requires_both_sections() {
    let test = TestService::new(1);
    let request = pb::UpdateConfigRequest {
        target: Some(target("lb0", 0)),
        module_config: Some(module_config(vec![real("192.168.0.1", 10)], false, 0)),
        module_state_config: None,
    };

    let err = test.service.update_config(&request).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(test.service.list_configs().configs.is_empty());
}

#[test]
fn test_failed_update_keeps_previous_config() {
    let test = TestService::new(1);
    let module = module_config(vec![real("192.168.0.1", 10)], false, 0);
    test.service
        .update_config(&update_request("lb0", 0, module, state_config(64, 0, 0.75)))
        .unwrap();

    test.agents[0].inject_failure(Fault::Publish);
    let next = module_config(vec![real("192.168.0.1", 99)], false, 0);
    let err = test
        .service
        .update_config(&update_request("lb0", 0, next, state_config(64, 0, 0.75)))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);

    test.agents[0].clear_failure(Fault::Publish);
    let shown = test.service.show_config(&target_request("lb0", 0)).unwrap();
    assert_eq!(shown.module_config.virtual_services[0].reals[0].weight, 10);
    assert_eq!(test.published_weights(0, "lb0"), vec![10]);
}

#[test]
fn test_instances_are_isolated() {
    let test = TestService::new(2);
    for instance in 0..2 {
        let module = module_config(vec![real("192.168.0.1", 10 + instance)], false, 0);
        test.service
            .update_config(&update_request("lb0", instance, module, state_config(64, 0, 0.75)))
            .unwrap();
    }

    assert_eq!(test.published_weights(0, "lb0"), vec![10]);
    assert_eq!(test.published_weights(1, "lb0"), vec![11]);

    test.service.delete_config(&target_request("lb0", 1)).unwrap();
    assert!(test.agents[1].published("lb0").is_none());
    assert_eq!(test.published_weights(0, "lb0"), vec![10]);
    assert_eq!(test.service.list_configs().configs, vec![target("lb0", 0)]);
}

// =============================================================================
// Real Updates
// =============================================================================

#[test]
fn test_real_updates_immediate_and_buffered() {
    let test = TestService::new(1);
    let module = module_config(vec![real("192.168.0.1", 10), real("192.168.0.2", 10)], false, 0);
    test.service
        .update_config(&update_request("lb0", 0, module, state_config(64, 0, 0.75)))
        .unwrap();

    test.service
        .update_reals(&pb::UpdateRealsRequest {
            target: Some(target("lb0", 0)),
            updates: vec![real_update("192.168.0.1", Some(20), None)],
            buffer: false,
        })
        .unwrap();
    assert_eq!(test.published_weights(0, "lb0"), vec![20, 10]);

    test.service
        .update_reals(&pb::UpdateRealsRequest {
            target: Some(target("lb0", 0)),
            updates: vec![
                real_update("192.168.0.2", None, Some(false)),
                real_update("192.168.0.1", Some(5), None),
            ],
            buffer: true,
        })
        .unwrap();
    assert_eq!(test.published_weights(0, "lb0"), vec![20, 10]);

    let flushed = test.service.flush_real_updates(&target_request("lb0", 0)).unwrap();
    assert_eq!(flushed.updates_flushed, 2);
    assert_eq!(test.published_weights(0, "lb0"), vec![5, 10]);
    let published = test.agents[0].published("lb0").unwrap();
    assert!(!published.virtual_services[0].reals[1].enabled);

    let shown = test.service.show_config(&target_request("lb0", 0)).unwrap();
    let reals = &shown.module_config.virtual_services[0].reals;
    assert!(!reals[1].enabled);
    assert_eq!(reals[1].weight, 10);
}

#[test]
fn test_buffered_update_for_unknown_real_fails_on_flush() {
    let test = TestService::new(1);
    let module = module_config(vec![real("192.168.0.1", 10)], false, 0);
    test.service
        .update_config(&update_request("lb0", 0, module, state_config(64, 0, 0.75)))
        .unwrap();

    test.service
        .update_reals(&pb::UpdateRealsRequest {
            target: Some(target("lb0", 0)),
            updates: vec![real_update("192.168.0.9", Some(5), None)],
            buffer: true,
        })
        .unwrap();

    let err = test.service.flush_real_updates(&target_request("lb0", 0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    // The buffer is gone either way.
    let flushed = test.service.flush_real_updates(&target_request("lb0", 0)).unwrap();
    assert_eq!(flushed.updates_flushed, 0);
}

#[test]
fn test_real_weight_limit() {
    let test = TestService::new(1);
    let module = module_config(vec![real("192.168.0.1", 10)], false, 0);
    test.service
        .update_config(&update_request("lb0", 0, module, state_config(64, 0, 0.75)))
        .unwrap();

    let err = test
        .service
        .update_reals(&pb::UpdateRealsRequest {
            target: Some(target("lb0", 0)),
            updates: vec![real_update("192.168.0.1", Some(1025), None)],
            buffer: false,
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

// =============================================================================
// Info, Sessions and Stats
// =============================================================================

#[test]
fn test_state_info_over_the_wire() {
    let test = TestService::new(1);
    let module = module_config(vec![real("192.168.0.1", 10), real("192.168.0.2", 10)], false, 0);
    test.service
        .update_config(&update_request("lb0", 0, module, state_config(1024, 0, 0.75)))
        .unwrap();

    let now = SystemTime::now();
    let table = test.table(0);
    open_sessions(&table, "1.1.1.1", "192.168.0.1", 3, now);
    open_sessions(&table, "2.2.2.2", "192.168.0.2", 1, now);

    let info = test.service.state_info(&target_request("lb0", 0)).unwrap();
    assert_eq!(info.active_sessions.value, 4);
    assert_eq!(info.vs_info[0].active_sessions.value, 4);
    assert_eq!(info.real_info[0].active_sessions.value, 3);
    assert_eq!(info.real_info[1].real_ip, "192.168.0.2".parse::<std::net::IpAddr>().unwrap());

    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["active_sessions"]["value"], "4");
    assert!(json["active_sessions"]["updated_at"].is_string());
}

#[test]
fn test_sessions_info_over_the_wire() {
    let test = TestService::new(1);
    let module = module_config(vec![real("192.168.0.1", 10)], false, 0);
    test.service
        .update_config(&update_request("lb0", 0, module, state_config(1024, 0, 0.75)))
        .unwrap();
    open_sessions(&test.table(0), "1.1.1.1", "192.168.0.1", 2, SystemTime::now());

    let sessions = test.service.sessions_info(&target_request("lb0", 0)).unwrap();
    assert_eq!(sessions.sessions_count, 2);
    assert_eq!(sessions.sessions[0].timeout_ms, 600_000);
    assert_eq!(sessions.sessions[0].vs_port, VIP_PORT);

    let json = serde_json::to_value(&sessions).unwrap();
    assert_eq!(json["sessions_count"], "2");
    assert_eq!(json["sessions"][0]["timeout_ms"], "600000");
}

#[test]
fn test_config_stats_requires_attachment() {
    let test = TestService::new(1);
    let module = module_config(vec![real("192.168.0.1", 10)], false, 0);
    test.service
        .update_config(&update_request("lb0", 0, module, state_config(64, 0, 0.75)))
        .unwrap();

    let request = pb::ConfigStatsRequest {
        target: Some(target("lb0", 0)),
        device: "eth0".to_string(),
        pipeline: "p0".to_string(),
        function: "f0".to_string(),
        chain: "c0".to_string(),
    };
    let stats = test.service.config_stats(&request).unwrap();
    assert!(stats.reals.is_empty());

    test.service.delete_config(&target_request("lb0", 0)).unwrap();
    let err = test.service.config_stats(&request).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
