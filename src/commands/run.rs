//! Run the balancer control plane against the in-memory dataplane.
//!
//! Every balancer from the config file is created at startup; background
//! tasks keep their session counters and weights current until Ctrl+C.
//! State reports are logged every `daemon.report_interval_secs`.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use yanet_balancer::balancer::pb;
use yanet_balancer::config::Config;
use yanet_balancer::dataplane::{Agent, MemoryAgent};
use yanet_balancer::service::{BalancerService, is_client_error};

pub async fn execute(path: &Path) -> Result<()> {
    let config = Config::load_from(path)?;
    let validation = config.validate()?;
    for warning in &validation.warnings {
        warn!(config = %path.display(), "{warning}");
    }

    let agents: Vec<Arc<dyn Agent>> = (0..config.daemon.dataplane_instances)
        .map(|_| Arc::new(MemoryAgent::new()) as Arc<dyn Agent>)
        .collect();
    let service = BalancerService::new(agents);

    for balancer in &config.balancers {
        if let Err(err) = service.update_config(&balancer.to_request()) {
            service.shutdown();
            let reason = if is_client_error(&err) {
                "Invalid balancer config"
            } else {
                "Dataplane failure"
            };
            return Err(err).with_context(|| format!("{reason}: '{}'", balancer.name));
        }
    }
    info!(
        balancers = config.balancers.len(),
        instances = config.daemon.dataplane_instances,
        "Balancer control plane started"
    );

    let result = match config.daemon.report_interval() {
        Some(period) => report_until_shutdown(&service, period).await,
        None => tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C"),
    };

    info!("Shutting down");
    service.shutdown();
    result
}

async fn report_until_shutdown(service: &BalancerService, period: Duration) -> Result<()> {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                return signal.context("Failed to listen for Ctrl+C");
            }
            _ = ticker.tick() => report(service),
        }
    }
}

fn report(service: &BalancerService) {
    for target in service.list_configs().configs {
        let request = pb::TargetRequest {
            target: Some(target.clone()),
        };
        match service.state_info(&request) {
            Ok(info) => info!(
                config = %target.config_name,
                instance = target.dataplane_instance,
                active_sessions = info.active_sessions.value,
                virtual_services = info.vs_info.len(),
                reals = info.real_info.len(),
                "State report"
            ),
            Err(err) => warn!(
                config = %target.config_name,
                instance = target.dataplane_instance,
                error = %err,
                "Failed to collect state report"
            ),
        }
    }
}
