//! Transport-agnostic balancer service.
//!
//! [`BalancerService`] manages named balancer instances, one set per
//! dataplane instance, and answers wire requests with wire responses. A
//! gRPC or HTTP frontend only has to map [`ErrorKind`] onto its status codes.
//!
//! The instance map lock is held while a balancer is created, so concurrent
//! `update_config` calls for a new target never build two balancers. Every
//! other operation clones the instance out of the map and releases the lock
//! before touching the balancer.

use crate::balancer::{Balancer, Error, ErrorKind, Result, parse, pb};
use crate::dataplane::{Agent, CounterScope};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

pub struct BalancerService {
    agents: Vec<Arc<dyn Agent>>,
    balancers: Mutex<HashMap<pb::ConfigTarget, Arc<Balancer>>>,
}

impl BalancerService {
    /// Creates a service with one agent per dataplane instance; the agent at
    /// index `i` serves `dataplane_instance == i`.
    pub fn new(agents: Vec<Arc<dyn Agent>>) -> Self {
        Self {
            agents,
            balancers: Mutex::new(HashMap::new()),
        }
    }

    /// Checks that a target is present, named and addresses a known
    /// dataplane instance.
    fn target<'a>(&self, target: Option<&'a pb::ConfigTarget>) -> Result<&'a pb::ConfigTarget> {
        let target = target.ok_or_else(|| Error::invalid("target is required"))?;
        if target.config_name.is_empty() {
            return Err(Error::invalid("config name is required"));
        }
        if target.dataplane_instance as usize >= self.agents.len() {
            return Err(Error::invalid(format!(
                "dataplane instance {} is out of range (instances: {})",
                target.dataplane_instance,
                self.agents.len()
            )));
        }
        Ok(target)
    }

    fn balancer(&self, target: Option<&pb::ConfigTarget>) -> Result<(pb::ConfigTarget, Arc<Balancer>)> {
        let target = self.target(target)?;
        let balancer = self.balancers.lock().get(target).cloned().ok_or_else(|| {
            Error::not_found(format!(
                "config '{}' not found on dataplane instance {}",
                target.config_name, target.dataplane_instance
            ))
        })?;
        Ok((target.clone(), balancer))
    }

    /// Creates the balancer of the target, or updates it if it exists.
    pub fn update_config(&self, request: &pb::UpdateConfigRequest) -> Result<()> {
        let target = self.target(request.target.as_ref())?;
        let module_config = request.module_config.as_ref();
        let state_config = request.module_state_config.as_ref();

        let existing = {
            let mut balancers = self.balancers.lock();
            match balancers.get(target) {
                Some(balancer) => balancer.clone(),
                None => {
                    let agent = self.agents[target.dataplane_instance as usize].clone();
                    let balancer = Balancer::new(agent, target.config_name.clone(), module_config, state_config)
                        .map_err(|err| err.context(format!("failed to create config '{}'", target.config_name)))?;
                    balancers.insert(target.clone(), Arc::new(balancer));
                    info!(
                        config = %target.config_name,
                        instance = target.dataplane_instance,
                        "Created balancer config"
                    );
                    return Ok(());
                }
            }
        };

        existing
            .update(module_config, state_config)
            .map_err(|err| err.context(format!("failed to update config '{}'", target.config_name)))?;
        info!(
            config = %target.config_name,
            instance = target.dataplane_instance,
            "Updated balancer config"
        );
        Ok(())
    }

    pub fn update_reals(&self, request: &pb::UpdateRealsRequest) -> Result<()> {
        let (target, balancer) = self.balancer(request.target.as_ref())?;
        let updates = request
            .updates
            .iter()
            .enumerate()
            .map(|(idx, update)| {
                parse::real_update(update).map_err(|err| err.context(format!("update at index {idx}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let count = updates.len();
        balancer.update_reals(updates, request.buffer)?;
        debug!(
            config = %target.config_name,
            instance = target.dataplane_instance,
            updates = count,
            buffered = request.buffer,
            "Processed real updates"
        );
        Ok(())
    }

    pub fn flush_real_updates(&self, request: &pb::TargetRequest) -> Result<pb::FlushRealUpdatesResponse> {
        let (_, balancer) = self.balancer(request.target.as_ref())?;
        let flushed = balancer.flush_real_updates()?;
        Ok(pb::FlushRealUpdatesResponse {
            updates_flushed: u32::try_from(flushed).unwrap_or(u32::MAX),
        })
    }

    pub fn show_config(&self, request: &pb::TargetRequest) -> Result<pb::ShowConfigResponse> {
        let (target, balancer) = self.balancer(request.target.as_ref())?;
        let (module_config, module_state_config) = balancer.get_config()?;
        Ok(pb::ShowConfigResponse {
            target,
            module_config,
            module_state_config,
        })
    }

    /// Every configured target, ordered by dataplane instance and name.
    pub fn list_configs(&self) -> pb::ListConfigsResponse {
        let mut configs: Vec<pb::ConfigTarget> = self.balancers.lock().keys().cloned().collect();
        configs.sort_by(|a, b| {
            (a.dataplane_instance, &a.config_name).cmp(&(b.dataplane_instance, &b.config_name))
        });
        pb::ListConfigsResponse { configs }
    }

    /// Removes the balancer of the target and frees it.
    pub fn delete_config(&self, request: &pb::TargetRequest) -> Result<()> {
        let target = self.target(request.target.as_ref())?;
        let Some(balancer) = self.balancers.lock().remove(target) else {
            return Err(Error::not_found(format!(
                "config '{}' not found on dataplane instance {}",
                target.config_name, target.dataplane_instance
            )));
        };

        balancer.free();
        if Arc::strong_count(&balancer) > 1 {
            warn!(config = %target.config_name, "Deleted config is still referenced by a request in flight");
        }
        info!(
            config = %target.config_name,
            instance = target.dataplane_instance,
            "Deleted balancer config"
        );
        Ok(())
    }

    pub fn state_info(&self, request: &pb::TargetRequest) -> Result<pb::BalancerInfo> {
        let (_, balancer) = self.balancer(request.target.as_ref())?;
        let info = balancer.get_state_info(SystemTime::now())?;
        Ok((&info).into())
    }

    pub fn sessions_info(&self, request: &pb::TargetRequest) -> Result<pb::SessionsInfo> {
        let (_, balancer) = self.balancer(request.target.as_ref())?;
        let info = balancer.get_sessions_info(SystemTime::now())?;
        Ok((&info).into())
    }

    pub fn config_stats(&self, request: &pb::ConfigStatsRequest) -> Result<pb::BalancerStats> {
        let (target, balancer) = self.balancer(request.target.as_ref())?;
        let scope = CounterScope {
            module: target.config_name,
            device: request.device.clone(),
            pipeline: request.pipeline.clone(),
            function: request.function.clone(),
            chain: request.chain.clone(),
        };
        let stats = balancer.get_config_stats(&scope)?;
        Ok((&stats).into())
    }

    /// Frees every balancer. Used on shutdown.
    pub fn shutdown(&self) {
        let balancers: Vec<_> = self.balancers.lock().drain().collect();
        for (target, balancer) in balancers {
            balancer.free();
            debug!(config = %target.config_name, instance = target.dataplane_instance, "Freed balancer config");
        }
    }
}

/// Whether an error means the request itself was wrong, as opposed to a
/// failure of the service.
pub fn is_client_error(err: &Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::InvalidArgument | ErrorKind::NotFound | ErrorKind::FailedPrecondition
    )
}
