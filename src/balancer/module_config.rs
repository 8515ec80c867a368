//! Packet handling configuration of a balancer.
//!
//! Every change builds a brand-new [`ModuleSnapshot`] and publishes it through
//! the agent. The in-memory fields are replaced only after the agent accepted
//! the snapshot, so a failed update leaves both the control plane and the
//! dataplane on the previous configuration.

use super::error::{Error, Result};
use super::parse::ParsedModuleConfig;
use super::pb;
use super::state::ModuleConfigState;
use super::stats::BalancerStats;
use super::task::{Job, PeriodicTask, Spawner};
use super::types::{
    BalancerAddresses, RealIdentifier, RealUpdate, RealUpdateBuffer, SessionsTimeouts,
    VirtualService, WlcConfig,
};
use super::wlc;
use crate::dataplane::{Agent, CounterScope, ModuleHandle, ModuleSnapshot, RealSnapshot, VsSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ModuleConfig {
    name: String,
    agent: Arc<dyn Agent>,
    spawner: Arc<dyn Spawner>,
    /// Published configuration; `None` once freed.
    handle: Option<ModuleHandle>,
    virtual_services: Vec<VirtualService>,
    addresses: BalancerAddresses,
    timeouts: SessionsTimeouts,
    wlc: WlcConfig,
    real_updates: RealUpdateBuffer,
    weights_task: Option<PeriodicTask>,
}

impl ModuleConfig {
    /// Publishes the initial configuration. Services must be registered.
    pub fn new(
        name: impl Into<String>,
        agent: Arc<dyn Agent>,
        spawner: Arc<dyn Spawner>,
        state: &ModuleConfigState,
        config: ParsedModuleConfig,
    ) -> Result<Self> {
        let mut module = Self {
            name: name.into(),
            agent,
            spawner,
            handle: None,
            virtual_services: Vec::new(),
            addresses: BalancerAddresses::default(),
            timeouts: SessionsTimeouts::default(),
            wlc: WlcConfig::default(),
            real_updates: RealUpdateBuffer::default(),
            weights_task: None,
        };
        module.apply(state.real_active_sessions(), config)?;
        Ok(module)
    }

    /// Releases the published configuration and stops the weights task.
    /// Idempotent.
    pub fn free(&mut self) {
        self.weights_task = None;
        if let Some(handle) = self.handle.take() {
            self.agent.release(handle);
            debug!(balancer = %self.name, "Released module config");
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.handle.is_some() {
            Ok(())
        } else {
            Err(Error::freed(self.name.clone()))
        }
    }

    pub fn virtual_services(&self) -> &[VirtualService] {
        &self.virtual_services
    }

    pub fn addresses(&self) -> &BalancerAddresses {
        &self.addresses
    }

    pub fn timeouts(&self) -> &SessionsTimeouts {
        &self.timeouts
    }

    pub fn wlc(&self) -> &WlcConfig {
        &self.wlc
    }

    /// Number of real updates waiting for a flush.
    pub fn buffered_updates(&self) -> usize {
        self.real_updates.len()
    }

    pub fn weights_task(&self) -> Option<&PeriodicTask> {
        self.weights_task.as_ref()
    }

    /// Replaces the whole configuration. Services must be registered.
    ///
    /// Drops buffered real updates: they refer to the replaced configuration.
    pub fn update(&mut self, state: &ModuleConfigState, config: ParsedModuleConfig) -> Result<()> {
        self.ensure_live()?;
        self.apply(state.real_active_sessions(), config)
    }

    /// Recomputes WLC weights from the last synced session counters and
    /// republishes if any changed. Returns whether a republish happened.
    ///
    /// A republish drops buffered real updates.
    pub fn update_effective_weights(&mut self, state: &ModuleConfigState) -> Result<bool> {
        self.ensure_live()?;

        let active = state.real_active_sessions();
        let mut services = self.virtual_services.clone();
        let mut updated = false;
        for vs in &mut services {
            updated |= wlc::update_effective_weights(vs, &self.wlc, active);
        }
        if !updated {
            debug!(balancer = %self.name, "Effective weights unchanged");
            return Ok(false);
        }

        self.republish(active, services)
            .map_err(|err| err.context("effective weights updated, but failed to update config"))?;
        info!(balancer = %self.name, "Published new effective weights");
        Ok(true)
    }

    /// Applies real updates immediately, or buffers them until
    /// [`flush_real_updates`](Self::flush_real_updates).
    ///
    /// Applying immediately drops whatever is still buffered.
    pub fn update_reals(
        &mut self,
        state: &ModuleConfigState,
        updates: Vec<RealUpdate>,
        buffer: bool,
    ) -> Result<()> {
        self.ensure_live()?;
        if buffer {
            self.real_updates.append(updates);
            debug!(balancer = %self.name, buffered = self.real_updates.len(), "Buffered real updates");
            return Ok(());
        }
        self.apply_real_updates(state, &updates)
    }

    /// Applies every buffered update at once. Returns the number applied.
    ///
    /// The buffer is emptied even when applying fails.
    pub fn flush_real_updates(&mut self, state: &ModuleConfigState) -> Result<usize> {
        self.ensure_live()?;
        let updates = self.real_updates.take();
        if updates.is_empty() {
            return Ok(0);
        }
        self.apply_real_updates(state, &updates)?;
        Ok(updates.len())
    }

    fn apply_real_updates(&mut self, state: &ModuleConfigState, updates: &[RealUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut services = self.virtual_services.clone();
        for (idx, update) in updates.iter().enumerate() {
            let vs = services
                .iter_mut()
                .find(|vs| vs.identifier == update.real.vs)
                .ok_or_else(|| {
                    Error::not_found(format!(
                        "failed to find virtual service for update at index {idx}: {}",
                        update.real.vs
                    ))
                })?;
            let real = vs.find_real_mut(update.real.addr).ok_or_else(|| {
                Error::not_found(format!(
                    "failed to find real for update at index {idx}: {}",
                    update.real
                ))
            })?;
            if let Some(weight) = update.weight {
                real.weight = weight;
            }
            if let Some(enabled) = update.enabled {
                real.enabled = enabled;
            }
        }

        self.republish(state.real_active_sessions(), services)?;
        info!(balancer = %self.name, updates = updates.len(), "Applied real updates");
        Ok(())
    }

    /// Publishes new services with the current addresses, timeouts and WLC
    /// settings.
    fn republish(
        &mut self,
        active: &HashMap<RealIdentifier, usize>,
        virtual_services: Vec<VirtualService>,
    ) -> Result<()> {
        let config = ParsedModuleConfig {
            virtual_services,
            addresses: self.addresses.clone(),
            timeouts: self.timeouts,
            wlc: self.wlc,
        };
        self.apply(active, config)
    }

    fn apply(&mut self, active: &HashMap<RealIdentifier, usize>, config: ParsedModuleConfig) -> Result<()> {
        let ParsedModuleConfig {
            mut virtual_services,
            addresses,
            timeouts,
            wlc,
        } = config;

        for vs in &mut virtual_services {
            wlc::update_effective_weights(vs, &wlc, active);
        }

        // Started first so a runtime failure leaves everything untouched. The
        // new task can not tick before the caller releases the lock.
        let weights_task = if wlc.update_period.is_zero() {
            None
        } else {
            Some(self.spawner.spawn(Job::UpdateEffectiveWeights, wlc.update_period)?)
        };

        let snapshot = snapshot(&self.name, &virtual_services, &addresses, &timeouts);
        let handle = self
            .agent
            .build_module(snapshot)
            .map_err(|err| Error::dataplane("failed to create module config", err))?;
        if let Err(err) = self.agent.publish(handle) {
            self.agent.release(handle);
            return Err(Error::dataplane("failed to publish module config", err));
        }

        if let Some(previous) = self.handle.replace(handle) {
            self.agent.release(previous);
        }
        if weights_task.is_none() && virtual_services.iter().any(|vs| vs.flags.wlc) {
            warn!(balancer = %self.name, "WLC update period is zero, background reweighting disabled");
        }
        self.weights_task = weights_task;

        self.virtual_services = virtual_services;
        self.addresses = addresses;
        self.timeouts = timeouts;
        self.wlc = wlc;
        // Buffered updates were recorded against the replaced config.
        self.real_updates.clear();

        info!(
            balancer = %self.name,
            virtual_services = self.virtual_services.len(),
            "Published module config"
        );
        Ok(())
    }

    /// Counters of the configured services and reals at one attachment point.
    pub fn get_stats(&self, scope: &CounterScope) -> Result<BalancerStats> {
        self.ensure_live()?;
        let counters = self
            .agent
            .counters(scope)
            .map_err(|err| Error::dataplane(format!("failed to read counters at {scope}"), err))?;
        Ok(BalancerStats::join(&self.virtual_services, &counters))
    }

    /// Configuration as it was last set, with configured (not effective)
    /// weights.
    pub fn to_proto(&self) -> pb::ModuleConfig {
        let virtual_services = self
            .virtual_services
            .iter()
            .map(|vs| pb::VirtualService {
                addr: vs.identifier.addr.to_string(),
                port: u32::from(vs.identifier.port),
                proto: vs.identifier.proto,
                scheduler: vs.scheduler,
                flags: vs.flags,
                allowed_srcs: vs.allowed_sources.iter().map(ToString::to_string).collect(),
                reals: vs
                    .reals
                    .iter()
                    .map(|real| pb::Real {
                        dst_addr: real.identifier.addr.to_string(),
                        src_addr: real.src_addr.to_string(),
                        src_mask: real.src_mask.to_string(),
                        weight: u32::from(real.weight),
                        enabled: real.enabled,
                    })
                    .collect(),
                peers: vs.peers.iter().map(ToString::to_string).collect(),
            })
            .collect();

        pb::ModuleConfig {
            source_address_v4: self.addresses.source_v4.to_string(),
            source_address_v6: self.addresses.source_v6.to_string(),
            decap_addresses: self.addresses.decap.iter().map(ToString::to_string).collect(),
            sessions_timeouts: Some(pb::SessionsTimeouts {
                tcp_syn_ack: self.timeouts.tcp_syn_ack,
                tcp_syn: self.timeouts.tcp_syn,
                tcp_fin: self.timeouts.tcp_fin,
                tcp: self.timeouts.tcp,
                udp: self.timeouts.udp,
                default: self.timeouts.default,
            }),
            virtual_services,
            wlc: Some(pb::WlcConfig {
                power: Some(self.wlc.power),
                max_weight: Some(u32::from(self.wlc.max_weight)),
                update_period_ms: self.wlc.update_period.as_millis() as u64,
            }),
        }
    }
}

impl Drop for ModuleConfig {
    fn drop(&mut self) {
        self.free();
    }
}

fn snapshot(
    name: &str,
    services: &[VirtualService],
    addresses: &BalancerAddresses,
    timeouts: &SessionsTimeouts,
) -> ModuleSnapshot {
    let virtual_services = services
        .iter()
        .map(|vs| VsSnapshot {
            registry_idx: vs.registry_idx,
            identifier: vs.identifier,
            flags: vs.flags,
            scheduler: vs.scheduler,
            allowed_sources: vs.allowed_sources.clone(),
            peers: vs.peers.clone(),
            reals: vs
                .reals
                .iter()
                .enumerate()
                .map(|(idx, real)| RealSnapshot {
                    registry_idx: real.registry_idx,
                    identifier: real.identifier,
                    weight: vs.published_weight(idx),
                    src_addr: real.src_addr,
                    src_mask: real.src_mask,
                    enabled: real.enabled,
                })
                .collect(),
        })
        .collect();

    ModuleSnapshot {
        name: name.to_string(),
        virtual_services,
        addresses: addresses.clone(),
        timeouts: *timeouts,
    }
}
