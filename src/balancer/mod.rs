//! A single balancer instance.
//!
//! [`Balancer`] ties together the session table state ([`ModuleConfigState`])
//! and the published packet handling configuration ([`ModuleConfig`]). Both
//! live in one [`BalancerCore`] behind one `parking_lot::Mutex`: API calls and
//! background tasks serialize on it, so a tick never observes a half-applied
//! update.
//!
//! ```text
//!   Created ──update / update_reals / flush / info / stats──▶ Created
//!      │
//!      └──free (or drop)──▶ Freed ──any operation──▶ Error::Freed
//! ```
//!
//! Background work:
//! - session table scan, every `session_table_scan_period_ms`: refresh active
//!   session counters, double the table when the load factor is exceeded
//! - WLC reweighting, every `wlc.update_period_ms`: recompute effective
//!   weights from the last counters and republish when they changed

pub mod error;
pub mod info;
pub mod module_config;
pub mod parse;
pub mod pb;
pub mod state;
pub mod stats;
pub mod task;
pub mod types;
pub mod wlc;


pub use error::{Error, ErrorKind, Result};
pub use info::{BalancerInfo, SessionsInfo};
pub use module_config::ModuleConfig;
pub use state::ModuleConfigState;
pub use stats::BalancerStats;
pub use types::{RealIdentifier, RealUpdate, VsIdentifier};

use crate::dataplane::{Agent, CounterScope};
use parking_lot::Mutex;
use parse::StateSettings;
use std::sync::Arc;
use std::time::SystemTime;
use task::{Job, Maintenance, Spawner, TaskScope};
use tracing::{error, info, warn};

/// State and configuration of a balancer; `None` once freed.
pub struct BalancerCore {
    name: String,
    state: Option<ModuleConfigState>,
    config: Option<ModuleConfig>,
}

impl BalancerCore {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> Result<&ModuleConfigState> {
        self.state.as_ref().ok_or_else(|| Error::freed(self.name.clone()))
    }

    pub fn state_mut(&mut self) -> Result<&mut ModuleConfigState> {
        match self.state.as_mut() {
            Some(state) => Ok(state),
            None => Err(Error::freed(self.name.clone())),
        }
    }

    pub fn config(&self) -> Result<&ModuleConfig> {
        self.config.as_ref().ok_or_else(|| Error::freed(self.name.clone()))
    }

    /// Both halves at once, for operations that read one and mutate the other.
    pub fn parts_mut(&mut self) -> Result<(&mut ModuleConfigState, &mut ModuleConfig)> {
        match (self.state.as_mut(), self.config.as_mut()) {
            (Some(state), Some(config)) => Ok((state, config)),
            _ => Err(Error::freed(self.name.clone())),
        }
    }

    pub fn is_freed(&self) -> bool {
        self.state.is_none() && self.config.is_none()
    }

    /// Releases the session table, then the published configuration.
    fn free(&mut self) {
        if let Some(mut state) = self.state.take() {
            state.free();
        }
        if let Some(mut config) = self.config.take() {
            config.free();
        }
    }

    /// Refreshes session counters, grows the table if needed and republishes
    /// WLC weights.
    pub fn sync_active_sessions_and_wlc_and_resize_table_on_demand(
        &mut self,
        now: SystemTime,
    ) -> Result<()> {
        let (state, config) = self.parts_mut()?;
        state
            .sync_active_sessions_and_resize_table_on_demand(now)
            .map_err(|err| err.context("failed to scan sessions table to sync active sessions"))?;
        config
            .update_effective_weights(state)
            .map_err(|err| err.context("failed to update WLC"))?;
        Ok(())
    }
}

impl Maintenance for BalancerCore {
    fn run_job(&mut self, job: Job, now: SystemTime) -> Result<()> {
        match job {
            Job::ScanSessionTable => self
                .state_mut()?
                .sync_active_sessions_and_resize_table_on_demand(now),
            Job::UpdateEffectiveWeights => {
                let (state, config) = self.parts_mut()?;
                config.update_effective_weights(state).map(|_| ())
            }
        }
    }
}

/// Balancer instance. Dropping it frees it.
pub struct Balancer {
    name: String,
    core: Arc<Mutex<BalancerCore>>,
}

impl std::fmt::Debug for Balancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer").field("name", &self.name).finish_non_exhaustive()
    }
}

fn require<'a, T>(value: Option<&'a T>, what: &str) -> Result<&'a T> {
    value.ok_or_else(|| Error::invalid(format!("{what} is required")))
}

impl Balancer {
    /// Creates the session table, registers every service and real, and
    /// publishes the initial configuration.
    ///
    /// Background tasks with a non-zero period need a running tokio runtime.
    pub fn new(
        agent: Arc<dyn Agent>,
        name: impl Into<String>,
        module_config: Option<&pb::ModuleConfig>,
        state_config: Option<&pb::ModuleStateConfig>,
    ) -> Result<Self> {
        let name = name.into();
        info!(balancer = %name, "Creating balancer instance");

        let module_config = require(module_config, "module config")?;
        let settings = StateSettings::from_proto(require(state_config, "module state config")?)?;
        let mut parsed = parse::module_config(module_config)?;

        let core = Arc::new(Mutex::new(BalancerCore {
            name: name.clone(),
            state: None,
            config: None,
        }));
        let spawner: Arc<dyn Spawner> = Arc::new(TaskScope::new(name.clone(), Arc::downgrade(&core)));

        {
            let mut guard = core.lock();
            let mut state = ModuleConfigState::new(name.clone(), agent.as_ref(), spawner.clone(), &settings)
                .map_err(|err| {
                    error!(balancer = %name, error = %err, "Failed to create module config state");
                    err.context("failed to create module config state")
                })?;
            state.register_virtual_services(&mut parsed.virtual_services)?;
            let config = ModuleConfig::new(name.clone(), agent, spawner, &state, parsed)
                .map_err(|err| err.context("failed to create module config"))?;

            guard.state = Some(state);
            guard.config = Some(config);
        }

        info!(balancer = %name, "Created balancer instance");
        Ok(Self { name, core })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `f` with the balancer mutex held.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut BalancerCore) -> R) -> R {
        f(&mut self.core.lock())
    }

    /// Replaces the configuration and applies new session table settings.
    ///
    /// The configuration is published first. A session table resize failure
    /// after that is logged and does not fail the call. Failing to start the
    /// background scan does: the published configuration stays and the
    /// session table settings are left as they were.
    pub fn update(
        &self,
        module_config: Option<&pb::ModuleConfig>,
        state_config: Option<&pb::ModuleStateConfig>,
    ) -> Result<()> {
        let module_config = require(module_config, "module config")?;
        let settings = StateSettings::from_proto(require(state_config, "module state config")?)?;
        let mut parsed = parse::module_config(module_config)?;

        let mut core = self.core.lock();
        let (state, config) = core.parts_mut()?;
        state.register_virtual_services(&mut parsed.virtual_services)?;
        config
            .update(state, parsed)
            .map_err(|err| err.context("failed to update module config"))?;

        let resize_error = state
            .update(&settings, SystemTime::now())
            .map_err(|err| err.context("module config updated, but failed to apply session table settings"))?;
        if let Some(err) = resize_error {
            warn!(balancer = %self.name, error = %err, "Session table settings were not fully applied");
        }
        info!(balancer = %self.name, "Balancer configuration updated");
        Ok(())
    }

    pub fn update_reals(&self, updates: Vec<RealUpdate>, buffer: bool) -> Result<()> {
        let mut core = self.core.lock();
        let (state, config) = core.parts_mut()?;
        config.update_reals(state, updates, buffer)
    }

    pub fn flush_real_updates(&self) -> Result<usize> {
        let mut core = self.core.lock();
        let (state, config) = core.parts_mut()?;
        config.flush_real_updates(state)
    }

    /// Current configuration and session table settings.
    pub fn get_config(&self) -> Result<(pb::ModuleConfig, pb::ModuleStateConfig)> {
        let core = self.core.lock();
        let state = core.state()?;
        let config = core.config()?;

        let state_config = pb::ModuleStateConfig {
            session_table_capacity: state.session_table_capacity() as u64,
            session_table_scan_period_ms: Some(state.scan_period().as_millis() as u64),
            session_table_max_load_factor: state.max_load_factor(),
        };
        Ok((config.to_proto(), state_config))
    }

    /// Refreshes active session counters, then returns the state info. A
    /// failed refresh is logged and the previous counters are reported.
    pub fn get_state_info(&self, now: SystemTime) -> Result<BalancerInfo> {
        let mut core = self.core.lock();
        let state = core.state_mut()?;
        if let Err(err) = state.sync_active_sessions(now) {
            warn!(balancer = %self.name, error = %err, "Failed to sync active sessions, reporting stale counters");
        }
        state.get_info()
    }

    pub fn get_sessions_info(&self, now: SystemTime) -> Result<SessionsInfo> {
        self.core.lock().state_mut()?.get_and_update_sessions_info(now)
    }

    pub fn get_config_stats(&self, scope: &CounterScope) -> Result<BalancerStats> {
        self.core.lock().config()?.get_stats(scope)
    }

    /// Explicit resize request; fails if the dataplane can not resize.
    pub fn resize_session_table(&self, capacity: usize, now: SystemTime) -> Result<()> {
        if capacity == 0 {
            return Err(Error::invalid("session table capacity must be positive"));
        }
        self.core.lock().state_mut()?.resize_session_table(capacity, now)
    }

    pub fn sync_active_sessions_and_wlc_and_resize_table_on_demand(&self, now: SystemTime) -> Result<()> {
        self.core
            .lock()
            .sync_active_sessions_and_wlc_and_resize_table_on_demand(now)
    }

    /// Stops background tasks and releases dataplane objects. Idempotent.
    pub fn free(&self) {
        let mut core = self.core.lock();
        if !core.is_freed() {
            core.free();
            info!(balancer = %self.name, "Freed balancer instance");
        }
    }
}

impl Drop for Balancer {
    fn drop(&mut self) {
        self.free();
    }
}
