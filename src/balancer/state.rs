//! Session table state of a balancer.
//!
//! [`ModuleConfigState`] owns the session table, keeps per-service and
//! per-real active session counters refreshed from it, and grows the table
//! when its load factor exceeds the configured maximum. Every method expects
//! the caller to hold the balancer mutex.

use super::error::{Error, Result};
use super::info::{AsyncInfo, BalancerInfo, SessionsInfo};
use super::parse::{StateSettings, validate_max_load_factor};
use super::task::{Job, PeriodicTask, Spawner};
use super::types::{RealIdentifier, VirtualService, VsIdentifier};
use crate::dataplane::{Agent, SessionTable};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

pub struct ModuleConfigState {
    name: String,
    /// `None` once freed.
    table: Option<Box<dyn SessionTable>>,
    spawner: Arc<dyn Spawner>,
    scan_period: Duration,
    max_load_factor: f32,
    active_sessions: usize,
    vs_active_sessions: HashMap<VsIdentifier, usize>,
    real_active_sessions: HashMap<RealIdentifier, usize>,
    updated_at: SystemTime,
    scan_task: Option<PeriodicTask>,
}

impl std::fmt::Debug for ModuleConfigState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleConfigState").field("name", &self.name).finish_non_exhaustive()
    }
}

impl ModuleConfigState {
    /// Allocates the session table and starts the scan task.
    pub fn new(
        name: impl Into<String>,
        agent: &dyn Agent,
        spawner: Arc<dyn Spawner>,
        settings: &StateSettings,
    ) -> Result<Self> {
        validate_max_load_factor(settings.max_load_factor)?;
        let name = name.into();
        let capacity = settings.initial_capacity();

        let table = agent
            .create_session_table(capacity)
            .map_err(|err| Error::dataplane("failed to create session table", err))?;

        let mut state = Self {
            name,
            table: Some(table),
            spawner,
            scan_period: settings.scan_period,
            max_load_factor: settings.max_load_factor,
            active_sessions: 0,
            vs_active_sessions: HashMap::new(),
            real_active_sessions: HashMap::new(),
            updated_at: SystemTime::UNIX_EPOCH,
            scan_task: None,
        };
        state.scan_task = state.spawn_scan_task(settings.scan_period)?;

        info!(balancer = %state.name, capacity, "Created session table");
        Ok(state)
    }

    /// Stops the scan task and releases the session table. Idempotent.
    pub fn free(&mut self) {
        self.scan_task = None;
        if self.table.take().is_some() {
            debug!(balancer = %self.name, "Released session table");
        }
    }

    fn table(&self) -> Result<&dyn SessionTable> {
        self.table
            .as_deref()
            .ok_or_else(|| Error::freed(self.name.clone()))
    }

    fn table_mut(&mut self) -> Result<&mut Box<dyn SessionTable>> {
        match self.table.as_mut() {
            Some(table) => Ok(table),
            None => Err(Error::freed(self.name.clone())),
        }
    }

    /// Capacity of the session table; zero once freed.
    pub fn session_table_capacity(&self) -> usize {
        self.table.as_ref().map_or(0, |table| table.capacity())
    }

    pub fn scan_period(&self) -> Duration {
        self.scan_period
    }

    pub fn max_load_factor(&self) -> f32 {
        self.max_load_factor
    }

    pub fn active_sessions(&self) -> AsyncInfo {
        AsyncInfo {
            value: self.active_sessions,
            updated_at: self.updated_at,
        }
    }

    /// Active sessions per real as of the last sync.
    pub fn real_active_sessions(&self) -> &HashMap<RealIdentifier, usize> {
        &self.real_active_sessions
    }

    /// Active sessions per virtual service as of the last sync.
    pub fn vs_active_sessions(&self) -> &HashMap<VsIdentifier, usize> {
        &self.vs_active_sessions
    }

    pub fn scan_task(&self) -> Option<&PeriodicTask> {
        self.scan_task.as_ref()
    }

    /// Applies new settings.
    ///
    /// The new scan task is started before anything changes, so `Err` leaves
    /// every setting and the running scan task untouched.
    ///
    /// A non-zero capacity different from the current one resizes the table.
    /// A failed resize does not stop the scan period and the load factor from
    /// being applied: it is returned as `Ok(Some(err))`.
    pub fn update(&mut self, settings: &StateSettings, now: SystemTime) -> Result<Option<Error>> {
        validate_max_load_factor(settings.max_load_factor)?;
        self.table()?;
        let scan_task = self.spawn_scan_task(settings.scan_period)?;

        let current = self.session_table_capacity();
        let mut resize_error = None;
        if settings.capacity == 0 || settings.capacity == current {
            debug!(balancer = %self.name, capacity = current, "Session table capacity unchanged");
        } else if let Err(err) = self.resize_session_table(settings.capacity, now) {
            warn!(
                balancer = %self.name,
                requested_capacity = settings.capacity,
                error = %err,
                "Failed to resize session table, continuing with config update"
            );
            resize_error = Some(err);
        }

        info!(
            balancer = %self.name,
            old_period = ?self.scan_period,
            new_period = ?settings.scan_period,
            max_load_factor = settings.max_load_factor,
            "Updating session table scan settings"
        );
        self.scan_period = settings.scan_period;
        self.max_load_factor = settings.max_load_factor;
        self.scan_task = scan_task;

        Ok(resize_error)
    }

    /// Resizes the session table, keeping registry indices and live sessions.
    pub fn resize_session_table(&mut self, capacity: usize, now: SystemTime) -> Result<()> {
        let old_capacity = self.session_table_capacity();
        self.table_mut()?
            .resize(capacity, now)
            .map_err(|err| Error::dataplane(format!("failed to resize session table to capacity {capacity}"), err))?;

        info!(balancer = %self.name, old_capacity, new_capacity = capacity, "Resized session table");
        Ok(())
    }

    pub fn register_vs(&mut self, vs: &VsIdentifier) -> Result<usize> {
        self.table_mut()?
            .register_vs(vs)
            .map_err(|err| Error::dataplane(format!("failed to register virtual service {vs}"), err))
    }

    pub fn register_real(&mut self, real: &RealIdentifier) -> Result<usize> {
        self.table_mut()?
            .register_real(real)
            .map_err(|err| Error::dataplane(format!("failed to register real {real}"), err))
    }

    /// Registers every service and real and stores their registry indices.
    pub fn register_virtual_services(&mut self, services: &mut [VirtualService]) -> Result<()> {
        for (vs_idx, vs) in services.iter_mut().enumerate() {
            vs.registry_idx = self
                .register_vs(&vs.identifier)
                .map_err(|err| err.context(format!("virtual service at index {vs_idx}")))?;
            for (real_idx, real) in vs.reals.iter_mut().enumerate() {
                real.registry_idx = self.register_real(&real.identifier).map_err(|err| {
                    err.context(format!("real at index {real_idx} of virtual service at index {vs_idx}"))
                })?;
            }
        }
        Ok(())
    }

    /// Reads live sessions and rebuilds the active session counters from them.
    pub fn get_and_update_sessions_info(&mut self, now: SystemTime) -> Result<SessionsInfo> {
        let sessions = self
            .table()?
            .sessions(now)
            .map_err(|err| Error::dataplane("failed to scan session table", err))?;

        self.vs_active_sessions.clear();
        self.real_active_sessions.clear();
        for session in &sessions {
            *self.real_active_sessions.entry(session.real).or_default() += 1;
            *self.vs_active_sessions.entry(session.real.vs).or_default() += 1;
        }
        self.active_sessions = sessions.len();
        self.updated_at = now;

        Ok(SessionsInfo {
            sessions_count: sessions.len(),
            sessions,
        })
    }

    pub fn sync_active_sessions(&mut self, now: SystemTime) -> Result<()> {
        self.get_and_update_sessions_info(now)
            .map_err(|err| err.context("failed to sync active sessions"))?;
        debug!(
            balancer = %self.name,
            active_sessions = self.active_sessions,
            capacity = self.session_table_capacity(),
            "Synced active sessions"
        );
        Ok(())
    }

    /// Doubles the table when active sessions over capacity exceed the max
    /// load factor. Returns whether the table was resized.
    pub fn resize_table_on_demand(&mut self, now: SystemTime) -> Result<bool> {
        let capacity = self.session_table_capacity();
        if capacity == 0 {
            return Ok(false);
        }

        let load_factor = self.active_sessions as f32 / capacity as f32;
        if load_factor <= self.max_load_factor {
            return Ok(false);
        }

        let requested = capacity.saturating_mul(2);
        info!(
            balancer = %self.name,
            load_factor,
            max_load_factor = self.max_load_factor,
            capacity,
            requested_capacity = requested,
            "Session table load factor exceeded, resizing"
        );
        self.resize_session_table(requested, now)
            .map_err(|err| err.context("failed to resize session table on demand"))?;
        Ok(true)
    }

    pub fn sync_active_sessions_and_resize_table_on_demand(&mut self, now: SystemTime) -> Result<()> {
        self.sync_active_sessions(now)?;
        self.resize_table_on_demand(now)?;
        Ok(())
    }

    /// Registry entries with the active session counters of the last sync.
    ///
    /// # Panics
    ///
    /// Panics if the per-service sum, the per-real sum and the total of
    /// active sessions disagree; the counters are corrupt at that point.
    pub fn get_info(&self) -> Result<BalancerInfo> {
        let mut info = self
            .table()?
            .info()
            .map_err(|err| Error::dataplane("failed to read balancer state", err))?;

        let updated_at = self.updated_at;
        info.active_sessions = self.active_sessions();
        for vs in &mut info.vs_info {
            vs.active_sessions = AsyncInfo {
                value: self.vs_active_sessions.get(&vs.identifier).copied().unwrap_or(0),
                updated_at,
            };
        }
        for real in &mut info.real_info {
            real.active_sessions = AsyncInfo {
                value: self.real_active_sessions.get(&real.identifier).copied().unwrap_or(0),
                updated_at,
            };
        }

        let vs_sum: usize = info.vs_info.iter().map(|vs| vs.active_sessions.value).sum();
        let real_sum: usize = info.real_info.iter().map(|real| real.active_sessions.value).sum();
        if vs_sum != self.active_sessions || real_sum != self.active_sessions {
            panic!(
                "active sessions invariant violation: total={} virtual services={vs_sum} reals={real_sum}",
                self.active_sessions
            );
        }
        Ok(info)
    }

    fn spawn_scan_task(&self, period: Duration) -> Result<Option<PeriodicTask>> {
        if period.is_zero() {
            warn!(balancer = %self.name, "Session table scan period is zero, background scan disabled");
            return Ok(None);
        }
        self.spawner.spawn(Job::ScanSessionTable, period).map(Some)
    }
}

impl Drop for ModuleConfigState {
    fn drop(&mut self) {
        self.free();
    }
}
