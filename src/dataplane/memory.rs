//! In-memory dataplane agent.
//!
//! Keeps session tables and published module configurations in process
//! memory. Used by the test suite and by `yanet-balancer run`. Failures of
//! individual agent calls can be injected with [`MemoryAgent::inject_failure`].

use super::{Agent, CounterScope, DataplaneError, ModuleHandle, ModuleSnapshot, SessionTable};
use crate::balancer::info::{AsyncInfo, BalancerInfo, RealInfo, SessionInfo, VsInfo};
use crate::balancer::stats::{ModuleCounters, ModuleStats, RealStats, VsStats};
use crate::balancer::types::{RealIdentifier, VsIdentifier};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

/// Agent call that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    CreateSessionTable,
    Resize,
    Register,
    ReadSessions,
    ReadInfo,
    BuildModule,
    Publish,
    ReadCounters,
}

type Faults = Arc<DashSet<Fault>>;

fn check(faults: &Faults, fault: Fault, message: impl FnOnce() -> String) -> Result<(), DataplaneError> {
    if faults.contains(&fault) {
        Err(DataplaneError::new(message()))
    } else {
        Ok(())
    }
}

/// Dataplane agent backed by process memory.
#[derive(Default)]
pub struct MemoryAgent {
    faults: Faults,
    next_handle: AtomicU64,
    modules: DashMap<ModuleHandle, ModuleSnapshot>,
    published: DashMap<String, ModuleHandle>,
    counters: DashMap<CounterScope, ModuleCounters>,
    tables: Mutex<Vec<Weak<Mutex<TableState>>>>,
}

impl MemoryAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call of the given kind fail.
    pub fn inject_failure(&self, fault: Fault) {
        self.faults.insert(fault);
    }

    pub fn clear_failure(&self, fault: Fault) {
        self.faults.remove(&fault);
    }

    /// Configuration currently published under `name`.
    pub fn published(&self, name: &str) -> Option<ModuleSnapshot> {
        let handle = *self.published.get(name)?;
        self.modules.get(&handle).map(|snapshot| snapshot.clone())
    }

    /// Number of built configurations not yet released.
    pub fn built_modules(&self) -> usize {
        self.modules.len()
    }

    /// Sets the counters returned for `scope`.
    pub fn set_counters(&self, scope: CounterScope, counters: ModuleCounters) {
        self.counters.insert(scope, counters);
    }

    /// Session tables that have not been dropped yet, oldest first.
    pub fn session_tables(&self) -> Vec<MemorySessionTable> {
        let mut tables = self.tables.lock();
        tables.retain(|table| table.strong_count() > 0);
        tables
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| MemorySessionTable {
                inner,
                faults: self.faults.clone(),
            })
            .collect()
    }

    /// Most recently created live session table.
    pub fn last_session_table(&self) -> Option<MemorySessionTable> {
        self.session_tables().pop()
    }
}

impl Agent for MemoryAgent {
    fn create_session_table(&self, capacity: usize) -> Result<Box<dyn SessionTable>, DataplaneError> {
        check(&self.faults, Fault::CreateSessionTable, || {
            format!("failed to allocate session table of capacity {capacity}")
        })?;

        let table = MemorySessionTable::new(capacity, self.faults.clone());
        self.tables.lock().push(Arc::downgrade(&table.inner));
        Ok(Box::new(table))
    }

    fn build_module(&self, snapshot: ModuleSnapshot) -> Result<ModuleHandle, DataplaneError> {
        check(&self.faults, Fault::BuildModule, || {
            format!("failed to build config of module '{}'", snapshot.name)
        })?;

        let handle = ModuleHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        self.modules.insert(handle, snapshot);
        Ok(handle)
    }

    fn publish(&self, handle: ModuleHandle) -> Result<(), DataplaneError> {
        check(&self.faults, Fault::Publish, || {
            "failed to update shared memory module".to_string()
        })?;

        let name = self
            .modules
            .get(&handle)
            .map(|snapshot| snapshot.name.clone())
            .ok_or_else(|| DataplaneError::new(format!("unknown module handle {}", handle.0)))?;
        self.published.insert(name, handle);
        Ok(())
    }

    fn release(&self, handle: ModuleHandle) {
        if let Some((_, snapshot)) = self.modules.remove(&handle) {
            self.published
                .remove_if(&snapshot.name, |_, published| *published == handle);
        }
    }

    fn counters(&self, scope: &CounterScope) -> Result<ModuleCounters, DataplaneError> {
        check(&self.faults, Fault::ReadCounters, || {
            format!("failed to read counters at {scope}")
        })?;

        if let Some(counters) = self.counters.get(scope) {
            return Ok(counters.clone());
        }
        if self.published.contains_key(&scope.module) {
            return Ok(ModuleCounters::default());
        }
        Err(DataplaneError::new(format!("module is not attached at {scope}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SessionKey {
    client_addr: IpAddr,
    client_port: u16,
    vs: VsIdentifier,
}

#[derive(Debug, Clone, Copy)]
struct SessionEntry {
    real: RealIdentifier,
    created: SystemTime,
    last_packet: SystemTime,
    timeout: Duration,
}

impl SessionEntry {
    fn is_alive(&self, now: SystemTime) -> bool {
        self.last_packet + self.timeout > now
    }
}

struct TableState {
    capacity: usize,
    vs_registry: Vec<VsIdentifier>,
    vs_index: HashMap<VsIdentifier, usize>,
    vs_stats: Vec<(VsStats, SystemTime)>,
    real_registry: Vec<RealIdentifier>,
    real_index: HashMap<RealIdentifier, usize>,
    real_stats: Vec<(RealStats, SystemTime)>,
    sessions: HashMap<SessionKey, SessionEntry>,
}

impl TableState {
    fn live_sessions(&self, now: SystemTime) -> usize {
        self.sessions.values().filter(|entry| entry.is_alive(now)).count()
    }
}

/// Session table handle. Clones share the same table.
#[derive(Clone)]
pub struct MemorySessionTable {
    inner: Arc<Mutex<TableState>>,
    faults: Faults,
}

impl MemorySessionTable {
    fn new(capacity: usize, faults: Faults) -> Self {
        let state = TableState {
            capacity,
            vs_registry: Vec::new(),
            vs_index: HashMap::new(),
            vs_stats: Vec::new(),
            real_registry: Vec::new(),
            real_index: HashMap::new(),
            real_stats: Vec::new(),
            sessions: HashMap::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
            faults,
        }
    }

    /// Creates or refreshes the session of a client with `real`, as a packet
    /// processed by a worker would.
    pub fn open_session(
        &self,
        client_addr: IpAddr,
        client_port: u16,
        real: &RealIdentifier,
        now: SystemTime,
        timeout: Duration,
    ) -> Result<(), DataplaneError> {
        let mut state = self.inner.lock();
        let state = &mut *state;

        let real_idx = *state
            .real_index
            .get(real)
            .ok_or_else(|| DataplaneError::new(format!("real {real} is not registered")))?;
        let vs_idx = *state
            .vs_index
            .get(&real.vs)
            .ok_or_else(|| DataplaneError::new(format!("virtual service {} is not registered", real.vs)))?;

        let key = SessionKey {
            client_addr,
            client_port,
            vs: real.vs,
        };
        let refreshed = match state.sessions.get_mut(&key) {
            Some(entry) if entry.is_alive(now) => {
                entry.last_packet = now;
                entry.timeout = timeout;
                true
            }
            _ => false,
        };
        let created = !refreshed;
        if created {
            if state.live_sessions(now) >= state.capacity {
                state.vs_stats[vs_idx].0.session_table_overflow += 1;
                return Err(DataplaneError::new("session table overflow"));
            }
            state.sessions.insert(
                key,
                SessionEntry {
                    real: *real,
                    created: now,
                    last_packet: now,
                    timeout,
                },
            );
        }

        let (vs_stats, vs_last_packet) = &mut state.vs_stats[vs_idx];
        vs_stats.incoming_packets += 1;
        *vs_last_packet = now;
        let (real_stats, real_last_packet) = &mut state.real_stats[real_idx];
        real_stats.packets += 1;
        *real_last_packet = now;
        if created {
            vs_stats.created_sessions += 1;
            real_stats.created_sessions += 1;
        }
        Ok(())
    }

    /// Number of sessions alive at `now`.
    pub fn live_sessions(&self, now: SystemTime) -> usize {
        self.inner.lock().live_sessions(now)
    }
}

impl SessionTable for MemorySessionTable {
    fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    fn resize(&mut self, capacity: usize, now: SystemTime) -> Result<(), DataplaneError> {
        check(&self.faults, Fault::Resize, || {
            format!("failed to allocate session table of capacity {capacity}")
        })?;
        if capacity == 0 {
            return Err(DataplaneError::new("session table capacity must be positive"));
        }

        let mut state = self.inner.lock();
        state.sessions.retain(|_, entry| entry.is_alive(now));
        if state.sessions.len() > capacity {
            return Err(DataplaneError::new(format!(
                "session table of capacity {capacity} can not hold {} live sessions",
                state.sessions.len()
            )));
        }
        state.capacity = capacity;
        Ok(())
    }

    fn register_vs(&mut self, vs: &VsIdentifier) -> Result<usize, DataplaneError> {
        check(&self.faults, Fault::Register, || {
            format!("failed to register virtual service {vs}")
        })?;

        let mut state = self.inner.lock();
        if let Some(idx) = state.vs_index.get(vs) {
            return Ok(*idx);
        }
        let idx = state.vs_registry.len();
        state.vs_registry.push(*vs);
        state.vs_index.insert(*vs, idx);
        state.vs_stats.push((VsStats::default(), SystemTime::UNIX_EPOCH));
        Ok(idx)
    }

    fn register_real(&mut self, real: &RealIdentifier) -> Result<usize, DataplaneError> {
        check(&self.faults, Fault::Register, || format!("failed to register real {real}"))?;

        let mut state = self.inner.lock();
        if let Some(idx) = state.real_index.get(real) {
            return Ok(*idx);
        }
        let idx = state.real_registry.len();
        state.real_registry.push(*real);
        state.real_index.insert(*real, idx);
        state.real_stats.push((RealStats::default(), SystemTime::UNIX_EPOCH));
        Ok(idx)
    }

    fn sessions(&self, now: SystemTime) -> Result<Vec<SessionInfo>, DataplaneError> {
        check(&self.faults, Fault::ReadSessions, || {
            "failed to read session table".to_string()
        })?;

        let state = self.inner.lock();
        let mut sessions: Vec<SessionInfo> = state
            .sessions
            .iter()
            .filter(|(_, entry)| entry.is_alive(now))
            .map(|(key, entry)| SessionInfo {
                client_addr: key.client_addr,
                client_port: key.client_port,
                real: entry.real,
                create_timestamp: entry.created,
                last_packet_timestamp: entry.last_packet,
                timeout: entry.timeout,
            })
            .collect();
        sessions.sort_by_key(|session| (session.real, session.client_addr, session.client_port));
        Ok(sessions)
    }

    fn info(&self) -> Result<BalancerInfo, DataplaneError> {
        check(&self.faults, Fault::ReadInfo, || {
            "failed to read balancer state".to_string()
        })?;

        let state = self.inner.lock();
        let vs_info = state
            .vs_registry
            .iter()
            .zip(&state.vs_stats)
            .enumerate()
            .map(|(idx, (identifier, (stats, last_packet)))| VsInfo {
                registry_idx: idx,
                identifier: *identifier,
                active_sessions: AsyncInfo::default(),
                last_packet_timestamp: *last_packet,
                stats: *stats,
            })
            .collect();
        let real_info = state
            .real_registry
            .iter()
            .zip(&state.real_stats)
            .enumerate()
            .map(|(idx, (identifier, (stats, last_packet)))| RealInfo {
                registry_idx: idx,
                identifier: *identifier,
                active_sessions: AsyncInfo::default(),
                last_packet_timestamp: *last_packet,
                stats: *stats,
            })
            .collect();

        Ok(BalancerInfo {
            active_sessions: AsyncInfo::default(),
            module: ModuleStats::default(),
            vs_info,
            real_info,
        })
    }
}
