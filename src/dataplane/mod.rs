//! Contract between the control plane and the dataplane agent.
//!
//! The agent owns shared-memory objects: session tables and published module
//! configurations. The control plane only ever sees them through the
//! [`Agent`] and [`SessionTable`] traits, so tests and the demo binary can run
//! against [`MemoryAgent`].

mod memory;

pub use memory::{Fault, MemoryAgent, MemorySessionTable};

use crate::balancer::info::{BalancerInfo, SessionInfo};
use crate::balancer::stats::ModuleCounters;
use crate::balancer::types::{
    BalancerAddresses, RealIdentifier, Scheduler, SessionsTimeouts, VsFlags, VsIdentifier,
};
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::time::SystemTime;

/// Failure reported by the dataplane.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct DataplaneError {
    message: String,
}

impl DataplaneError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Opaque reference to a module configuration built by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

/// Place in the packet processing graph where counters are collected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterScope {
    pub module: String,
    pub device: String,
    pub pipeline: String,
    pub function: String,
    pub chain: String,
}

impl fmt::Display for CounterScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.device, self.pipeline, self.function, self.chain, self.module
        )
    }
}

/// Real as published to the dataplane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealSnapshot {
    pub registry_idx: usize,
    pub identifier: RealIdentifier,
    /// Effective weight for WLC services, configured weight otherwise.
    pub weight: u16,
    pub src_addr: IpAddr,
    pub src_mask: IpAddr,
    pub enabled: bool,
}

/// Virtual service as published to the dataplane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsSnapshot {
    pub registry_idx: usize,
    pub identifier: VsIdentifier,
    pub flags: VsFlags,
    pub scheduler: Scheduler,
    pub allowed_sources: Vec<IpNet>,
    pub peers: Vec<IpAddr>,
    pub reals: Vec<RealSnapshot>,
}

/// Immutable module configuration handed to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSnapshot {
    pub name: String,
    pub virtual_services: Vec<VsSnapshot>,
    pub addresses: BalancerAddresses,
    pub timeouts: SessionsTimeouts,
}

/// Dataplane agent of one dataplane instance.
pub trait Agent: Send + Sync {
    /// Allocates a session table with room for `capacity` sessions.
    fn create_session_table(&self, capacity: usize) -> Result<Box<dyn SessionTable>, DataplaneError>;

    /// Builds a module configuration without making it visible to packets.
    fn build_module(&self, snapshot: ModuleSnapshot) -> Result<ModuleHandle, DataplaneError>;

    /// Makes a built configuration the active one for its module name.
    fn publish(&self, handle: ModuleHandle) -> Result<(), DataplaneError>;

    /// Releases a built configuration. Unknown handles are ignored.
    fn release(&self, handle: ModuleHandle);

    /// Reads counters of the module at one attachment point.
    fn counters(&self, scope: &CounterScope) -> Result<ModuleCounters, DataplaneError>;
}

/// Session table shared with the dataplane workers.
///
/// Virtual services and reals are registered once and keep their registry
/// index for the lifetime of the table, across resizes. Dropping the table
/// releases its memory.
pub trait SessionTable: Send {
    fn capacity(&self) -> usize;

    /// Reallocates the table, migrating live sessions.
    fn resize(&mut self, capacity: usize, now: SystemTime) -> Result<(), DataplaneError>;

    /// Returns the registry index of `vs`, registering it if needed.
    fn register_vs(&mut self, vs: &VsIdentifier) -> Result<usize, DataplaneError>;

    /// Returns the registry index of `real`, registering it if needed.
    fn register_real(&mut self, real: &RealIdentifier) -> Result<usize, DataplaneError>;

    /// Sessions that have not expired at `now`.
    fn sessions(&self, now: SystemTime) -> Result<Vec<SessionInfo>, DataplaneError>;

    /// Registry entries with their counters. Active session counts are left
    /// for the caller to fill in.
    fn info(&self) -> Result<BalancerInfo, DataplaneError>;
}
