//! Shared defaults and limits for the balancer control plane.

/// Session table capacity used when a zero initial capacity is requested.
pub const DEFAULT_SESSION_TABLE_CAPACITY: usize = 1024;

/// Lower bound (exclusive) for the session table max load factor.
pub const MIN_MAX_LOAD_FACTOR: f32 = 0.001;

/// Maximum configured weight of a real.
pub const MAX_REAL_WEIGHT: u16 = 1024;

/// Default log filter for the binary when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Interval between state reports printed by `yanet-balancer run`.
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 10;

/// Number of dataplane instances served when the config file does not say.
pub const DEFAULT_DATAPLANE_INSTANCES: u32 = 1;

/// Default config file read by the binary.
pub const DEFAULT_CONFIG_FILE: &str = "yanet-balancer.toml";
