//! Control plane for the YANET L4 balancer module.
//!
//! The crate tracks client sessions reported by the dataplane, keeps the
//! session table sized to its load, recomputes weighted-least-connections
//! (WLC) weights of reals and publishes immutable configuration snapshots to
//! the dataplane agent.
//!
//! - [`balancer`] - balancer instance: state, configuration, WLC, background tasks
//! - [`dataplane`] - contract of the dataplane agent and session table, plus an
//!   in-memory implementation
//! - [`service`] - named balancer instances per dataplane instance
//! - [`config`] - TOML configuration files

pub mod balancer;
pub mod config;
pub mod constants;
pub mod dataplane;
pub mod service;
