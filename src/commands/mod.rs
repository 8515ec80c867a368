//! CLI command implementations for yanet-balancer.
//!
//! - [`check`] - validate a config file without touching the dataplane
//! - [`run`] - create the configured balancers and keep them maintained

pub mod check;
pub mod run;

/// Initialize stdout logging. `RUST_LOG` overrides the default filter.
pub fn init_logging(json: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(yanet_balancer::constants::DEFAULT_LOG_FILTER));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
