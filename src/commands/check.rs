//! Validate a configuration file.

use anyhow::{Context, Result};
use std::path::Path;
use yanet_balancer::config::Config;

/// Loads and validates `path`, printing warnings. With `print_requests` the
/// update requests the daemon would send are printed as JSON.
pub fn execute(path: &Path, print_requests: bool) -> Result<()> {
    let config = Config::load_from(path)?;
    let validation = config.validate()?;

    for warning in &validation.warnings {
        eprintln!("warning: {warning}");
    }

    if print_requests {
        let requests: Vec<_> = config.balancers.iter().map(|balancer| balancer.to_request()).collect();
        let json = serde_json::to_string_pretty(&requests).context("Failed to serialize requests")?;
        println!("{json}");
    } else {
        println!(
            "{}: ok ({} balancer(s), {} dataplane instance(s))",
            path.display(),
            config.balancers.len(),
            config.daemon.dataplane_instances
        );
    }
    Ok(())
}
