//! Configuration file for `yanet-balancer`.
//!
//! The file lists daemon settings and the balancers to create at startup:
//!
//! - [`Config`] - root of the file
//! - [`DaemonConfig`] - dataplane instances and reporting
//! - [`BalancerFileConfig`] - one balancer: `[balancers.module]` and
//!   `[balancers.state]` are the wire messages accepted by the service
//!
//! Balancer sections are validated with the same parser the service uses, so
//! a file that passes [`Config::validate`] is accepted by
//! [`BalancerService::update_config`](crate::service::BalancerService::update_config).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::balancer::parse::{self, StateSettings};
use crate::balancer::pb;
use crate::constants;

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Non-fatal warnings that should be logged but don't prevent operation.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub balancers: Vec<BalancerFileConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Number of dataplane instances; one agent is created per instance.
    #[serde(default = "default_dataplane_instances")]
    pub dataplane_instances: u32,
    /// Seconds between state reports; zero disables reporting.
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            dataplane_instances: default_dataplane_instances(),
            report_interval_secs: default_report_interval_secs(),
        }
    }
}

fn default_dataplane_instances() -> u32 {
    constants::DEFAULT_DATAPLANE_INSTANCES
}

fn default_report_interval_secs() -> u64 {
    constants::DEFAULT_REPORT_INTERVAL_SECS
}

impl DaemonConfig {
    pub fn report_interval(&self) -> Option<Duration> {
        (self.report_interval_secs > 0).then(|| Duration::from_secs(self.report_interval_secs))
    }
}

/// One balancer created at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct BalancerFileConfig {
    pub name: String,
    #[serde(default)]
    pub dataplane_instance: u32,
    pub module: pb::ModuleConfig,
    pub state: pb::ModuleStateConfig,
}

impl BalancerFileConfig {
    pub fn target(&self) -> pb::ConfigTarget {
        pb::ConfigTarget {
            config_name: self.name.clone(),
            dataplane_instance: self.dataplane_instance,
        }
    }

    /// Request that creates (or updates) this balancer.
    pub fn to_request(&self) -> pb::UpdateConfigRequest {
        pb::UpdateConfigRequest {
            target: Some(self.target()),
            module_config: Some(self.module.clone()),
            module_state_config: Some(self.state),
        }
    }

    fn validate(&self, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
        let name = &self.name;

        let module = match parse::module_config(&self.module) {
            Ok(module) => Some(module),
            Err(err) => {
                errors.push(format!("balancer '{name}': {err}"));
                None
            }
        };
        let settings = match StateSettings::from_proto(&self.state) {
            Ok(settings) => Some(settings),
            Err(err) => {
                errors.push(format!("balancer '{name}': {err}"));
                None
            }
        };

        if let Some(settings) = settings {
            if settings.capacity == 0 {
                warnings.push(format!(
                    "balancer '{name}': session_table_capacity is 0, {} will be used",
                    constants::DEFAULT_SESSION_TABLE_CAPACITY
                ));
            }
            if settings.scan_period.is_zero() {
                warnings.push(format!(
                    "balancer '{name}': session_table_scan_period_ms is 0\n  \
                     Active sessions are only refreshed on request and the table never grows on its own"
                ));
            }
        }

        if let Some(module) = module {
            if module.virtual_services.is_empty() {
                warnings.push(format!("balancer '{name}' has no virtual services"));
            }
            let wlc_services = module.virtual_services.iter().filter(|vs| vs.flags.wlc).count();
            if wlc_services > 0 && module.wlc.update_period.is_zero() {
                warnings.push(format!(
                    "balancer '{name}': {wlc_services} virtual service(s) use WLC but wlc.update_period_ms is 0\n  \
                     Effective weights are only recomputed on explicit sync"
                ));
            }
        }
    }
}

impl Config {
    /// Load configuration from the default file in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains invalid TOML.
    pub fn load() -> Result<Self> {
        Self::load_from(constants::DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read (IO error)
    /// - The file contains invalid TOML syntax
    /// - Required fields are missing or have invalid types
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration with comprehensive checks.
    ///
    /// Returns a `ValidationResult` containing any non-fatal warnings.
    ///
    /// # Errors
    ///
    /// Returns an error listing every problem found:
    /// - No dataplane instances
    /// - Empty or duplicate balancer targets
    /// - Dataplane instance out of range
    /// - Invalid module or state sections
    pub fn validate(&self) -> Result<ValidationResult> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        // 1. Daemon settings
        if self.daemon.dataplane_instances == 0 {
            errors.push("daemon.dataplane_instances cannot be 0".to_string());
        }
        if self.balancers.is_empty() {
            warnings.push("No balancers configured, the daemon will start idle".to_string());
        }

        // 2. Balancer targets
        let mut seen = HashSet::new();
        for balancer in &self.balancers {
            if balancer.name.is_empty() {
                errors.push("balancer name cannot be empty".to_string());
            }
            if balancer.dataplane_instance >= self.daemon.dataplane_instances {
                errors.push(format!(
                    "balancer '{}': dataplane_instance {} is out of range (instances: {})",
                    balancer.name, balancer.dataplane_instance, self.daemon.dataplane_instances
                ));
            }
            if !seen.insert(balancer.target()) {
                errors.push(format!(
                    "balancer '{}' is defined twice for dataplane instance {}",
                    balancer.name, balancer.dataplane_instance
                ));
            }

            // 3. Module and state sections
            balancer.validate(&mut errors, &mut warnings);
        }

        if !errors.is_empty() {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }

        Ok(ValidationResult { warnings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID: &str = r#"
[daemon]
dataplane_instances = 2
report_interval_secs = 5

[[balancers]]
name = "lb0"
dataplane_instance = 1

[balancers.module]
source_address_v4 = "5.5.5.5"
source_address_v6 = "fe80::5"
decap_addresses = ["10.10.0.1"]

[balancers.module.sessions_timeouts]
tcp_syn_ack = 10
tcp_syn = 10
tcp_fin = 10
tcp = 600
udp = 60
default = 30

[balancers.module.wlc]
power = "10"
max_weight = 1000
update_period_ms = 1000

[[balancers.module.virtual_services]]
addr = "10.0.0.1"
port = 80
proto = "tcp"
scheduler = "round_robin"
allowed_srcs = ["192.168.0.0/16"]
flags = { wlc = true }

[[balancers.module.virtual_services.reals]]
dst_addr = "192.168.1.1"
src_addr = "10.1.0.0"
src_mask = "255.255.0.0"
weight = 100
enabled = true

[balancers.state]
session_table_capacity = 4096
session_table_scan_period_ms = 500
session_table_max_load_factor = 0.75
"#;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse(VALID);
        assert_eq!(config.daemon.dataplane_instances, 2);
        assert_eq!(config.daemon.report_interval(), Some(Duration::from_secs(5)));

        let balancer = &config.balancers[0];
        assert_eq!(balancer.name, "lb0");
        assert_eq!(balancer.module.virtual_services[0].reals[0].weight, 100);
        assert_eq!(balancer.module.wlc.and_then(|wlc| wlc.power), Some(10));
        assert_eq!(balancer.state.session_table_capacity, 4096);
        assert_eq!(balancer.state.session_table_scan_period_ms, Some(500));

        let result = config.validate().unwrap();
        assert!(!result.has_warnings(), "{:?}", result.warnings);
    }

    #[test]
    fn test_demo_config_is_valid() {
        let config = parse(include_str!("../demos/yanet-balancer.toml"));
        assert_eq!(config.balancers.len(), 2);

        let result = config.validate().unwrap();
        assert!(!result.has_warnings(), "{:?}", result.warnings);
    }

    #[test]
    fn test_defaults() {
        let config = parse("");
        assert_eq!(config.daemon.dataplane_instances, constants::DEFAULT_DATAPLANE_INSTANCES);
        assert_eq!(config.daemon.report_interval_secs, constants::DEFAULT_REPORT_INTERVAL_SECS);

        let result = config.validate().unwrap();
        assert!(result.warnings[0].contains("No balancers"));
    }

    #[test]
    fn test_request_carries_target() {
        let config = parse(VALID);
        let request = config.balancers[0].to_request();
        assert_eq!(
            request.target,
            Some(pb::ConfigTarget {
                config_name: "lb0".to_string(),
                dataplane_instance: 1,
            })
        );
        assert_eq!(request.module_config.as_ref(), Some(&config.balancers[0].module));
    }

    #[test]
    fn test_validate_instance_out_of_range() {
        let mut config = parse(VALID);
        config.daemon.dataplane_instances = 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }

    #[test]
    fn test_validate_duplicate_balancer() {
        let mut config = parse(VALID);
        config.balancers.push(config.balancers[0].clone());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("defined twice"), "{err}");
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = parse(VALID);
        config.balancers[0].name = String::new();
        config.balancers[0].module.virtual_services[0].reals[0].weight = 5000;
        config.balancers[0].state.session_table_max_load_factor = 0.0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("name cannot be empty"), "{err}");
        assert!(err.contains("weight 5000"), "{err}");
        assert!(err.contains("max load factor"), "{err}");
    }

    #[test]
    fn test_validate_warns_on_disabled_background_work() {
        let mut config = parse(VALID);
        config.balancers[0].state.session_table_capacity = 0;
        config.balancers[0].state.session_table_scan_period_ms = Some(0);
        if let Some(wlc) = config.balancers[0].module.wlc.as_mut() {
            wlc.update_period_ms = 0;
        }

        let result = config.validate().unwrap();
        assert_eq!(result.warnings.len(), 3, "{:?}", result.warnings);
        assert!(result.warnings[0].contains("1024"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(VALID.as_bytes()).unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.balancers.len(), 1);
    }

    #[test]
    fn test_load_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from(dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_load_from_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[[balancers]]\nname = ").unwrap();

        let err = Config::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
