//! Validated conversion of wire messages into domain types.
//!
//! Parsing never touches the dataplane: registry indices are assigned later,
//! when the parsed services are registered in the session table.

use super::error::{Error, Result};
use super::pb;
use super::types::{
    BalancerAddresses, Real, RealIdentifier, RealUpdate, SessionsTimeouts, VirtualService,
    VsIdentifier, WlcConfig,
};
use crate::constants::{DEFAULT_SESSION_TABLE_CAPACITY, MAX_REAL_WEIGHT, MIN_MAX_LOAD_FACTOR};
use ipnet::IpNet;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tracing::warn;

/// Module configuration after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedModuleConfig {
    pub virtual_services: Vec<VirtualService>,
    pub addresses: BalancerAddresses,
    pub timeouts: SessionsTimeouts,
    pub wlc: WlcConfig,
}

/// Session table settings after validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateSettings {
    /// Requested capacity; zero keeps the current one.
    pub capacity: usize,
    pub scan_period: Duration,
    pub max_load_factor: f32,
}

impl StateSettings {
    pub fn from_proto(config: &pb::ModuleStateConfig) -> Result<Self> {
        let scan_period_ms = config
            .session_table_scan_period_ms
            .ok_or_else(|| Error::invalid("session table scan period is required"))?;
        let max_load_factor = config.session_table_max_load_factor;
        validate_max_load_factor(max_load_factor)?;

        Ok(Self {
            capacity: usize::try_from(config.session_table_capacity).map_err(|_| {
                Error::invalid(format!(
                    "session table capacity {} is too large",
                    config.session_table_capacity
                ))
            })?,
            scan_period: Duration::from_millis(scan_period_ms),
            max_load_factor,
        })
    }

    /// Settings for a new table; a zero capacity falls back to the default.
    pub fn initial_capacity(&self) -> usize {
        if self.capacity == 0 {
            warn!(
                capacity = DEFAULT_SESSION_TABLE_CAPACITY,
                "Session table capacity not set, using default"
            );
            DEFAULT_SESSION_TABLE_CAPACITY
        } else {
            self.capacity
        }
    }
}

pub fn validate_max_load_factor(max_load_factor: f32) -> Result<()> {
    if max_load_factor > MIN_MAX_LOAD_FACTOR && max_load_factor.is_finite() {
        Ok(())
    } else {
        Err(Error::invalid(format!(
            "session table max load factor must be greater than {MIN_MAX_LOAD_FACTOR}, got {max_load_factor}"
        )))
    }
}

pub fn parse_addr(field: &str, value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::invalid(format!("invalid {field} '{value}'")))
}

fn parse_port(field: &str, value: u32) -> Result<u16> {
    u16::try_from(value).map_err(|_| Error::invalid(format!("{field} {value} is out of range")))
}

fn parse_weight(value: u32) -> Result<u16> {
    match u16::try_from(value) {
        Ok(weight) if weight <= MAX_REAL_WEIGHT => Ok(weight),
        _ => Err(Error::invalid(format!(
            "weight {value} exceeds maximum {MAX_REAL_WEIGHT}"
        ))),
    }
}

fn same_family(a: IpAddr, b: IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

pub fn module_config(config: &pb::ModuleConfig) -> Result<ParsedModuleConfig> {
    let addresses = addresses(config)?;
    let timeouts = config
        .sessions_timeouts
        .as_ref()
        .map(sessions_timeouts)
        .ok_or_else(|| Error::invalid("sessions timeouts are required"))?;

    let mut seen = HashSet::new();
    let mut virtual_services = Vec::with_capacity(config.virtual_services.len());
    for (idx, vs) in config.virtual_services.iter().enumerate() {
        let vs = virtual_service(vs).map_err(|err| err.context(format!("virtual service at index {idx}")))?;
        if !seen.insert(vs.identifier) {
            return Err(Error::invalid(format!(
                "duplicate virtual service {} at index {idx}",
                vs.identifier
            )));
        }
        virtual_services.push(vs);
    }

    let wlc_required = virtual_services.iter().any(|vs| vs.flags.wlc);
    let wlc = wlc_config(config.wlc.as_ref(), wlc_required)?;

    Ok(ParsedModuleConfig {
        virtual_services,
        addresses,
        timeouts,
        wlc,
    })
}

fn addresses(config: &pb::ModuleConfig) -> Result<BalancerAddresses> {
    let source_v4 = if config.source_address_v4.is_empty() {
        Ipv4Addr::UNSPECIFIED
    } else {
        match parse_addr("source address v4", &config.source_address_v4)? {
            IpAddr::V4(addr) => addr,
            IpAddr::V6(addr) => {
                return Err(Error::invalid(format!("source address v4 '{addr}' is not IPv4")));
            }
        }
    };
    let source_v6 = if config.source_address_v6.is_empty() {
        Ipv6Addr::UNSPECIFIED
    } else {
        match parse_addr("source address v6", &config.source_address_v6)? {
            IpAddr::V6(addr) => addr,
            IpAddr::V4(addr) => {
                return Err(Error::invalid(format!("source address v6 '{addr}' is not IPv6")));
            }
        }
    };
    let decap = config
        .decap_addresses
        .iter()
        .map(|addr| parse_addr("decap address", addr))
        .collect::<Result<Vec<_>>>()?;

    Ok(BalancerAddresses {
        source_v4,
        source_v6,
        decap,
    })
}

fn sessions_timeouts(timeouts: &pb::SessionsTimeouts) -> SessionsTimeouts {
    SessionsTimeouts {
        tcp_syn_ack: timeouts.tcp_syn_ack,
        tcp_syn: timeouts.tcp_syn,
        tcp_fin: timeouts.tcp_fin,
        tcp: timeouts.tcp,
        udp: timeouts.udp,
        default: timeouts.default,
    }
}

fn wlc_config(config: Option<&pb::WlcConfig>, required: bool) -> Result<WlcConfig> {
    let Some(config) = config else {
        if required {
            return Err(Error::invalid(
                "wlc config is required by virtual services with the wlc flag",
            ));
        }
        return Ok(WlcConfig::default());
    };

    let power = config.power.unwrap_or(0);
    let max_weight = config.max_weight.unwrap_or(0);
    let max_weight = u16::try_from(max_weight)
        .map_err(|_| Error::invalid(format!("wlc max weight {max_weight} is out of range")))?;
    if required && (power == 0 || max_weight == 0) {
        return Err(Error::invalid("wlc power and max weight must be positive"));
    }

    Ok(WlcConfig {
        power,
        max_weight,
        update_period: Duration::from_millis(config.update_period_ms),
    })
}

fn virtual_service(vs: &pb::VirtualService) -> Result<VirtualService> {
    let identifier = VsIdentifier {
        addr: parse_addr("virtual service address", &vs.addr)?,
        port: parse_port("virtual service port", vs.port)?,
        proto: vs.proto,
    };
    if vs.flags.pure_l3 && identifier.port != 0 {
        return Err(Error::invalid(format!(
            "pure L3 virtual service {identifier} must have port 0"
        )));
    }

    let allowed_sources = vs
        .allowed_srcs
        .iter()
        .map(|src| {
            let net: IpNet = src
                .trim()
                .parse()
                .map_err(|_| Error::invalid(format!("invalid allowed source '{src}'")))?;
            if !same_family(net.addr(), identifier.addr) {
                return Err(Error::invalid(format!(
                    "allowed source {net} does not match address family of {identifier}"
                )));
            }
            Ok(net.trunc())
        })
        .collect::<Result<Vec<_>>>()?;

    let peers = vs
        .peers
        .iter()
        .map(|peer| parse_addr("peer address", peer))
        .collect::<Result<Vec<_>>>()?;

    let mut seen = HashSet::new();
    let mut reals = Vec::with_capacity(vs.reals.len());
    for (idx, real) in vs.reals.iter().enumerate() {
        let real = parse_real(identifier, real).map_err(|err| err.context(format!("real at index {idx}")))?;
        if !seen.insert(real.identifier.addr) {
            return Err(Error::invalid(format!(
                "duplicate real {} at index {idx}",
                real.identifier.addr
            )));
        }
        reals.push(real);
    }

    Ok(VirtualService {
        registry_idx: 0,
        identifier,
        flags: vs.flags,
        scheduler: vs.scheduler,
        allowed_sources,
        peers,
        reals,
    })
}

fn parse_real(vs: VsIdentifier, real: &pb::Real) -> Result<Real> {
    let addr = parse_addr("real address", &real.dst_addr)?;
    let src_addr = parse_addr("real source address", &real.src_addr)?;
    let src_mask = parse_addr("real source mask", &real.src_mask)?;
    if !same_family(addr, src_addr) || !same_family(addr, src_mask) {
        return Err(Error::invalid(format!(
            "source address and mask of real {addr} must match its address family"
        )));
    }

    Ok(Real::new(
        RealIdentifier { vs, addr },
        parse_weight(real.weight)?,
        src_addr,
        src_mask,
        real.enabled,
    ))
}

pub fn real_update(update: &pb::RealUpdate) -> Result<RealUpdate> {
    let vs = VsIdentifier {
        addr: parse_addr("virtual service address", &update.virtual_ip)?,
        port: parse_port("virtual service port", update.port)?,
        proto: update.proto,
    };
    let real = RealIdentifier {
        vs,
        addr: parse_addr("real address", &update.real_ip)?,
    };

    Ok(RealUpdate {
        real,
        weight: update.weight.map(parse_weight).transpose()?,
        enabled: update.enable,
    })
}
