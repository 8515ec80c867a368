//! Weighted least connections (WLC) reweighting.
//!
//! A real that serves fewer sessions than its share of the service weight
//! gets its effective weight boosted, so new sessions drift towards it:
//!
//! ```text
//! ratio     = (connections * weight_sum) / (connections_sum * weight)
//! boost     = max(1, power * (1 - ratio))
//! effective = min(round(weight * boost), max_weight)
//! ```
//!
//! Sums cover enabled reals only. Until the service carries at least as many
//! sessions as its total weight the configured weight is kept.

use super::types::{RealIdentifier, VirtualService, WlcConfig};
use std::collections::HashMap;

/// Effective weight of a single real.
pub fn calc_wlc_weight(
    wlc: &WlcConfig,
    weight: u16,
    connections: u64,
    weight_sum: u64,
    connections_sum: u64,
) -> u16 {
    if weight == 0 {
        return 0;
    }
    if weight_sum == 0 || connections_sum < weight_sum {
        return weight;
    }

    let scaled_connections = connections as f64 * weight_sum as f64;
    let scaled_weight = connections_sum as f64 * f64::from(weight);
    let ratio = scaled_connections / scaled_weight;
    let boost = (wlc.power as f64 * (1.0 - ratio)).max(1.0);

    let effective = (f64::from(weight) * boost).round();
    if effective >= f64::from(wlc.max_weight) {
        wlc.max_weight
    } else {
        effective as u16
    }
}

/// Recomputes effective weights of every real of `vs`.
///
/// Disabled reals get zero. Reals of a service without the WLC flag get their
/// configured weight. Returns whether any effective weight changed.
pub fn update_effective_weights(
    vs: &mut VirtualService,
    wlc: &WlcConfig,
    active_sessions: &HashMap<RealIdentifier, usize>,
) -> bool {
    let sessions_of = |id: &RealIdentifier| active_sessions.get(id).copied().unwrap_or(0) as u64;

    let (weight_sum, connections_sum) = vs
        .reals
        .iter()
        .filter(|real| real.enabled)
        .fold((0u64, 0u64), |(weights, conns), real| {
            (
                weights + u64::from(real.weight),
                conns + sessions_of(&real.identifier),
            )
        });

    let mut updated = false;
    for real in &mut vs.reals {
        let effective = if !real.enabled {
            0
        } else if vs.flags.wlc {
            calc_wlc_weight(
                wlc,
                real.weight,
                sessions_of(&real.identifier),
                weight_sum,
                connections_sum,
            )
        } else {
            real.weight
        };

        if real.effective_weight != effective {
            real.effective_weight = effective;
            updated = true;
        }
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::types::{Real, Scheduler, TransportProto, VsFlags, VsIdentifier};
    use std::time::Duration;

    fn wlc(power: u64, max_weight: u16) -> WlcConfig {
        WlcConfig {
            power,
            max_weight,
            update_period: Duration::ZERO,
        }
    }

    // =========================================================================
    // Single Real Formula Tests
    // =========================================================================

    #[test]
    fn test_zero_weight_stays_zero() {
        assert_eq!(calc_wlc_weight(&wlc(10, 1000), 0, 100, 200, 500), 0);
    }

    #[test]
    fn test_small_load_keeps_weight() {
        assert_eq!(calc_wlc_weight(&wlc(10, 1000), 100, 50, 0, 500), 100);
        assert_eq!(calc_wlc_weight(&wlc(10, 1000), 100, 50, 200, 100), 100);
    }

    #[test]
    fn test_known_vectors() {
        let cases = [
            // (power, max, connections, weight_sum, connections_sum, expected)
            (10, 1000, 50, 200, 200, 500),
            (10, 1000, 200, 200, 400, 100),
            (10, 1000, 100, 200, 400, 500),
            (10, 1000, 300, 200, 400, 100),
            (20, 200, 50, 200, 400, 200),
            (10, 1000, 0, 200, 400, 1000),
            (4, 1000, 100, 200, 400, 200),
        ];

        for (power, max, conns, weight_sum, conns_sum, expected) in cases {
            assert_eq!(
                calc_wlc_weight(&wlc(power, max), 100, conns, weight_sum, conns_sum),
                expected,
                "power={power} max={max} connections={conns}"
            );
        }
    }

    // =========================================================================
    // Virtual Service Tests
    // =========================================================================

    fn service(wlc_flag: bool, reals: &[(&str, u16, bool)]) -> VirtualService {
        let id = VsIdentifier {
            addr: "10.0.0.1".parse().unwrap(),
            port: 80,
            proto: TransportProto::Tcp,
        };
        VirtualService {
            registry_idx: 0,
            identifier: id,
            flags: VsFlags {
                wlc: wlc_flag,
                ..VsFlags::default()
            },
            scheduler: Scheduler::RoundRobin,
            allowed_sources: Vec::new(),
            peers: Vec::new(),
            reals: reals
                .iter()
                .map(|(addr, weight, enabled)| {
                    Real::new(
                        RealIdentifier {
                            vs: id,
                            addr: addr.parse().unwrap(),
                        },
                        *weight,
                        "10.1.0.0".parse().unwrap(),
                        "255.255.0.0".parse().unwrap(),
                        *enabled,
                    )
                })
                .collect(),
        }
    }

    fn sessions(vs: &VirtualService, counts: &[usize]) -> HashMap<RealIdentifier, usize> {
        vs.reals
            .iter()
            .zip(counts)
            .map(|(real, count)| (real.identifier, *count))
            .collect()
    }

    #[test]
    fn test_underloaded_real_is_boosted() {
        let mut vs = service(true, &[("192.168.0.1", 100, true), ("192.168.0.2", 100, true)]);
        let active = sessions(&vs, &[100, 300]);

        assert!(update_effective_weights(&mut vs, &wlc(10, 1000), &active));
        assert_eq!(vs.reals[0].effective_weight, 500);
        assert_eq!(vs.reals[1].effective_weight, 100);

        // Same load again: nothing changes.
        assert!(!update_effective_weights(&mut vs, &wlc(10, 1000), &active));
    }

    #[test]
    fn test_disabled_real_is_excluded() {
        let mut vs = service(
            true,
            &[
                ("192.168.0.1", 100, true),
                ("192.168.0.2", 100, true),
                ("192.168.0.3", 500, false),
            ],
        );
        let active = sessions(&vs, &[100, 300, 1000]);

        update_effective_weights(&mut vs, &wlc(10, 1000), &active);
        assert_eq!(vs.reals[0].effective_weight, 500);
        assert_eq!(vs.reals[2].effective_weight, 0);
    }

    #[test]
    fn test_non_wlc_service_uses_configured_weight() {
        let mut vs = service(false, &[("192.168.0.1", 7, true), ("192.168.0.2", 9, false)]);
        vs.reals[0].effective_weight = 3;
        let active = sessions(&vs, &[100, 300]);

        assert!(update_effective_weights(&mut vs, &wlc(10, 1000), &active));
        assert_eq!(vs.reals[0].effective_weight, 7);
        assert_eq!(vs.reals[1].effective_weight, 0);
    }
}
