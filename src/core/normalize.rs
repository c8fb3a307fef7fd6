//! Rule normalization
//!
//! Expands loosely-written [`RuleSpec`]s into canonical [`AtomicRule`]s.
//! Malformed pieces are dropped rather than failing the document: a bad port
//! token removes only that token, an unknown protocol removes only that entry.

use crate::core::rules::{AtomicRule, PortSpec, ProtocolSpec, RuleSpec};
use tracing::warn;

/// Result of a normalization pass, including what was dropped along the way
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Normalized {
    pub rules: Vec<AtomicRule>,
    /// Port tokens that were not a valid integer in `1..=65536`
    pub dropped_ports: usize,
    /// Entries skipped entirely because their protocol was not recognised
    pub skipped_specs: usize,
}

/// Normalizes specs into atomic rules, discarding the drop counters.
pub fn normalize(specs: &[RuleSpec]) -> Vec<AtomicRule> {
    normalize_with_report(specs).rules
}

/// Normalizes specs into atomic rules.
///
/// Emission order is protocol-then-port per spec, specs in document order.
pub fn normalize_with_report(specs: &[RuleSpec]) -> Normalized {
    let mut out = Normalized::default();

    for spec in specs {
        let Ok(protocols) = spec.protocol.trim().parse::<ProtocolSpec>() else {
            warn!(
                "Skipping rule with unknown protocol '{}' (ports: {})",
                spec.protocol, spec.ports
            );
            out.skipped_specs += 1;
            continue;
        };

        let address = normalize_address(&spec.ip_address);
        let (ports, dropped) = parse_ports(&spec.ports);
        if dropped > 0 {
            warn!(
                "Dropped {} invalid port token(s) from '{}'",
                dropped, spec.ports
            );
            out.dropped_ports += dropped;
        }

        for &protocol in protocols.expand() {
            for &port in &ports {
                out.rules.push(AtomicRule {
                    ip_address: address.clone(),
                    port,
                    protocol,
                    enable: spec.enable,
                    target: spec.target.clone(),
                });
            }
        }
    }

    out
}

/// Collapses "no constraint" spellings to `None`.
///
/// Empty, `any` and `all` (any case) mean unrestricted; everything else passes
/// through untouched. Syntax is checked later, at resolution.
pub fn normalize_address(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("any")
        || trimmed.eq_ignore_ascii_case("all")
    {
        None
    } else {
        Some(raw.to_string())
    }
}

/// Splits a comma-separated port field.
///
/// A literal `any` token dominates every other token. Returns the parsed ports
/// and the number of tokens dropped as invalid.
pub fn parse_ports(raw: &str) -> (Vec<PortSpec>, usize) {
    let tokens: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();

    if tokens.contains(&"any") {
        return (vec![PortSpec::Any], 0);
    }

    let ports: Vec<PortSpec> = tokens
        .iter()
        .filter_map(|t| PortSpec::from_token(t))
        .collect();
    let dropped = tokens.len() - ports.len();
    (ports, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rules::Protocol;
    use crate::core::test_helpers::rule_spec;

    #[test]
    fn test_both_protocols_cross_ports() {
        let rules = normalize(&[rule_spec("10.1.1.1", "both", "80,443")]);
        let pairs: Vec<(Protocol, PortSpec)> =
            rules.iter().map(|r| (r.protocol, r.port)).collect();
        assert_eq!(
            pairs,
            vec![
                (Protocol::Tcp, PortSpec::Number(80)),
                (Protocol::Tcp, PortSpec::Number(443)),
                (Protocol::Udp, PortSpec::Number(80)),
                (Protocol::Udp, PortSpec::Number(443)),
            ]
        );
        for rule in &rules {
            assert_eq!(rule.ip_address.as_deref(), Some("10.1.1.1"));
            assert!(rule.enable);
            assert_eq!(rule.target, "ACCEPT");
        }
    }

    #[test]
    fn test_any_dominates_port_list() {
        let rules = normalize(&[rule_spec("", "both", "80, any, 443")]);
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r.port == PortSpec::Any));
    }

    #[test]
    fn test_unrestricted_address_spellings() {
        for raw in ["", "ANY", "all", "All", "  any "] {
            assert_eq!(normalize_address(raw), None, "{raw:?}");
        }
        assert_eq!(
            normalize_address("192.168.0.0/16"),
            Some("192.168.0.0/16".to_string())
        );
        assert_eq!(normalize_address("mall"), Some("mall".to_string()));
    }

    #[test]
    fn test_invalid_ports_dropped() {
        let report = normalize_with_report(&[rule_spec("", "tcp", "0, 22, 70000, abc")]);
        assert_eq!(report.rules.len(), 1);
        assert_eq!(report.rules[0].port, PortSpec::Number(22));
        assert_eq!(report.dropped_ports, 3);
    }

    #[test]
    fn test_only_invalid_ports_yields_nothing() {
        let report = normalize_with_report(&[rule_spec("", "udp", "0,70000,abc")]);
        assert!(report.rules.is_empty());
        assert_eq!(report.dropped_ports, 3);
    }

    #[test]
    fn test_empty_ports_yields_nothing() {
        assert!(normalize(&[rule_spec("", "tcp", "")]).is_empty());
    }

    #[test]
    fn test_unknown_protocol_skips_only_that_spec() {
        let report = normalize_with_report(&[
            rule_spec("", "icmp", "1"),
            rule_spec("", "tcp", "22"),
        ]);
        assert_eq!(report.skipped_specs, 1);
        assert_eq!(report.rules.len(), 1);
        assert_eq!(report.rules[0].protocol, Protocol::Tcp);
    }

    #[test]
    fn test_disable_flag_and_target_inherited() {
        let mut spec = rule_spec("", "udp", "53");
        spec.enable = false;
        spec.target = "DROP".to_string();
        let rules = normalize(&[spec]);
        assert_eq!(rules.len(), 1);
        assert!(!rules[0].enable);
        assert_eq!(rules[0].target, "DROP");
    }
}
