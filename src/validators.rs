//! Input validation and sanitization functions for fwsync
//!
//! Everything that ends up inside a rendered artifact or an artifact file name
//! passes through here first, since rule documents are fetched from a remote,
//! possibly hand-edited source.

use ipnetwork::IpNetwork;
use std::net::Ipv4Addr;

/// Maximum length of a chain target name accepted by the kernel (`XT_EXTENSION_MAXNAMELEN - 1`)
pub const MAX_TARGET_LEN: usize = 28;

/// Validates an explicit rule address (single IP or CIDR network).
///
/// # Errors
///
/// Returns `Err` if the value is neither an IPv4/IPv6 address nor a network.
///
/// # Examples
///
/// ```
/// use fwsync::validators::validate_address;
///
/// assert!(validate_address("10.0.0.0/8").is_ok());
/// assert!(validate_address("192.168.1.7").is_ok());
/// assert!(validate_address("web-01").is_err());
/// ```
pub fn validate_address(input: &str) -> Result<IpNetwork, String> {
    input
        .trim()
        .parse::<IpNetwork>()
        .map_err(|e| format!("Invalid address '{input}': {e}"))
}

/// Checks for a strict IPv4 dotted quad (`a.b.c.d`, each octet 0-255, no leading zeros).
///
/// Used for addresses pulled out of discovery tags, which must be single hosts.
pub fn is_ipv4_dotted_quad(input: &str) -> bool {
    // Ipv4Addr's parser already rejects leading zeros and out-of-range octets
    input.parse::<Ipv4Addr>().is_ok()
}

/// Validates and normalizes a chain target (`ACCEPT`, `DROP`, custom chain names).
///
/// The value is upper-cased. Only ASCII alphanumerics, `_` and `-` are allowed
/// so a target can never inject extra arguments into a rendered fragment.
///
/// # Errors
///
/// Returns `Err` if the target is empty, too long, or contains other characters.
///
/// # Examples
///
/// ```
/// use fwsync::validators::validate_target;
///
/// assert_eq!(validate_target("accept").unwrap(), "ACCEPT");
/// assert!(validate_target("ACCEPT -j DROP").is_err());
/// ```
pub fn validate_target(input: &str) -> Result<String, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("Target cannot be empty".to_string());
    }

    if trimmed.len() > MAX_TARGET_LEN {
        return Err(format!("Target too long (max {MAX_TARGET_LEN} characters)"));
    }

    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err(format!("Target '{trimmed}' contains invalid characters"));
    }

    Ok(trimmed.to_ascii_uppercase())
}

/// Makes an address usable inside an artifact file name.
///
/// `/` becomes `_`; any other character outside `[A-Za-z0-9._:-]` also becomes
/// `_` so a name can never escape the artifact directory.
pub fn artifact_name_component(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Validates a machine tag filter (`namespace:predicate` or `namespace:predicate=value`).
///
/// # Errors
///
/// Returns `Err` if the tag has no namespace, no predicate, or contains whitespace.
pub fn validate_machine_tag(input: &str) -> Result<String, String> {
    let tag = input.trim();
    if tag.is_empty() {
        return Err("Tag cannot be empty".to_string());
    }

    if tag.chars().any(char::is_whitespace) {
        return Err(format!("Tag '{tag}' contains whitespace"));
    }

    let name = tag.split_once('=').map_or(tag, |(name, _)| name);
    match name.split_once(':') {
        Some((namespace, predicate)) if !namespace.is_empty() && !predicate.is_empty() => {
            Ok(tag.to_string())
        }
        _ => Err(format!(
            "Tag '{tag}' must look like namespace:predicate[=value]"
        )),
    }
}
