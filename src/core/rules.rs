//! Rule data structures
//!
//! A rule document is a YAML sequence of loosely-typed [`RuleSpec`] entries.
//! Normalization (see [`crate::core::normalize`]) turns each entry into one or
//! more [`AtomicRule`]s, each naming exactly one protocol and one port token.
//!
//! # Example
//!
//! ```
//! use fwsync::core::rules::parse_document;
//!
//! let specs = parse_document(
//!     "- ip_address: ''\n  protocol: both\n  ports: '22, 80'\n  enable: true\n  target: ACCEPT\n",
//! )
//! .unwrap();
//! assert_eq!(specs.len(), 1);
//! assert_eq!(specs[0].ports, "22, 80");
//! ```

use crate::core::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Maximum number of entries accepted from a single rule document
///
/// Limit prevents memory exhaustion from a malformed remote document.
pub const MAX_RULE_SPECS: usize = 10_000;

/// Highest port token accepted by the normalizer (inclusive)
pub const MAX_PORT: u32 = 65_536;

/// Target used when a document entry omits one
pub const DEFAULT_TARGET: &str = "ACCEPT";

/// Raw rule entry as written in the rule document
///
/// Keys may carry a leading colon (`:ports`), which is how Ruby-symbol YAML
/// serializes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(default, alias = ":ip_address", deserialize_with = "lenient_string")]
    pub ip_address: String,
    #[serde(alias = ":protocol", deserialize_with = "lenient_string")]
    pub protocol: String,
    #[serde(alias = ":ports", deserialize_with = "lenient_string")]
    pub ports: String,
    #[serde(default = "default_true", alias = ":enable")]
    pub enable: bool,
    #[serde(default = "default_target", alias = ":target")]
    pub target: String,
}

fn default_true() -> bool {
    true
}

fn default_target() -> String {
    DEFAULT_TARGET.to_string()
}

/// Accepts strings, numbers, booleans and null (as empty) for text fields.
/// Hand-edited documents routinely write `ports: 22` instead of `ports: '22'`.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    match Option::<serde_yaml::Value>::deserialize(deserializer)? {
        None | Some(serde_yaml::Value::Null) => Ok(String::new()),
        Some(serde_yaml::Value::String(s)) => Ok(s),
        Some(serde_yaml::Value::Number(n)) => Ok(n.to_string()),
        Some(serde_yaml::Value::Bool(b)) => Ok(b.to_string()),
        Some(other) => Err(D::Error::custom(format!(
            "expected a scalar value, found {other:?}"
        ))),
    }
}

/// Transport protocol of an atomic rule
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Protocol field of a [`RuleSpec`], before expansion
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProtocolSpec {
    Tcp,
    Udp,
    /// Expands to TCP then UDP
    Both,
}

impl ProtocolSpec {
    /// Protocols this spec expands to, in emission order
    pub const fn expand(self) -> &'static [Protocol] {
        match self {
            ProtocolSpec::Tcp => &[Protocol::Tcp],
            ProtocolSpec::Udp => &[Protocol::Udp],
            ProtocolSpec::Both => &[Protocol::Tcp, Protocol::Udp],
        }
    }
}

/// A single resolved port token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortSpec {
    /// No port constraint
    Any,
    Number(u32),
}

impl PortSpec {
    /// Parses one numeric token. Returns `None` for anything outside `1..=65536`.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.parse::<u32>() {
            Ok(port) if (1..=MAX_PORT).contains(&port) => Some(PortSpec::Number(port)),
            _ => None,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, PortSpec::Any)
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Any => write!(f, "any"),
            PortSpec::Number(port) => write!(f, "{port}"),
        }
    }
}

/// Canonical single-protocol, single-port directive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicRule {
    /// `None` means no address constraint
    pub ip_address: Option<String>,
    pub port: PortSpec,
    pub protocol: Protocol,
    pub enable: bool,
    pub target: String,
}

impl fmt::Display for AtomicRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} from {} -> {}",
            if self.enable { "enable" } else { "disable" },
            self.protocol,
            self.port,
            self.ip_address.as_deref().unwrap_or("any"),
            self.target
        )
    }
}

/// Parses a YAML rule document into raw specs.
///
/// An empty document yields no specs.
///
/// # Errors
///
/// Returns `Err` if the YAML is malformed or holds more than [`MAX_RULE_SPECS`] entries.
pub fn parse_document(text: &str) -> Result<Vec<RuleSpec>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let specs: Option<Vec<RuleSpec>> = serde_yaml::from_str(text)?;
    let specs = specs.unwrap_or_default();

    if specs.len() > MAX_RULE_SPECS {
        return Err(Error::Validation {
            field: "document".to_string(),
            message: format!(
                "contains {} rules (max: {MAX_RULE_SPECS})",
                specs.len()
            ),
        });
    }

    Ok(specs)
}
