//! Target resolution
//!
//! Turns an [`AtomicRule`]'s abstract target into concrete addresses. A target
//! is either an explicit address (or the `any` sentinel) or a tag expression
//! answered by a [`DiscoveryPort`]. Results are never cached: fleet membership
//! can change between cycles.

use crate::core::error::{Error, Result};
use crate::core::rules::AtomicRule;
use crate::validators::{is_ipv4_dotted_quad, validate_address};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Tag holding a member's address when none is configured
pub const DEFAULT_IP_TAG: &str = "server:private_ip_0";

/// Sentinel for "no address restriction"
pub const ANY_ADDRESS: &str = "any";

/// Which discovery members a rule applies to, and where their address lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSelector {
    /// Discovery collection to query
    pub collection: String,
    /// Tag filter (`namespace:predicate` or `namespace:predicate=value`)
    pub machine_tags: Vec<String>,
    /// Tag whose value is the member's address
    #[serde(default = "default_ip_tag")]
    pub ip_tag: String,
}

fn default_ip_tag() -> String {
    DEFAULT_IP_TAG.to_string()
}

/// One host returned by discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Member {
    #[serde(default, deserialize_with = "scalar_map")]
    pub tags: BTreeMap<String, String>,
}

impl Member {
    /// True if the member satisfies every filter entry
    pub fn matches(&self, tag_filter: &[String]) -> bool {
        tag_filter.iter().all(|filter| match filter.split_once('=') {
            Some((key, value)) => self.tags.get(key).is_some_and(|v| v == value),
            None => self.tags.contains_key(filter.as_str()),
        })
    }
}

/// Tag values in snapshots are often unquoted (`role:web: true`); keep them as text.
fn scalar_map<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, serde_yaml::Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|(key, value)| {
            let text = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((key, text))
        })
        .collect())
}

/// Tag-based server discovery
///
/// Retry and caching are the implementor's concern.
pub trait DiscoveryPort {
    /// Returns members of `collection` carrying every tag in `tag_filter`.
    fn members(&self, collection: &str, tag_filter: &[String]) -> Result<Vec<Member>>;
}

/// Discovery backed by a YAML (or JSON) snapshot file, re-read on every query.
///
/// ```yaml
/// web:
///   - tags:
///       role:web: "true"
///       server:private_ip_0: 10.0.0.5
/// ```
#[derive(Debug, Clone)]
pub struct FileDiscovery {
    path: PathBuf,
}

impl FileDiscovery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DiscoveryPort for FileDiscovery {
    fn members(&self, collection: &str, tag_filter: &[String]) -> Result<Vec<Member>> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Discovery(format!(
                "cannot read snapshot {}: {e}",
                self.path.display()
            ))
        })?;

        let mut collections: HashMap<String, Vec<Member>> = if text.trim().is_empty() {
            HashMap::new()
        } else {
            serde_yaml::from_str(&text).map_err(|e| {
                Error::Discovery(format!(
                    "cannot parse snapshot {}: {e}",
                    self.path.display()
                ))
            })?
        };

        Ok(collections
            .remove(collection)
            .unwrap_or_default()
            .into_iter()
            .filter(|m| m.matches(tag_filter))
            .collect())
    }
}

/// An unconfigured discovery source fails every query
impl<D: DiscoveryPort> DiscoveryPort for Option<D> {
    fn members(&self, collection: &str, tag_filter: &[String]) -> Result<Vec<Member>> {
        match self {
            Some(discovery) => discovery.members(collection, tag_filter),
            None => Err(Error::Discovery(format!(
                "no discovery source configured (collection '{collection}')"
            ))),
        }
    }
}

/// A concrete address an artifact applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Target {
    /// No address restriction
    Any,
    /// Validated single address or CIDR network, as written
    Address(String),
}

impl Target {
    /// Address for rendering; `None` for [`Target::Any`]
    pub fn address(&self) -> Option<&str> {
        match self {
            Target::Any => None,
            Target::Address(addr) => Some(addr),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Any => write!(f, "{ANY_ADDRESS}"),
            Target::Address(addr) => write!(f, "{addr}"),
        }
    }
}

/// Ordered, duplicate-free addresses resolved for one rule
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSet(Vec<Target>);

impl TargetSet {
    pub fn single(target: Target) -> Self {
        Self(vec![target])
    }

    fn push(&mut self, target: Target) {
        if !self.0.contains(&target) {
            self.0.push(target);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Target> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a TargetSet {
    type Item = &'a Target;
    type IntoIter = std::slice::Iter<'a, Target>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Derives resolver inputs for a rule.
///
/// A rule without an address means "any" unless a tag selector is configured,
/// in which case the tags decide. Only a concrete address combined with a
/// selector can conflict.
pub fn target_inputs<'a>(
    rule: &'a AtomicRule,
    selector: Option<&'a TagSelector>,
) -> (Option<&'a str>, Option<&'a TagSelector>) {
    match (rule.ip_address.as_deref(), selector) {
        (Some(addr), selector) => (Some(addr), selector),
        (None, Some(selector)) => (None, Some(selector)),
        (None, None) => (Some(ANY_ADDRESS), None),
    }
}

/// Resolves one rule's target into concrete addresses.
///
/// Invalid explicit addresses and discovered values that are not IPv4 dotted
/// quads are left out; an empty set is a normal result.
///
/// # Errors
///
/// - [`Error::ConflictingTarget`] if both an explicit address and a selector are given
/// - [`Error::Discovery`] if the discovery query fails
pub fn resolve<D: DiscoveryPort + ?Sized>(
    rule: &AtomicRule,
    explicit: Option<&str>,
    selector: Option<&TagSelector>,
    discovery: &D,
) -> Result<TargetSet> {
    match (explicit, selector) {
        (Some(address), Some(selector)) => Err(Error::ConflictingTarget {
            address: address.to_string(),
            tags: selector.machine_tags.clone(),
        }),
        (Some(address), None) => Ok(resolve_explicit(rule, address)),
        (None, Some(selector)) => resolve_tagged(rule, selector, discovery),
        (None, None) => {
            debug!("No target given for rule '{rule}'");
            Ok(TargetSet::default())
        }
    }
}

fn resolve_explicit(rule: &AtomicRule, address: &str) -> TargetSet {
    if address.trim().eq_ignore_ascii_case(ANY_ADDRESS) {
        return TargetSet::single(Target::Any);
    }

    match validate_address(address) {
        Ok(_) => TargetSet::single(Target::Address(address.trim().to_string())),
        Err(e) => {
            warn!("Skipping rule '{rule}': {e}");
            TargetSet::default()
        }
    }
}

fn resolve_tagged<D: DiscoveryPort + ?Sized>(
    rule: &AtomicRule,
    selector: &TagSelector,
    discovery: &D,
) -> Result<TargetSet> {
    debug!(
        "Resolving '{rule}' via tags [{}] in collection '{}' (address tag {})",
        selector.machine_tags.join(", "),
        selector.collection,
        selector.ip_tag
    );

    let members = discovery.members(&selector.collection, &selector.machine_tags)?;
    let mut targets = TargetSet::default();

    for member in &members {
        match member.tags.get(&selector.ip_tag) {
            Some(value) if is_ipv4_dotted_quad(value) => {
                targets.push(Target::Address(value.clone()));
            }
            Some(value) => {
                warn!(
                    "Ignoring member with malformed {} value '{value}'",
                    selector.ip_tag
                );
            }
            None => {
                debug!("Ignoring member without tag {}", selector.ip_tag);
            }
        }
    }

    if targets.is_empty() {
        debug!(
            "No members of '{}' matched [{}] yet",
            selector.collection,
            selector.machine_tags.join(", ")
        );
    }

    Ok(targets)
}
