//! Artifact rendering and activation
//!
//! Every (atomic rule, target) pair materializes as one named artifact: a
//! small iptables fragment picked up by the rebuild command. The name is a pure
//! function of port, address and protocol, so repeated cycles over the same
//! logical rule always land on the same artifact.
//!
//! Activation is compare-then-write. An artifact whose bytes already match the
//! store is left untouched, which is what keeps unchanged cycles from
//! triggering a reload downstream.

use crate::core::error::{Error, Result};
use crate::core::resolve::{ANY_ADDRESS, Target};
use crate::core::rules::{AtomicRule, PortSpec};
use crate::validators::{artifact_name_component, validate_target};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Chain the rebuild command assembles fragments into
pub const CHAIN: &str = "FWR";

/// Default directory holding one file per artifact
pub const DEFAULT_ARTIFACT_DIR: &str = "/etc/iptables.d";

/// Persistent key-value table of active artifacts, keyed by artifact name
pub trait ArtifactStore {
    /// Returns the active content under `name`, if any.
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Makes `content` the active content under `name`.
    fn put(&mut self, name: &str, content: &[u8]) -> Result<()>;

    /// Deactivates `name`. Removing an absent artifact is not an error.
    fn remove(&mut self, name: &str) -> Result<()>;
}

/// Artifact store keeping one file per artifact in a directory
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl ArtifactStore for DirStore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes through a temp file in the same directory, then renames over the
    /// target so the rebuild command never sees a half-written fragment.
    fn put(&mut self, name: &str, content: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o644))?;
        }
        temp.write_all(content)?;
        temp.as_file().sync_all()?;
        temp.persist(self.path_for(name))
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory artifact store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    artifacts: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.artifacts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl ArtifactStore for MemoryStore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.artifacts.get(name).cloned())
    }

    fn put(&mut self, name: &str, content: &[u8]) -> Result<()> {
        self.artifacts.insert(name.to_string(), content.to_vec());
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        self.artifacts.remove(name);
        Ok(())
    }
}

/// Reads through to an inner store but keeps every write in memory.
///
/// Used for planning: a full cycle runs against it and reports what would
/// change without touching the real artifacts.
#[derive(Debug, Clone)]
pub struct DryRunStore<S> {
    inner: S,
    overlay: HashMap<String, Option<Vec<u8>>>,
}

impl<S: ArtifactStore> DryRunStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            overlay: HashMap::new(),
        }
    }

    /// Names of artifacts that would have been written or removed
    pub fn pending(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.overlay.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl<S: ArtifactStore> ArtifactStore for DryRunStore<S> {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self.overlay.get(name) {
            Some(staged) => Ok(staged.clone()),
            None => self.inner.get(name),
        }
    }

    fn put(&mut self, name: &str, content: &[u8]) -> Result<()> {
        self.overlay.insert(name.to_string(), Some(content.to_vec()));
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        self.overlay.insert(name.to_string(), None);
        Ok(())
    }
}

/// Rendered candidate for one (rule, target) pair, before comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedArtifact {
    pub name: String,
    pub content: Vec<u8>,
    pub enable: bool,
}

/// Materialized artifact after comparison against the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifact {
    pub name: String,
    pub content: Vec<u8>,
    pub enable: bool,
    /// True iff the store's active content differed and was replaced
    pub changed: bool,
}

impl RenderedArtifact {
    /// SHA-256 of the rendered content, hex encoded
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.content);
        format!("{:x}", hasher.finalize())
    }
}

/// Artifact name for a rule applied to an address (`None` = any).
///
/// ```
/// use fwsync::core::render::artifact_name;
/// use fwsync::core::rules::{AtomicRule, PortSpec, Protocol};
///
/// let rule = AtomicRule {
///     ip_address: None,
///     port: PortSpec::Number(22),
///     protocol: Protocol::Tcp,
///     enable: true,
///     target: "ACCEPT".to_string(),
/// };
/// assert_eq!(artifact_name(&rule, Some("10.0.0.0/24")), "port_22_10.0.0.0_24_tcp");
/// assert_eq!(artifact_name(&rule, None), "port_22_any_tcp");
/// ```
pub fn artifact_name(rule: &AtomicRule, address: Option<&str>) -> String {
    let address = address.map_or_else(|| ANY_ADDRESS.to_string(), artifact_name_component);
    format!("port_{}_{}_{}", rule.port, address, rule.protocol)
}

/// Renders the fragment for a rule applied to an address (`None` = any).
///
/// Output is deterministic: the same inputs always give the same bytes.
///
/// # Errors
///
/// Returns [`Error::Validation`] if the rule's target is not a valid chain target.
pub fn render_content(rule: &AtomicRule, address: Option<&str>) -> Result<Vec<u8>> {
    let target = validate_target(&rule.target).map_err(|message| Error::Validation {
        field: "target".to_string(),
        message,
    })?;

    let name = artifact_name(rule, address);
    let mut text = String::new();
    let _ = writeln!(text, "# {name} (managed by fwsync)");
    let _ = write!(text, "-A {CHAIN}");
    if let Some(addr) = address {
        let _ = write!(text, " -s {addr}");
    }
    let _ = write!(text, " -p {}", rule.protocol);
    if let PortSpec::Number(port) = rule.port {
        let _ = write!(text, " -m {} --dport {port}", rule.protocol);
    }
    let _ = writeln!(text, " -j {target}");

    Ok(text.into_bytes())
}

/// Renders without touching any store.
///
/// # Errors
///
/// Same as [`render_content`].
pub fn prepare(rule: &AtomicRule, target: &Target) -> Result<PreparedArtifact> {
    let address = target.address();
    Ok(PreparedArtifact {
        name: artifact_name(rule, address),
        content: render_content(rule, address)?,
        enable: rule.enable,
    })
}

/// Compares a prepared artifact with the store and activates it if it differs.
///
/// An enabled artifact changes when the stored bytes differ (or are absent) and
/// is written. A disabled artifact changes when it is still present and is
/// removed. Nothing is written when nothing changed.
///
/// # Errors
///
/// Returns `Err` if the store cannot be read or written.
pub fn activate<S: ArtifactStore + ?Sized>(
    prepared: PreparedArtifact,
    store: &mut S,
) -> Result<RenderedArtifact> {
    let active = store.get(&prepared.name)?;

    let changed = if prepared.enable {
        active.as_deref() != Some(prepared.content.as_slice())
    } else {
        active.is_some()
    };

    if changed {
        if prepared.enable {
            log_content_diff(&prepared.name, active.as_deref(), &prepared.content);
            store.put(&prepared.name, &prepared.content)?;
            info!("Activated artifact {}", prepared.name);
        } else {
            store.remove(&prepared.name)?;
            info!("Removed artifact {}", prepared.name);
        }
    } else {
        debug!("Artifact {} unchanged", prepared.name);
    }

    Ok(RenderedArtifact {
        name: prepared.name,
        content: prepared.content,
        enable: prepared.enable,
        changed,
    })
}

/// Renders one (rule, target) pair and activates it if it differs from the store.
///
/// # Errors
///
/// Returns `Err` on an invalid target or a store failure.
pub fn render<S: ArtifactStore + ?Sized>(
    rule: &AtomicRule,
    target: &Target,
    store: &mut S,
) -> Result<RenderedArtifact> {
    activate(prepare(rule, target)?, store)
}

fn log_content_diff(name: &str, old: Option<&[u8]>, new: &[u8]) {
    let Some(old) = old else {
        debug!("Artifact {name} is new");
        return;
    };

    let old_text = String::from_utf8_lossy(old);
    let new_text = String::from_utf8_lossy(new);
    let diff = similar::TextDiff::from_lines(old_text.as_ref(), new_text.as_ref());
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => "-",
            similar::ChangeTag::Insert => "+",
            similar::ChangeTag::Equal => continue,
        };
        debug!("{name}: {sign}{}", change.value().trim_end());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rules::Protocol;

    fn rule(port: PortSpec, protocol: Protocol, enable: bool) -> AtomicRule {
        AtomicRule {
            ip_address: None,
            port,
            protocol,
            enable,
            target: "accept".to_string(),
        }
    }

    #[test]
    fn test_render_content_exact_bytes() {
        let r = rule(PortSpec::Number(22), Protocol::Tcp, true);
        let content = render_content(&r, Some("10.0.0.0/24")).unwrap();
        assert_eq!(
            String::from_utf8(content).unwrap(),
            "# port_22_10.0.0.0_24_tcp (managed by fwsync)\n-A FWR -s 10.0.0.0/24 -p tcp -m tcp --dport 22 -j ACCEPT\n"
        );
    }

    #[test]
    fn test_render_any_port_and_address_unconstrained() {
        let r = rule(PortSpec::Any, Protocol::Udp, true);
        let content = String::from_utf8(render_content(&r, None).unwrap()).unwrap();
        assert_eq!(
            content,
            "# port_any_any_udp (managed by fwsync)\n-A FWR -p udp -j ACCEPT\n"
        );
        assert!(!content.contains("--dport"));
        assert!(!content.contains("-s "));
    }

    #[test]
    fn test_render_rejects_injected_target() {
        let mut r = rule(PortSpec::Number(80), Protocol::Tcp, true);
        r.target = "ACCEPT -j LOG".to_string();
        assert!(matches!(
            render_content(&r, None),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn test_activate_writes_only_on_change() {
        let mut store = MemoryStore::new();
        let r = rule(PortSpec::Number(443), Protocol::Tcp, true);

        let first = render(&r, &Target::Any, &mut store).unwrap();
        assert!(first.changed);
        assert_eq!(store.get(&first.name).unwrap(), Some(first.content.clone()));

        let second = render(&r, &Target::Any, &mut store).unwrap();
        assert!(!second.changed);
        assert_eq!(first.digest(), second.digest());
    }

    #[test]
    fn test_activate_replaces_stale_content() {
        let mut store = MemoryStore::new();
        let r = rule(PortSpec::Number(443), Protocol::Tcp, true);
        let name = artifact_name(&r, None);
        store.put(&name, b"-A FWR -j DROP\n").unwrap();

        let rendered = render(&r, &Target::Any, &mut store).unwrap();
        assert!(rendered.changed);
        assert_eq!(store.get(&name).unwrap(), Some(rendered.content));
    }

    #[test]
    fn test_disabled_rule_removes_present_artifact() {
        let mut store = MemoryStore::new();
        let enabled = rule(PortSpec::Number(8080), Protocol::Tcp, true);
        render(&enabled, &Target::Any, &mut store).unwrap();
        assert_eq!(store.len(), 1);

        let disabled = rule(PortSpec::Number(8080), Protocol::Tcp, false);
        let removed = render(&disabled, &Target::Any, &mut store).unwrap();
        assert!(removed.changed);
        assert!(store.is_empty());

        let again = render(&disabled, &Target::Any, &mut store).unwrap();
        assert!(!again.changed);
    }

    #[test]
    fn test_dir_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirStore::new(dir.path().join("iptables.d"));

        assert_eq!(store.get("port_22_any_tcp").unwrap(), None);
        store.put("port_22_any_tcp", b"-A FWR -p tcp -j ACCEPT\n").unwrap();
        assert_eq!(
            store.get("port_22_any_tcp").unwrap().as_deref(),
            Some(b"-A FWR -p tcp -j ACCEPT\n".as_slice())
        );

        store.remove("port_22_any_tcp").unwrap();
        store.remove("port_22_any_tcp").unwrap();
        assert_eq!(store.get("port_22_any_tcp").unwrap(), None);
    }

    #[test]
    fn test_dry_run_store_leaves_inner_untouched() {
        let mut inner = MemoryStore::new();
        inner.put("port_53_any_udp", b"old\n").unwrap();

        let mut dry = DryRunStore::new(inner);
        dry.put("port_22_any_tcp", b"new\n").unwrap();
        dry.remove("port_53_any_udp").unwrap();

        assert_eq!(dry.get("port_22_any_tcp").unwrap(), Some(b"new\n".to_vec()));
        assert_eq!(dry.get("port_53_any_udp").unwrap(), None);
        assert_eq!(dry.pending(), vec!["port_22_any_tcp", "port_53_any_udp"]);
        assert_eq!(dry.inner.get("port_53_any_udp").unwrap(), Some(b"old\n".to_vec()));
        assert_eq!(dry.inner.get("port_22_any_tcp").unwrap(), None);
    }
}
