use crate::core::error::{Error, Result};
use crate::core::resolve::TagSelector;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fwsync/config.json";

/// Upper bound for the HTTP timeout
///
/// Clamped so a typo cannot wedge a scheduled run for hours.
pub const MAX_HTTP_TIMEOUT_SECS: u64 = 600;

/// Complete service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Global switch; nothing is fetched or applied while off
    pub enabled: bool,
    /// URI of the remote rule list
    pub source: Option<String>,
    /// Last successfully applied copy of the rule list
    pub local_reference: PathBuf,
    /// Directory holding one file per active artifact
    pub artifact_dir: PathBuf,
    /// Rebuilds the host ruleset from the artifact directory
    pub rebuild_command: Vec<String>,
    /// Reloads kernel parameters after a change
    pub reload_command: Vec<String>,
    /// Discovery snapshot file (collection -> members)
    pub discovery_file: Option<PathBuf>,
    /// Resolve address-less rules through discovery instead of "any"
    pub tag_selector: Option<TagSelector>,
    /// JSON-lines audit trail; `null` disables it
    pub audit_log: Option<PathBuf>,
    pub http_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false, // Hosts opt in explicitly
            source: None,
            local_reference: PathBuf::from("/etc/fwsync/firewall_rules.yaml"),
            artifact_dir: PathBuf::from(crate::core::render::DEFAULT_ARTIFACT_DIR),
            rebuild_command: vec!["/usr/sbin/rebuild-iptables".to_string()],
            reload_command: vec!["sysctl".to_string(), "-e".to_string(), "-p".to_string()],
            discovery_file: None,
            tag_selector: None,
            audit_log: Some(PathBuf::from("/var/log/fwsync/audit.log")),
            http_timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.clamp(1, MAX_HTTP_TIMEOUT_SECS))
    }

    /// Returns the configured source, or a config error naming the file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no source is set.
    pub fn require_source(&self) -> Result<&str> {
        self.source
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::Config("no rule source configured".to_string()))
    }

    /// Checks cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for empty commands or a tag selector with
    /// nothing to query.
    pub fn validate(&self) -> Result<()> {
        if self.rebuild_command.is_empty() {
            return Err(Error::Config("rebuild_command cannot be empty".to_string()));
        }
        if self.reload_command.is_empty() {
            return Err(Error::Config("reload_command cannot be empty".to_string()));
        }
        if let Some(selector) = &self.tag_selector {
            if selector.collection.trim().is_empty() {
                return Err(Error::Config(
                    "tag_selector.collection cannot be empty".to_string(),
                ));
            }
            for tag in &selector.machine_tags {
                crate::validators::validate_machine_tag(tag).map_err(Error::Config)?;
            }
            if self.discovery_file.is_none() {
                return Err(Error::Config(
                    "tag_selector requires discovery_file".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file next to the target.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
///
/// # Errors
///
/// Returns `Err` if the directory or file cannot be written.
pub async fn save_config(config: &Config, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;

    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    // Create file with restrictive permissions from the start so it is never
    // briefly world-readable
    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            Error::Config(format!(
                "disk full: cannot save configuration to {}",
                path.display()
            ))
        } else {
            Error::Io(e)
        }
    })?;
    Ok(())
}

/// Writes a default config to `path` for a new host.
///
/// An existing file is left alone unless `force` is set. The written config
/// has the global switch off, so nothing happens until an operator enables it.
///
/// # Errors
///
/// Returns [`Error::Config`] if the file exists and `force` is not set, or
/// any error from [`save_config`].
pub async fn init_config(path: &Path, force: bool) -> Result<Config> {
    if !force && tokio::fs::try_exists(path).await? {
        return Err(Error::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    let config = Config::default();
    save_config(&config, path).await?;
    tracing::info!("Wrote default configuration to {}", path.display());
    Ok(config)
}

/// Loads the config from `path`, or returns defaults if the file does not exist.
///
/// # Errors
///
/// Returns [`Error::Config`] if the file exists but cannot be read or parsed.
pub async fn load_config(path: &Path) -> Result<Config> {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str::<Config>(&json)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config at {}; using defaults", path.display());
            Ok(Config::default())
        }
        Err(e) => Err(Error::Config(format!("{}: {e}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.json")).await.unwrap();

        assert_eq!(config, Config::default());
        assert!(!config.enabled);
        assert_eq!(config.reload_command, vec!["sysctl", "-e", "-p"]);
    }

    #[tokio::test]
    async fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"enabled": true, "source": "https://rules.example.com/fw.yaml",
                "tag_selector": {"collection": "web", "machine_tags": ["role:web=true"]}}"#,
        )
        .unwrap();

        let config = load_config(&path).await.unwrap();
        assert!(config.enabled);
        assert_eq!(
            config.require_source().unwrap(),
            "https://rules.example.com/fw.yaml"
        );
        let selector = config.tag_selector.unwrap();
        assert_eq!(selector.ip_tag, crate::core::resolve::DEFAULT_IP_TAG);
        assert_eq!(config.artifact_dir, PathBuf::from("/etc/iptables.d"));
    }

    #[tokio::test]
    async fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(load_config(&path).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc").join("config.json");
        let config = Config {
            enabled: true,
            source: Some("https://rules.example.com/fw.yaml".to_string()),
            ..Config::default()
        };

        save_config(&config, &path).await.unwrap();
        assert_eq!(load_config(&path).await.unwrap(), config);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_init_writes_defaults_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fwsync").join("config.json");

        let written = init_config(&path, false).await.unwrap();
        assert_eq!(written, Config::default());
        assert_eq!(load_config(&path).await.unwrap(), Config::default());

        std::fs::write(&path, r#"{"enabled": true}"#).unwrap();
        assert!(matches!(
            init_config(&path, false).await,
            Err(Error::Config(_))
        ));
        assert!(load_config(&path).await.unwrap().enabled);

        init_config(&path, true).await.unwrap();
        assert!(!load_config(&path).await.unwrap().enabled);
    }

    #[test]
    fn test_validate_rejects_selector_without_discovery() {
        let config = Config {
            tag_selector: Some(TagSelector {
                collection: "web".to_string(),
                machine_tags: vec!["role:web=true".to_string()],
                ip_tag: "server:private_ip_0".to_string(),
            }),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = Config {
            discovery_file: Some(PathBuf::from("/var/lib/fwsync/discovery.yaml")),
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_source_and_timeout_clamp() {
        let config = Config {
            source: Some("  ".to_string()),
            http_timeout_secs: 0,
            ..Config::default()
        };
        assert!(config.require_source().is_err());
        assert_eq!(config.http_timeout(), Duration::from_secs(1));
    }
}
