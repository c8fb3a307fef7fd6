//! Remote rule source over HTTP(S)
//!
//! Provides the freshness probe (`HEAD` with `If-Modified-Since`) and the
//! document fetch (`GET`), plus persistence of the local reference copy whose
//! modification time feeds the next probe. No retries: a failed fetch fails
//! the cycle and the next scheduled run tries again.

use crate::core::change::{FreshnessProbe, RemoteFreshness, http_date};
use crate::core::error::{Error, Result};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::IF_MODIFIED_SINCE;
use std::future::Future;
use std::io::Write as _;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Downloads the full rule document
pub trait DocumentFetcher {
    fn fetch(&self, url: &Url) -> impl Future<Output = Result<Vec<u8>>>;
}

/// HTTP client for the rule source
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    /// Creates a client with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fwsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

fn transport_error(url: &Url, e: &reqwest::Error) -> Error {
    Error::Transport {
        url: url.to_string(),
        message: e.to_string(),
    }
}

impl FreshnessProbe for HttpSource {
    async fn probe(&self, url: &Url, since: DateTime<Utc>) -> Result<RemoteFreshness> {
        let response = self
            .client
            .head(url.clone())
            .header(IF_MODIFIED_SINCE, http_date(since))
            .send()
            .await
            .map_err(|e| transport_error(url, &e))?;

        debug!("HEAD {url} -> {}", response.status());
        if response.status() == StatusCode::NOT_MODIFIED {
            Ok(RemoteFreshness::NotModified)
        } else {
            Ok(RemoteFreshness::Modified)
        }
    }
}

impl DocumentFetcher for HttpSource {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        info!("Fetching rules from {url}");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| transport_error(url, &e))?;

        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(url, &e))?;
        debug!("Fetched {} bytes from {url}", body.len());
        Ok(body.to_vec())
    }
}

/// Atomically replaces the local reference copy with `content`.
///
/// Creates the parent directory if needed. The fresh modification time is
/// what the next `If-Modified-Since` probe will carry.
///
/// # Errors
///
/// Returns `Err` if the directory or file cannot be written.
pub fn persist_reference(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;

    debug!("Saved local reference {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persist_reference_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fwsync").join("firewall_rules.yaml");

        persist_reference(&path, b"- protocol: tcp\n  ports: 22\n").unwrap();
        assert_eq!(
            std::fs::read(&path).unwrap(),
            b"- protocol: tcp\n  ports: 22\n"
        );

        persist_reference(&path, b"[]\n").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"[]\n");
    }

    #[tokio::test]
    async fn test_probe_unreachable_host_is_transport_error() {
        let source = HttpSource::new(Duration::from_secs(2)).unwrap();
        // Port 9 on localhost: nothing listens, connection is refused immediately
        let url = Url::parse("http://127.0.0.1:9/rules.yaml").unwrap();

        let result = source.probe(&url, Utc::now()).await;
        match result {
            Err(Error::Transport { url: failed, .. }) => {
                assert_eq!(failed, "http://127.0.0.1:9/rules.yaml");
            }
            other => panic!("expected transport error, got {other:?}"),
        }
    }
}
