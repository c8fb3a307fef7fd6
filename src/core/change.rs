//! Change detection for the remote rule source
//!
//! Decides whether the remote rule document is newer than the last-applied
//! local copy. The policy is deliberately conservative: only an explicit
//! "not modified" answer from the remote skips a cycle. Any other answer,
//! including a transport failure, counts as changed.

use crate::core::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::Path;
use tracing::{debug, info, warn};
use url::Url;

/// What the remote said about its copy relative to ours
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RemoteFreshness {
    /// Remote explicitly reported "not modified since"
    NotModified,
    /// Remote answered with anything else
    Modified,
    /// The probe failed at the transport level
    Unreachable,
}

/// Metadata-only query against the remote source
pub trait FreshnessProbe {
    /// Asks whether `url` changed after `since`.
    fn probe(&self, url: &Url, since: DateTime<Utc>) -> impl Future<Output = Result<RemoteFreshness>>;
}

/// Pulls every absolute URL with a host out of free text.
///
/// Tokens are split on whitespace and stripped of surrounding quotes,
/// brackets and trailing punctuation first.
pub fn extract_uris(text: &str) -> Vec<Url> {
    text.split_whitespace()
        .map(|token| {
            token
                .trim_start_matches(|c: char| matches!(c, '"' | '\'' | '<' | '(' | '['))
                .trim_end_matches(|c: char| {
                    matches!(c, '"' | '\'' | '>' | ')' | ']' | ',' | ';' | '.')
                })
        })
        .filter_map(|token| Url::parse(token).ok())
        .filter(|url| url.has_host() && !url.cannot_be_a_base())
        .collect()
}

/// Accepts the source only if it holds exactly one URI.
///
/// # Errors
///
/// Returns [`Error::InvalidSource`] naming the offending text when it holds
/// zero or several URIs.
///
/// # Examples
///
/// ```
/// use fwsync::core::change::validate_source;
///
/// assert!(validate_source("https://example.com/rules.yaml").is_ok());
/// assert!(validate_source("rules: https://a.example/x or https://b.example/y").is_err());
/// assert!(validate_source("/etc/rules.yaml").is_err());
/// ```
pub fn validate_source(text: &str) -> Result<Url> {
    let mut uris = extract_uris(text);
    if uris.len() == 1 {
        Ok(uris.remove(0))
    } else {
        Err(Error::InvalidSource {
            uri: text.to_string(),
        })
    }
}

/// The apply decision as a pure function.
///
/// No local copy means first run. Otherwise only an explicit
/// [`RemoteFreshness::NotModified`] skips.
pub fn decide(local_modified: Option<DateTime<Utc>>, remote: Option<RemoteFreshness>) -> bool {
    match (local_modified, remote) {
        (None, _) => true,
        (Some(_), Some(RemoteFreshness::NotModified)) => false,
        (Some(_), _) => true,
    }
}

/// Formats a timestamp as an HTTP-date (`If-Modified-Since` value).
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Last-modified time of the local reference, if it can be read.
pub fn local_modified(path: &Path) -> Option<DateTime<Utc>> {
    match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => Some(DateTime::<Utc>::from(modified)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(
                "Cannot read modification time of {}: {e}; treating as missing",
                path.display()
            );
            None
        }
    }
}

/// Combines source validation, the local timestamp and the remote probe
#[derive(Debug, Clone)]
pub struct ChangeDetector<P> {
    probe: P,
}

impl<P: FreshnessProbe> ChangeDetector<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Returns whether the rules at `source` should be (re)applied.
    ///
    /// Never fails for transport problems; those count as "changed".
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSource`] if `source` is not exactly one URI.
    pub async fn should_apply(&self, local_reference: &Path, source: &str) -> Result<bool> {
        let url = validate_source(source)?;

        let Some(since) = local_modified(local_reference) else {
            info!(
                "No local copy at {}; applying rules from {url}",
                local_reference.display()
            );
            return Ok(true);
        };

        debug!("Probing {url} with If-Modified-Since {}", http_date(since));
        let remote = match self.probe.probe(&url, since).await {
            Ok(freshness) => freshness,
            Err(e) => {
                warn!("Freshness probe failed ({e}); assuming rules changed");
                RemoteFreshness::Unreachable
            }
        };

        let apply = decide(Some(since), Some(remote));
        if !apply {
            info!("Rules file hasn't changed since the last run");
        }
        Ok(apply)
    }
}
