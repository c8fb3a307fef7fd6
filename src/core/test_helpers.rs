//! Shared test utilities for core module tests
//!
//! Provides in-memory stand-ins for the collaborators the core talks to
//! (discovery, host actions, the freshness probe). This module is only
//! compiled in test mode.

use crate::core::apply::HostAction;
use crate::core::change::{FreshnessProbe, RemoteFreshness};
use crate::core::error::{Error, Result};
use crate::core::resolve::{DEFAULT_IP_TAG, DiscoveryPort, Member, TagSelector};
use crate::core::rules::RuleSpec;
use crate::core::source::DocumentFetcher;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;

/// Creates an enabled `ACCEPT` spec with the given address, protocol and ports.
pub fn rule_spec(ip_address: &str, protocol: &str, ports: &str) -> RuleSpec {
    RuleSpec {
        ip_address: ip_address.to_string(),
        protocol: protocol.to_string(),
        ports: ports.to_string(),
        enable: true,
        target: "ACCEPT".to_string(),
    }
}

/// Creates a discovery member from `(tag, value)` pairs.
pub fn member(tags: &[(&str, &str)]) -> Member {
    Member {
        tags: tags
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
    }
}

/// Selector for `role:web=true` members of the `web` collection.
pub fn web_selector() -> TagSelector {
    TagSelector {
        collection: "web".to_string(),
        machine_tags: vec!["role:web=true".to_string()],
        ip_tag: DEFAULT_IP_TAG.to_string(),
    }
}

/// Discovery answering from fixed collections and counting queries
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    collections: HashMap<String, Vec<Member>>,
    queries: AtomicUsize,
    fail: bool,
}

impl StaticDiscovery {
    pub fn with_members(mut self, collection: &str, members: Vec<Member>) -> Self {
        self.collections.insert(collection.to_string(), members);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl DiscoveryPort for StaticDiscovery {
    fn members(&self, collection: &str, tag_filter: &[String]) -> Result<Vec<Member>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Discovery("discovery unavailable".to_string()));
        }
        Ok(self
            .collections
            .get(collection)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| m.matches(tag_filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Host action that counts invocations and optionally fails
#[derive(Debug, Default)]
pub struct RecordingAction {
    calls: AtomicUsize,
    fail: bool,
}

impl RecordingAction {
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HostAction for RecordingAction {
    fn describe(&self) -> String {
        "recording action".to_string()
    }

    async fn run(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(Error::Action {
                program: "recording action".to_string(),
                exit_code: Some(1),
                stderr: "simulated failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Freshness probe returning a canned answer and recording what it was asked
#[derive(Debug)]
pub struct StubProbe {
    answer: std::result::Result<RemoteFreshness, String>,
    seen: Mutex<Vec<(Url, DateTime<Utc>)>>,
}

impl StubProbe {
    pub fn answering(answer: RemoteFreshness) -> Self {
        Self {
            answer: Ok(answer),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            answer: Err("connection refused".to_string()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn probes(&self) -> Vec<(Url, DateTime<Utc>)> {
        self.seen.lock().unwrap().clone()
    }
}

impl FreshnessProbe for StubProbe {
    async fn probe(&self, url: &Url, since: DateTime<Utc>) -> Result<RemoteFreshness> {
        self.seen.lock().unwrap().push((url.clone(), since));
        self.answer
            .clone()
            .map_err(|message| Error::Transport {
                url: url.to_string(),
                message,
            })
    }
}

/// Document fetcher serving fixed bytes and counting downloads
#[derive(Debug)]
pub struct StubFetcher {
    body: Option<Vec<u8>>,
    fetches: AtomicUsize,
}

impl StubFetcher {
    pub fn serving(body: &str) -> Self {
        Self {
            body: Some(body.as_bytes().to_vec()),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            body: None,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl DocumentFetcher for StubFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.body.clone().ok_or_else(|| Error::Transport {
            url: url.to_string(),
            message: "HTTP status server error (503 Service Unavailable)".to_string(),
        })
    }
}
