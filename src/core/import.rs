//! Rule list import
//!
//! One import run is: check the global switch, ask the change detector,
//! fetch, parse, normalize, apply. The fetched document becomes the local
//! reference only after the apply succeeded, so a failed cycle is retried in
//! full on the next run instead of being masked by a fresh timestamp.

use crate::core::apply::{ApplyOutcome, HostAction, Orchestrator};
use crate::core::change::{ChangeDetector, FreshnessProbe, validate_source};
use crate::core::error::{Error, Result};
use crate::core::normalize::normalize_with_report;
use crate::core::render::ArtifactStore;
use crate::core::resolve::DiscoveryPort;
use crate::core::rules::{RuleSpec, parse_document};
use crate::core::source::{DocumentFetcher, persist_reference};
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

/// What an applied document contained and what applying it did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DocumentReport {
    /// Entries in the document
    pub specs: usize,
    /// Atomic rules after normalization
    pub rules: usize,
    pub dropped_ports: usize,
    pub skipped_specs: usize,
    pub apply: ApplyOutcome,
}

/// Result of one import run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImportOutcome {
    /// Global switch is off; nothing was contacted
    Disabled,
    /// Remote reported the rules unchanged
    Unchanged,
    Applied(DocumentReport),
}

/// Parses, normalizes and applies one rule document.
///
/// # Errors
///
/// Returns `Err` for a malformed document or any fatal cycle error.
pub async fn apply_document<D, S, B, R>(
    text: &str,
    orchestrator: &mut Orchestrator<D, S, B, R>,
) -> Result<DocumentReport>
where
    D: DiscoveryPort,
    S: ArtifactStore,
    B: HostAction,
    R: HostAction,
{
    let specs = parse_document(text)?;
    let normalized = normalize_with_report(&specs);
    info!(
        "Loaded {} rule entr{} ({} atomic rule(s))",
        specs.len(),
        if specs.len() == 1 { "y" } else { "ies" },
        normalized.rules.len()
    );

    let apply = orchestrator.apply_all(&normalized.rules).await?;

    Ok(DocumentReport {
        specs: specs.len(),
        rules: normalized.rules.len(),
        dropped_ports: normalized.dropped_ports,
        skipped_specs: normalized.skipped_specs,
        apply,
    })
}

/// Applies a single rule given outside any document.
///
/// Unlike a document entry, a lone rule that normalizes to nothing is
/// rejected instead of silently skipped.
///
/// # Errors
///
/// - [`Error::Validation`] for an empty port field or a rule with no valid port
///   or protocol
/// - any fatal cycle error
pub async fn apply_rule<D, S, B, R>(
    spec: &RuleSpec,
    orchestrator: &mut Orchestrator<D, S, B, R>,
) -> Result<DocumentReport>
where
    D: DiscoveryPort,
    S: ArtifactStore,
    B: HostAction,
    R: HostAction,
{
    if spec.ports.trim().is_empty() {
        return Err(Error::Validation {
            field: "ports".to_string(),
            message: "port is required".to_string(),
        });
    }

    let normalized = normalize_with_report(std::slice::from_ref(spec));
    if normalized.rules.is_empty() {
        return Err(Error::Validation {
            field: if normalized.skipped_specs > 0 { "protocol" } else { "ports" }.to_string(),
            message: format!(
                "'{}' on '{}' does not describe any rule",
                spec.ports, spec.protocol
            ),
        });
    }

    let apply = orchestrator.apply_all(&normalized.rules).await?;
    Ok(DocumentReport {
        specs: 1,
        rules: normalized.rules.len(),
        dropped_ports: normalized.dropped_ports,
        skipped_specs: normalized.skipped_specs,
        apply,
    })
}

/// Runs one import of the rule list at `source`.
///
/// # Errors
///
/// - [`Error::InvalidSource`] before anything else is contacted
/// - transport errors from the fetch (the probe never fails the run)
/// - any error from [`apply_document`] or persisting the local reference
pub async fn run_import<P, F, D, S, B, R>(
    source: &str,
    local_reference: &Path,
    detector: &ChangeDetector<P>,
    fetcher: &F,
    orchestrator: &mut Orchestrator<D, S, B, R>,
) -> Result<ImportOutcome>
where
    P: FreshnessProbe,
    F: DocumentFetcher,
    D: DiscoveryPort,
    S: ArtifactStore,
    B: HostAction,
    R: HostAction,
{
    if !orchestrator.is_enabled() {
        warn!("Firewall is not enabled; skipping rule import");
        return Ok(ImportOutcome::Disabled);
    }

    if !detector.should_apply(local_reference, source).await? {
        return Ok(ImportOutcome::Unchanged);
    }

    let url = validate_source(source)?;
    let body = fetcher.fetch(&url).await?;
    let text = std::str::from_utf8(&body).map_err(|e| Error::Validation {
        field: "document".to_string(),
        message: format!("rule list from {url} is not UTF-8: {e}"),
    })?;

    let report = apply_document(text, orchestrator).await?;

    persist_reference(local_reference, &body)?;
    Ok(ImportOutcome::Applied(report))
}
