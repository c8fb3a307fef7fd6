/// Audit trail of import and apply cycles
///
/// Every cycle that runs on a host leaves one JSON line here, including
/// cycles that were skipped or failed, so a host's firewall history can be
/// reconstructed without the process logs.
use crate::core::apply::ApplyOutcome;
use crate::core::import::DocumentReport;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ApplyCycle,
    SkipUnchanged,
    CycleDisabled,
    CycleFailed,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if the cycle failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }

    /// One-line rendering for `fwsync history`
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} {:<14} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.event_type.as_str(),
            if self.success { "ok" } else { "failed" }
        );
        if let Some(source) = self.details.get("source").and_then(serde_json::Value::as_str) {
            line.push(' ');
            line.push_str(source);
        }
        if let Some(changes) = self.details.get("changes").and_then(serde_json::Value::as_array) {
            line.push_str(&format!(" ({} changed)", changes.len()));
        }
        if let Some(error) = &self.error {
            line.push_str(": ");
            line.push_str(error);
        }
        line
    }
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApplyCycle => "apply_cycle",
            Self::SkipUnchanged => "skip_unchanged",
            Self::CycleDisabled => "cycle_disabled",
            Self::CycleFailed => "cycle_failed",
        }
    }
}

/// Audit log writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line).
    /// The parent directory is created on first write.
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event)?;

        if let Some(dir) = self.log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events, newest first
    ///
    /// Lines that are not valid events are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

async fn write_event(audit: Option<&AuditLog>, event: AuditEvent) {
    let Some(audit) = audit else {
        return;
    };
    if let Err(e) = audit.log(&event).await {
        tracing::warn!("Failed to write audit log {}: {}", audit.path().display(), e);
    }
}

fn outcome_details(source: &str, outcome: &ApplyOutcome) -> serde_json::Value {
    serde_json::json!({
        "source": source,
        "cycle_id": outcome.cycle_id,
        "rendered": outcome.rendered,
        "skipped_rules": outcome.skipped_rules,
        "superseded": outcome.superseded,
        "changes": outcome.changes,
        "reloaded": outcome.reloaded,
    })
}

/// Logs a completed apply cycle
pub async fn log_apply(audit: Option<&AuditLog>, source: &str, report: &DocumentReport) {
    let mut details = outcome_details(source, &report.apply);
    details["rules"] = serde_json::json!(report.rules);
    details["dropped_ports"] = serde_json::json!(report.dropped_ports);
    details["skipped_specs"] = serde_json::json!(report.skipped_specs);

    write_event(
        audit,
        AuditEvent::new(EventType::ApplyCycle, true, details, None),
    )
    .await;
}

/// Logs a cycle skipped because the remote was unchanged
pub async fn log_unchanged(audit: Option<&AuditLog>, source: &str) {
    write_event(
        audit,
        AuditEvent::new(
            EventType::SkipUnchanged,
            true,
            serde_json::json!({ "source": source }),
            None,
        ),
    )
    .await;
}

/// Logs a cycle skipped by the global switch
pub async fn log_disabled(audit: Option<&AuditLog>) {
    write_event(
        audit,
        AuditEvent::new(EventType::CycleDisabled, true, serde_json::json!({}), None),
    )
    .await;
}

/// Logs a failed cycle
pub async fn log_failure(audit: Option<&AuditLog>, source: &str, error: &crate::Error) {
    write_event(
        audit,
        AuditEvent::new(
            EventType::CycleFailed,
            false,
            serde_json::json!({
                "source": source,
                "misconfiguration": error.is_misconfiguration(),
            }),
            Some(error.to_string()),
        ),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            EventType::CycleFailed,
            false,
            serde_json::json!({"source": "https://rules.example.com/fw.yaml"}),
            Some("rebuild failed".to_string()),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("cycle_failed"));
        assert!(json.contains("rebuild failed"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00Z","event_type":"skip_unchanged","success":true,"details":{},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();

        assert!(event.success);
        assert_eq!(event.event_type, EventType::SkipUnchanged);
    }

    #[tokio::test]
    async fn test_log_appends_lines_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(dir.path().join("log").join("audit.log"));

        log_disabled(Some(&audit)).await;
        log_unchanged(Some(&audit), "https://rules.example.com/fw.yaml").await;
        let report = DocumentReport {
            specs: 1,
            rules: 2,
            ..DocumentReport::default()
        };
        log_apply(Some(&audit), "https://rules.example.com/fw.yaml", &report).await;

        let content = std::fs::read_to_string(audit.path()).unwrap();
        assert_eq!(content.lines().count(), 3);

        let recent = audit.read_recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_type, EventType::ApplyCycle);
        assert_eq!(recent[0].details["rules"], 2);
        assert_eq!(recent[1].event_type, EventType::SkipUnchanged);
    }

    #[tokio::test]
    async fn test_failure_records_error_text() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(dir.path().join("audit.log"));
        let error = crate::Error::InvalidSource {
            uri: "see wiki".to_string(),
        };

        log_failure(Some(&audit), "see wiki", &error).await;

        let recent = audit.read_recent(10).await.unwrap();
        assert!(!recent[0].success);
        assert_eq!(recent[0].details["misconfiguration"], true);
        assert!(recent[0].error.as_deref().unwrap().contains("see wiki"));
    }

    #[test]
    fn test_summary_lines() {
        let json = r#"{"timestamp":"2024-01-01T12:30:00Z","event_type":"apply_cycle","success":true,
            "details":{"source":"https://rules.example.com/fw.yaml","changes":[{},{}]},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event.summary(),
            "2024-01-01 12:30:00 apply_cycle    ok https://rules.example.com/fw.yaml (2 changed)"
        );

        let event = AuditEvent {
            success: false,
            event_type: EventType::CycleFailed,
            details: serde_json::json!({"source": "see wiki"}),
            error: Some("invalid rule source".to_string()),
            ..event
        };
        assert!(event.summary().ends_with("cycle_failed   failed see wiki: invalid rule source"));

        let event = AuditEvent {
            success: true,
            event_type: EventType::CycleDisabled,
            details: serde_json::json!({}),
            error: None,
            ..event
        };
        assert!(event.summary().ends_with("cycle_disabled ok"));
    }

    #[tokio::test]
    async fn test_no_audit_log_is_noop() {
        log_disabled(None).await;
    }
}
