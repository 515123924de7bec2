use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

pub const AUDIT_TARGET: &str = "audit";

#[derive(Debug, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    /// The file (or other object) the event is about.
    pub subject: String,
    pub details: Value,
}

impl AuditEvent {
    pub fn new(event_type: &str, subject: &str, details: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            subject: subject.to_string(),
            details,
        }
    }
}

/// Emit one audit record as a single JSON line on the `audit` target.
pub fn log_audit(event_type: &str, subject: &str, details: Value) {
    let event = AuditEvent::new(event_type, subject, details);

    // Serialize up front so the subscriber receives clean JSON as the message.
    if let Ok(json_str) = serde_json::to_string(&event) {
        info!(target: AUDIT_TARGET, "{}", json_str);
    }
}
