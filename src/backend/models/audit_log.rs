// src/backend/models/audit_log.rs
use crate::models::common::Timestamp;
use serde::{Deserialize, Serialize};

/// Represents a single, immutable entry in the audit log.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    /// Milliseconds since epoch.
    pub timestamp: Timestamp,
    #[serde(rename = "type")]
    pub kind: AuditKind,
    /// The specific action performed, e.g. "switch.transition" or "action.attempt".
    pub action: String,
    /// Structured details; always an object.
    pub details: serde_json::Value,
    pub success: bool,
}

/// Subsystem an audit entry pertains to.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Copy)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Heartbeat,
    Escalation,
    Executor,
    Ghost,
    Config,
    Mortality,
    Error,
}

/// An entry before the vault assigns its id and timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub action: String,
    pub details: serde_json::Value,
    pub success: bool,
}

impl AuditEvent {
    pub fn success(kind: AuditKind, action: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            kind,
            action: action.into(),
            details,
            success: true,
        }
    }

    /// A failure always carries a human-readable `reason` in its details.
    pub fn failure(
        kind: AuditKind,
        action: impl Into<String>,
        reason: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        let mut details = match details {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        details.insert("reason".to_string(), serde_json::Value::String(reason.into()));
        Self {
            kind,
            action: action.into(),
            details: serde_json::Value::Object(details),
            success: false,
        }
    }
}
