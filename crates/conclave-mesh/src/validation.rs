//! Structural and semantic checks for messages and message chains
//!
//! Errors make a message invalid and keep it out of the system. Warnings
//! (odd TTLs, expiry, exhausted retries, oversized payloads, orphaned
//! replies) are reported but never reject anything.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use crate::error::{MeshError, MeshResult};
use crate::message::{Message, MessageType};

/// Payloads above this size (serialized bytes) produce a warning
pub const LARGE_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Correlation group for messages without a correlation id
pub const NO_CORRELATION: &str = "no_correlation";

const RAW_REQUIRED_FIELDS: [&str; 5] = [
    "sender_id",
    "receiver_id",
    "message_type",
    "payload",
    "session_id",
];

/// Outcome of validating a single message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn new() -> Self {
        Self {
            valid: true,
            ..Default::default()
        }
    }

    fn error(&mut self, reason: impl Into<String>) {
        self.errors.push(reason.into());
        self.valid = false;
    }

    fn warn(&mut self, reason: impl Into<String>) {
        self.warnings.push(reason.into());
    }

    /// Turn an invalid report into `MeshError::InvalidMessage`
    ///
    /// A valid report is handed back so callers can still log its warnings.
    pub fn into_result(self) -> MeshResult<Self> {
        if self.valid {
            Ok(self)
        } else {
            Err(MeshError::InvalidMessage(self.errors))
        }
    }
}

/// Outcome of validating a chain of related messages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub chain_length: usize,
    /// Message ids grouped by correlation id
    pub correlation_groups: BTreeMap<String, Vec<String>>,
}

/// Validator for agent messages
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageValidator;

impl MessageValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate message structure and content
    pub fn validate(&self, message: &Message) -> ValidationReport {
        let mut report = ValidationReport::new();

        let required = [
            ("message_id", message.message_id.is_empty()),
            ("sender_id", message.sender_id.is_empty()),
            ("receiver_id", message.receiver_id.is_empty()),
            ("payload", message.payload.is_empty()),
            ("session_id", message.session_id.is_empty()),
        ];
        for (field, missing) in required {
            if missing {
                report.error(format!("Missing required field: {}", field));
            }
        }

        if matches!(message.ttl, Some(ttl) if ttl <= 0) {
            report.warn("TTL should be positive");
        }

        if message.is_expired() {
            report.warn("Message has expired");
        }

        if message.retry_count > message.max_retries {
            report.warn("Message has exceeded max retries");
        }

        let payload_size = serde_json::to_vec(&message.payload)
            .map(|bytes| bytes.len())
            .unwrap_or(0);
        if payload_size > LARGE_PAYLOAD_BYTES {
            report.warn(format!("Large payload size detected: {} bytes", payload_size));
        }

        report
    }

    /// Validate a raw wire object before it becomes a `Message`
    ///
    /// Checks required keys, that `payload` is a key-value object and that
    /// `message_type` is a recognized value; a structurally sound object is
    /// then parsed and checked with [`Self::validate`].
    pub fn validate_json(&self, raw: &Value) -> ValidationReport {
        let mut report = ValidationReport::new();

        let Some(object) = raw.as_object() else {
            report.error("Message must be a JSON object");
            return report;
        };

        for field in RAW_REQUIRED_FIELDS {
            let missing = match object.get(field) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.is_empty(),
                Some(_) => false,
            };
            if missing {
                report.error(format!("Missing required field: {}", field));
            }
        }

        if let Some(payload) = object.get("payload")
            && !payload.is_null()
            && !payload.is_object()
        {
            report.error("Payload must be a key-value object");
        }

        match object.get("message_type") {
            Some(Value::String(s)) if !s.is_empty() => {
                if s.parse::<MessageType>().is_err() {
                    report.error(format!("Invalid message type: {}", s));
                }
            }
            Some(Value::Null) | None => {}
            Some(Value::String(_)) => {}
            Some(other) => report.error(format!("Invalid message type: {}", other)),
        }

        if !report.valid {
            return report;
        }

        match serde_json::from_value::<Message>(raw.clone()) {
            Ok(message) => {
                let parsed = self.validate(&message);
                report.valid = parsed.valid;
                report.errors.extend(parsed.errors);
                report.warnings.extend(parsed.warnings);
            }
            Err(e) => report.error(format!("Malformed message: {}", e)),
        }

        report
    }

    /// Validate a chain of related messages
    ///
    /// Invalid members and orphaned replies (a `reply_to` that matches no
    /// message in the chain) are warnings. Only an empty chain is an error.
    pub fn validate_chain(&self, messages: &[Message]) -> ChainReport {
        let mut report = ChainReport {
            valid: true,
            chain_length: messages.len(),
            ..Default::default()
        };

        if messages.is_empty() {
            report.errors.push("Empty message chain".to_string());
            report.valid = false;
            return report;
        }

        for message in messages {
            let group = message
                .correlation_id
                .clone()
                .unwrap_or_else(|| NO_CORRELATION.to_string());
            report
                .correlation_groups
                .entry(group)
                .or_default()
                .push(message.message_id.to_string());
        }

        let invalid_count = messages
            .iter()
            .filter(|m| !self.validate(m).valid)
            .count();
        if invalid_count > 0 {
            report
                .warnings
                .push(format!("{} invalid messages in chain", invalid_count));
        }

        let ids: HashSet<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();
        for message in messages {
            if let Some(reply_to) = &message.reply_to
                && !ids.contains(reply_to.as_str())
            {
                report
                    .warnings
                    .push(format!("Orphaned reply message: {}", message.message_id));
            }
        }

        report
    }
}
