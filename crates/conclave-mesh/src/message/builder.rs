//! Factories for the common agent interaction patterns.
//!
//! A `MessageBuilder` is bound to one sender and one session. Each factory
//! fills in the payload envelope, priority and TTL appropriate for its
//! interaction so callers never hand-tune them per call.

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use super::core::Message;
use super::types::{MessagePriority, MessageType, Payload};
use crate::types::BROADCAST;

/// TTL of task assignments (seconds)
pub const TASK_ASSIGNMENT_TTL: i64 = 300;
/// TTL of research requests (seconds)
pub const RESEARCH_REQUEST_TTL: i64 = 600;
/// TTL of status updates (seconds)
pub const STATUS_UPDATE_TTL: i64 = 60;
/// TTL of error notifications (seconds)
pub const ERROR_NOTIFICATION_TTL: i64 = 120;
/// TTL of heartbeats (seconds)
pub const HEARTBEAT_TTL: i64 = 30;

/// Builder for creating messages from one sender within one session
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    sender_id: String,
    session_id: String,
}

fn envelope(key: &str, value: Value) -> Payload {
    let mut payload = Payload::new();
    payload.insert(key.to_string(), value);
    payload
}

impl MessageBuilder {
    pub fn new(sender_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            session_id: session_id.into(),
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Bare message from this sender in this session
    pub fn message(
        &self,
        receiver_id: impl Into<String>,
        message_type: MessageType,
        payload: Payload,
    ) -> Message {
        Message::new(
            self.sender_id.clone(),
            receiver_id,
            message_type,
            self.session_id.clone(),
            payload,
        )
    }

    /// Task assignment: `{"task_data": …}`, 5 minute TTL
    pub fn task_assignment(
        &self,
        receiver_id: impl Into<String>,
        task_data: Value,
        priority: MessagePriority,
    ) -> Message {
        self.message(
            receiver_id,
            MessageType::TaskAssignment,
            envelope("task_data", task_data),
        )
        .with_priority(priority)
        .with_ttl(TASK_ASSIGNMENT_TTL)
    }

    /// Research request: `{"subtopic_brief": …}`, high priority, 10 minute TTL
    pub fn research_request(
        &self,
        receiver_id: impl Into<String>,
        subtopic_brief: Value,
        correlation_id: Option<String>,
    ) -> Message {
        let mut message = self
            .message(
                receiver_id,
                MessageType::ResearchRequest,
                envelope("subtopic_brief", subtopic_brief),
            )
            .with_priority(MessagePriority::High)
            .with_ttl(RESEARCH_REQUEST_TTL);
        message.correlation_id = correlation_id;
        message
    }

    /// Research result: `{"research_findings": …}`, high priority, no TTL
    pub fn research_result(
        &self,
        receiver_id: impl Into<String>,
        research_findings: Value,
        reply_to: Option<String>,
    ) -> Message {
        let mut message = self
            .message(
                receiver_id,
                MessageType::ResearchResult,
                envelope("research_findings", research_findings),
            )
            .with_priority(MessagePriority::High);
        message.reply_to = reply_to;
        message
    }

    /// Quality feedback: `{"assessment": …, "suggestions": […]}`
    ///
    /// `suggestions` is omitted from the payload when empty.
    pub fn quality_feedback(
        &self,
        receiver_id: impl Into<String>,
        assessment: Value,
        suggestions: &[String],
    ) -> Message {
        let mut payload = envelope("assessment", assessment);
        if !suggestions.is_empty() {
            payload.insert(
                "suggestions".to_string(),
                Value::from(suggestions.to_vec()),
            );
        }
        self.message(receiver_id, MessageType::QualityFeedback, payload)
            .with_priority(MessagePriority::Normal)
    }

    /// Status update: `{"status": …}`, low priority, 1 minute TTL
    pub fn status_update(&self, receiver_id: impl Into<String>, status_info: Value) -> Message {
        self.message(
            receiver_id,
            MessageType::StatusUpdate,
            envelope("status", status_info),
        )
        .with_priority(MessagePriority::Low)
        .with_ttl(STATUS_UPDATE_TTL)
    }

    /// Error notification: `{"error": …}`, urgent, 2 minute TTL
    pub fn error_notification(
        &self,
        receiver_id: impl Into<String>,
        error_info: Value,
        correlation_id: Option<String>,
    ) -> Message {
        let mut message = self
            .message(
                receiver_id,
                MessageType::ErrorNotification,
                envelope("error", error_info),
            )
            .with_priority(MessagePriority::Urgent)
            .with_ttl(ERROR_NOTIFICATION_TTL);
        message.correlation_id = correlation_id;
        message
    }

    /// Heartbeat: `{"timestamp": …}`, low priority, 30 second TTL
    ///
    /// Broadcast unless a receiver is given.
    pub fn heartbeat(&self, receiver_id: Option<&str>) -> Message {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::AutoSi, true);
        self.message(
            receiver_id.unwrap_or(BROADCAST),
            MessageType::Heartbeat,
            envelope("timestamp", Value::String(now)),
        )
        .with_priority(MessagePriority::Low)
        .with_ttl(HEARTBEAT_TTL)
    }

    /// Broadcast of an arbitrary type with default priority and no TTL
    pub fn broadcast(&self, message_type: MessageType, payload: Payload) -> Message {
        self.message(BROADCAST, message_type, payload)
    }
}

/// One-shot task assignment without keeping a builder around
pub fn create_task_assignment(
    sender_id: &str,
    receiver_id: &str,
    session_id: &str,
    task_data: Value,
) -> Message {
    MessageBuilder::new(sender_id, session_id).task_assignment(
        receiver_id,
        task_data,
        MessagePriority::Normal,
    )
}

pub fn create_research_request(
    sender_id: &str,
    receiver_id: &str,
    session_id: &str,
    subtopic_brief: Value,
) -> Message {
    MessageBuilder::new(sender_id, session_id).research_request(receiver_id, subtopic_brief, None)
}

pub fn create_research_result(
    sender_id: &str,
    receiver_id: &str,
    session_id: &str,
    research_findings: Value,
    reply_to: Option<String>,
) -> Message {
    MessageBuilder::new(sender_id, session_id).research_result(
        receiver_id,
        research_findings,
        reply_to,
    )
}

pub fn create_status_update(
    sender_id: &str,
    receiver_id: &str,
    session_id: &str,
    status_info: Value,
) -> Message {
    MessageBuilder::new(sender_id, session_id).status_update(receiver_id, status_info)
}
