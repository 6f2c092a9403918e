//! Message types and builders for agent communication.
//!
//! # Message Types
//!
//! - `Message` - the unit exchanged between agents, with delivery state
//! - `MessageBuilder` - per-sender factories for the common interaction patterns
//! - `MessageType`, `MessagePriority`, `MessageStatus` - closed enums with
//!   lower-snake-case wire names
//!
//! # Routing keys
//!
//! Unless overridden, a message routes under `"{message_type}.{receiver_id}"`,
//! e.g. `research_request.researcher_1`.

mod builder;
mod core;
mod types;

pub use builder::{
    ERROR_NOTIFICATION_TTL, HEARTBEAT_TTL, MessageBuilder, RESEARCH_REQUEST_TTL,
    STATUS_UPDATE_TTL, TASK_ASSIGNMENT_TTL, create_research_request, create_research_result,
    create_status_update, create_task_assignment,
};
pub use core::{DEFAULT_MAX_RETRIES, Message};
pub use types::{
    DeliveryMetadata, MessageId, MessagePriority, MessageStatus, MessageType, Payload,
};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    fn sample() -> Message {
        Message::new(
            "agent_1",
            "agent_2",
            MessageType::TaskAssignment,
            "session_123",
            payload(json!({"task": "test_task"})),
        )
    }

    #[test]
    fn test_message_creation_defaults() {
        let msg = sample();

        assert!(msg.message_id.as_str().starts_with("msg_"));
        assert_eq!(msg.sender_id, "agent_1");
        assert_eq!(msg.receiver_id, "agent_2");
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.priority, MessagePriority::Normal);
        assert_eq!(msg.max_retries, 3);
        assert_eq!(msg.retry_count, 0);
        assert!(msg.ttl.is_none());
        assert!((Utc::now() - msg.timestamp).num_seconds() < 5);
    }

    #[test]
    fn test_ttl_expiry_is_time_based() {
        let created = Utc::now();
        let msg = sample().with_timestamp(created).with_ttl(1);

        assert!(!msg.is_expired_at(created + Duration::milliseconds(500)));
        assert!(msg.is_expired_at(created + Duration::seconds(2)));
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let msg = sample().with_timestamp(Utc::now() - Duration::days(365));
        assert!(!msg.is_expired());
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let msg = sample()
            .with_timestamp(Utc::now() - Duration::days(365))
            .with_ttl(0);
        assert!(!msg.is_expired());
        assert!(msg.can_retry());
    }

    #[test]
    fn test_retry_budget() {
        let mut msg = sample().with_max_retries(3);

        for expected in 0..3 {
            assert_eq!(msg.retry_count, expected);
            assert!(msg.can_retry());
            msg.status = MessageStatus::Failed;
            msg.mark_retry();
            assert_eq!(msg.status, MessageStatus::Pending);
        }

        assert_eq!(msg.retry_count, 3);
        assert!(!msg.can_retry());
    }

    #[test]
    fn test_expired_message_cannot_retry() {
        let msg = sample()
            .with_timestamp(Utc::now() - Duration::seconds(10))
            .with_ttl(1);
        assert_eq!(msg.retry_count, 0);
        assert!(!msg.can_retry());
    }

    #[test]
    fn test_create_reply_links_original() {
        let original = Message::new(
            "A",
            "B",
            MessageType::ResearchRequest,
            "s1",
            Payload::new(),
        )
        .with_id("m1")
        .with_priority(MessagePriority::High);

        let reply = original.create_reply("B", payload(json!({"ok": true})), None);

        assert_eq!(reply.sender_id, "B");
        assert_eq!(reply.receiver_id, "A");
        assert_eq!(reply.correlation_id.as_deref(), Some("m1"));
        assert_eq!(reply.reply_to.as_deref(), Some("m1"));
        assert_eq!(reply.session_id, "s1");
        assert_eq!(reply.message_type, MessageType::TaskResult);
        assert_eq!(reply.priority, MessagePriority::High);
        assert_ne!(reply.message_id, original.message_id);
    }

    #[test]
    fn test_routing_key_default_and_override() {
        let msg = sample();
        assert_eq!(msg.routing_key(), "task_assignment.agent_2");

        let msg = msg.with_routing_key("custom.key");
        assert_eq!(msg.routing_key(), "custom.key");
    }

    #[test]
    fn test_delivery_metadata_accumulates() {
        let mut msg = sample();
        assert!(msg.delivery_metadata.is_none());

        msg.add_delivery_metadata("router_id", "router_1");
        msg.add_delivery_metadata("attempt", 2);

        assert_eq!(msg.delivery_metadata("router_id"), Some(&json!("router_1")));
        assert_eq!(msg.delivery_metadata("attempt"), Some(&json!(2)));
    }

    #[test]
    fn test_wire_format_uses_snake_case_values() {
        let msg = Message::new(
            "agent_1",
            "agent_2",
            MessageType::ResearchRequest,
            "session_123",
            payload(json!({"query": "q"})),
        )
        .with_id("test_msg")
        .with_priority(MessagePriority::Urgent);

        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["message_id"], "test_msg");
        assert_eq!(value["message_type"], "research_request");
        assert_eq!(value["priority"], "urgent");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["payload"]["query"], "q");
        assert!(value["ttl"].is_null());

        let restored = Message::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(restored, msg);
    }

    #[test]
    fn test_from_json_fills_missing_id_and_accepts_naive_timestamp() {
        let raw = json!({
            "message_id": "",
            "sender_id": "a",
            "receiver_id": "b",
            "message_type": "heartbeat",
            "payload": {},
            "session_id": "s",
            "timestamp": "2024-05-01T12:30:00.123456",
            "delivery_metadata": null
        });

        let msg = Message::from_json(&raw.to_string()).unwrap();
        assert!(msg.message_id.as_str().starts_with("msg_"));
        assert_eq!(msg.timestamp.to_rfc3339(), "2024-05-01T12:30:00.123456+00:00");
        assert_eq!(msg.max_retries, DEFAULT_MAX_RETRIES);
        assert!(msg.delivery_metadata.is_none());
    }

    #[test]
    fn test_builder_defaults_per_pattern() {
        let builder = MessageBuilder::new("agent_1", "session_123");

        let task = builder.task_assignment("agent_2", json!({"t": 1}), MessagePriority::Normal);
        assert_eq!(task.message_type, MessageType::TaskAssignment);
        assert_eq!(task.payload["task_data"], json!({"t": 1}));
        assert_eq!(task.ttl, Some(TASK_ASSIGNMENT_TTL));
        assert_eq!(task.session_id, "session_123");

        let request =
            builder.research_request("agent_2", json!({"topic": "x"}), Some("corr_123".into()));
        assert_eq!(request.priority, MessagePriority::High);
        assert_eq!(request.ttl, Some(600));
        assert_eq!(request.correlation_id.as_deref(), Some("corr_123"));
        assert_eq!(request.payload["subtopic_brief"], json!({"topic": "x"}));

        let status = builder.status_update("agent_2", json!({"progress": 0.5}));
        assert_eq!(status.priority, MessagePriority::Low);
        assert_eq!(status.ttl, Some(60));
        assert_eq!(status.payload["status"], json!({"progress": 0.5}));

        let error = builder.error_notification("agent_2", json!({"code": 1}), None);
        assert_eq!(error.priority, MessagePriority::Urgent);
        assert_eq!(error.ttl, Some(120));

        let heartbeat = builder.heartbeat(None);
        assert_eq!(heartbeat.receiver_id, "broadcast");
        assert_eq!(heartbeat.priority, MessagePriority::Low);
        assert_eq!(heartbeat.ttl, Some(30));
        assert!(heartbeat.payload["timestamp"].is_string());

        let result = builder.research_result("agent_2", json!({}), Some("m1".into()));
        assert_eq!(result.priority, MessagePriority::High);
        assert!(result.ttl.is_none());
        assert_eq!(result.reply_to.as_deref(), Some("m1"));
    }

    #[test]
    fn test_quality_feedback_omits_empty_suggestions() {
        let builder = MessageBuilder::new("qc", "s");

        let bare = builder.quality_feedback("agent", json!({"score": 0.8}), &[]);
        assert!(!bare.payload.contains_key("suggestions"));

        let with = builder.quality_feedback("agent", json!({"score": 0.8}), &["cite more".into()]);
        assert_eq!(with.payload["suggestions"], json!(["cite more"]));
    }

    #[test]
    fn test_free_constructors() {
        let msg = create_research_request("sup", "res", "s1", json!({"q": 1}));
        assert_eq!(msg.sender_id, "sup");
        assert_eq!(msg.receiver_id, "res");
        assert_eq!(msg.message_type, MessageType::ResearchRequest);

        let msg = create_status_update("a", "b", "s", json!({}));
        assert_eq!(msg.message_type, MessageType::StatusUpdate);
    }
}
