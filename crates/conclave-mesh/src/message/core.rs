//! Core message structure and implementations.
//!
//! `Message` is the unit exchanged between agents. Identity, classification,
//! payload and conversation context are fixed at construction; the delivery
//! state (`status`, `retry_count`, `delivery_metadata`) is updated by the
//! router and the queues as the message moves through the system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::types::{
    DeliveryMetadata, MessageId, MessagePriority, MessageStatus, MessageType, Payload,
};
use crate::error::MeshResult;
use crate::types::BROADCAST;

/// Default retry budget for new messages
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A message sent between agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier
    #[serde(default)]
    pub message_id: MessageId,
    /// Sending agent
    pub sender_id: String,
    /// Receiving agent, or the literal `"broadcast"`
    pub receiver_id: String,
    /// Interaction kind
    pub message_type: MessageType,

    /// Message body
    #[serde(default)]
    pub payload: Payload,
    /// Conversation the message belongs to
    pub session_id: String,
    /// Creation time
    #[serde(default = "Utc::now", with = "iso_timestamp")]
    pub timestamp: DateTime<Utc>,

    /// Links a causal chain of messages
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Id of the message being answered
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub priority: MessagePriority,
    /// Time-to-live in seconds; `None` and zero never expire
    #[serde(default)]
    pub ttl: Option<i64>,

    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Explicit routing key override
    #[serde(default)]
    pub routing_key: Option<String>,
    #[serde(default)]
    pub delivery_metadata: Option<DeliveryMetadata>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Message {
    /// Create a pending message with a fresh id and timestamp
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        message_type: MessageType,
        session_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            message_id: MessageId::new(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            message_type,
            payload,
            session_id: session_id.into(),
            timestamp: Utc::now(),
            correlation_id: None,
            reply_to: None,
            priority: MessagePriority::Normal,
            ttl: None,
            status: MessageStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            routing_key: None,
            delivery_metadata: None,
        }
    }

    /// Replace the generated id
    pub fn with_id(mut self, message_id: impl Into<MessageId>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set time-to-live in seconds
    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl = Some(ttl_secs);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set correlation ID for request/reply chains
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Check whether the TTL has elapsed at `now`
    ///
    /// A message without a TTL, or with a TTL of zero, never expires.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            None | Some(0) => false,
            Some(ttl) => {
                let elapsed_ms = (now - self.timestamp).num_milliseconds();
                elapsed_ms > ttl.saturating_mul(1000)
            }
        }
    }

    /// Check whether the TTL has elapsed
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// True while the retry budget is not exhausted and the message is live
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries && !self.is_expired()
    }

    /// Consume one retry and return the message to `pending`
    pub fn mark_retry(&mut self) -> &mut Self {
        self.retry_count += 1;
        self.status = MessageStatus::Pending;
        self
    }

    /// Build a reply linked to this message
    ///
    /// The reply goes back to this message's sender, keeps the session and
    /// priority, and carries this message's id as both `correlation_id` and
    /// `reply_to`. The reply type defaults to `task_result`.
    pub fn create_reply(
        &self,
        sender_id: impl Into<String>,
        payload: Payload,
        message_type: Option<MessageType>,
    ) -> Message {
        Message::new(
            sender_id,
            self.sender_id.clone(),
            message_type.unwrap_or(MessageType::TaskResult),
            self.session_id.clone(),
            payload,
        )
        .with_correlation_id(self.message_id.as_str())
        .with_reply_to(self.message_id.as_str())
        .with_priority(self.priority)
    }

    /// Key matched against route patterns: explicit override or `type.receiver`
    pub fn routing_key(&self) -> String {
        match &self.routing_key {
            Some(key) if !key.is_empty() => key.clone(),
            _ => format!("{}.{}", self.message_type, self.receiver_id),
        }
    }

    pub fn add_delivery_metadata(
        &mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) {
        self.delivery_metadata
            .get_or_insert_with(DeliveryMetadata::new)
            .insert(key.into(), value.into());
    }

    pub fn delivery_metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.delivery_metadata.as_ref().and_then(|m| m.get(key))
    }

    /// Time since creation; zero if the timestamp lies in the future
    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp).to_std().unwrap_or_default()
    }

    pub fn age_seconds(&self) -> f64 {
        self.age().as_secs_f64()
    }

    /// True when addressed to every broadcast handler
    pub fn is_broadcast(&self) -> bool {
        self.receiver_id == BROADCAST
    }

    /// Serialize message to single-line JSON
    pub fn to_json(&self) -> MeshResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize message from JSON, generating an id if the wire value is empty
    pub fn from_json(json: &str) -> MeshResult<Self> {
        let mut message: Message = serde_json::from_str(json)?;
        if message.message_id.is_empty() {
            message.message_id = MessageId::new();
        }
        Ok(message)
    }
}

/// ISO-8601 timestamps; naive values (no offset) are read as UTC
mod iso_timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Utc::now());
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(&s) {
            return Ok(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}
