//! Message classification and identity primitives.
//!
//! All enums serialize as their lower-snake-case wire value
//! (`"task_assignment"`, `"urgent"`, `"pending"`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// MessageId Type
// ============================================================================

/// Unique identifier for a message
///
/// Generated ids have the form `msg_<16 hex chars>`. Ids coming from the wire
/// are accepted as-is so that replies can reference messages created elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Create a new random message ID
    pub fn new() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("msg_{}", &hex[..16]))
    }

    /// Wrap an existing identifier
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the message ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id carries no characters
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl PartialEq<str> for MessageId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for MessageId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

// ============================================================================
// MessageType
// ============================================================================

/// Closed set of interaction kinds exchanged between agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Task management
    TaskAssignment,
    TaskResult,
    TaskStatusUpdate,
    TaskCancellation,

    // Research workflow
    ResearchRequest,
    ResearchResult,
    ResearchProgress,

    // Quality control
    QualityFeedback,
    QualityAssessment,
    RevisionRequest,

    // Coordination
    StatusUpdate,
    ResourceRequest,
    ResourceAllocation,

    // Session management
    SessionStart,
    SessionEnd,
    AgentRegistration,
    AgentDeregistration,

    // Error handling
    ErrorNotification,
    RetryRequest,

    // System
    Heartbeat,
    ShutdownSignal,
}

impl MessageType {
    /// Every recognized message type, in declaration order
    pub const ALL: [MessageType; 21] = [
        MessageType::TaskAssignment,
        MessageType::TaskResult,
        MessageType::TaskStatusUpdate,
        MessageType::TaskCancellation,
        MessageType::ResearchRequest,
        MessageType::ResearchResult,
        MessageType::ResearchProgress,
        MessageType::QualityFeedback,
        MessageType::QualityAssessment,
        MessageType::RevisionRequest,
        MessageType::StatusUpdate,
        MessageType::ResourceRequest,
        MessageType::ResourceAllocation,
        MessageType::SessionStart,
        MessageType::SessionEnd,
        MessageType::AgentRegistration,
        MessageType::AgentDeregistration,
        MessageType::ErrorNotification,
        MessageType::RetryRequest,
        MessageType::Heartbeat,
        MessageType::ShutdownSignal,
    ];

    /// Wire representation of the type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskAssignment => "task_assignment",
            MessageType::TaskResult => "task_result",
            MessageType::TaskStatusUpdate => "task_status_update",
            MessageType::TaskCancellation => "task_cancellation",
            MessageType::ResearchRequest => "research_request",
            MessageType::ResearchResult => "research_result",
            MessageType::ResearchProgress => "research_progress",
            MessageType::QualityFeedback => "quality_feedback",
            MessageType::QualityAssessment => "quality_assessment",
            MessageType::RevisionRequest => "revision_request",
            MessageType::StatusUpdate => "status_update",
            MessageType::ResourceRequest => "resource_request",
            MessageType::ResourceAllocation => "resource_allocation",
            MessageType::SessionStart => "session_start",
            MessageType::SessionEnd => "session_end",
            MessageType::AgentRegistration => "agent_registration",
            MessageType::AgentDeregistration => "agent_deregistration",
            MessageType::ErrorNotification => "error_notification",
            MessageType::RetryRequest => "retry_request",
            MessageType::Heartbeat => "heartbeat",
            MessageType::ShutdownSignal => "shutdown_signal",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown message type: {}", s))
    }
}

// ============================================================================
// MessagePriority
// ============================================================================

/// Delivery priority; queues serve `Urgent` first and `Low` last
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl MessagePriority {
    /// Priorities in service order, highest first
    pub const SERVICE_ORDER: [MessagePriority; 4] = [
        MessagePriority::Urgent,
        MessagePriority::High,
        MessagePriority::Normal,
        MessagePriority::Low,
    ];

    /// Position in [`Self::SERVICE_ORDER`]
    pub fn rank(&self) -> usize {
        match self {
            MessagePriority::Urgent => 0,
            MessagePriority::High => 1,
            MessagePriority::Normal => 2,
            MessagePriority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessagePriority::Urgent => "urgent",
            MessagePriority::High => "high",
            MessagePriority::Normal => "normal",
            MessagePriority::Low => "low",
        }
    }
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// MessageStatus
// ============================================================================

/// Delivery state of a message as it moves through router and queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Pending,
    Sent,
    Delivered,
    Acknowledged,
    Failed,
    Expired,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Acknowledged => "acknowledged",
            MessageStatus::Failed => "failed",
            MessageStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Payload
// ============================================================================

/// Opaque key-value message body
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Free-form delivery bookkeeping appended by router and queues
pub type DeliveryMetadata = serde_json::Map<String, serde_json::Value>;
