//! # Conclave Mesh
//!
//! In-process agent-to-agent messaging for Conclave multi-agent systems.
//!
//! This crate provides a local message broker that lets independently
//! scheduled agents exchange typed messages without any network transport.
//!
//! ## Features
//!
//! - **Typed Messages**: closed message-type enum, priorities, TTLs and retry budgets
//! - **Routing**: direct agent handlers, broadcast handlers and first-match wildcard routes
//! - **Priority Queues**: per-agent queues served urgent-first, with push-style consumers
//! - **Reliability**: fixed-delay retries and a bounded dead letter queue
//! - **Persistence**: optional line-delimited JSON log per queue
//!
//! ## Example
//!
//! ```rust,no_run
//! use conclave_mesh::{AgentCommunicationHub, HubConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = AgentCommunicationHub::standalone(HubConfig::default())?;
//!     hub.start().await?;
//!
//!     hub.register_agent("supervisor", None).await;
//!     hub.register_agent("researcher", None).await;
//!
//!     hub.send_research_request("supervisor", "researcher", json!({"topic": "tides"}), None)
//!         .await;
//!
//!     for message in hub.get_agent_messages("researcher", 10).await {
//!         println!("{} -> {}", message.message_type, message.payload["subtopic_brief"]);
//!     }
//!
//!     hub.stop().await;
//!     Ok(())
//! }
//! ```

pub mod dlq;
pub mod error;
pub mod handler;
pub mod hub;
pub mod message;
pub mod persistence;
pub mod queue;
pub mod router;
pub mod stats;
pub mod types;
pub mod validation;

mod task;

pub use dlq::{DeadLetterQueue, DeadLetterReason, DlqConfig, DlqEntry, DlqStats};
pub use error::{MeshError, MeshResult};
pub use handler::{ConsumerHandler, HandlerId, MessageHandler};
pub use hub::{AgentCommunicationHub, AgentRecord, DEFAULT_ROUTES, HubConfig, MeshContext};
pub use message::{
    DEFAULT_MAX_RETRIES, DeliveryMetadata, Message, MessageBuilder, MessageId, MessagePriority,
    MessageStatus, MessageType, Payload, create_research_request, create_research_result,
    create_status_update, create_task_assignment,
};
pub use queue::{
    LocalMessageQueue, LocalQueueManager, PriorityBuckets, QueueConfiguration, QueueSize,
    QueueType,
};
pub use router::{MessageRouter, Route, RoutePattern, RouteStats, RouterConfig};
pub use stats::{HubStats, HubStatsSnapshot, QueueStats, RouterStats};
pub use types::{AgentId, BROADCAST, IdValidationError};
pub use validation::{ChainReport, MessageValidator, ValidationReport};
