//! Agent-facing communication hub
//!
//! The hub ties a [`MessageRouter`] and a [`LocalQueueManager`] together.
//! Registering an agent gives it a dedicated priority queue named
//! `agent_queue_<agent_id>` and a direct router handler that drops every
//! message addressed to the agent into that queue. Agents then either poll
//! with [`AgentCommunicationHub::get_agent_messages`] or attach a push-style
//! consumer with [`AgentCommunicationHub::add_agent_consumer`].
//!
//! Sends are fire-and-forget: the `send_*` family returns whether the message
//! was accepted for processing. Later delivery failures only show up in the
//! statistics and the router's dead letters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{MeshError, MeshResult};
use crate::handler::{ConsumerHandler, MessageHandler};
use crate::message::{Message, MessageBuilder, MessagePriority, MessageStatus, MessageType, Payload};
use crate::queue::{LocalMessageQueue, LocalQueueManager, QueueConfiguration, QueueType};
use crate::router::{MessageRouter, RouterConfig};
use crate::stats::{HubCounters, HubStatsSnapshot};
use crate::types::AgentId;
use crate::validation::MessageValidator;

/// Routes every hub installs on its first start, as `(pattern, priority)`
pub const DEFAULT_ROUTES: [(&str, i32); 4] = [
    ("task_assignment.*", 10),
    ("research_request.*", 10),
    ("status_update.*", 5),
    ("*", 1),
];

/// Router and queue manager shared by the hubs of one process
///
/// Cloning is cheap; clones refer to the same router and queues.
#[derive(Clone)]
pub struct MeshContext {
    router: Arc<MessageRouter>,
    queues: Arc<LocalQueueManager>,
}

impl MeshContext {
    pub fn new(config: RouterConfig) -> MeshResult<Self> {
        Ok(Self {
            router: Arc::new(MessageRouter::new(config)?),
            queues: Arc::new(LocalQueueManager::new()),
        })
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn queues(&self) -> &Arc<LocalQueueManager> {
        &self.queues
    }
}

impl Default for MeshContext {
    fn default() -> Self {
        Self {
            router: Arc::new(MessageRouter::with_defaults()),
            queues: Arc::new(LocalQueueManager::new()),
        }
    }
}

/// Hub configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Generated when absent
    pub hub_id: Option<String>,
    /// Configuration of every per-agent queue
    pub agent_queue: QueueConfiguration,
    pub install_default_routes: bool,
    /// Wait of each dequeue in `get_agent_messages`
    pub poll_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hub_id: None,
            agent_queue: QueueConfiguration::default(),
            install_default_routes: true,
            poll_timeout: Duration::from_millis(100),
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> MeshResult<()> {
        self.agent_queue.validate()
    }
}

/// What the hub knows about a registered agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub registered_at: DateTime<Utc>,
    pub queue_name: String,
    /// Session every message built for this agent belongs to
    pub session_id: String,
    /// Caller-supplied description
    pub info: Payload,
    /// Messages this agent has sent through the hub
    pub message_count: u64,
}

struct RegisteredAgent {
    record: AgentRecord,
    builder: MessageBuilder,
}

/// Direct router handler that drops messages into an agent's queue
///
/// A queue rejection (full or expired) is reported as a failed delivery so
/// the router's retry policy applies.
struct AgentQueueHandler {
    agent_id: String,
    queue: Arc<LocalMessageQueue>,
    counters: Arc<HubCounters>,
}

#[async_trait]
impl MessageHandler for AgentQueueHandler {
    async fn handle(&self, message: &Message) -> MeshResult<()> {
        let mut delivered = message.clone();
        delivered.status = MessageStatus::Delivered;

        self.queue.enqueue(delivered).await?;
        self.counters.messages_delivered.incr();

        debug!(
            agent_id = %self.agent_id,
            message_id = %message.message_id,
            "Message delivered to agent queue"
        );
        Ok(())
    }
}

async fn log_default_route(message: Message) -> MeshResult<()> {
    debug!(
        message_id = %message.message_id,
        routing_key = %message.routing_key(),
        "Message handled by default route"
    );
    Ok(())
}

fn queue_name_for(agent_id: &AgentId) -> String {
    format!("agent_queue_{}", agent_id)
}

fn session_id_for(agent_id: &AgentId) -> String {
    format!("session_{}_{}", agent_id, Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Agent registry and messaging facade over a [`MeshContext`]
pub struct AgentCommunicationHub {
    hub_id: String,
    config: HubConfig,
    context: MeshContext,
    validator: MessageValidator,
    agents: RwLock<HashMap<String, RegisteredAgent>>,
    counters: Arc<HubCounters>,
    default_routes_installed: AtomicBool,
    running: AtomicBool,
}

impl AgentCommunicationHub {
    pub fn new(context: MeshContext, config: HubConfig) -> MeshResult<Self> {
        config.validate()?;

        let hub_id = config.hub_id.clone().unwrap_or_else(|| {
            let hex = Uuid::new_v4().simple().to_string();
            format!("hub_{}", &hex[..8])
        });
        info!(hub_id = %hub_id, router_id = %context.router.router_id(), "Communication hub initialized");

        Ok(Self {
            hub_id,
            config,
            context,
            validator: MessageValidator::new(),
            agents: RwLock::new(HashMap::new()),
            counters: Arc::new(HubCounters::default()),
            default_routes_installed: AtomicBool::new(false),
            running: AtomicBool::new(false),
        })
    }

    /// Hub over a private router and queue manager
    pub fn standalone(config: HubConfig) -> MeshResult<Self> {
        Self::new(MeshContext::default(), config)
    }

    pub fn hub_id(&self) -> &str {
        &self.hub_id
    }

    pub fn context(&self) -> &MeshContext {
        &self.context
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start routing; no-op if already running
    ///
    /// Default routes are installed on the first start only. Agent queues
    /// stopped by a previous `stop` are restarted with their contents.
    pub async fn start(&self) -> MeshResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.config.install_default_routes
            && !self.default_routes_installed.swap(true, Ordering::SeqCst)
        {
            for (pattern, priority) in DEFAULT_ROUTES {
                self.context
                    .router
                    .register_route(pattern, Arc::new(log_default_route), priority)
                    .await;
            }
        }

        let records: Vec<AgentRecord> = self
            .agents
            .read()
            .await
            .values()
            .map(|agent| agent.record.clone())
            .collect();
        for record in &records {
            if let Err(e) = self.attach_queue(record).await {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        self.context.router.start_processing().await;

        info!(hub_id = %self.hub_id, "Communication hub started");
        Ok(())
    }

    /// Stop routing and every queue of the context
    ///
    /// Queues stay registered, so messages routed while the hub is stopped
    /// are still readable and survive the next `start`. Safe to call on a
    /// stopped hub.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.context.router.stop_processing().await;
        self.context.queues.stop_all().await;

        info!(hub_id = %self.hub_id, "Communication hub stopped");
    }

    async fn attach_queue(&self, record: &AgentRecord) -> MeshResult<Arc<LocalMessageQueue>> {
        let queue = self
            .context
            .queues
            .create_queue(
                &record.queue_name,
                QueueType::Priority,
                self.config.agent_queue.clone(),
            )
            .await?;
        queue.start().await;

        let handler = AgentQueueHandler {
            agent_id: record.agent_id.to_string(),
            queue: Arc::clone(&queue),
            counters: Arc::clone(&self.counters),
        };
        self.context
            .router
            .register_agent_handler(record.agent_id.as_str(), Arc::new(handler))
            .await;
        Ok(queue)
    }

    /// Register an agent; registering an existing agent is a no-op
    ///
    /// Returns `false` for an empty id, for the reserved `broadcast` address
    /// and when the agent's queue cannot be created.
    pub async fn register_agent(&self, agent_id: &str, info: Option<Payload>) -> bool {
        let agent_id = match AgentId::parse(agent_id) {
            Ok(agent_id) => agent_id,
            Err(e) => {
                warn!(agent_id, error = %e, "Rejected agent id");
                return false;
            }
        };

        let mut agents = self.agents.write().await;
        if agents.contains_key(agent_id.as_str()) {
            debug!(agent_id = %agent_id, "Agent already registered");
            return true;
        }

        let session_id = session_id_for(&agent_id);
        let record = AgentRecord {
            queue_name: queue_name_for(&agent_id),
            registered_at: Utc::now(),
            session_id: session_id.clone(),
            info: info.unwrap_or_default(),
            message_count: 0,
            agent_id: agent_id.clone(),
        };
        if let Err(e) = self.attach_queue(&record).await {
            error!(agent_id = %agent_id, error = %e, "Failed to create agent queue");
            return false;
        }

        agents.insert(
            agent_id.to_string(),
            RegisteredAgent {
                builder: MessageBuilder::new(agent_id.as_str(), session_id),
                record,
            },
        );
        self.counters.agents_registered.incr();

        info!(hub_id = %self.hub_id, agent_id = %agent_id, "Agent registered");
        true
    }

    /// Remove an agent, its router handler and its queue
    pub async fn unregister_agent(&self, agent_id: &str) -> bool {
        let Some(agent) = self.agents.write().await.remove(agent_id) else {
            return false;
        };

        self.context.router.unregister_agent_handler(agent_id).await;
        self.context
            .queues
            .delete_queue(&agent.record.queue_name)
            .await;

        info!(hub_id = %self.hub_id, agent_id, "Agent unregistered");
        true
    }

    /// Validate and hand a message to the router
    ///
    /// Returns `false` for invalid messages and for messages the router
    /// refuses. Validator warnings are logged but do not block the send.
    pub async fn send_message(&self, message: Message) -> bool {
        let report = match self.validator.validate(&message).into_result() {
            Ok(report) => report,
            Err(e) => {
                error!(message_id = %message.message_id, error = %e, "Message validation failed");
                self.counters.communication_errors.incr();
                return false;
            }
        };
        if !report.warnings.is_empty() {
            warn!(
                message_id = %message.message_id,
                warnings = ?report.warnings,
                "Message validation warnings"
            );
        }

        let sender_id = message.sender_id.clone();
        let message_id = message.message_id.clone();
        if !self.context.router.route_message(message).await {
            error!(message_id = %message_id, "Failed to route message");
            self.counters.communication_errors.incr();
            return false;
        }

        self.counters.messages_sent.incr();
        if let Some(agent) = self.agents.write().await.get_mut(&sender_id) {
            agent.record.message_count += 1;
        }

        debug!(message_id = %message_id, sender_id = %sender_id, "Message sent");
        true
    }

    async fn builder_for(&self, sender_id: &str) -> Option<MessageBuilder> {
        let builder = self
            .agents
            .read()
            .await
            .get(sender_id)
            .map(|agent| agent.builder.clone());
        if builder.is_none() {
            warn!(sender_id, "Sender not registered");
        }
        builder
    }

    pub async fn send_task_assignment(
        &self,
        sender_id: &str,
        receiver_id: &str,
        task_data: Value,
        priority: MessagePriority,
    ) -> bool {
        let Some(builder) = self.builder_for(sender_id).await else {
            return false;
        };
        self.send_message(builder.task_assignment(receiver_id, task_data, priority))
            .await
    }

    pub async fn send_research_request(
        &self,
        sender_id: &str,
        receiver_id: &str,
        subtopic_brief: Value,
        correlation_id: Option<String>,
    ) -> bool {
        let Some(builder) = self.builder_for(sender_id).await else {
            return false;
        };
        self.send_message(builder.research_request(receiver_id, subtopic_brief, correlation_id))
            .await
    }

    /// Send research findings, linked to the request they answer
    ///
    /// `reply_to` doubles as the correlation id so the result joins the
    /// request's chain.
    pub async fn send_research_result(
        &self,
        sender_id: &str,
        receiver_id: &str,
        research_findings: Value,
        reply_to: Option<String>,
    ) -> bool {
        let Some(builder) = self.builder_for(sender_id).await else {
            return false;
        };
        let mut message = builder.research_result(receiver_id, research_findings, reply_to.clone());
        message.correlation_id = reply_to;
        self.send_message(message).await
    }

    pub async fn send_quality_feedback(
        &self,
        sender_id: &str,
        receiver_id: &str,
        assessment: Value,
        suggestions: &[String],
    ) -> bool {
        let Some(builder) = self.builder_for(sender_id).await else {
            return false;
        };
        self.send_message(builder.quality_feedback(receiver_id, assessment, suggestions))
            .await
    }

    pub async fn send_status_update(
        &self,
        sender_id: &str,
        receiver_id: &str,
        status_info: Value,
    ) -> bool {
        let Some(builder) = self.builder_for(sender_id).await else {
            return false;
        };
        self.send_message(builder.status_update(receiver_id, status_info))
            .await
    }

    pub async fn send_error_notification(
        &self,
        sender_id: &str,
        receiver_id: &str,
        error_info: Value,
        correlation_id: Option<String>,
    ) -> bool {
        let Some(builder) = self.builder_for(sender_id).await else {
            return false;
        };
        self.send_message(builder.error_notification(receiver_id, error_info, correlation_id))
            .await
    }

    /// Heartbeat to `receiver_id`, or to every broadcast handler
    pub async fn send_heartbeat(&self, sender_id: &str, receiver_id: Option<&str>) -> bool {
        let Some(builder) = self.builder_for(sender_id).await else {
            return false;
        };
        self.send_message(builder.heartbeat(receiver_id)).await
    }

    pub async fn broadcast_message(
        &self,
        sender_id: &str,
        message_type: MessageType,
        payload: Payload,
    ) -> bool {
        let Some(builder) = self.builder_for(sender_id).await else {
            return false;
        };
        self.send_message(builder.broadcast(message_type, payload))
            .await
    }

    /// Pull up to `count` messages from an agent's queue
    ///
    /// Each dequeue waits at most `poll_timeout`, so an empty queue returns
    /// promptly. Unknown agents get an empty list.
    pub async fn get_agent_messages(&self, agent_id: &str, count: usize) -> Vec<Message> {
        let Some(queue) = self.agent_queue(agent_id).await else {
            warn!(agent_id, "Agent not registered");
            return Vec::new();
        };

        let mut messages = Vec::with_capacity(count);
        while messages.len() < count {
            match queue.dequeue(Some(self.config.poll_timeout)).await {
                Some(message) => messages.push(message),
                None => break,
            }
        }
        messages
    }

    /// Deliver everything the router holds, then drain every queue
    ///
    /// Returns the drained messages in queue-name order, each queue in
    /// priority order.
    pub async fn flush_all_messages(&self) -> Vec<Message> {
        self.context.router.flush_queues().await;

        let mut drained = Vec::new();
        for name in self.context.queues.list_queues().await {
            let Some(queue) = self.context.queues.get_queue(&name).await else {
                continue;
            };
            while let Some(message) = queue.dequeue(Some(Duration::ZERO)).await {
                drained.push(message);
            }
        }

        info!(hub_id = %self.hub_id, count = drained.len(), "Flushed all messages");
        drained
    }

    /// Queue of a registered agent, for push-style consumers
    pub async fn agent_queue(&self, agent_id: &str) -> Option<Arc<LocalMessageQueue>> {
        let queue_name = self
            .agents
            .read()
            .await
            .get(agent_id)
            .map(|agent| agent.record.queue_name.clone())?;
        self.context.queues.get_queue(&queue_name).await
    }

    /// Attach a consumer to an agent's queue and start it
    ///
    /// Returns `Ok(false)` if the consumer id is already taken on that queue.
    pub async fn add_agent_consumer(
        &self,
        agent_id: &str,
        consumer_id: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> MeshResult<bool> {
        let queue = self
            .agent_queue(agent_id)
            .await
            .ok_or_else(|| MeshError::AgentNotRegistered(agent_id.to_string()))?;
        Ok(queue.add_consumer(consumer_id, handler, true).await)
    }

    /// Registered agent ids, sorted
    pub async fn registered_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn agent_info(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .map(|agent| agent.record.clone())
    }

    pub async fn stats(&self) -> HubStatsSnapshot {
        HubStatsSnapshot {
            hub: self.counters.snapshot(&self.hub_id),
            router: self.context.router.stats().await,
            queues: self.context.queues.stats().await,
            registered_agents: self.registered_agents().await,
            is_running: self.is_running(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hub() -> AgentCommunicationHub {
        AgentCommunicationHub::standalone(HubConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_register_agent_is_idempotent() {
        let hub = hub();
        let mut info = Payload::new();
        info.insert("role".into(), json!("researcher"));

        assert!(hub.register_agent("researcher", Some(info)).await);
        assert!(hub.register_agent("researcher", None).await);

        assert_eq!(hub.registered_agents().await, vec!["researcher"]);
        let record = hub.agent_info("researcher").await.unwrap();
        assert_eq!(record.queue_name, "agent_queue_researcher");
        assert_eq!(record.info["role"], "researcher");
        assert!(record.session_id.starts_with("session_researcher_"));
        assert_eq!(hub.stats().await.hub.agents_registered, 1);
        assert!(hub.context().router().has_agent_handler("researcher").await);
    }

    #[tokio::test]
    async fn test_agent_id_rules() {
        let hub = hub();
        assert!(!hub.register_agent("broadcast", None).await);
        assert!(!hub.register_agent("", None).await);
        assert!(hub.registered_agents().await.is_empty());

        assert!(hub.register_agent("agent:1", None).await);
        assert!(hub.register_agent("research agent", None).await);
        assert!(hub.send_status_update("agent:1", "research agent", json!({"ok": true})).await);
        hub.context().router().flush_queues().await;

        let messages = hub.get_agent_messages("research agent", 5).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender_id, "agent:1");
    }

    #[tokio::test]
    async fn test_persistent_agent_queue_with_unsafe_id() {
        let dir = tempfile::TempDir::new().unwrap();
        let hub = AgentCommunicationHub::standalone(HubConfig {
            agent_queue: QueueConfiguration {
                persistence_enabled: true,
                persistence_path: Some(dir.path().join("queues")),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();

        assert!(hub.register_agent("../escape", None).await);
        hub.start().await.unwrap();
        hub.stop().await;

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        assert_eq!(std::fs::read_dir(dir.path().join("queues")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_sender_fails_fast() {
        let hub = hub();
        assert!(!hub.send_status_update("ghost", "anyone", json!({})).await);
        assert!(!hub.send_heartbeat("ghost", None).await);
        assert_eq!(hub.context().router().pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_message_counts_as_error() {
        let hub = hub();
        let message = Message::new("a", "b", MessageType::TaskAssignment, "", Payload::new());

        assert!(!hub.send_message(message).await);
        let stats = hub.stats().await;
        assert_eq!(stats.hub.communication_errors, 1);
        assert_eq!(stats.hub.messages_sent, 0);
    }

    #[tokio::test]
    async fn test_send_updates_counters_and_delivers() {
        let hub = hub();
        assert!(hub.register_agent("supervisor", None).await);
        assert!(hub.register_agent("worker", None).await);

        assert!(
            hub.send_task_assignment("supervisor", "worker", json!({"task": "t"}), MessagePriority::High)
                .await
        );
        assert_eq!(hub.agent_info("supervisor").await.unwrap().message_count, 1);

        hub.context().router().flush_queues().await;
        let messages = hub.get_agent_messages("worker", 10).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Delivered);
        assert_eq!(messages[0].payload["task_data"]["task"], "t");

        let stats = hub.stats().await;
        assert_eq!(stats.hub.messages_sent, 1);
        assert_eq!(stats.hub.messages_delivered, 1);
    }

    #[tokio::test]
    async fn test_default_routes_installed_once() {
        let hub = hub();
        hub.start().await.unwrap();
        hub.stop().await;
        hub.start().await.unwrap();

        let routes = hub.context().router().route_stats().await;
        assert_eq!(routes.len(), DEFAULT_ROUTES.len());
        assert_eq!(routes.last().map(|r| r.pattern.as_str()), Some("*"));
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_restart_resumes_agent_queues() {
        let hub = hub();
        assert!(hub.register_agent("a", None).await);
        hub.start().await.unwrap();
        let before = hub.agent_queue("a").await.unwrap();
        hub.stop().await;

        let stopped = hub.agent_queue("a").await.unwrap();
        assert!(Arc::ptr_eq(&before, &stopped));
        assert!(!stopped.is_running());

        hub.start().await.unwrap();
        let queue = hub.agent_queue("a").await.unwrap();
        assert!(Arc::ptr_eq(&before, &queue));
        assert!(queue.is_running());
        hub.stop().await;
        hub.stop().await;
        assert!(!hub.is_running());
    }

    #[tokio::test]
    async fn test_unregister_removes_queue_and_handler() {
        let hub = hub();
        assert!(hub.register_agent("a", None).await);

        assert!(hub.unregister_agent("a").await);
        assert!(!hub.unregister_agent("a").await);
        assert!(!hub.context().router().has_agent_handler("a").await);
        assert!(hub.context().queues().list_queues().await.is_empty());
        assert!(matches!(
            hub.add_agent_consumer("a", "c", Arc::new(|_m: Message| async { MeshResult::Ok(true) }))
                .await,
            Err(MeshError::AgentNotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_flush_all_drains_queues() {
        let hub = hub();
        assert!(hub.register_agent("a", None).await);
        assert!(hub.register_agent("b", None).await);

        assert!(hub.send_status_update("a", "b", json!({"p": 1})).await);
        assert!(hub.send_status_update("b", "a", json!({"p": 2})).await);

        let drained = hub.flush_all_messages().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].receiver_id, "a");
        assert!(hub.get_agent_messages("a", 1).await.is_empty());
    }
}
