//! Pattern-based message dispatch
//!
//! `route_message` only enqueues; a background loop started with
//! [`MessageRouter::start_processing`] drains the pending buffer in batches and
//! delivers each message to exactly one target:
//!
//! 1. `broadcast` receivers go to every broadcast handler; delivery succeeds
//!    if at least one of them succeeds.
//! 2. Otherwise the receiver's direct agent handler, if registered.
//! 3. Otherwise the first route, in priority order, whose pattern matches the
//!    routing key.
//!
//! A failed delivery is retried after a fixed delay while the message's retry
//! budget lasts, then dead-lettered.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dlq::{DeadLetterQueue, DeadLetterReason, DlqConfig, DlqEntry};
use crate::error::{MeshError, MeshResult};
use crate::handler::{HandlerId, MessageHandler};
use crate::message::{Message, MessageStatus};
use crate::stats::{RouterCounters, RouterStats};
use crate::task::{BackgroundTask, shutdown_requested};

/// Router configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Identifier stamped into delivery metadata; generated when absent
    pub router_id: Option<String>,
    /// Capacity of the pending buffer
    pub max_queue_size: usize,
    /// Fixed delay before a failed message is retried
    pub retry_delay: Duration,
    /// Messages delivered per loop iteration
    pub batch_size: usize,
    /// Sleep between loop iterations
    pub poll_interval: Duration,
    /// Upper bound on a single handler invocation
    pub handler_timeout: Duration,
    pub dead_letter: DlqConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            router_id: None,
            max_queue_size: 10_000,
            retry_delay: Duration::from_secs(5),
            batch_size: 10,
            poll_interval: Duration::from_millis(100),
            handler_timeout: Duration::from_secs(30),
            dead_letter: DlqConfig::default(),
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> MeshResult<()> {
        if self.max_queue_size == 0 {
            return Err(MeshError::InvalidConfig(
                "max_queue_size must be greater than zero".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(MeshError::InvalidConfig(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        if self.handler_timeout.is_zero() {
            return Err(MeshError::InvalidConfig(
                "handler_timeout must be greater than zero".to_string(),
            ));
        }
        self.dead_letter.validate()
    }
}

/// Dot-separated routing pattern
///
/// - `*` alone matches every key
/// - a pattern without `*` must equal the key
/// - a `*` segment matches exactly one key segment
/// - a `**` segment matches one or more key segments
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutePattern(String);

impl RoutePattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        if self.0 == "*" {
            return true;
        }
        if !self.0.contains('*') {
            return self.0 == routing_key;
        }

        let pattern: Vec<&str> = self.0.split('.').collect();
        let key: Vec<&str> = routing_key.split('.').collect();
        match_segments(&pattern, &key)
    }
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"**", rest)) => {
            if rest.is_empty() {
                return !key.is_empty();
            }
            (1..=key.len()).any(|skip| match_segments(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && match_segments(rest, &key[1..]),
        Some((literal, rest)) => key.first() == Some(literal) && match_segments(rest, &key[1..]),
    }
}

/// A registered pattern route
pub struct Route {
    pattern: RoutePattern,
    handler: Arc<dyn MessageHandler>,
    priority: i32,
    match_count: AtomicU64,
    last_matched: RwLock<Option<DateTime<Utc>>>,
}

impl Route {
    fn new(pattern: RoutePattern, handler: Arc<dyn MessageHandler>, priority: i32) -> Self {
        Self {
            pattern,
            handler,
            priority,
            match_count: AtomicU64::new(0),
            last_matched: RwLock::new(None),
        }
    }

    pub fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.pattern.matches(&message.routing_key())
    }

    async fn record_match(&self) {
        self.match_count.fetch_add(1, Ordering::Relaxed);
        *self.last_matched.write().await = Some(Utc::now());
    }

    pub async fn stats(&self) -> RouteStats {
        RouteStats {
            pattern: self.pattern.as_str().to_string(),
            priority: self.priority,
            match_count: self.match_count.load(Ordering::Relaxed),
            last_matched: *self.last_matched.read().await,
        }
    }
}

/// Per-route delivery statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteStats {
    pub pattern: String,
    pub priority: i32,
    pub match_count: u64,
    pub last_matched: Option<DateTime<Utc>>,
}

/// Message router with pending, retry and dead-letter buffers
pub struct MessageRouter {
    router_id: String,
    config: RouterConfig,
    routes: RwLock<Vec<Arc<Route>>>,
    agent_handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    broadcast_handlers: RwLock<Vec<(HandlerId, Arc<dyn MessageHandler>)>>,
    pending: Mutex<VecDeque<Message>>,
    retry: Mutex<VecDeque<(Message, Instant)>>,
    dead_letters: DeadLetterQueue,
    counters: RouterCounters,
    processing: Mutex<Option<BackgroundTask>>,
    running: AtomicBool,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

impl MessageRouter {
    /// Create a router after validating its configuration
    pub fn new(config: RouterConfig) -> MeshResult<Self> {
        config.validate()?;
        Ok(Self::from_config(config))
    }

    pub fn with_defaults() -> Self {
        Self::from_config(RouterConfig::default())
    }

    fn from_config(config: RouterConfig) -> Self {
        let router_id = config.router_id.clone().unwrap_or_else(|| {
            let hex = Uuid::new_v4().simple().to_string();
            format!("router_{}", &hex[..8])
        });
        info!(router_id = %router_id, "Message router initialized");

        Self {
            router_id,
            dead_letters: DeadLetterQueue::new(config.dead_letter.clone()),
            config,
            routes: RwLock::new(Vec::new()),
            agent_handlers: RwLock::new(HashMap::new()),
            broadcast_handlers: RwLock::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            retry: Mutex::new(VecDeque::new()),
            counters: RouterCounters::default(),
            processing: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn router_id(&self) -> &str {
        &self.router_id
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register a pattern route; higher priority routes are tried first
    ///
    /// Routes of equal priority keep registration order.
    pub async fn register_route(
        &self,
        pattern: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        priority: i32,
    ) {
        let pattern = RoutePattern::new(pattern);
        let mut routes = self.routes.write().await;
        routes.push(Arc::new(Route::new(pattern.clone(), handler, priority)));
        routes.sort_by_key(|route| Reverse(route.priority));
        self.counters.routes_registered.incr();

        info!(
            pattern = pattern.as_str(),
            priority,
            total_routes = routes.len(),
            "Route registered"
        );
    }

    /// Register the direct handler for an agent, replacing any previous one
    pub async fn register_agent_handler(
        &self,
        agent_id: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) {
        let agent_id = agent_id.into();
        info!(agent_id = %agent_id, "Agent handler registered");
        self.agent_handlers.write().await.insert(agent_id, handler);
    }

    pub async fn unregister_agent_handler(&self, agent_id: &str) -> bool {
        let removed = self.agent_handlers.write().await.remove(agent_id).is_some();
        if removed {
            info!(agent_id, "Agent handler unregistered");
        }
        removed
    }

    pub async fn has_agent_handler(&self, agent_id: &str) -> bool {
        self.agent_handlers.read().await.contains_key(agent_id)
    }

    pub async fn register_broadcast_handler(&self, handler: Arc<dyn MessageHandler>) -> HandlerId {
        let id = HandlerId::new();
        self.broadcast_handlers.write().await.push((id, handler));
        info!(handler_id = %id, "Broadcast handler registered");
        id
    }

    pub async fn unregister_broadcast_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.broadcast_handlers.write().await;
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        let removed = handlers.len() < before;
        if removed {
            info!(handler_id = %id, "Broadcast handler unregistered");
        }
        removed
    }

    /// Accept a message for delivery
    ///
    /// Returns `false` and dead-letters the message if it has already expired
    /// or the pending buffer is full. Never waits for delivery.
    pub async fn route_message(&self, mut message: Message) -> bool {
        if message.is_expired() {
            warn!(
                message_id = %message.message_id,
                age_secs = message.age_seconds(),
                "Dropping expired message"
            );
            self.dead_letter(message, DeadLetterReason::Expired).await;
            return false;
        }

        let mut pending = self.pending.lock().await;
        if pending.len() >= self.config.max_queue_size {
            drop(pending);
            error!(
                message_id = %message.message_id,
                capacity = self.config.max_queue_size,
                "Message queue full, dropping message"
            );
            self.dead_letter(message, DeadLetterReason::QueueFull).await;
            return false;
        }

        message.status = MessageStatus::Sent;
        message.add_delivery_metadata("router_id", self.router_id.as_str());
        message.add_delivery_metadata("queued_at", now_iso());

        debug!(
            message_id = %message.message_id,
            message_type = %message.message_type,
            sender = %message.sender_id,
            receiver = %message.receiver_id,
            "Message queued for routing"
        );

        pending.push_back(message);
        self.counters.routed.incr();
        true
    }

    /// Start the background processing loop; no-op if already running
    pub async fn start_processing(self: &Arc<Self>) {
        let mut processing = self.processing.lock().await;
        if processing.is_some() {
            warn!(router_id = %self.router_id, "Message router already running");
            return;
        }

        let router = Arc::clone(self);
        *processing = Some(BackgroundTask::spawn(move |shutdown| async move {
            router.processing_loop(shutdown).await;
        }));
        self.running.store(true, Ordering::SeqCst);
        info!(router_id = %self.router_id, "Message router started");
    }

    /// Stop the processing loop and wait for it to exit; safe to call twice
    pub async fn stop_processing(&self) {
        let Some(task) = self.processing.lock().await.take() else {
            return;
        };

        self.running.store(false, Ordering::SeqCst);
        task.stop("message_router").await;

        info!(router_id = %self.router_id, "Message router stopped");
    }

    async fn processing_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut last_purge = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.process_pending_batch().await;
            self.promote_ready_retries().await;

            if last_purge.elapsed() >= self.config.dead_letter.cleanup_interval {
                let purged = self.dead_letters.cleanup_expired().await;
                if purged > 0 {
                    info!(purged, "Cleaned up expired dead letter messages");
                }
                last_purge = Instant::now();
            }

            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        debug!(router_id = %self.router_id, "Processing loop exited");
    }

    async fn process_pending_batch(&self) -> usize {
        let mut processed = 0;
        while processed < self.config.batch_size {
            let Some(message) = self.pending.lock().await.pop_front() else {
                break;
            };
            self.process_message(message).await;
            processed += 1;
        }
        processed
    }

    async fn process_message(&self, mut message: Message) {
        match self.deliver(&message).await {
            Ok(()) => {
                message.status = MessageStatus::Delivered;
                self.counters.delivered.incr();
                debug!(
                    message_id = %message.message_id,
                    receiver = %message.receiver_id,
                    "Message delivered successfully"
                );
            }
            Err(e) => self.handle_delivery_failure(message, &e).await,
        }
    }

    async fn deliver(&self, message: &Message) -> MeshResult<()> {
        if message.is_broadcast() {
            return self.deliver_broadcast(message).await;
        }

        let agent_handler = self
            .agent_handlers
            .read()
            .await
            .get(&message.receiver_id)
            .cloned();
        if let Some(handler) = agent_handler {
            return self.invoke(handler, message).await;
        }

        let routing_key = message.routing_key();
        let route = self
            .routes
            .read()
            .await
            .iter()
            .find(|route| route.pattern.matches(&routing_key))
            .cloned();

        match route {
            Some(route) => {
                self.invoke(Arc::clone(&route.handler), message).await?;
                route.record_match().await;
                Ok(())
            }
            None => {
                warn!(
                    message_id = %message.message_id,
                    receiver = %message.receiver_id,
                    routing_key = %routing_key,
                    "No handler found for message"
                );
                Err(MeshError::NoRoute(routing_key))
            }
        }
    }

    async fn deliver_broadcast(&self, message: &Message) -> MeshResult<()> {
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .broadcast_handlers
            .read()
            .await
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        if handlers.is_empty() {
            return Err(MeshError::NoRoute(message.routing_key()));
        }

        let mut delivered = 0;
        for handler in handlers {
            match self.invoke(handler, message).await {
                Ok(()) => delivered += 1,
                Err(e) => error!(
                    message_id = %message.message_id,
                    error = %e,
                    "Broadcast delivery failed"
                ),
            }
        }

        if delivered > 0 {
            Ok(())
        } else {
            Err(MeshError::handler("every broadcast handler failed"))
        }
    }

    /// Run one handler in its own task, bounded by the handler timeout
    async fn invoke(&self, handler: Arc<dyn MessageHandler>, message: &Message) -> MeshResult<()> {
        let owned = message.clone();
        let mut task = tokio::spawn(async move { handler.handle(&owned).await });

        let result = match tokio::time::timeout(self.config.handler_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(MeshError::handler(format!(
                "handler panicked: {}",
                join_error
            ))),
            Err(_) => {
                task.abort();
                Err(MeshError::Timeout(self.config.handler_timeout))
            }
        };

        if let Err(e) = &result {
            error!(
                message_id = %message.message_id,
                error = %e,
                "Handler execution failed"
            );
        }
        result
    }

    async fn handle_delivery_failure(&self, mut message: Message, cause: &MeshError) {
        self.counters.failed.incr();

        if message.can_retry() {
            message.mark_retry();
            message.add_delivery_metadata("retry_scheduled_at", now_iso());
            let ready_at = Instant::now() + self.config.retry_delay;

            info!(
                message_id = %message.message_id,
                retry_count = message.retry_count,
                error = %cause,
                "Message scheduled for retry"
            );

            self.retry.lock().await.push_back((message, ready_at));
            self.counters.retried.incr();
        } else {
            self.dead_letter(message, DeadLetterReason::MaxRetriesExceeded)
                .await;
        }
    }

    async fn dead_letter(&self, message: Message, reason: DeadLetterReason) {
        self.counters.dead_lettered.incr();
        self.dead_letters.add(message, reason).await;
    }

    /// Move retries whose delay has elapsed back into the pending buffer
    async fn promote_ready_retries(&self) -> usize {
        let now = Instant::now();
        let mut ready = Vec::new();
        {
            let mut retry = self.retry.lock().await;
            while retry.front().is_some_and(|(_, ready_at)| *ready_at <= now) {
                if let Some((message, _)) = retry.pop_front() {
                    ready.push(message);
                }
            }
        }

        let promoted = ready.len();
        if promoted > 0 {
            let mut pending = self.pending.lock().await;
            for message in ready {
                debug!(message_id = %message.message_id, "Message moved from retry to pending");
                pending.push_back(message);
            }
        }
        promoted
    }

    async fn drain_pending(&self) -> usize {
        let mut processed = 0;
        loop {
            let Some(message) = self.pending.lock().await.pop_front() else {
                break;
            };
            self.process_message(message).await;
            processed += 1;
        }
        processed
    }

    /// Deliver everything pending, then every retry that is already due
    ///
    /// Runs on the caller's task without waiting for the processing loop.
    /// Returns the number of delivery attempts made.
    pub async fn flush_queues(&self) -> usize {
        info!(router_id = %self.router_id, "Flushing message queues");

        let mut processed = self.drain_pending().await;
        self.promote_ready_retries().await;
        processed += self.drain_pending().await;

        info!(processed, "Queue flush completed");
        processed
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn retry_count(&self) -> usize {
        self.retry.lock().await.len()
    }

    /// Dead-lettered entries, oldest first
    pub async fn dead_letters(&self) -> Vec<DlqEntry> {
        self.dead_letters.list().await
    }

    pub async fn clear_dead_letters(&self) -> usize {
        self.dead_letters.clear().await
    }

    /// Routes in the order they are tried
    pub async fn route_stats(&self) -> Vec<RouteStats> {
        let routes: Vec<Arc<Route>> = self.routes.read().await.clone();
        let mut stats = Vec::with_capacity(routes.len());
        for route in routes {
            stats.push(route.stats().await);
        }
        stats
    }

    pub async fn stats(&self) -> RouterStats {
        RouterStats {
            router_id: self.router_id.clone(),
            messages_routed: self.counters.routed.get(),
            messages_delivered: self.counters.delivered.get(),
            messages_failed: self.counters.failed.get(),
            messages_retried: self.counters.retried.get(),
            messages_dead_lettered: self.counters.dead_lettered.get(),
            routes_registered: self.counters.routes_registered.get(),
            pending_messages: self.pending_count().await,
            retry_queue_size: self.retry_count().await,
            dead_letter_size: self.dead_letters.size().await,
            registered_agents: self.agent_handlers.read().await.len(),
            broadcast_handlers: self.broadcast_handlers.read().await.len(),
            active_routes: self.routes.read().await.len(),
            is_running: self.is_running(),
        }
    }
}
