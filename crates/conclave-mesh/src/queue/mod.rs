//! Named delivery queues with priority ordering and consumers
//!
//! A [`LocalMessageQueue`] keeps one FIFO bucket per priority and always
//! serves the highest non-empty bucket first. Lower priorities can starve
//! under a steady stream of urgent messages.
//!
//! Consumers are background loops that dequeue and hand each message to a
//! [`ConsumerHandler`]; the handler's answer decides between acknowledgement
//! and rejection.

pub mod manager;

pub use manager::LocalQueueManager;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{MeshError, MeshResult};
use crate::handler::ConsumerHandler;
use crate::message::{Message, MessageId, MessagePriority, MessageStatus};
use crate::persistence::QueueLog;
use crate::stats::{QueueCounters, QueueStats};
use crate::task::{BackgroundTask, shutdown_requested};

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfiguration {
    /// Capacity across all priority buckets
    pub max_size: usize,
    pub persistence_enabled: bool,
    /// Directory holding `<queue_name>.jsonl`
    pub persistence_path: Option<PathBuf>,
    /// Nominal message lifetime; not stamped onto messages
    pub message_ttl: Duration,
    /// Acknowledge every consumed message regardless of the handler's answer
    pub auto_acknowledge: bool,
    pub batch_size: usize,
    /// Default wait of `dequeue` when no timeout is given
    pub consumer_timeout: Duration,
    /// Sleep between polls while `dequeue` waits
    pub poll_interval: Duration,
    /// Period of the expired-message sweep
    pub cleanup_interval: Duration,
    /// Wait of each consumer-loop `dequeue`
    pub consumer_poll_timeout: Duration,
    /// Requeue messages a consumer rejects, while their retry budget lasts
    pub requeue_on_reject: bool,
}

impl Default for QueueConfiguration {
    fn default() -> Self {
        Self {
            max_size: 1000,
            persistence_enabled: false,
            persistence_path: None,
            message_ttl: Duration::from_secs(3600),
            auto_acknowledge: true,
            batch_size: 10,
            consumer_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            cleanup_interval: Duration::from_secs(60),
            consumer_poll_timeout: Duration::from_secs(1),
            requeue_on_reject: false,
        }
    }
}

impl QueueConfiguration {
    pub fn validate(&self) -> MeshResult<()> {
        if self.max_size == 0 {
            return Err(MeshError::InvalidConfig(
                "max_size must be greater than zero".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(MeshError::InvalidConfig(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        if self.persistence_enabled && self.persistence_path.is_none() {
            return Err(MeshError::InvalidConfig(
                "persistence_path is required when persistence is enabled".to_string(),
            ));
        }
        if self.poll_interval.is_zero() || self.cleanup_interval.is_zero() {
            return Err(MeshError::InvalidConfig(
                "poll_interval and cleanup_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Ordering discipline of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// Strict priority, FIFO within a priority
    #[default]
    Priority,
    /// Arrival order, priority ignored
    Fifo,
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueType::Priority => f.write_str("priority"),
            QueueType::Fifo => f.write_str("fifo"),
        }
    }
}

/// Message counts by priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSize {
    pub urgent: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total: usize,
}

/// Priority-bucketed message storage
///
/// In `Fifo` mode every message shares one bucket.
#[derive(Debug, Clone)]
pub struct PriorityBuckets {
    queue_type: QueueType,
    buckets: [VecDeque<Message>; 4],
}

impl PriorityBuckets {
    pub fn new(queue_type: QueueType) -> Self {
        Self {
            queue_type,
            buckets: Default::default(),
        }
    }

    fn bucket_of(&self, priority: MessagePriority) -> usize {
        match self.queue_type {
            QueueType::Priority => priority.rank(),
            QueueType::Fifo => 0,
        }
    }

    pub fn push(&mut self, message: Message) {
        let index = self.bucket_of(message.priority);
        self.buckets[index].push_back(message);
    }

    /// Pop the next live message, discarding expired ones on the way
    ///
    /// Returns the message, if any, and how many expired messages were dropped.
    pub fn pop_live(&mut self, now: DateTime<Utc>) -> (Option<Message>, usize) {
        let mut discarded = 0;
        for bucket in self.buckets.iter_mut() {
            while let Some(message) = bucket.pop_front() {
                if message.is_expired_at(now) {
                    debug!(message_id = %message.message_id, "Expired message removed from queue");
                    discarded += 1;
                    continue;
                }
                return (Some(message), discarded);
            }
        }
        (None, discarded)
    }

    /// Up to `count` live messages in service order, without removing them
    pub fn peek(&self, count: usize, now: DateTime<Utc>) -> Vec<Message> {
        self.iter()
            .filter(|message| !message.is_expired_at(now))
            .take(count)
            .cloned()
            .collect()
    }

    /// Drop every expired message, returning how many were removed
    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.len();
        for bucket in self.buckets.iter_mut() {
            bucket.retain(|message| !message.is_expired_at(now));
        }
        before - self.len()
    }

    /// Messages in service order
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.buckets.iter().flat_map(|bucket| bucket.iter())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.len();
        self.buckets.iter_mut().for_each(VecDeque::clear);
        cleared
    }

    pub fn size(&self) -> QueueSize {
        let mut size = QueueSize::default();
        for message in self.iter() {
            match message.priority {
                MessagePriority::Urgent => size.urgent += 1,
                MessagePriority::High => size.high += 1,
                MessagePriority::Normal => size.normal += 1,
                MessagePriority::Low => size.low += 1,
            }
            size.total += 1;
        }
        size
    }
}

struct Consumer {
    handler: Arc<dyn ConsumerHandler>,
    task: Option<BackgroundTask>,
}

/// In-process message queue with optional disk persistence
pub struct LocalMessageQueue {
    name: String,
    queue_type: QueueType,
    config: QueueConfiguration,
    buckets: Mutex<PriorityBuckets>,
    consumers: Mutex<HashMap<String, Consumer>>,
    cleanup: Mutex<Option<BackgroundTask>>,
    running: AtomicBool,
    /// Set once the persistence log has been read back
    restored: AtomicBool,
    counters: QueueCounters,
    log: Option<QueueLog>,
}

impl LocalMessageQueue {
    /// Create a stopped queue
    ///
    /// Fails on invalid configuration or when the persistence directory
    /// cannot be created.
    pub fn new(
        name: impl Into<String>,
        queue_type: QueueType,
        config: QueueConfiguration,
    ) -> MeshResult<Self> {
        config.validate()?;
        let name = name.into();

        let log = match (&config.persistence_enabled, &config.persistence_path) {
            (true, Some(dir)) => Some(QueueLog::open(dir, &name)?),
            _ => None,
        };

        info!(
            queue_name = %name,
            queue_type = %queue_type,
            persistence = log.is_some(),
            "Local message queue initialized"
        );

        Ok(Self {
            buckets: Mutex::new(PriorityBuckets::new(queue_type)),
            name,
            queue_type,
            config,
            consumers: Mutex::new(HashMap::new()),
            cleanup: Mutex::new(None),
            running: AtomicBool::new(false),
            restored: AtomicBool::new(false),
            counters: QueueCounters::default(),
            log,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn config(&self) -> &QueueConfiguration {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the expiry sweep; no-op if running
    ///
    /// The first start also loads the persistence log. Later restarts keep
    /// the in-memory contents, which the log only mirrors.
    pub async fn start(self: &Arc<Self>) {
        let mut cleanup = self.cleanup.lock().await;
        if cleanup.is_some() {
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        self.load_persisted().await;

        let queue = Arc::clone(self);
        *cleanup = Some(BackgroundTask::spawn(move |shutdown| async move {
            queue.cleanup_loop(shutdown).await;
        }));

        info!(queue_name = %self.name, "Message queue started");
    }

    /// Stop consumers and the sweep, then rewrite the persistence log
    ///
    /// Safe to call on a stopped queue.
    pub async fn stop(&self) {
        let Some(cleanup) = self.cleanup.lock().await.take() else {
            return;
        };
        self.running.store(false, Ordering::SeqCst);

        let consumer_ids: Vec<String> = self.consumers.lock().await.keys().cloned().collect();
        for consumer_id in consumer_ids {
            self.remove_consumer(&consumer_id).await;
        }

        cleanup.stop(&self.name).await;
        self.persist_all().await;

        info!(queue_name = %self.name, "Message queue stopped");
    }

    /// Accept a message into its priority bucket
    ///
    /// Fails with `QueueFull` at capacity and `MessageExpired` for a message
    /// whose TTL has elapsed.
    pub async fn enqueue(&self, message: Message) -> MeshResult<()> {
        let mut buckets = self.buckets.lock().await;

        let current = buckets.len();
        if current >= self.config.max_size {
            warn!(
                queue_name = %self.name,
                message_id = %message.message_id,
                "Queue full, rejecting message"
            );
            return Err(MeshError::QueueFull {
                capacity: self.config.max_size,
                current,
            });
        }

        if message.is_expired() {
            warn!(
                queue_name = %self.name,
                message_id = %message.message_id,
                "Message expired, rejecting"
            );
            return Err(MeshError::MessageExpired(message.message_id.to_string()));
        }

        if let Some(log) = &self.log
            && let Err(e) = log.append(&message)
        {
            error!(
                queue_name = %self.name,
                message_id = %message.message_id,
                error = %e,
                "Failed to persist message"
            );
        }

        debug!(
            queue_name = %self.name,
            message_id = %message.message_id,
            priority = %message.priority,
            "Message enqueued"
        );

        buckets.push(message);
        self.counters.enqueued.incr();
        Ok(())
    }

    async fn try_dequeue(&self) -> Option<Message> {
        let (message, discarded) = self.buckets.lock().await.pop_live(Utc::now());
        for _ in 0..discarded {
            self.counters.expired.incr();
        }

        if let Some(message) = &message {
            self.counters.dequeued.incr();
            debug!(
                queue_name = %self.name,
                message_id = %message.message_id,
                priority = %message.priority,
                "Message dequeued"
            );
        }
        message
    }

    /// Take the next live message in priority order
    ///
    /// Always makes one pass over the buckets. While the queue is running it
    /// then keeps polling until a message arrives or `timeout` (default
    /// `consumer_timeout`) elapses. A zero timeout never waits.
    pub async fn dequeue(&self, timeout: Option<Duration>) -> Option<Message> {
        let timeout = timeout.unwrap_or(self.config.consumer_timeout);
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(message) = self.try_dequeue().await {
                return Some(message);
            }

            let now = Instant::now();
            if !self.is_running() || timeout.is_zero() || now >= deadline {
                return None;
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Up to `count` live messages in service order, without removing them
    pub async fn peek(&self, count: usize) -> Vec<Message> {
        self.buckets.lock().await.peek(count, Utc::now())
    }

    pub async fn size(&self) -> QueueSize {
        self.buckets.lock().await.size()
    }

    pub async fn len(&self) -> usize {
        self.buckets.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.lock().await.is_empty()
    }

    /// Drop every queued message, returning how many were removed
    pub async fn clear(&self) -> usize {
        let cleared = self.buckets.lock().await.clear();
        info!(queue_name = %self.name, cleared, "Queue cleared");
        cleared
    }

    /// Register a consumer; returns `false` if the id is taken
    pub async fn add_consumer(
        self: &Arc<Self>,
        consumer_id: impl Into<String>,
        handler: Arc<dyn ConsumerHandler>,
        auto_start: bool,
    ) -> bool {
        let consumer_id = consumer_id.into();
        {
            let mut consumers = self.consumers.lock().await;
            if consumers.contains_key(&consumer_id) {
                warn!(queue_name = %self.name, consumer_id = %consumer_id, "Consumer already exists");
                return false;
            }
            consumers.insert(
                consumer_id.clone(),
                Consumer {
                    handler,
                    task: None,
                },
            );
        }

        info!(queue_name = %self.name, consumer_id = %consumer_id, "Consumer added");

        if auto_start {
            self.start_consumer(&consumer_id).await;
        }
        true
    }

    /// Stop and unregister a consumer
    pub async fn remove_consumer(&self, consumer_id: &str) -> bool {
        let Some(consumer) = self.consumers.lock().await.remove(consumer_id) else {
            return false;
        };
        if let Some(task) = consumer.task {
            task.stop(consumer_id).await;
        }

        info!(queue_name = %self.name, consumer_id, "Consumer removed");
        true
    }

    /// Spawn the loop of a registered consumer
    ///
    /// Returns `true` if the loop is running afterwards. A stopped queue does
    /// not start consumers.
    pub async fn start_consumer(self: &Arc<Self>, consumer_id: &str) -> bool {
        if !self.is_running() {
            warn!(queue_name = %self.name, consumer_id, "Queue not running, consumer not started");
            return false;
        }

        let mut consumers = self.consumers.lock().await;
        let Some(consumer) = consumers.get_mut(consumer_id) else {
            return false;
        };
        if consumer.task.is_some() {
            return true;
        }

        let queue = Arc::clone(self);
        let handler = Arc::clone(&consumer.handler);
        let id = consumer_id.to_string();
        consumer.task = Some(BackgroundTask::spawn(move |shutdown| async move {
            queue.consumer_loop(id, handler, shutdown).await;
        }));

        info!(queue_name = %self.name, consumer_id, "Consumer started");
        true
    }

    /// Stop a consumer's loop but keep it registered
    pub async fn stop_consumer(&self, consumer_id: &str) -> bool {
        let task = {
            let mut consumers = self.consumers.lock().await;
            match consumers.get_mut(consumer_id).and_then(|c| c.task.take()) {
                Some(task) => task,
                None => return false,
            }
        };
        task.stop(consumer_id).await;

        info!(queue_name = %self.name, consumer_id, "Consumer stopped");
        true
    }

    /// Mark a message as successfully processed
    pub fn acknowledge_message(&self, message: &mut Message) {
        message.status = MessageStatus::Acknowledged;
        self.counters.acknowledged.incr();
        debug!(queue_name = %self.name, message_id = %message.message_id, "Message acknowledged");
    }

    /// Mark a message as failed, optionally putting it back in the queue
    ///
    /// A requeue consumes one retry and only happens while the message can
    /// still be retried. Returns `true` if the message was requeued.
    pub async fn reject_message(&self, message: &mut Message, requeue: bool) -> bool {
        message.status = MessageStatus::Failed;
        self.counters.rejected.incr();

        if requeue && message.can_retry() {
            message.mark_retry();
            match self.enqueue(message.clone()).await {
                Ok(()) => {
                    self.counters.requeued.incr();
                    debug!(
                        queue_name = %self.name,
                        message_id = %message.message_id,
                        retry_count = message.retry_count,
                        "Message requeued after rejection"
                    );
                    return true;
                }
                Err(e) => warn!(
                    queue_name = %self.name,
                    message_id = %message.message_id,
                    error = %e,
                    "Failed to requeue rejected message"
                ),
            }
        }

        debug!(queue_name = %self.name, message_id = %message.message_id, "Message rejected");
        false
    }

    async fn consumer_loop(
        self: Arc<Self>,
        consumer_id: String,
        handler: Arc<dyn ConsumerHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() || !self.is_running() {
                break;
            }

            let next = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                next = self.dequeue(Some(self.config.consumer_poll_timeout)) => next,
            };

            if let Some(message) = next {
                self.consume(&consumer_id, handler.as_ref(), message).await;
            }
        }

        debug!(queue_name = %self.name, consumer_id = %consumer_id, "Consumer loop exited");
    }

    async fn consume(&self, consumer_id: &str, handler: &dyn ConsumerHandler, mut message: Message) {
        let outcome = AssertUnwindSafe(handler.consume(&message))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(accepted)) if accepted || self.config.auto_acknowledge => {
                self.acknowledge_message(&mut message);
            }
            Ok(Ok(_)) => {
                self.reject_message(&mut message, self.config.requeue_on_reject)
                    .await;
            }
            Ok(Err(e)) => {
                error!(
                    queue_name = %self.name,
                    consumer_id,
                    message_id = %message.message_id,
                    error = %e,
                    "Consumer handler failed"
                );
                self.reject_message(&mut message, false).await;
            }
            Err(_) => {
                error!(
                    queue_name = %self.name,
                    consumer_id,
                    message_id = %message.message_id,
                    "Consumer handler panicked"
                );
                self.reject_message(&mut message, false).await;
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.cleanup_interval);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = interval.tick() => {
                    let removed = self.buckets.lock().await.remove_expired(Utc::now());
                    if removed > 0 {
                        for _ in 0..removed {
                            self.counters.expired.incr();
                        }
                        info!(queue_name = %self.name, count = removed, "Removed expired messages");
                    }
                }
            }
        }
    }

    async fn load_persisted(&self) {
        let Some(log) = &self.log else {
            return;
        };
        if self.restored.swap(true, Ordering::SeqCst) {
            return;
        }

        match log.load() {
            Ok(messages) => {
                let now = Utc::now();
                let mut buckets = self.buckets.lock().await;
                // Messages enqueued before the first start are already in the log
                let mut seen: HashSet<MessageId> =
                    buckets.iter().map(|m| m.message_id.clone()).collect();
                let mut loaded = 0;
                for message in messages {
                    if message.is_expired_at(now) || !seen.insert(message.message_id.clone()) {
                        continue;
                    }
                    if buckets.len() >= self.config.max_size {
                        warn!(
                            queue_name = %self.name,
                            capacity = self.config.max_size,
                            "Queue full, dropping remaining persisted messages"
                        );
                        break;
                    }
                    buckets.push(message);
                    loaded += 1;
                }
                info!(queue_name = %self.name, count = loaded, "Loaded persisted messages");
            }
            Err(e) => {
                error!(queue_name = %self.name, error = %e, "Failed to load persisted messages");
            }
        }
    }

    async fn persist_all(&self) {
        let Some(log) = &self.log else {
            return;
        };

        let buckets = self.buckets.lock().await;
        if let Err(e) = log.rewrite(buckets.iter()) {
            error!(queue_name = %self.name, error = %e, "Failed to persist messages");
        }
    }

    pub async fn stats(&self) -> QueueStats {
        let size = self.size().await;
        let (total_consumers, active_consumers) = {
            let consumers = self.consumers.lock().await;
            let active = consumers.values().filter(|c| c.task.is_some()).count();
            (consumers.len(), active)
        };

        QueueStats {
            queue_name: self.name.clone(),
            queue_type: self.queue_type,
            is_running: self.is_running(),
            size,
            max_size: self.config.max_size,
            messages_enqueued: self.counters.enqueued.get(),
            messages_dequeued: self.counters.dequeued.get(),
            messages_acknowledged: self.counters.acknowledged.get(),
            messages_rejected: self.counters.rejected.get(),
            messages_requeued: self.counters.requeued.get(),
            messages_expired: self.counters.expired.get(),
            active_consumers,
            total_consumers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageType, Payload};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn message(id: &str, priority: MessagePriority) -> Message {
        Message::new("a", "b", MessageType::TaskAssignment, "s", Payload::new())
            .with_id(id)
            .with_priority(priority)
    }

    fn fast_config() -> QueueConfiguration {
        QueueConfiguration {
            poll_interval: Duration::from_millis(5),
            consumer_poll_timeout: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn started(config: QueueConfiguration) -> Arc<LocalMessageQueue> {
        let queue = Arc::new(LocalMessageQueue::new("test_queue", QueueType::Priority, config).unwrap());
        queue.start().await;
        queue
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_priority_order() {
        let queue = started(fast_config()).await;

        queue.enqueue(message("low", MessagePriority::Low)).await.unwrap();
        queue.enqueue(message("urgent", MessagePriority::Urgent)).await.unwrap();
        queue.enqueue(message("normal", MessagePriority::Normal)).await.unwrap();
        queue.enqueue(message("high", MessagePriority::High)).await.unwrap();

        let mut order = Vec::new();
        while let Some(m) = queue.dequeue(Some(Duration::ZERO)).await {
            order.push(m.message_id.to_string());
        }
        assert_eq!(order, vec!["urgent", "high", "normal", "low"]);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_fifo_ignores_priority() {
        let queue = Arc::new(
            LocalMessageQueue::new("fifo", QueueType::Fifo, fast_config()).unwrap(),
        );
        queue.start().await;

        queue.enqueue(message("first", MessagePriority::Low)).await.unwrap();
        queue.enqueue(message("second", MessagePriority::Urgent)).await.unwrap();

        assert_eq!(queue.dequeue(Some(Duration::ZERO)).await.unwrap().message_id, "first");
        let size = queue.size().await;
        assert_eq!(size.urgent, 1);
        assert_eq!(size.total, 1);
    }

    #[tokio::test]
    async fn test_capacity_and_expiry_rejected() {
        let queue = started(QueueConfiguration {
            max_size: 1,
            ..fast_config()
        })
        .await;

        let expired = message("old", MessagePriority::Normal)
            .with_timestamp(Utc::now() - chrono::Duration::seconds(10))
            .with_ttl(1);
        assert!(matches!(
            queue.enqueue(expired).await,
            Err(MeshError::MessageExpired(_))
        ));

        queue.enqueue(message("m1", MessagePriority::Normal)).await.unwrap();
        assert!(matches!(
            queue.enqueue(message("m2", MessagePriority::Normal)).await,
            Err(MeshError::QueueFull { capacity: 1, current: 1 })
        ));
    }

    #[tokio::test]
    async fn test_dequeue_skips_expired() {
        let queue = started(fast_config()).await;

        let mut buckets = queue.buckets.lock().await;
        buckets.push(
            message("stale", MessagePriority::Urgent)
                .with_timestamp(Utc::now() - chrono::Duration::seconds(10))
                .with_ttl(1),
        );
        buckets.push(message("fresh", MessagePriority::Low));
        drop(buckets);

        assert_eq!(queue.peek(5).await.len(), 1);
        let next = queue.dequeue(Some(Duration::ZERO)).await.unwrap();
        assert_eq!(next.message_id, "fresh");
        assert_eq!(queue.stats().await.messages_expired, 1);
    }

    #[tokio::test]
    async fn test_dequeue_times_out_when_empty() {
        let queue = started(fast_config()).await;
        let started_at = Instant::now();
        assert!(queue.dequeue(Some(Duration::from_millis(30))).await.is_none());
        assert!(started_at.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_stopped_queue_does_not_wait() {
        let queue = Arc::new(
            LocalMessageQueue::new("stopped", QueueType::Priority, fast_config()).unwrap(),
        );
        queue.enqueue(message("m1", MessagePriority::Normal)).await.unwrap();

        assert!(queue.dequeue(Some(Duration::from_secs(5))).await.is_some());
        let started_at = Instant::now();
        assert!(queue.dequeue(Some(Duration::from_secs(5))).await.is_none());
        assert!(started_at.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_consumer_acknowledges() {
        let queue = started(fast_config()).await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);

        assert!(
            queue
                .add_consumer(
                    "worker",
                    Arc::new(move |_message: Message| {
                        let counter = Arc::clone(&counter);
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            MeshResult::Ok(true)
                        }
                    }),
                    true,
                )
                .await
        );
        assert!(
            !queue
                .add_consumer("worker", Arc::new(|_m: Message| async { MeshResult::Ok(true) }), true)
                .await
        );

        queue.enqueue(message("m1", MessagePriority::Normal)).await.unwrap();
        queue.enqueue(message("m2", MessagePriority::High)).await.unwrap();

        wait_until(|| seen.load(Ordering::SeqCst) == 2).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        let stats = queue.stats().await;
        assert_eq!(stats.active_consumers, 1);
        queue.stop().await;
        queue.stop().await;

        let stats = queue.stats().await;
        assert!(!stats.is_running);
        assert_eq!(stats.total_consumers, 0);
        assert_eq!(stats.messages_acknowledged, 2);
    }

    #[tokio::test]
    async fn test_consumer_failures_reject() {
        let queue = started(QueueConfiguration {
            auto_acknowledge: false,
            ..fast_config()
        })
        .await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        queue
            .add_consumer(
                "picky",
                Arc::new(move |message: Message| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        match message.message_id.as_str() {
                            "ok" => Ok(true),
                            "no" => Ok(false),
                            _ => Err(MeshError::handler("bad input")),
                        }
                    }
                }),
                true,
            )
            .await;

        for id in ["ok", "no", "err"] {
            queue.enqueue(message(id, MessagePriority::Normal)).await.unwrap();
        }
        wait_until(|| calls.load(Ordering::SeqCst) == 3).await;
        queue.stop_consumer("picky").await;

        let stats = queue.stats().await;
        assert_eq!(stats.messages_acknowledged, 1);
        assert_eq!(stats.messages_rejected, 2);
        assert_eq!(stats.messages_requeued, 0);
        assert_eq!(stats.active_consumers, 0);
        assert_eq!(stats.total_consumers, 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_reject_with_requeue_consumes_retry() {
        let queue = started(fast_config()).await;
        let mut msg = message("m1", MessagePriority::Normal).with_max_retries(1);

        assert!(queue.reject_message(&mut msg, true).await);
        assert_eq!(msg.retry_count, 1);
        assert_eq!(queue.len().await, 1);

        let mut again = queue.dequeue(Some(Duration::ZERO)).await.unwrap();
        assert!(!queue.reject_message(&mut again, true).await);
        assert_eq!(again.status, MessageStatus::Failed);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_persistence_survives_restart() {
        let dir = TempDir::new().unwrap();
        let config = QueueConfiguration {
            persistence_enabled: true,
            persistence_path: Some(dir.path().to_path_buf()),
            ..fast_config()
        };

        let queue = started(config.clone()).await;
        queue.enqueue(message("m1", MessagePriority::Low)).await.unwrap();
        queue.enqueue(message("m2", MessagePriority::Urgent)).await.unwrap();
        queue.dequeue(Some(Duration::ZERO)).await.unwrap();
        queue.stop().await;

        let restored = started(config).await;
        let remaining = restored.peek(10).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message_id, "m1");
    }

    #[tokio::test]
    async fn test_restart_does_not_duplicate_persisted_messages() {
        let dir = TempDir::new().unwrap();
        let config = QueueConfiguration {
            persistence_enabled: true,
            persistence_path: Some(dir.path().to_path_buf()),
            ..fast_config()
        };
        let queue = Arc::new(LocalMessageQueue::new("restart", QueueType::Priority, config).unwrap());

        queue.enqueue(message("early", MessagePriority::Normal)).await.unwrap();
        queue.start().await;
        assert_eq!(queue.size().await.total, 1);

        queue.enqueue(message("late", MessagePriority::High)).await.unwrap();
        queue.stop().await;
        queue.start().await;
        queue.stop().await;
        queue.start().await;

        let ids: Vec<String> = queue
            .peek(10)
            .await
            .into_iter()
            .map(|m| m.message_id.to_string())
            .collect();
        assert_eq!(ids, vec!["late", "early"]);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_persisted_load_respects_capacity() {
        let dir = TempDir::new().unwrap();
        let log = QueueLog::open(dir.path(), "small").unwrap();
        for id in ["m1", "m2", "m3"] {
            log.append(&message(id, MessagePriority::Normal)).unwrap();
        }

        let config = QueueConfiguration {
            max_size: 2,
            persistence_enabled: true,
            persistence_path: Some(dir.path().to_path_buf()),
            ..fast_config()
        };
        let small = Arc::new(LocalMessageQueue::new("small", QueueType::Priority, config).unwrap());
        small.start().await;
        assert_eq!(small.size().await.total, 2);
    }

    #[tokio::test]
    async fn test_clear_and_size() {
        let queue = started(fast_config()).await;
        queue.enqueue(message("a", MessagePriority::Urgent)).await.unwrap();
        queue.enqueue(message("b", MessagePriority::Low)).await.unwrap();

        let size = queue.size().await;
        assert_eq!((size.urgent, size.low, size.total), (1, 1, 2));

        assert_eq!(queue.clear().await, 2);
        assert!(queue.is_empty().await);
    }

    #[test]
    fn test_persistence_requires_path() {
        let config = QueueConfiguration {
            persistence_enabled: true,
            ..Default::default()
        };
        assert!(matches!(
            LocalMessageQueue::new("q", QueueType::Priority, config),
            Err(MeshError::InvalidConfig(_))
        ));
    }
}
