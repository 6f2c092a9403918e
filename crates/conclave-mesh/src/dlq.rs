//! Dead Letter Queue for undeliverable messages
//!
//! The router moves messages here when they expire, when its pending buffer
//! is full, or when their retry budget runs out. Entries are kept for a
//! bounded time (TTL) and a bounded count so they can be inspected.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{MeshError, MeshResult};
use crate::message::{Message, MessageStatus};

/// Configuration for the Dead Letter Queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// Maximum number of entries; the oldest is evicted beyond this
    pub max_size: usize,
    /// How long an entry is retained
    pub ttl: Duration,
    /// Minimum time between purge passes of the router loop
    pub cleanup_interval: Duration,
    /// If false, dead-lettered messages are dropped
    pub enabled: bool,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(1),
            enabled: true,
        }
    }
}

impl DlqConfig {
    pub fn validate(&self) -> MeshResult<()> {
        if self.max_size == 0 {
            return Err(MeshError::InvalidConfig(
                "dead_letter.max_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Why a message was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// TTL elapsed before routing
    Expired,
    /// Router pending buffer at capacity
    QueueFull,
    /// Delivery failed and the retry budget is spent
    MaxRetriesExceeded,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Expired => "expired",
            DeadLetterReason::QueueFull => "queue_full",
            DeadLetterReason::MaxRetriesExceeded => "max_retries_exceeded",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message in the Dead Letter Queue with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    /// The dead-lettered message, status `failed`
    pub message: Message,
    pub reason: DeadLetterReason,
    /// When the message was added to DLQ
    pub added_at: DateTime<Utc>,
}

impl DlqEntry {
    /// Check if the entry outlived `ttl` at `now`
    pub fn is_expired_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        (now - self.added_at)
            .to_std()
            .map(|age| age > ttl)
            .unwrap_or(false)
    }
}

/// Statistics for the Dead Letter Queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DlqStats {
    /// Total messages currently in DLQ
    pub current_size: usize,
    /// Total messages added to DLQ (lifetime)
    pub total_added: u64,
    /// Entries dropped to respect `max_size`
    pub total_evicted: u64,
    /// Entries purged after their TTL
    pub total_expired: u64,
}

/// Dead Letter Queue for failed messages
pub struct DeadLetterQueue {
    config: DlqConfig,
    queue: RwLock<VecDeque<DlqEntry>>,
    stats: RwLock<DlqStats>,
}

impl DeadLetterQueue {
    pub fn new(config: DlqConfig) -> Self {
        Self {
            config,
            queue: RwLock::new(VecDeque::new()),
            stats: RwLock::new(DlqStats::default()),
        }
    }

    /// Create a DLQ with default configuration
    pub fn with_defaults() -> Self {
        Self::new(DlqConfig::default())
    }

    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    /// Mark the message failed, stamp the reason and time, and store it
    pub async fn add(&self, mut message: Message, reason: DeadLetterReason) {
        let now = Utc::now();
        message.status = MessageStatus::Failed;
        message.add_delivery_metadata("dead_letter_reason", reason.as_str());
        message.add_delivery_metadata(
            "dead_letter_time",
            now.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        );

        warn!(
            message_id = %message.message_id,
            receiver_id = %message.receiver_id,
            reason = %reason,
            retry_count = message.retry_count,
            "Message moved to dead letter queue"
        );

        if !self.config.enabled {
            debug!("DLQ disabled, dropping failed message");
            return;
        }

        let mut queue = self.queue.write().await;
        let mut stats = self.stats.write().await;

        while queue.len() >= self.config.max_size {
            queue.pop_front();
            stats.total_evicted += 1;
        }

        queue.push_back(DlqEntry {
            message,
            reason,
            added_at: now,
        });
        stats.total_added += 1;
        stats.current_size = queue.len();
    }

    /// Get all entries, oldest first
    pub async fn list(&self) -> Vec<DlqEntry> {
        self.queue.read().await.iter().cloned().collect()
    }

    /// Drop entries older than the configured TTL
    pub async fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Utc::now()).await
    }

    pub(crate) async fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut queue = self.queue.write().await;
        let initial_len = queue.len();
        let ttl = self.config.ttl;
        queue.retain(|entry| !entry.is_expired_at(ttl, now));
        let removed = initial_len - queue.len();

        if removed > 0 {
            let mut stats = self.stats.write().await;
            stats.total_expired += removed as u64;
            stats.current_size = queue.len();
            debug!(removed, "Purged expired dead letters");
        }

        removed
    }

    pub async fn stats(&self) -> DlqStats {
        self.stats.read().await.clone()
    }

    pub async fn size(&self) -> usize {
        self.queue.read().await.len()
    }

    /// Remove every entry, returning how many were dropped
    pub async fn clear(&self) -> usize {
        let mut queue = self.queue.write().await;
        let cleared = queue.len();
        queue.clear();
        self.stats.write().await.current_size = 0;

        debug!(cleared, "Cleared dead letter queue");
        cleared
    }
}
