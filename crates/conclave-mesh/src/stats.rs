//! Counters and read-only statistics snapshots
//!
//! Components bump lock-free counters on the hot path and assemble a
//! serializable snapshot on demand. Snapshots carry no agent-level labels
//! except the registered agent list of the hub.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::queue::{QueueSize, QueueType};

/// Monotonic event counter
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub(crate) fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub(crate) struct RouterCounters {
    pub routed: Counter,
    pub delivered: Counter,
    pub failed: Counter,
    pub retried: Counter,
    pub dead_lettered: Counter,
    pub routes_registered: Counter,
}

/// Router statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub router_id: String,
    /// Messages accepted by `route_message`
    pub messages_routed: u64,
    pub messages_delivered: u64,
    /// Failed delivery attempts, including ones later retried
    pub messages_failed: u64,
    pub messages_retried: u64,
    pub messages_dead_lettered: u64,
    pub routes_registered: u64,
    pub pending_messages: usize,
    pub retry_queue_size: usize,
    pub dead_letter_size: usize,
    pub registered_agents: usize,
    pub broadcast_handlers: usize,
    pub active_routes: usize,
    pub is_running: bool,
}

#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    pub enqueued: Counter,
    pub dequeued: Counter,
    pub acknowledged: Counter,
    pub rejected: Counter,
    pub requeued: Counter,
    pub expired: Counter,
}

/// Queue statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub queue_type: QueueType,
    pub is_running: bool,
    pub size: QueueSize,
    pub max_size: usize,
    pub messages_enqueued: u64,
    pub messages_dequeued: u64,
    pub messages_acknowledged: u64,
    pub messages_rejected: u64,
    pub messages_requeued: u64,
    /// Expired messages discarded by dequeue or the cleanup sweep
    pub messages_expired: u64,
    pub active_consumers: usize,
    pub total_consumers: usize,
}

#[derive(Debug, Default)]
pub(crate) struct HubCounters {
    pub agents_registered: Counter,
    pub messages_sent: Counter,
    pub messages_delivered: Counter,
    pub communication_errors: Counter,
}

impl HubCounters {
    pub(crate) fn snapshot(&self, hub_id: &str) -> HubStats {
        HubStats {
            hub_id: hub_id.to_string(),
            agents_registered: self.agents_registered.get(),
            messages_sent: self.messages_sent.get(),
            messages_delivered: self.messages_delivered.get(),
            communication_errors: self.communication_errors.get(),
        }
    }
}

/// Hub-level counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub hub_id: String,
    /// Registrations over the hub's lifetime
    pub agents_registered: u64,
    pub messages_sent: u64,
    /// Messages placed into an agent queue by the router
    pub messages_delivered: u64,
    pub communication_errors: u64,
}

/// Diagnostic snapshot of a hub and the router and queues behind it
#[derive(Debug, Clone, Serialize)]
pub struct HubStatsSnapshot {
    pub hub: HubStats,
    pub router: RouterStats,
    pub queues: BTreeMap<String, QueueStats>,
    pub registered_agents: Vec<String>,
    pub is_running: bool,
}
