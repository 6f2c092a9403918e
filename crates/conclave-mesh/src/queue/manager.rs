//! Registry of named queues

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use super::{LocalMessageQueue, QueueConfiguration, QueueType};
use crate::error::MeshResult;
use crate::stats::QueueStats;

/// Owns the queues of one process or one shared mesh context
#[derive(Default)]
pub struct LocalQueueManager {
    queues: RwLock<HashMap<String, Arc<LocalMessageQueue>>>,
}

impl LocalQueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the queue called `name`, creating and starting it if absent
    ///
    /// An existing queue is returned as is; `queue_type` and `config` only
    /// apply to a newly created one.
    pub async fn create_queue(
        &self,
        name: &str,
        queue_type: QueueType,
        config: QueueConfiguration,
    ) -> MeshResult<Arc<LocalMessageQueue>> {
        if let Some(queue) = self.queues.read().await.get(name) {
            return Ok(Arc::clone(queue));
        }

        let mut queues = self.queues.write().await;
        if let Some(queue) = queues.get(name) {
            return Ok(Arc::clone(queue));
        }

        let queue = Arc::new(LocalMessageQueue::new(name, queue_type, config)?);
        queue.start().await;
        queues.insert(name.to_string(), Arc::clone(&queue));

        info!(queue_name = %name, "Queue created");
        Ok(queue)
    }

    pub async fn get_queue(&self, name: &str) -> Option<Arc<LocalMessageQueue>> {
        self.queues.read().await.get(name).cloned()
    }

    /// Stop and forget a queue; returns `false` if it did not exist
    pub async fn delete_queue(&self, name: &str) -> bool {
        let Some(queue) = self.queues.write().await.remove(name) else {
            return false;
        };
        queue.stop().await;

        info!(queue_name = %name, "Queue deleted");
        true
    }

    /// Stop every queue but keep it registered
    ///
    /// Stopped queues keep their messages and can be started again.
    pub async fn stop_all(&self) {
        let queues: Vec<_> = self.queues.read().await.values().cloned().collect();
        for queue in &queues {
            queue.stop().await;
        }

        info!(count = queues.len(), "All queues stopped");
    }

    /// Stop every queue and empty the registry
    pub async fn shutdown_all(&self) {
        let queues: Vec<_> = self.queues.write().await.drain().collect();
        let count = queues.len();
        for (_, queue) in queues {
            queue.stop().await;
        }

        info!(count, "All queues shut down");
    }

    pub async fn list_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn stats(&self) -> BTreeMap<String, QueueStats> {
        let queues: Vec<_> = self.queues.read().await.values().cloned().collect();

        let mut stats = BTreeMap::new();
        for queue in queues {
            stats.insert(queue.name().to_string(), queue.stats().await);
        }
        stats
    }
}
