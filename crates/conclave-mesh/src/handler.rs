//! Handler traits invoked by the router and by queue consumers
//!
//! Both traits have blanket implementations for async closures, so most
//! callers never implement them by hand:
//!
//! ```rust
//! use conclave_mesh::{Message, MessageHandler, MeshResult};
//! use std::sync::Arc;
//!
//! let handler: Arc<dyn MessageHandler> = Arc::new(|message: Message| async move {
//!     tracing::info!(message_id = %message.message_id, "received");
//!     MeshResult::Ok(())
//! });
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use uuid::Uuid;

use crate::{error::MeshResult, message::Message};

/// Delivery target used by the router
///
/// Returning an error marks the delivery attempt as failed; the router then
/// retries or dead-letters the message according to its retry budget.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> MeshResult<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MeshResult<()>> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> MeshResult<()> {
        (self)(message.clone()).await
    }
}

/// Processing function of a queue consumer
///
/// `Ok(true)` acknowledges the message, `Ok(false)` rejects it. An error is
/// logged and treated as a rejection without requeue.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn consume(&self, message: &Message) -> MeshResult<bool>;
}

#[async_trait]
impl<F, Fut> ConsumerHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MeshResult<bool>> + Send + 'static,
{
    async fn consume(&self, message: &Message) -> MeshResult<bool> {
        (self)(message.clone()).await
    }
}

/// Registration handle for a broadcast handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(Uuid);

impl HandlerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandlerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;
    use crate::message::{MessageType, Payload};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample() -> Message {
        Message::new("a", "b", MessageType::Heartbeat, "s", Payload::new())
    }

    #[tokio::test]
    async fn test_closure_message_handler() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handler: Arc<dyn MessageHandler> = Arc::new(move |_message: Message| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                MeshResult::Ok(())
            }
        });

        handler.handle(&sample()).await.unwrap();
        handler.handle(&sample()).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closure_consumer_handler_error() {
        let handler: Arc<dyn ConsumerHandler> = Arc::new(|_message: Message| async {
            MeshResult::<bool>::Err(MeshError::handler("boom"))
        });

        let result = handler.consume(&sample()).await;
        assert!(matches!(result, Err(MeshError::HandlerFailed(reason)) if reason == "boom"));
    }

    #[test]
    fn test_handler_ids_are_unique() {
        assert_ne!(HandlerId::new(), HandlerId::new());
    }
}
