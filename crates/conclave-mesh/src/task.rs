//! Cooperative background loops
//!
//! A loop receives a `watch` flag and is expected to leave at its next await
//! point once the flag flips to `true`.

use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::error;

pub(crate) struct BackgroundTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub(crate) fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(body(shutdown_rx));
        Self { shutdown, handle }
    }

    /// Signal shutdown and wait for the loop to exit
    pub(crate) async fn stop(self, name: &str) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await
            && !e.is_cancelled()
        {
            error!(task = name, error = %e, "Background task terminated abnormally");
        }
    }
}

/// Resolve once shutdown is requested or the sender is gone
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
