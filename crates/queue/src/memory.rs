use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::driver::{ActionHandler, QueueDriver, QueueError};
use crate::message::ActionMessage;

/// In-memory reference queue over an unbounded tokio channel.
///
/// Single process, single subscriber. The consumer loop hands each message
/// to the handler on its own task -- delivery order follows enqueue order,
/// and any concurrency bound is the handler's to enforce.
pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<ActionMessage>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ActionMessage>>>,
    tracker: TaskTracker,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            tracker: TaskTracker::new(),
        }
    }
}

#[async_trait]
impl QueueDriver for MemoryQueue {
    async fn enqueue_action(&self, msg: ActionMessage) -> Result<(), QueueError> {
        self.tx
            .send(msg)
            .map_err(|e| QueueError::Enqueue(e.to_string()))
    }

    async fn consume_actions(
        &self,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<(), QueueError> {
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or(QueueError::ConsumerAttached)?;

        let tracker = self.tracker.clone();
        self.tracker.spawn(async move {
            while let Some(msg) = rx.recv().await {
                let handler = handler.clone();
                tracker.spawn(async move { handler.handle(msg).await });
            }
            debug!("action queue drained, consumer loop exiting");
        });
        Ok(())
    }

    async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
