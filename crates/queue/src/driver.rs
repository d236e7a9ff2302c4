use async_trait::async_trait;
use thiserror::Error;

use crate::message::ActionMessage;

/// Errors from queue drivers.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue is shut down or otherwise unable to accept messages.
    #[error("enqueue failed: {0}")]
    Enqueue(String),

    /// A consumer is already attached; the queue is single-subscriber.
    #[error("a consumer is already attached")]
    ConsumerAttached,

    /// A backend error occurred.
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Handler invoked for each delivered message.
///
/// The handler must not panic; failures are expected to be absorbed into the
/// invocation row it manages.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, msg: ActionMessage);
}

/// Pluggable queue backend for action messages.
///
/// Delivery is at-least-once; consumers must tolerate duplicates.
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Enqueue a message for the attached consumer.
    async fn enqueue_action(&self, msg: ActionMessage) -> Result<(), QueueError>;

    /// Attach the single consumer. Fails if one is already attached.
    async fn consume_actions(
        &self,
        handler: std::sync::Arc<dyn ActionHandler>,
    ) -> Result<(), QueueError>;

    /// Stop delivering messages and wait for in-flight handlers to finish.
    async fn shutdown(&self);
}
