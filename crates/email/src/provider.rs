use async_trait::async_trait;
use parking_lot::Mutex;

use crate::message::{EmailError, EmailMessage};

/// Pluggable delivery backend.
///
/// Implementations receive messages that already passed
/// [`EmailMessage::validate`]; they own transport concerns only.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError>;
}

/// Outbox provider for tests: records every message instead of sending.
#[derive(Debug, Default)]
pub struct MemoryEmailProvider {
    outbox: Mutex<Vec<EmailMessage>>,
}

impl MemoryEmailProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages sent so far.
    #[must_use]
    pub fn outbox(&self) -> Vec<EmailMessage> {
        self.outbox.lock().clone()
    }

    /// The most recent message addressed to `address`.
    #[must_use]
    pub fn last_to(&self, address: &str) -> Option<EmailMessage> {
        self.outbox
            .lock()
            .iter()
            .rev()
            .find(|m| m.to.iter().any(|a| a.address == address))
            .cloned()
    }
}

#[async_trait]
impl EmailProvider for MemoryEmailProvider {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        message.validate()?;
        self.outbox.lock().push(message.clone());
        Ok(())
    }
}
