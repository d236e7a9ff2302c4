//! Email delivery for Latchflow's auth ceremonies and notification actions.
//!
//! [`EmailMessage`] normalizes and validates addresses up front so every
//! backend sees the same shape; [`EmailProvider`] is the delivery seam. The
//! SMTP backend rides on `lettre`; the in-memory outbox backs the tests.

mod message;
mod provider;
mod smtp;

pub use message::{EmailAddress, EmailError, EmailMessage};
pub use provider::{EmailProvider, MemoryEmailProvider};
pub use smtp::{SmtpConfig, SmtpProvider};
