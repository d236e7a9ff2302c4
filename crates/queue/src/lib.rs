//! Action message transport for Latchflow.
//!
//! The trigger runner enqueues one [`ActionMessage`] per resolved pipeline
//! step; the action consumer attaches a handler via
//! [`QueueDriver::consume_actions`]. Delivery is at-least-once and the
//! consumer is a single subscriber -- duplicate tolerance lives entirely in
//! the `ActionInvocation` row (a retry creates a new row, never a re-run of
//! the old one).

mod driver;
mod memory;
mod message;

pub use driver::{ActionHandler, QueueDriver, QueueError};
pub use memory::MemoryQueue;
pub use message::ActionMessage;
