//! The action consumer: takes messages off the queue, materializes an
//! `ActionInvocation` row, executes the plugin under a timeout inside a
//! bounded concurrency slot, and writes exactly one finalizing update per
//! row. Retries re-enqueue a fresh attempt after a backoff delay -- the old
//! row stays finalized as `RETRYING`.

mod config;
mod consumer;

pub use config::{ConsumerConfig, backoff_delay_ms};
pub use consumer::ActionConsumer;
