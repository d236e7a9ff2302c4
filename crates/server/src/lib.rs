//! The Latchflow HTTP server.
//!
//! Thin route wiring over the core crates: the admin API (bundles, files,
//! recipients, definitions, pipelines), the recipient portal subset, the
//! three auth ceremonies, and the streaming download path. Handlers return
//! [`error::ServerError`], which renders the uniform
//! `{"status":"error","code",...,"message":...}` body.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod ratelimit;
