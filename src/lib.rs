//! dutymail: mailbox connection pool and concurrent multi-mailbox search
//!
//! The engine behind the internal daily-duties dashboard and email client.
//! It keeps a pool of authenticated sessions to the departmental mail store,
//! health-checks and transparently replaces dead sessions, runs a background
//! keep-alive sweep, and fans a search out across the mailbox roster in
//! parallel, merging and paginating results in global date order. Ticketing,
//! rendering, and authentication are external collaborators; they consume
//! this crate through [`MailEngine`].
//!
//! # Architecture
//!
//! - [`config`]: Environment-driven configuration for the account and engine knobs
//! - [`errors`]: Typed error model shared by every module
//! - [`store`]: Mail store capability trait and fetch row types
//! - [`imap`]: TLS transport and the real `MailStore` over `async-imap`, timeout-bounded
//! - [`pool`]: Connection pool (arena of slots, one bookkeeping mutex, no I/O under it)
//! - [`keepalive`]: Recurring background sweep of idle pooled connections
//! - [`batch`]: The ≤500 UID batching rule used by every batch operation
//! - [`summary`]: Summary building: header decoding and display-sender selection
//! - [`models`]: Result DTOs and the clamped search range
//! - [`engine`]: Search/aggregation orchestration and the dashboard operations

pub mod batch;
pub mod config;
pub mod engine;
pub mod errors;
pub mod imap;
pub mod keepalive;
pub mod models;
pub mod pool;
pub mod store;
pub mod summary;

pub use config::{EngineConfig, ExhaustionPolicy};
pub use engine::MailEngine;
pub use errors::{EngineError, EngineResult};
pub use keepalive::KeepAliveSweeper;
pub use models::{DutyCounts, MessageSummary, SearchRange, VoicemailSummary};
pub use pool::{ConnHandle, ConnectionPool};
pub use store::{Connector, MailStore};
