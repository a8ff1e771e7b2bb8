//! # pulse-presence
//!
//! The distributed presence engine for Pulse. Provides:
//!
//! - Per-scope presence reconciliation with reference-counted clients
//! - Disconnect grace queue absorbing transient reconnects
//! - Node liveness protocol (sentry) with dead-peer reconciliation
//! - Protocol resource adapting client operations to the manager
//! - Per-node engine wiring scopes to the sentry
//!
//! Nodes converge through the shared store: every presence transition is
//! persisted in the scope's hash and published on the scope's channel,
//! and every node (including the origin) folds those messages into its
//! own merged view.

pub mod engine;
pub mod grace;
pub mod manager;
pub mod message;
pub mod resource;
pub mod sentry;
pub mod store;

pub use engine::PresenceEngine;
pub use manager::{PresenceEvent, PresenceManager};
pub use resource::{ClientSession, PresenceResource};
pub use sentry::{Sentry, SentryEvent};
