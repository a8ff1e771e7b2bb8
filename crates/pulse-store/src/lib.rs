//! # pulse-store
//!
//! Store backends for Pulse. The shared store is the substrate every
//! node converges through: hashes persist per-scope presence state and
//! pub/sub channels propagate it live. Supports two modes:
//!
//! - **memory**: in-process backend for tests and single-node deployments
//! - **redis-backend**: Redis, for real multi-node clusters
//!
//! The backend is selected at runtime based on configuration.

pub mod keys;
#[cfg(feature = "memory")]
pub mod memory;
pub mod provider;
#[cfg(feature = "redis-backend")]
pub mod redis;

pub use provider::StoreManager;
