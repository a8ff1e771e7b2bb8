//! Redis store backend.

pub mod client;
pub mod operations;

pub use client::RedisStoreClient;
pub use operations::RedisStoreProvider;
