//! FanQ Storage - Queue storage backends for the pub/sub broker
//!
//! This crate provides pluggable storage implementations.
//! Currently supports:
//! - In-memory storage (default)
//!
//! Messages are never written to durable storage.

pub mod traits;

#[cfg(feature = "memory")]
pub mod memory;

// Re-exports
pub use traits::StorageEngine;

#[cfg(feature = "memory")]
pub use memory::MemoryStorage;
