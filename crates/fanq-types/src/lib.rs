//! FanQ Types - Core domain types for the pub/sub broker
//!
//! This crate contains all shared types used across FanQ components.

pub mod connection;
pub mod error;
pub mod exchange;
pub mod message;
pub mod queue;

// Re-export commonly used types
pub use connection::{AckMode, ConnectionId, ConsumerState, ConsumerTag};
pub use error::{Error, Result};
pub use exchange::{Binding, Exchange, ExchangeKind};
pub use message::{Message, MessageId};
pub use queue::{generate_queue_name, Queue, QueueStats};
