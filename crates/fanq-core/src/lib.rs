//! FanQ Core - Pub/sub broker logic
//!
//! This crate contains:
//! - ExchangeRegistry: exchange declaration, bindings and routing
//! - QueueManager: queue lifecycle, FIFOs and consumer slots
//! - Publisher: routes messages into bound queues
//! - Consumer: cancellable per-subscription delivery loop
//! - Connection: the transport boundary and its in-memory implementation
//! - Broker: façade tying the above together

pub mod broker;
pub mod connection;
pub mod consumer;
pub mod exchange;
pub mod publisher;
pub mod queue_manager;

// Re-exports
pub use broker::Broker;
pub use connection::{Connection, Connector, LocalConnection, LocalConnector};
pub use consumer::{handler_fn, Consumer, Delivery, FnHandler, MessageHandler, TransportLink};
pub use exchange::ExchangeRegistry;
pub use publisher::Publisher;
pub use queue_manager::QueueManager;
