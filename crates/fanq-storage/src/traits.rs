//! Storage engine trait definition
//!
//! Defines the interface that all queue backends must implement. A backend
//! only stores queues and their messages; routing, consumers and wake-ups
//! live in `fanq-core`.

use async_trait::async_trait;
use fanq_types::{Message, MessageId, Queue, QueueStats, Result};

/// Storage engine trait - all backends implement this
///
/// Every method must complete without waiting on other callers beyond
/// lock acquisition, and push/pop on one queue must be linearizable.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    // ==================== Queue Operations ====================

    /// Create a new queue, failing with `QueueAlreadyExists` if the name is taken
    async fn create_queue(&self, queue: Queue) -> Result<Queue>;

    /// Get a queue by name
    async fn get_queue(&self, name: &str) -> Result<Option<Queue>>;

    /// List all queues
    async fn list_queues(&self) -> Result<Vec<Queue>>;

    /// Delete a queue and all its messages
    async fn delete_queue(&self, name: &str) -> Result<Queue>;

    /// Get queue statistics (consumer count is filled in by the caller)
    async fn get_queue_stats(&self, name: &str) -> Result<QueueStats>;

    // ==================== Message Operations ====================

    /// Append a message to the tail of a queue
    async fn push_message(&self, queue_name: &str, message: Message) -> Result<MessageId>;

    /// Take the head of a queue and move it in flight
    async fn pop_message(&self, queue_name: &str) -> Result<Option<Message>>;

    /// Acknowledge an in-flight message (remove it for good)
    async fn ack_message(&self, queue_name: &str, message_id: &MessageId) -> Result<()>;

    /// Return an in-flight message to the head of the queue, or drop it
    async fn nack_message(
        &self,
        queue_name: &str,
        message_id: &MessageId,
        requeue: bool,
    ) -> Result<()>;

    /// Delete all pending and in-flight messages from a queue
    async fn purge_queue(&self, queue_name: &str) -> Result<u64>;
}
