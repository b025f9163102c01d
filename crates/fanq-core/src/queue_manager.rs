//! Queue manager
//!
//! Creates and deletes queues, feeds messages into their FIFOs and tracks
//! which consumers are attached. Message storage is delegated to a
//! [`StorageEngine`]; this layer adds consumer slots and wake-ups for
//! blocked receivers.

use std::sync::Arc;

use dashmap::DashMap;
use fanq_storage::StorageEngine;
use fanq_types::{
    ConnectionId, ConsumerTag, Error, Message, MessageId, Queue, QueueStats, Result,
};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::exchange::ExchangeRegistry;

/// Runtime state kept next to each stored queue
#[derive(Default)]
struct QueueSlot {
    /// Wakes receivers blocked on an empty queue
    notify: Arc<Notify>,
    /// Attached consumers
    consumers: Vec<ConsumerTag>,
}

/// Queue manager
pub struct QueueManager {
    storage: Arc<dyn StorageEngine>,
    exchanges: Arc<ExchangeRegistry>,
    slots: DashMap<String, QueueSlot>,
}

impl QueueManager {
    /// Create a queue manager over a storage backend
    pub fn new(storage: Arc<dyn StorageEngine>, exchanges: Arc<ExchangeRegistry>) -> Self {
        Self {
            storage,
            exchanges,
            slots: DashMap::new(),
        }
    }

    // ==================== Queue Lifecycle ====================

    /// Declare a queue
    ///
    /// An empty name creates an anonymous exclusive queue with a generated
    /// name. A named queue is created, or returned as-is when it already
    /// exists with the same exclusivity.
    pub async fn declare(
        &self,
        name: &str,
        exclusive: bool,
        owner: Option<&ConnectionId>,
    ) -> Result<Queue> {
        if name.is_empty() {
            let queue = self.storage.create_queue(Queue::anonymous(owner.cloned())).await?;
            self.slots.entry(queue.name.clone()).or_default();
            info!(queue = %queue.name, "Anonymous queue declared");
            return Ok(queue);
        }

        if let Some(existing) = self.storage.get_queue(name).await? {
            return Self::check_redeclare(existing, exclusive, owner);
        }

        let queue = if exclusive {
            Queue::exclusive(name, owner.cloned())
        } else {
            Queue::new(name)
        };

        match self.storage.create_queue(queue).await {
            Ok(queue) => {
                self.slots.entry(queue.name.clone()).or_default();
                info!(queue = %queue.name, exclusive = exclusive, "Queue declared");
                Ok(queue)
            }
            // Lost a race against a concurrent declare of the same name
            Err(Error::QueueAlreadyExists(_)) => {
                let existing = self
                    .storage
                    .get_queue(name)
                    .await?
                    .ok_or_else(|| Error::QueueNotFound(name.to_string()))?;
                Self::check_redeclare(existing, exclusive, owner)
            }
            Err(e) => Err(e),
        }
    }

    fn check_redeclare(
        existing: Queue,
        exclusive: bool,
        owner: Option<&ConnectionId>,
    ) -> Result<Queue> {
        if existing.exclusive != exclusive {
            return Err(Error::ConfigConflict(format!(
                "queue '{}' already declared with exclusive={}",
                existing.name, existing.exclusive
            )));
        }
        if existing.owner.is_some() && existing.owner.as_ref() != owner {
            return Err(Error::ExclusivityViolation(format!(
                "queue '{}' is owned by another connection",
                existing.name
            )));
        }
        Ok(existing)
    }

    /// Get a queue by name
    pub async fn get(&self, name: &str) -> Result<Option<Queue>> {
        self.storage.get_queue(name).await
    }

    /// Get a queue by name, failing with `QueueNotFound`
    pub async fn require(&self, name: &str) -> Result<Queue> {
        self.storage
            .get_queue(name)
            .await?
            .ok_or_else(|| Error::QueueNotFound(name.to_string()))
    }

    /// List all queues
    pub async fn list(&self) -> Result<Vec<Queue>> {
        self.storage.list_queues().await
    }

    /// Delete a queue, its messages and every binding that targets it
    ///
    /// Receivers blocked on the queue wake up and observe `QueueNotFound`.
    pub async fn delete_queue(&self, name: &str) -> Result<Queue> {
        let queue = self.storage.delete_queue(name).await?;
        self.exchanges.remove_queue(name);

        if let Some((_, slot)) = self.slots.remove(name) {
            slot.notify.notify_waiters();
        }

        info!(queue = %name, "Queue deleted");
        Ok(queue)
    }

    /// Delete every exclusive queue owned by a connection
    pub async fn release_connection(&self, connection: &ConnectionId) -> Result<Vec<String>> {
        let owned: Vec<String> = self
            .storage
            .list_queues()
            .await?
            .into_iter()
            .filter(|q| q.is_owned_by(connection))
            .map(|q| q.name)
            .collect();

        let mut deleted = Vec::with_capacity(owned.len());
        for name in owned {
            match self.delete_queue(&name).await {
                Ok(_) => deleted.push(name),
                // Already removed by a terminating consumer
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if !deleted.is_empty() {
            debug!(connection = %connection, count = deleted.len(), "Released exclusive queues");
        }
        Ok(deleted)
    }

    /// Get queue statistics including attached consumers
    pub async fn stats(&self, name: &str) -> Result<QueueStats> {
        let mut stats = self.storage.get_queue_stats(name).await?;
        stats.consumer_count = self
            .slots
            .get(name)
            .map(|slot| slot.consumers.len() as u64)
            .unwrap_or(0);
        Ok(stats)
    }

    /// Purge all messages from a queue
    pub async fn purge(&self, name: &str) -> Result<u64> {
        self.storage.purge_queue(name).await
    }

    // ==================== Messages ====================

    /// Append a message to a queue and wake one receiver
    pub async fn enqueue(&self, name: &str, message: Message) -> Result<MessageId> {
        let id = self.storage.push_message(name, message).await?;
        if let Some(slot) = self.slots.get(name) {
            slot.notify.notify_one();
        }
        Ok(id)
    }

    /// Take the next message if one is pending
    pub async fn try_dequeue(&self, name: &str) -> Result<Option<Message>> {
        self.storage.pop_message(name).await
    }

    /// Wait for the next message of a queue
    ///
    /// There is no timeout: the call waits until a message arrives or the
    /// queue is deleted. Dropping the future before it completes never
    /// loses a message, so it can sit in a `select!` next to cancellation.
    pub async fn receive(&self, name: &str) -> Result<Message> {
        loop {
            let notify = self.notify_handle(name)?;
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent enqueue cannot slip
            // between the empty check and the wait.
            notified.as_mut().enable();

            if let Some(message) = self.storage.pop_message(name).await? {
                return Ok(message);
            }

            notified.await;
        }
    }

    /// Acknowledge an in-flight message
    pub async fn ack(&self, name: &str, message_id: &MessageId) -> Result<()> {
        self.storage.ack_message(name, message_id).await
    }

    /// Reject an in-flight message, optionally returning it to the head
    pub async fn nack(&self, name: &str, message_id: &MessageId, requeue: bool) -> Result<()> {
        self.storage.nack_message(name, message_id, requeue).await?;
        if requeue {
            if let Some(slot) = self.slots.get(name) {
                slot.notify.notify_one();
            }
        }
        Ok(())
    }

    fn notify_handle(&self, name: &str) -> Result<Arc<Notify>> {
        self.slots
            .get(name)
            .map(|slot| Arc::clone(&slot.notify))
            .ok_or_else(|| Error::QueueNotFound(name.to_string()))
    }

    // ==================== Consumers ====================

    /// Attach a consumer to a queue
    ///
    /// Fails with `ExclusivityViolation` when the queue is exclusive and
    /// already has a consumer, or belongs to another connection.
    pub async fn attach_consumer(
        &self,
        name: &str,
        tag: &ConsumerTag,
        connection: Option<&ConnectionId>,
    ) -> Result<Queue> {
        let queue = self.require(name).await?;

        if queue.owner.is_some() && queue.owner.as_ref() != connection {
            return Err(Error::ExclusivityViolation(format!(
                "queue '{}' is owned by another connection",
                name
            )));
        }

        let mut slot = self
            .slots
            .get_mut(name)
            .ok_or_else(|| Error::QueueNotFound(name.to_string()))?;

        if queue.exclusive && !slot.consumers.is_empty() {
            return Err(Error::ExclusivityViolation(format!(
                "exclusive queue '{}' already has a consumer",
                name
            )));
        }

        slot.consumers.push(tag.clone());
        debug!(queue = %name, consumer = %tag, "Consumer attached");
        Ok(queue)
    }

    /// Release a consumer's attachment; no-op if it is not attached
    pub fn detach_consumer(&self, name: &str, tag: &ConsumerTag) {
        if let Some(mut slot) = self.slots.get_mut(name) {
            let before = slot.consumers.len();
            slot.consumers.retain(|t| t != tag);
            if slot.consumers.len() != before {
                debug!(queue = %name, consumer = %tag, "Consumer detached");
            }
        }
    }
}
