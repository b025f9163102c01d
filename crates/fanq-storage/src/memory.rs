//! In-memory storage backend
//!
//! Fast, non-persistent storage. All data is lost when the process exits.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fanq_types::{Error, Message, MessageId, Queue, QueueStats, Result};
use tracing::{debug, info};

use crate::traits::StorageEngine;

/// Internal queue data structure
struct QueueData {
    /// Queue metadata
    queue: Queue,
    /// Messages in the queue (pending)
    messages: VecDeque<Message>,
    /// Messages currently being processed (delivered but not acked)
    in_flight: HashMap<MessageId, Message>,
}

impl QueueData {
    fn new(queue: Queue) -> Self {
        Self {
            queue,
            messages: VecDeque::new(),
            in_flight: HashMap::new(),
        }
    }
}

/// In-memory storage implementation
///
/// Each queue sits in its own `DashMap` slot, so operations on one queue
/// never contend with operations on queues in other shards.
pub struct MemoryStorage {
    /// Queues stored by name
    queues: DashMap<String, QueueData>,
}

impl MemoryStorage {
    /// Create a new in-memory storage
    pub fn new() -> Self {
        info!("Initializing in-memory storage");
        Self {
            queues: DashMap::new(),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageEngine for MemoryStorage {
    // ==================== Queue Operations ====================

    async fn create_queue(&self, queue: Queue) -> Result<Queue> {
        match self.queues.entry(queue.name.clone()) {
            Entry::Occupied(entry) => Err(Error::QueueAlreadyExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                debug!(queue = %queue.name, "Queue stored");
                entry.insert(QueueData::new(queue.clone()));
                Ok(queue)
            }
        }
    }

    async fn get_queue(&self, name: &str) -> Result<Option<Queue>> {
        Ok(self.queues.get(name).map(|q| q.queue.clone()))
    }

    async fn list_queues(&self) -> Result<Vec<Queue>> {
        Ok(self.queues.iter().map(|q| q.queue.clone()).collect())
    }

    async fn delete_queue(&self, name: &str) -> Result<Queue> {
        match self.queues.remove(name) {
            Some((_, data)) => {
                debug!(
                    queue = %name,
                    dropped = data.messages.len() + data.in_flight.len(),
                    "Queue removed from storage"
                );
                Ok(data.queue)
            }
            None => Err(Error::QueueNotFound(name.to_string())),
        }
    }

    async fn get_queue_stats(&self, name: &str) -> Result<QueueStats> {
        let queue_data = self
            .queues
            .get(name)
            .ok_or_else(|| Error::QueueNotFound(name.to_string()))?;

        let pending_count = queue_data.messages.len() as u64;
        let in_flight_count = queue_data.in_flight.len() as u64;
        let size_bytes: u64 = queue_data
            .messages
            .iter()
            .map(|m| m.body.len() as u64)
            .sum();

        Ok(QueueStats {
            message_count: pending_count + in_flight_count,
            pending_count,
            in_flight_count,
            size_bytes,
            consumer_count: 0,
        })
    }

    // ==================== Message Operations ====================

    async fn push_message(&self, queue_name: &str, message: Message) -> Result<MessageId> {
        let mut queue_data = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_string()))?;

        let message_id = message.id.clone();
        queue_data.messages.push_back(message);

        debug!(
            queue = %queue_name,
            message_id = %message_id,
            "Message pushed"
        );

        Ok(message_id)
    }

    async fn pop_message(&self, queue_name: &str) -> Result<Option<Message>> {
        let mut queue_data = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_string()))?;

        let Some(mut message) = queue_data.messages.pop_front() else {
            return Ok(None);
        };

        message.delivery_count += 1;

        // Move to in-flight
        let message_clone = message.clone();
        queue_data.in_flight.insert(message.id.clone(), message);

        debug!(
            queue = %queue_name,
            message_id = %message_clone.id,
            delivery_count = message_clone.delivery_count,
            "Message popped"
        );

        Ok(Some(message_clone))
    }

    async fn ack_message(&self, queue_name: &str, message_id: &MessageId) -> Result<()> {
        let mut queue_data = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_string()))?;

        match queue_data.in_flight.remove(message_id) {
            Some(_) => {
                debug!(
                    queue = %queue_name,
                    message_id = %message_id,
                    "Message acknowledged"
                );
                Ok(())
            }
            None => Err(Error::MessageNotFound(message_id.to_string())),
        }
    }

    async fn nack_message(
        &self,
        queue_name: &str,
        message_id: &MessageId,
        requeue: bool,
    ) -> Result<()> {
        let mut queue_data = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_string()))?;

        match queue_data.in_flight.remove(message_id) {
            Some(message) => {
                if requeue {
                    queue_data.messages.push_front(message);
                    debug!(
                        queue = %queue_name,
                        message_id = %message_id,
                        "Message returned to queue"
                    );
                } else {
                    debug!(
                        queue = %queue_name,
                        message_id = %message_id,
                        "Message rejected and dropped"
                    );
                }
                Ok(())
            }
            None => Err(Error::MessageNotFound(message_id.to_string())),
        }
    }

    async fn purge_queue(&self, queue_name: &str) -> Result<u64> {
        let mut queue_data = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_string()))?;

        let count = (queue_data.messages.len() + queue_data.in_flight.len()) as u64;
        queue_data.messages.clear();
        queue_data.in_flight.clear();

        info!(queue = %queue_name, count = count, "Queue purged");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get_queue() {
        let storage = MemoryStorage::new();
        storage.create_queue(Queue::new("jobs")).await.unwrap();

        let retrieved = storage.get_queue("jobs").await.unwrap();
        assert_eq!(retrieved.map(|q| q.name), Some("jobs".to_string()));
    }

    #[tokio::test]
    async fn test_create_duplicate_queue() {
        let storage = MemoryStorage::new();
        storage.create_queue(Queue::new("jobs")).await.unwrap();

        let err = storage.create_queue(Queue::new("jobs")).await.unwrap_err();
        assert!(matches!(err, Error::QueueAlreadyExists(name) if name == "jobs"));
    }

    #[tokio::test]
    async fn test_push_and_pop_preserves_order() {
        let storage = MemoryStorage::new();
        storage.create_queue(Queue::new("test")).await.unwrap();

        for i in 0..3 {
            storage
                .push_message("test", Message::new(format!("m{}", i)))
                .await
                .unwrap();
        }

        for i in 0..3 {
            let msg = storage.pop_message("test").await.unwrap().unwrap();
            assert_eq!(msg.body_as_str(), Some(format!("m{}", i).as_str()));
            assert_eq!(msg.delivery_count, 1);
        }
        assert!(storage.pop_message("test").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ack_message() {
        let storage = MemoryStorage::new();
        storage.create_queue(Queue::new("test")).await.unwrap();
        storage.push_message("test", Message::new("test")).await.unwrap();

        let received = storage.pop_message("test").await.unwrap().unwrap();
        storage.ack_message("test", &received.id).await.unwrap();

        let stats = storage.get_queue_stats("test").await.unwrap();
        assert_eq!(stats.message_count, 0);

        let err = storage.ack_message("test", &received.id).await.unwrap_err();
        assert!(matches!(err, Error::MessageNotFound(_)));
    }

    #[tokio::test]
    async fn test_nack_requeue_goes_to_head() {
        let storage = MemoryStorage::new();
        storage.create_queue(Queue::new("test")).await.unwrap();
        storage.push_message("test", Message::new("first")).await.unwrap();
        storage.push_message("test", Message::new("second")).await.unwrap();

        let first = storage.pop_message("test").await.unwrap().unwrap();
        storage.nack_message("test", &first.id, true).await.unwrap();

        let again = storage.pop_message("test").await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.delivery_count, 2);
        assert!(again.is_redelivery());
    }

    #[tokio::test]
    async fn test_nack_without_requeue_drops() {
        let storage = MemoryStorage::new();
        storage.create_queue(Queue::new("test")).await.unwrap();
        storage.push_message("test", Message::new("bad")).await.unwrap();

        let msg = storage.pop_message("test").await.unwrap().unwrap();
        storage.nack_message("test", &msg.id, false).await.unwrap();

        let stats = storage.get_queue_stats("test").await.unwrap();
        assert_eq!(stats, QueueStats::default());
    }

    #[tokio::test]
    async fn test_delete_queue() {
        let storage = MemoryStorage::new();
        storage.create_queue(Queue::new("test")).await.unwrap();
        storage.push_message("test", Message::new("x")).await.unwrap();

        let deleted = storage.delete_queue("test").await.unwrap();
        assert_eq!(deleted.name, "test");

        assert!(storage.get_queue("test").await.unwrap().is_none());
        let err = storage.push_message("test", Message::new("y")).await.unwrap_err();
        assert!(matches!(err, Error::QueueNotFound(_)));
    }

    #[tokio::test]
    async fn test_purge_queue() {
        let storage = MemoryStorage::new();
        storage.create_queue(Queue::new("test")).await.unwrap();
        storage.push_message("test", Message::new("a")).await.unwrap();
        storage.push_message("test", Message::new("b")).await.unwrap();
        storage.pop_message("test").await.unwrap();

        assert_eq!(storage.purge_queue("test").await.unwrap(), 2);
        let stats = storage.get_queue_stats("test").await.unwrap();
        assert_eq!(stats.message_count, 0);
    }
}
