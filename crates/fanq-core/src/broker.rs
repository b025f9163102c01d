//! Broker - Main pub/sub orchestrator
//!
//! The Broker owns the exchange registry, the queue manager and the
//! publisher, and is what connections and the HTTP API talk to.

use std::sync::Arc;

use fanq_storage::StorageEngine;
use fanq_types::{
    AckMode, Binding, ConnectionId, Error, Exchange, ExchangeKind, Message, Queue, QueueStats,
    Result,
};
use tracing::info;

use crate::consumer::{Consumer, MessageHandler};
use crate::exchange::ExchangeRegistry;
use crate::publisher::Publisher;
use crate::queue_manager::QueueManager;

/// Main message broker
pub struct Broker {
    exchanges: Arc<ExchangeRegistry>,
    queues: Arc<QueueManager>,
    publisher: Publisher,
}

impl Broker {
    /// Create a new broker with the given storage backend
    pub fn new(storage: impl StorageEngine + 'static) -> Self {
        Self::with_storage(Arc::new(storage))
    }

    /// Create a new broker with an Arc storage
    pub fn with_storage(storage: Arc<dyn StorageEngine>) -> Self {
        info!("Initializing FanQ broker");
        let exchanges = Arc::new(ExchangeRegistry::new());
        let queues = Arc::new(QueueManager::new(storage, Arc::clone(&exchanges)));
        let publisher = Publisher::new(Arc::clone(&exchanges), Arc::clone(&queues));
        Self {
            exchanges,
            queues,
            publisher,
        }
    }

    /// The exchange registry
    pub fn exchanges(&self) -> &Arc<ExchangeRegistry> {
        &self.exchanges
    }

    /// The queue manager
    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    // ==================== Exchange Operations ====================

    /// Declare an exchange (idempotent for the same kind)
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<Exchange> {
        self.exchanges.declare(name, kind)
    }

    /// Get an exchange by name
    pub fn get_exchange(&self, name: &str) -> Option<Exchange> {
        self.exchanges.get(name)
    }

    /// List all exchanges
    pub fn list_exchanges(&self) -> Vec<Exchange> {
        self.exchanges.list()
    }

    /// Delete an exchange and its bindings
    pub fn delete_exchange(&self, name: &str) -> Result<Exchange> {
        self.exchanges.delete(name)
    }

    /// Bindings of an exchange
    pub fn bindings(&self, exchange: &str) -> Result<Vec<Binding>> {
        self.exchanges.bindings(exchange)
    }

    /// Bind a queue to an exchange
    pub async fn bind(&self, exchange: &str, queue: &str) -> Result<()> {
        self.bind_with_key(exchange, queue, "").await
    }

    /// Bind a queue to an exchange under a binding key
    pub async fn bind_with_key(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        let queue = self.queues.require(queue).await?;
        self.exchanges.bind_with_key(exchange, &queue, routing_key)?;

        // The queue may have been deleted between the lookup and the bind
        let current = self.queues.get(&queue.name).await?;
        if current.map_or(true, |q| q.created_at != queue.created_at) {
            self.exchanges
                .unbind_with_key(exchange, &queue.name, routing_key);
            return Err(Error::QueueNotFound(queue.name));
        }
        Ok(())
    }

    /// Remove a binding; no-op if absent
    pub fn unbind(&self, exchange: &str, queue: &str) {
        self.exchanges.unbind(exchange, queue)
    }

    /// Remove a keyed binding; no-op if absent
    pub fn unbind_with_key(&self, exchange: &str, queue: &str, routing_key: &str) {
        self.exchanges.unbind_with_key(exchange, queue, routing_key)
    }

    // ==================== Queue Operations ====================

    /// Declare a queue; an empty name creates an anonymous exclusive queue
    pub async fn declare_queue(&self, name: &str, exclusive: bool) -> Result<Queue> {
        self.queues.declare(name, exclusive, None).await
    }

    /// Declare a queue on behalf of a connection
    pub async fn declare_queue_for(
        &self,
        name: &str,
        exclusive: bool,
        connection: &ConnectionId,
    ) -> Result<Queue> {
        self.queues.declare(name, exclusive, Some(connection)).await
    }

    /// Get a queue by name
    pub async fn get_queue(&self, name: &str) -> Result<Option<Queue>> {
        self.queues.get(name).await
    }

    /// List all queues
    pub async fn list_queues(&self) -> Result<Vec<Queue>> {
        self.queues.list().await
    }

    /// Delete a queue together with its bindings
    pub async fn delete_queue(&self, name: &str) -> Result<Queue> {
        self.queues.delete_queue(name).await
    }

    /// Get queue statistics
    pub async fn get_queue_stats(&self, name: &str) -> Result<QueueStats> {
        self.queues.stats(name).await
    }

    /// Purge all messages from a queue
    pub async fn purge_queue(&self, name: &str) -> Result<u64> {
        self.queues.purge(name).await
    }

    // ==================== Message Operations ====================

    /// Publish a message to an exchange, returning the number of queues reached
    pub async fn publish(&self, exchange: &str, message: Message) -> Result<usize> {
        self.publisher.publish(exchange, message).await
    }

    /// Publish raw bytes to an exchange
    pub async fn publish_bytes(
        &self,
        exchange: &str,
        body: impl Into<bytes::Bytes>,
    ) -> Result<usize> {
        self.publish(exchange, Message::new(body)).await
    }

    /// Start a consumer loop on a queue
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        ack_mode: AckMode,
    ) -> Result<Consumer> {
        Consumer::subscribe(Arc::clone(&self.queues), queue, handler, ack_mode).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{handler_fn, Delivery};
    use async_trait::async_trait;
    use fanq_storage::MemoryStorage;
    use fanq_types::{ConsumerState, MessageId};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn create_test_broker() -> Broker {
        Broker::new(MemoryStorage::new())
    }

    #[tokio::test]
    async fn test_declare_exchange_twice() {
        let broker = create_test_broker();

        broker.declare_exchange("logs", ExchangeKind::Fanout).unwrap();
        broker.declare_exchange("logs", ExchangeKind::Fanout).unwrap();
        assert_eq!(broker.list_exchanges().len(), 1);

        let err = broker
            .declare_exchange("logs", ExchangeKind::Direct)
            .unwrap_err();
        assert!(matches!(err, Error::ConfigConflict(_)));
    }

    #[tokio::test]
    async fn test_bind_requires_both_endpoints() {
        let broker = create_test_broker();
        broker.declare_exchange("logs", ExchangeKind::Fanout).unwrap();
        broker.declare_queue("q", false).await.unwrap();

        let err = broker.bind("logs", "missing").await.unwrap_err();
        assert!(matches!(err, Error::QueueNotFound(_)));

        let err = broker.bind("missing", "q").await.unwrap_err();
        assert!(matches!(err, Error::ExchangeNotFound(_)));

        broker.bind("logs", "q").await.unwrap();
        assert_eq!(broker.bindings("logs").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_logs_hello_scenario() {
        let broker = create_test_broker();
        broker.declare_exchange("logs", ExchangeKind::Fanout).unwrap();
        let queue = broker.declare_queue("", true).await.unwrap();
        broker.bind("logs", &queue.name).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |d: &Delivery| {
            tx.send(d.body().clone())
                .map_err(|e| Error::Handler(e.to_string()))
        });
        let mut consumer = broker
            .subscribe(&queue.name, handler, AckMode::Auto)
            .await
            .unwrap();

        assert_eq!(broker.publish_bytes("logs", "hello").await.unwrap(), 1);

        let body = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&body[..], b"hello");

        // Exactly one delivery
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        assert_eq!(consumer.cancel().await.unwrap(), ConsumerState::Idle);
    }

    #[tokio::test]
    async fn test_fanout_not_load_balanced() {
        let broker = create_test_broker();
        broker.declare_exchange("logs", ExchangeKind::Fanout).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut consumers = Vec::new();
        for _ in 0..2 {
            let queue = broker.declare_queue("", true).await.unwrap();
            broker.bind("logs", &queue.name).await.unwrap();

            let tx = tx.clone();
            let handler = handler_fn(move |d: &Delivery| {
                tx.send((d.queue.clone(), d.body().clone()))
                    .map_err(|e| Error::Handler(e.to_string()))
            });
            consumers.push(
                broker
                    .subscribe(&queue.name, handler, AckMode::Auto)
                    .await
                    .unwrap(),
            );
        }

        broker.publish_bytes("logs", "x").await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let (queue, body) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&body[..], b"x");
            seen.push(queue);
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 2);

        for consumer in &mut consumers {
            consumer.cancel().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_delete_queue_unbinds() {
        let broker = create_test_broker();
        broker.declare_exchange("logs", ExchangeKind::Fanout).unwrap();
        broker.declare_queue("q", false).await.unwrap();
        broker.bind("logs", "q").await.unwrap();

        broker.delete_queue("q").await.unwrap();

        assert!(broker.bindings("logs").unwrap().is_empty());
        assert_eq!(broker.publish_bytes("logs", "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_and_stats() {
        let broker = create_test_broker();
        broker.declare_exchange("logs", ExchangeKind::Fanout).unwrap();
        broker.declare_queue("q", false).await.unwrap();
        broker.bind("logs", "q").await.unwrap();

        for i in 0..3 {
            broker
                .publish_bytes("logs", format!("line {}", i))
                .await
                .unwrap();
        }

        let stats = broker.get_queue_stats("q").await.unwrap();
        assert_eq!(stats.pending_count, 3);
        assert_eq!(stats.size_bytes, 18);

        assert_eq!(broker.purge_queue("q").await.unwrap(), 3);
        assert_eq!(broker.get_queue_stats("q").await.unwrap().message_count, 0);
    }

    /// Deletes a queue right after the first lookup that finds it, once armed
    struct VanishingStorage {
        inner: MemoryStorage,
        armed: AtomicBool,
    }

    #[async_trait]
    impl StorageEngine for VanishingStorage {
        async fn create_queue(&self, queue: Queue) -> Result<Queue> {
            self.inner.create_queue(queue).await
        }

        async fn get_queue(&self, name: &str) -> Result<Option<Queue>> {
            let found = self.inner.get_queue(name).await?;
            if found.is_some() && self.armed.swap(false, Ordering::SeqCst) {
                self.inner.delete_queue(name).await?;
            }
            Ok(found)
        }

        async fn list_queues(&self) -> Result<Vec<Queue>> {
            self.inner.list_queues().await
        }

        async fn delete_queue(&self, name: &str) -> Result<Queue> {
            self.inner.delete_queue(name).await
        }

        async fn get_queue_stats(&self, name: &str) -> Result<QueueStats> {
            self.inner.get_queue_stats(name).await
        }

        async fn push_message(&self, queue_name: &str, message: Message) -> Result<MessageId> {
            self.inner.push_message(queue_name, message).await
        }

        async fn pop_message(&self, queue_name: &str) -> Result<Option<Message>> {
            self.inner.pop_message(queue_name).await
        }

        async fn ack_message(&self, queue_name: &str, message_id: &MessageId) -> Result<()> {
            self.inner.ack_message(queue_name, message_id).await
        }

        async fn nack_message(
            &self,
            queue_name: &str,
            message_id: &MessageId,
            requeue: bool,
        ) -> Result<()> {
            self.inner.nack_message(queue_name, message_id, requeue).await
        }

        async fn purge_queue(&self, queue_name: &str) -> Result<u64> {
            self.inner.purge_queue(queue_name).await
        }
    }

    #[tokio::test]
    async fn test_bind_racing_queue_delete_leaves_no_binding() {
        let storage = Arc::new(VanishingStorage {
            inner: MemoryStorage::new(),
            armed: AtomicBool::new(false),
        });
        let broker = Broker::with_storage(storage.clone());
        broker.declare_exchange("logs", ExchangeKind::Fanout).unwrap();
        broker.declare_queue("q", false).await.unwrap();

        storage.armed.store(true, Ordering::SeqCst);
        let err = broker.bind("logs", "q").await.unwrap_err();
        assert!(matches!(err, Error::QueueNotFound(_)));
        assert!(broker.bindings("logs").unwrap().is_empty());

        // A new queue under the same name starts unbound
        broker.declare_queue("q", false).await.unwrap();
        assert_eq!(broker.publish_bytes("logs", "x").await.unwrap(), 0);
    }
}
