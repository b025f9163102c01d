//! Publisher - routes a message through an exchange into queues

use std::sync::Arc;

use fanq_types::{Message, Result};
use tracing::debug;

use crate::exchange::ExchangeRegistry;
use crate::queue_manager::QueueManager;

/// Publishes messages to exchanges
///
/// Delivery is synchronous and best-effort: once `publish` returns, every
/// queue bound at the time of the call holds its copy.
#[derive(Clone)]
pub struct Publisher {
    exchanges: Arc<ExchangeRegistry>,
    queues: Arc<QueueManager>,
}

impl Publisher {
    pub fn new(exchanges: Arc<ExchangeRegistry>, queues: Arc<QueueManager>) -> Self {
        Self { exchanges, queues }
    }

    /// Publish a message, returning how many queues received a copy
    ///
    /// Fails with `ExchangeNotFound` for an undeclared exchange. With no
    /// bound queue the message is dropped and `0` is returned.
    pub async fn publish(&self, exchange: &str, message: Message) -> Result<usize> {
        let targets = self.exchanges.route(exchange, &message)?;

        if targets.is_empty() {
            debug!(exchange = %exchange, message_id = %message.id, "No bound queues, message dropped");
            return Ok(0);
        }

        let mut delivered = 0;
        for queue in &targets {
            match self.queues.enqueue(queue, message.clone()).await {
                Ok(_) => delivered += 1,
                // Deleted between routing and enqueue
                Err(e) if e.is_not_found() => {
                    debug!(exchange = %exchange, queue = %queue, "Target queue vanished, skipped");
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            exchange = %exchange,
            message_id = %message.id,
            routed = delivered,
            "Message published"
        );
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanq_storage::MemoryStorage;
    use fanq_types::{Error, ExchangeKind};

    fn create_test_publisher() -> (Publisher, Arc<ExchangeRegistry>, Arc<QueueManager>) {
        let exchanges = Arc::new(ExchangeRegistry::new());
        let queues = Arc::new(QueueManager::new(
            Arc::new(MemoryStorage::new()),
            Arc::clone(&exchanges),
        ));
        let publisher = Publisher::new(Arc::clone(&exchanges), Arc::clone(&queues));
        (publisher, exchanges, queues)
    }

    #[tokio::test]
    async fn test_publish_unknown_exchange() {
        let (publisher, _, _) = create_test_publisher();
        let err = publisher.publish("nope", Message::new("x")).await.unwrap_err();
        assert!(matches!(err, Error::ExchangeNotFound(_)));
    }

    #[tokio::test]
    async fn test_publish_without_bindings_drops() {
        let (publisher, exchanges, queues) = create_test_publisher();
        exchanges.declare("logs", ExchangeKind::Fanout).unwrap();
        queues.declare("unbound", false, None).await.unwrap();

        assert_eq!(publisher.publish("logs", Message::new("x")).await.unwrap(), 0);
        assert_eq!(queues.stats("unbound").await.unwrap().message_count, 0);
    }

    #[tokio::test]
    async fn test_fanout_copies_to_each_queue_in_order() {
        let (publisher, exchanges, queues) = create_test_publisher();
        exchanges.declare("logs", ExchangeKind::Fanout).unwrap();

        let mut names = Vec::new();
        for _ in 0..3 {
            let queue = queues.declare("", false, None).await.unwrap();
            exchanges.bind("logs", &queue).unwrap();
            names.push(queue.name);
        }

        for i in 0..4 {
            let routed = publisher
                .publish("logs", Message::new(format!("line {}", i)))
                .await
                .unwrap();
            assert_eq!(routed, 3);
        }

        for name in &names {
            for i in 0..4 {
                let msg = queues.try_dequeue(name).await.unwrap().unwrap();
                assert_eq!(msg.body_as_str(), Some(format!("line {}", i).as_str()));
            }
            assert!(queues.try_dequeue(name).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_late_binding_misses_earlier_messages() {
        let (publisher, exchanges, queues) = create_test_publisher();
        exchanges.declare("logs", ExchangeKind::Fanout).unwrap();
        let early = queues.declare("", false, None).await.unwrap();
        exchanges.bind("logs", &early).unwrap();

        publisher.publish("logs", Message::new("before")).await.unwrap();

        let late = queues.declare("", false, None).await.unwrap();
        exchanges.bind("logs", &late).unwrap();
        publisher.publish("logs", Message::new("after")).await.unwrap();

        let msg = queues.try_dequeue(&late.name).await.unwrap().unwrap();
        assert_eq!(msg.body_as_str(), Some("after"));
        assert!(queues.try_dequeue(&late.name).await.unwrap().is_none());
        assert_eq!(queues.stats(&early.name).await.unwrap().pending_count, 2);
    }
}
