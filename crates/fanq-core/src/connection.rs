//! Transport connection boundary
//!
//! Clients talk to a broker through a [`Connection`]. The in-memory
//! [`LocalConnection`] implements the same contract a network transport
//! would, so routing, binding and exclusivity can be exercised without a
//! broker process.
//!
//! A connection owns its consumers and its exclusive queues. `close()`
//! cancels the consumers (they end `Idle`) and then deletes the queues.
//! Dropping a connection that was never closed counts as transport loss:
//! consumers end `Terminated` and the queues are released in the
//! background.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use fanq_types::{
    AckMode, ConnectionId, ConsumerState, ConsumerTag, Error, ExchangeKind, Message, Result,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::consumer::{Consumer, MessageHandler, TransportLink};

/// Opens connections to a broker by host name
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Connection;

    async fn connect(&self, host: &str) -> Result<Self::Connection>;
}

/// Client side of a broker connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Identity used for exclusive queue ownership
    fn id(&self) -> &ConnectionId;

    /// Whether `close()` has not been called yet
    fn is_open(&self) -> bool;

    /// Declare an exchange
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Declare a queue and return its name; an empty name asks the broker
    /// for an anonymous exclusive queue
    async fn declare_queue(&self, name: &str, exclusive: bool) -> Result<String>;

    /// Bind a queue to an exchange
    async fn bind(&self, exchange: &str, queue: &str) -> Result<()> {
        self.bind_with_key(exchange, queue, "").await
    }

    /// Bind a queue to an exchange under a binding key
    async fn bind_with_key(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()>;

    /// Remove a binding
    async fn unbind(&self, exchange: &str, queue: &str) -> Result<()>;

    /// Publish raw bytes to an exchange, returning the number of queues reached
    async fn publish(&self, exchange: &str, body: Bytes) -> Result<usize> {
        self.publish_message(exchange, Message::new(body)).await
    }

    /// Publish a message with metadata
    async fn publish_message(&self, exchange: &str, message: Message) -> Result<usize>;

    /// Start consuming a queue
    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        ack_mode: AckMode,
    ) -> Result<ConsumerTag>;

    /// Cancel a consumer and wait until it has detached
    async fn cancel(&self, tag: &ConsumerTag) -> Result<ConsumerState>;

    /// Cancel all consumers and release the connection's exclusive queues
    async fn close(&self) -> Result<()>;
}

/// Resolves host names to in-process brokers
#[derive(Clone, Default)]
pub struct LocalConnector {
    brokers: Arc<DashMap<String, Arc<Broker>>>,
}

impl LocalConnector {
    /// Create a connector with no brokers registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `broker` reachable under `host`
    pub fn register(&self, host: impl Into<String>, broker: Arc<Broker>) {
        let host = host.into();
        info!(host = %host, "Broker registered");
        self.brokers.insert(host, broker);
    }
}

#[async_trait]
impl Connector for LocalConnector {
    type Connection = LocalConnection;

    async fn connect(&self, host: &str) -> Result<LocalConnection> {
        let broker = self
            .brokers
            .get(host)
            .map(|b| Arc::clone(b.value()))
            .ok_or_else(|| Error::ConnectionRefused(host.to_string()))?;
        Ok(LocalConnection::open(broker))
    }
}

/// In-memory connection to a [`Broker`]
pub struct LocalConnection {
    id: ConnectionId,
    broker: Arc<Broker>,
    alive: watch::Sender<bool>,
    closed: AtomicBool,
    consumers: Mutex<HashMap<ConsumerTag, Consumer>>,
}

impl LocalConnection {
    /// Open a connection directly on a broker
    pub fn open(broker: Arc<Broker>) -> Self {
        let id = ConnectionId::new();
        info!(connection = %id, "Connection opened");
        let (alive, _) = watch::channel(true);
        Self {
            id,
            broker,
            alive,
            closed: AtomicBool::new(false),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// State of one of this connection's consumers
    pub fn consumer_state(&self, tag: &ConsumerTag) -> Option<ConsumerState> {
        self.consumers.lock().get(tag).map(Consumer::state)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.ensure_open()?;
        self.broker.declare_exchange(name, kind).map(|_| ())
    }

    async fn declare_queue(&self, name: &str, exclusive: bool) -> Result<String> {
        self.ensure_open()?;
        let queue = self.broker.declare_queue_for(name, exclusive, &self.id).await?;
        Ok(queue.name)
    }

    async fn bind_with_key(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.bind_with_key(exchange, queue, routing_key).await
    }

    async fn unbind(&self, exchange: &str, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.unbind(exchange, queue);
        Ok(())
    }

    async fn publish_message(&self, exchange: &str, message: Message) -> Result<usize> {
        self.ensure_open()?;
        self.broker.publish(exchange, message).await
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        ack_mode: AckMode,
    ) -> Result<ConsumerTag> {
        self.ensure_open()?;
        let link = TransportLink::new(self.id.clone(), self.alive.subscribe());
        let consumer = Consumer::subscribe_linked(
            Arc::clone(self.broker.queues()),
            queue,
            handler,
            ack_mode,
            link,
        )
        .await?;

        let tag = consumer.tag().clone();
        self.consumers.lock().insert(tag.clone(), consumer);
        Ok(tag)
    }

    async fn cancel(&self, tag: &ConsumerTag) -> Result<ConsumerState> {
        let consumer = self.consumers.lock().remove(tag);
        match consumer {
            Some(mut consumer) => consumer.cancel().await,
            None => {
                debug!(connection = %self.id, consumer = %tag, "Cancel for unknown consumer ignored");
                Ok(ConsumerState::Idle)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut first_error = None;
        let consumers: Vec<Consumer> = self.consumers.lock().drain().map(|(_, c)| c).collect();
        for mut consumer in consumers {
            if let Err(e) = consumer.cancel().await {
                warn!(connection = %self.id, consumer = %consumer.tag(), error = %e, "Consumer did not stop cleanly");
                self.broker
                    .queues()
                    .detach_consumer(consumer.queue(), consumer.tag());
                first_error.get_or_insert(e);
            }
        }

        self.alive.send_replace(false);
        match self.broker.queues().release_connection(&self.id).await {
            Ok(released) => {
                info!(connection = %self.id, released_queues = released.len(), "Connection closed");
            }
            Err(e) => {
                error!(connection = %self.id, error = %e, "Failed to release exclusive queues");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        warn!(connection = %self.id, "Connection dropped without close, treating as lost");
        // Signal loss before the consumer handles are dropped so the loops
        // end Terminated rather than Idle.
        self.alive.send_replace(false);

        let queues = Arc::clone(self.broker.queues());
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = queues.release_connection(&id).await {
                        error!(connection = %id, error = %e, "Failed to release exclusive queues");
                    }
                });
            }
            Err(_) => {
                warn!(connection = %self.id, "No runtime to release exclusive queues");
            }
        }
    }
}
