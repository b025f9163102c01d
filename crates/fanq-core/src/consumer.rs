//! Consumer loop
//!
//! Each subscription runs as its own tokio task:
//!
//! ```text
//! Idle -> Subscribed -> Receiving -> Subscribed -> ... -> Idle        (cancel)
//!                                                    \-> Terminated  (connection lost)
//! ```
//!
//! The blocking receive is the only suspension point and has no timeout.
//! Every time the task wakes it checks, in this order, whether the
//! connection is gone and whether it was cancelled, before taking the next
//! message. A handler that is already running always finishes first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fanq_types::{
    AckMode, ConnectionId, ConsumerState, ConsumerTag, Error, Message, MessageId, Queue, Result,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::queue_manager::QueueManager;

/// Per-message callback of a consumer
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one delivery. Errors are logged and do not stop the consumer.
    async fn handle(&self, delivery: &Delivery) -> Result<()>;
}

/// Adapter turning a plain closure into a [`MessageHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&Delivery) -> Result<()> + Send + Sync,
{
    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        (self.0)(delivery)
    }
}

/// Wrap a closure as a shareable handler
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(&Delivery) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// A message handed to a handler
pub struct Delivery {
    /// The delivered copy
    pub message: Message,
    /// Per-consumer sequence number, starting at 1
    pub delivery_tag: u64,
    /// Queue the message came from
    pub queue: String,
    /// Consumer that received it
    pub consumer_tag: ConsumerTag,
    /// Set in manual mode only
    queues: Option<Arc<QueueManager>>,
    settled: AtomicBool,
}

impl Delivery {
    /// Message payload
    pub fn body(&self) -> &Bytes {
        &self.message.body
    }

    /// Whether this message was handed out before
    pub fn redelivered(&self) -> bool {
        self.message.is_redelivery()
    }

    /// Whether the message has been acknowledged or rejected
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Acknowledge the message. A no-op for auto-ack consumers.
    pub async fn ack(&self) -> Result<()> {
        if let Some(queues) = &self.queues {
            queues.ack(&self.queue, &self.message.id).await?;
        }
        self.settled.store(true, Ordering::Release);
        Ok(())
    }

    /// Reject the message, returning it to the head of the queue when
    /// `requeue` is set. A no-op for auto-ack consumers.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        if let Some(queues) = &self.queues {
            queues.nack(&self.queue, &self.message.id, requeue).await?;
        }
        self.settled.store(true, Ordering::Release);
        Ok(())
    }
}

/// Liveness of the connection a consumer belongs to
///
/// The connection is considered lost once the watched value turns `false`
/// or its sender is dropped.
#[derive(Clone)]
pub struct TransportLink {
    connection: ConnectionId,
    alive: watch::Receiver<bool>,
}

impl TransportLink {
    /// Link to `connection`, watching its liveness flag
    pub fn new(connection: ConnectionId, alive: watch::Receiver<bool>) -> Self {
        Self { connection, alive }
    }

    /// Connection the consumer belongs to
    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    async fn lost(&mut self) {
        let _ = self.alive.wait_for(|alive| !*alive).await;
    }
}

/// Handle to a running consumer loop
///
/// Dropping the handle cancels the loop without waiting for it.
pub struct Consumer {
    tag: ConsumerTag,
    queue: String,
    cancel_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ConsumerState>,
    task: Option<JoinHandle<()>>,
}

impl Consumer {
    /// Attach to `queue` and start delivering to `handler`
    ///
    /// Fails with `ExclusivityViolation` if the queue is exclusive and
    /// already consumed.
    pub async fn subscribe(
        queues: Arc<QueueManager>,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        ack_mode: AckMode,
    ) -> Result<Self> {
        Self::start(queues, queue, handler, ack_mode, None).await
    }

    /// Like [`Consumer::subscribe`], tied to the lifetime of a connection
    pub async fn subscribe_linked(
        queues: Arc<QueueManager>,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        ack_mode: AckMode,
        link: TransportLink,
    ) -> Result<Self> {
        Self::start(queues, queue, handler, ack_mode, Some(link)).await
    }

    async fn start(
        queues: Arc<QueueManager>,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        ack_mode: AckMode,
        link: Option<TransportLink>,
    ) -> Result<Self> {
        let tag = ConsumerTag::new();
        let connection = link.as_ref().map(TransportLink::connection);
        let queue = queues.attach_consumer(queue, &tag, connection).await?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConsumerState::Subscribed);

        info!(queue = %queue.name, consumer = %tag, ack_mode = ?ack_mode, "Consumer subscribed");

        let name = queue.name.clone();
        let worker = ConsumerLoop {
            queues,
            queue,
            tag: tag.clone(),
            handler,
            ack_mode,
            cancel_rx,
            link,
            state_tx,
            last_delivery_tag: 0,
            unacked: Vec::new(),
        };
        let task = tokio::spawn(worker.run());

        Ok(Self {
            tag,
            queue: name,
            cancel_tx,
            state_rx,
            task: Some(task),
        })
    }

    /// Tag identifying this subscription
    pub fn tag(&self) -> &ConsumerTag {
        &self.tag
    }

    /// Queue being consumed
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Current state of the loop
    pub fn state(&self) -> ConsumerState {
        *self.state_rx.borrow()
    }

    /// Stop the loop and wait until it has detached
    ///
    /// A handler that is running completes first. Returns the final state,
    /// which is `Terminated` if the connection was lost before.
    pub async fn cancel(&mut self) -> Result<ConsumerState> {
        self.cancel_tx.send_replace(true);
        self.wait().await
    }

    /// Wait for the loop to stop on its own
    pub async fn wait(&mut self) -> Result<ConsumerState> {
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Error::Internal(format!("consumer task failed: {e}")))?;
        }
        Ok(self.state())
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .field("state", &self.state())
            .finish()
    }
}

enum Exit {
    Cancelled,
    ConnectionLost,
    QueueGone(Error),
}

struct ConsumerLoop {
    queues: Arc<QueueManager>,
    queue: Queue,
    tag: ConsumerTag,
    handler: Arc<dyn MessageHandler>,
    ack_mode: AckMode,
    cancel_rx: watch::Receiver<bool>,
    link: Option<TransportLink>,
    state_tx: watch::Sender<ConsumerState>,
    last_delivery_tag: u64,
    /// Manual mode: delivered but not yet settled, in delivery order
    unacked: Vec<MessageId>,
}

impl ConsumerLoop {
    async fn run(mut self) {
        let exit = loop {
            self.state_tx.send_replace(ConsumerState::Subscribed);

            let next = tokio::select! {
                biased;
                _ = connection_lost(&mut self.link) => break Exit::ConnectionLost,
                _ = cancelled(&mut self.cancel_rx) => break Exit::Cancelled,
                next = self.queues.receive(&self.queue.name) => next,
            };

            match next {
                Ok(message) => self.deliver(message).await,
                Err(e) => break Exit::QueueGone(e),
            }
        };

        self.finish(exit).await;
    }

    async fn deliver(&mut self, message: Message) {
        self.state_tx.send_replace(ConsumerState::Receiving);
        self.last_delivery_tag += 1;

        let queues = match self.ack_mode {
            AckMode::Auto => {
                // Settled before the handler runs: at-most-once
                if let Err(e) = self.queues.ack(&self.queue.name, &message.id).await {
                    debug!(queue = %self.queue.name, error = %e, "Auto-ack failed");
                }
                None
            }
            AckMode::Manual => {
                self.unacked.push(message.id.clone());
                Some(Arc::clone(&self.queues))
            }
        };

        let delivery = Arc::new(Delivery {
            message,
            delivery_tag: self.last_delivery_tag,
            queue: self.queue.name.clone(),
            consumer_tag: self.tag.clone(),
            queues,
            settled: AtomicBool::new(self.ack_mode == AckMode::Auto),
        });

        debug!(
            queue = %delivery.queue,
            consumer = %self.tag,
            delivery_tag = delivery.delivery_tag,
            "Delivering message"
        );

        // A panic surfaces as a handler error
        let handler = Arc::clone(&self.handler);
        let running = Arc::clone(&delivery);
        let outcome = tokio::spawn(async move { handler.handle(&running).await })
            .await
            .unwrap_or_else(|e| Err(Error::Handler(format!("handler panicked: {e}"))));

        if let Err(e) = outcome {
            warn!(
                queue = %delivery.queue,
                consumer = %self.tag,
                delivery_tag = delivery.delivery_tag,
                error = %e,
                "Message handler failed"
            );
        }

        if delivery.is_settled() {
            self.unacked.retain(|id| id != &delivery.message.id);
        }
    }

    async fn finish(mut self, exit: Exit) {
        self.requeue_unacked().await;
        self.queues.detach_consumer(&self.queue.name, &self.tag);

        let state = match exit {
            Exit::Cancelled => {
                info!(queue = %self.queue.name, consumer = %self.tag, "Consumer cancelled");
                ConsumerState::Idle
            }
            Exit::QueueGone(e) => {
                info!(queue = %self.queue.name, consumer = %self.tag, reason = %e, "Consumer stopped");
                ConsumerState::Idle
            }
            Exit::ConnectionLost => {
                warn!(queue = %self.queue.name, consumer = %self.tag, "Connection lost, consumer terminated");
                if self.queue.exclusive && self.queue.anonymous {
                    match self.queues.delete_queue(&self.queue.name).await {
                        Ok(_) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => {
                            warn!(queue = %self.queue.name, error = %e, "Failed to delete anonymous queue")
                        }
                    }
                }
                ConsumerState::Terminated
            }
        };

        self.state_tx.send_replace(state);
    }

    /// Hand unsettled manual-mode messages back, keeping their original order
    async fn requeue_unacked(&mut self) {
        for id in self.unacked.drain(..).rev() {
            match self.queues.nack(&self.queue.name, &id, true).await {
                Ok(()) => debug!(queue = %self.queue.name, message_id = %id, "Unacked message requeued"),
                // Settled out of band, or the queue is gone
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(queue = %self.queue.name, error = %e, "Failed to requeue message"),
            }
        }
    }
}

async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    // A dropped handle counts as cancellation
    let _ = cancel_rx.wait_for(|cancelled| *cancelled).await;
}

async fn connection_lost(link: &mut Option<TransportLink>) {
    match link {
        Some(link) => link.lost().await,
        None => std::future::pending().await,
    }
}
