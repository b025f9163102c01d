//! Standalone log consumer
//!
//! Declares a fanout exchange, binds a private anonymous queue to it and
//! prints every message it receives until stopped.

use std::sync::Arc;

use fanq_core::{handler_fn, Connection, Connector, Delivery, MessageHandler};
use fanq_types::{AckMode, ConsumerTag, ExchangeKind, Result};
use tracing::info;

/// A running log consumer and the connection it owns
pub struct LogConsumer<C: Connection> {
    connection: C,
    queue: String,
    tag: ConsumerTag,
}

impl<C: Connection> LogConsumer<C> {
    /// Connect to `host` and start printing messages published to `exchange`
    pub async fn start<K>(connector: &K, host: &str, exchange: &str) -> Result<Self>
    where
        K: Connector<Connection = C>,
    {
        Self::start_with(connector, host, exchange, print_handler()).await
    }

    /// Like [`LogConsumer::start`] with a custom handler
    pub async fn start_with<K>(
        connector: &K,
        host: &str,
        exchange: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self>
    where
        K: Connector<Connection = C>,
    {
        let connection = connector.connect(host).await?;
        connection
            .declare_exchange(exchange, ExchangeKind::Fanout)
            .await?;
        let queue = connection.declare_queue("", true).await?;
        connection.bind(exchange, &queue).await?;

        let tag = connection.consume(&queue, handler, AckMode::Auto).await?;
        info!(exchange = %exchange, queue = %queue, "Log consumer waiting for messages");

        Ok(Self {
            connection,
            queue,
            tag,
        })
    }

    /// Name of the private queue
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Cancel the subscription, then close the connection
    pub async fn stop(self) -> Result<()> {
        self.connection.cancel(&self.tag).await?;
        self.connection.close().await?;
        info!(queue = %self.queue, "Log consumer stopped");
        Ok(())
    }
}

/// Render a delivery the way the console output shows it
pub fn render(delivery: &Delivery) -> String {
    format!(" [x] b'{}'", delivery.body().escape_ascii())
}

fn print_handler() -> Arc<dyn MessageHandler> {
    handler_fn(|delivery: &Delivery| {
        println!("{}", render(delivery));
        Ok(())
    })
}
