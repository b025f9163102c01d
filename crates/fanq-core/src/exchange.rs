//! Exchange registry
//!
//! Maps exchange names to their routing kind and bindings. Routing only
//! reads state: it computes a snapshot of target queues at call time.

use std::collections::{BTreeSet, HashMap};

use fanq_types::{Binding, Error, Exchange, ExchangeKind, Message, Queue, Result};
use parking_lot::RwLock;
use tracing::{debug, info};

/// An exchange together with its bindings
struct ExchangeEntry {
    exchange: Exchange,
    /// (queue, binding key), ordered for deterministic routing
    bindings: BTreeSet<(String, String)>,
}

/// Registry of declared exchanges
#[derive(Default)]
pub struct ExchangeRegistry {
    exchanges: RwLock<HashMap<String, ExchangeEntry>>,
}

impl ExchangeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an exchange
    ///
    /// Redeclaring with the same kind is a no-op, a different kind fails
    /// with `ConfigConflict`.
    pub fn declare(&self, name: &str, kind: ExchangeKind) -> Result<Exchange> {
        if name.is_empty() {
            return Err(Error::InvalidName("exchange name must not be empty".into()));
        }

        let mut exchanges = self.exchanges.write();
        if let Some(entry) = exchanges.get(name) {
            if entry.exchange.kind != kind {
                return Err(Error::ConfigConflict(format!(
                    "exchange '{}' already declared as {}, not {}",
                    name, entry.exchange.kind, kind
                )));
            }
            return Ok(entry.exchange.clone());
        }

        let exchange = Exchange::new(name, kind);
        exchanges.insert(
            name.to_string(),
            ExchangeEntry {
                exchange: exchange.clone(),
                bindings: BTreeSet::new(),
            },
        );
        info!(exchange = %name, kind = %kind, "Exchange declared");
        Ok(exchange)
    }

    /// Get an exchange by name
    pub fn get(&self, name: &str) -> Option<Exchange> {
        self.exchanges.read().get(name).map(|e| e.exchange.clone())
    }

    /// List all exchanges
    pub fn list(&self) -> Vec<Exchange> {
        self.exchanges
            .read()
            .values()
            .map(|e| e.exchange.clone())
            .collect()
    }

    /// Delete an exchange together with its bindings
    pub fn delete(&self, name: &str) -> Result<Exchange> {
        match self.exchanges.write().remove(name) {
            Some(entry) => {
                info!(
                    exchange = %name,
                    bindings = entry.bindings.len(),
                    "Exchange deleted"
                );
                Ok(entry.exchange)
            }
            None => Err(Error::ExchangeNotFound(name.to_string())),
        }
    }

    /// Bind a queue with the empty binding key
    ///
    /// Taking a `Queue` rather than a name means the caller has already
    /// resolved the queue through the queue manager.
    pub fn bind(&self, exchange: &str, queue: &Queue) -> Result<()> {
        self.bind_with_key(exchange, queue, "")
    }

    /// Bind a queue with a binding key (ignored by fanout exchanges)
    pub fn bind_with_key(&self, exchange: &str, queue: &Queue, routing_key: &str) -> Result<()> {
        let mut exchanges = self.exchanges.write();
        let entry = exchanges
            .get_mut(exchange)
            .ok_or_else(|| Error::ExchangeNotFound(exchange.to_string()))?;

        if entry
            .bindings
            .insert((queue.name.clone(), routing_key.to_string()))
        {
            info!(exchange = %exchange, queue = %queue.name, routing_key = %routing_key, "Queue bound");
        }
        Ok(())
    }

    /// Remove a binding with the empty key; no-op if absent
    pub fn unbind(&self, exchange: &str, queue: &str) {
        self.unbind_with_key(exchange, queue, "")
    }

    /// Remove a binding; no-op if absent
    pub fn unbind_with_key(&self, exchange: &str, queue: &str, routing_key: &str) {
        let mut exchanges = self.exchanges.write();
        if let Some(entry) = exchanges.get_mut(exchange) {
            if entry
                .bindings
                .remove(&(queue.to_string(), routing_key.to_string()))
            {
                info!(exchange = %exchange, queue = %queue, "Queue unbound");
            }
        }
    }

    /// Drop every binding that targets `queue`, returning how many were removed
    pub fn remove_queue(&self, queue: &str) -> usize {
        let mut removed = 0;
        for entry in self.exchanges.write().values_mut() {
            let before = entry.bindings.len();
            entry.bindings.retain(|(q, _)| q != queue);
            removed += before - entry.bindings.len();
        }
        if removed > 0 {
            debug!(queue = %queue, removed = removed, "Bindings removed for queue");
        }
        removed
    }

    /// Bindings of an exchange
    pub fn bindings(&self, exchange: &str) -> Result<Vec<Binding>> {
        let exchanges = self.exchanges.read();
        let entry = exchanges
            .get(exchange)
            .ok_or_else(|| Error::ExchangeNotFound(exchange.to_string()))?;

        Ok(entry
            .bindings
            .iter()
            .map(|(queue, key)| Binding::with_key(exchange, queue.as_str(), key.as_str()))
            .collect())
    }

    /// Compute the queues a message published now would be copied to
    ///
    /// Each target appears once even when bound under several keys.
    pub fn route(&self, exchange: &str, message: &Message) -> Result<Vec<String>> {
        let exchanges = self.exchanges.read();
        let entry = exchanges
            .get(exchange)
            .ok_or_else(|| Error::ExchangeNotFound(exchange.to_string()))?;

        let targets: BTreeSet<&str> = match entry.exchange.kind {
            ExchangeKind::Fanout => entry.bindings.iter().map(|(q, _)| q.as_str()).collect(),
            ExchangeKind::Direct => {
                let key = message.routing_key_or_default();
                entry
                    .bindings
                    .iter()
                    .filter(|(_, k)| k == key)
                    .map(|(q, _)| q.as_str())
                    .collect()
            }
        };

        Ok(targets.into_iter().map(str::to_string).collect())
    }
}
