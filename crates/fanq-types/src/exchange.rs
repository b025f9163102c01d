//! Exchange and binding types for FanQ

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// How an exchange picks target queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Broadcast to every bound queue, routing keys are ignored
    Fanout,
    /// Deliver to queues whose binding key equals the routing key
    Direct,
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeKind::Fanout => f.write_str("fanout"),
            ExchangeKind::Direct => f.write_str("direct"),
        }
    }
}

impl std::str::FromStr for ExchangeKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "fanout" => Ok(ExchangeKind::Fanout),
            "direct" => Ok(ExchangeKind::Direct),
            other => Err(crate::Error::InvalidName(format!(
                "unknown exchange kind: {other}"
            ))),
        }
    }
}

/// Exchange metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Exchange {
    /// Exchange name (unique)
    pub name: String,

    /// Routing kind
    pub kind: ExchangeKind,

    /// When the exchange was declared
    pub created_at: DateTime<Utc>,
}

impl Exchange {
    /// Create a new exchange
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            created_at: Utc::now(),
        }
    }

    /// Create a new fanout exchange
    pub fn fanout(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Fanout)
    }
}

/// Routing link from an exchange to a queue
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
pub struct Binding {
    /// Source exchange
    pub exchange: String,

    /// Target queue
    pub queue: String,

    /// Binding key, empty for fanout bindings
    #[serde(default)]
    pub routing_key: String,
}

impl Binding {
    /// Create a binding with the empty key
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self::with_key(exchange, queue, "")
    }

    /// Create a binding with a binding key
    pub fn with_key(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse_and_display() {
        assert_eq!("fanout".parse::<ExchangeKind>().unwrap(), ExchangeKind::Fanout);
        assert_eq!("direct".parse::<ExchangeKind>().unwrap(), ExchangeKind::Direct);
        assert!("topic".parse::<ExchangeKind>().is_err());
        assert_eq!(ExchangeKind::Fanout.to_string(), "fanout");
    }

    #[test]
    fn test_kind_serde() {
        let json = serde_json::to_string(&ExchangeKind::Fanout).unwrap();
        assert_eq!(json, "\"fanout\"");
    }

    #[test]
    fn test_binding_default_key() {
        let binding = Binding::new("logs", "q1");
        assert_eq!(binding.routing_key, "");
    }
}
