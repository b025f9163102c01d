//! Queue types for FanQ
//!
//! Defines queue metadata and statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::connection::ConnectionId;

/// Prefix used for server-generated queue names
pub const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";

/// Queue metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Queue {
    /// Queue name (unique)
    pub name: String,

    /// At most one consumer, only from the owning connection
    pub exclusive: bool,

    /// The name was generated by the broker
    pub anonymous: bool,

    /// Connection that declared an exclusive queue
    pub owner: Option<ConnectionId>,

    /// When the queue was created
    pub created_at: DateTime<Utc>,
}

impl Queue {
    /// Create a shared queue with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exclusive: false,
            anonymous: false,
            owner: None,
            created_at: Utc::now(),
        }
    }

    /// Create an exclusive queue owned by `owner`
    pub fn exclusive(name: impl Into<String>, owner: Option<ConnectionId>) -> Self {
        Self {
            exclusive: true,
            owner,
            ..Self::new(name)
        }
    }

    /// Create an anonymous exclusive queue with a generated name
    pub fn anonymous(owner: Option<ConnectionId>) -> Self {
        Self {
            anonymous: true,
            ..Self::exclusive(generate_queue_name(), owner)
        }
    }

    /// Whether this queue is removed together with its owning connection
    pub fn is_owned_by(&self, connection: &ConnectionId) -> bool {
        self.exclusive && self.owner.as_ref() == Some(connection)
    }
}

/// Generate a process-unique queue name
pub fn generate_queue_name() -> String {
    format!("{}{}", GENERATED_QUEUE_PREFIX, Uuid::new_v4().simple())
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QueueStats {
    /// Pending plus in-flight messages
    pub message_count: u64,

    /// Number of messages waiting for delivery
    pub pending_count: u64,

    /// Number of delivered but unacknowledged messages
    pub in_flight_count: u64,

    /// Total size of pending messages in bytes
    pub size_bytes: u64,

    /// Number of attached consumers
    pub consumer_count: u64,
}
