//! Connection and consumer identity types

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Unique identifier for a client connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random ConnectionId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one consumer attachment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct ConsumerTag(pub String);

impl ConsumerTag {
    /// Create a new generated tag
    pub fn new() -> Self {
        Self(format!("ctag-{}", Uuid::new_v4().simple()))
    }
}

impl Default for ConsumerTag {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Acknowledgement mode of a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Removed from the queue on dequeue, before the handler runs
    #[default]
    Auto,
    /// Stays in flight until the handler acknowledges it
    Manual,
}

/// Lifecycle of a consumer loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    /// Not attached to any queue
    Idle,
    /// Attached, waiting for the next message
    Subscribed,
    /// Running the handler for a delivery
    Receiving,
    /// Stopped because the connection went away
    Terminated,
}

impl ConsumerState {
    /// Whether the loop has stopped for good
    pub fn is_stopped(&self) -> bool {
        matches!(self, ConsumerState::Idle | ConsumerState::Terminated)
    }
}
