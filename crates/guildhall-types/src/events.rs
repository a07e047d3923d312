use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the connection is authenticated
    Ready { user_id: Uuid, username: String },

    /// A bot message was posted to a target
    MessagePost {
        id: String,
        target: String,
        text: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A previously posted message changed content
    MessageEdit {
        id: String,
        target: String,
        text: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A previously posted message was removed
    MessageDelete { id: String, target: String },
}

impl GatewayEvent {
    /// Returns the target if this event is scoped to one.
    /// Events that return `None` are delivered to every client.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::MessagePost { target, .. }
            | Self::MessageEdit { target, .. }
            | Self::MessageDelete { target, .. } => Some(target),
            Self::Ready { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Subscribe to channel targets. Direct `user:` targets for the
    /// connected user are always delivered.
    Subscribe { targets: Vec<String> },
}
