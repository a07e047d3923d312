use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a message goes: an interface tag selecting the sink, plus an
/// interface-specific target (channel name, chat id, `user:<uuid>`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub interface: String,
    pub target: String,
}

impl Address {
    pub fn new(interface: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            target: target.into(),
        }
    }

    /// Direct-message target for a user on the given interface.
    pub fn user(interface: impl Into<String>, user_id: Uuid) -> Self {
        Self::new(interface, format!("{}{}", USER_TARGET_PREFIX, user_id))
    }

    /// Returns the user id if this address targets a single user.
    pub fn user_id(&self) -> Option<Uuid> {
        self.target
            .strip_prefix(USER_TARGET_PREFIX)
            .and_then(|id| id.parse().ok())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.interface, self.target)
    }
}

pub const USER_TARGET_PREFIX: &str = "user:";

/// Opaque reference to a delivered message, allowing later edit/delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHandle {
    pub address: Address,
    pub id: String,
}

impl MessageHandle {
    pub fn new(address: Address, id: impl Into<String>) -> Self {
        Self {
            address,
            id: id.into(),
        }
    }
}

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.id)
    }
}
