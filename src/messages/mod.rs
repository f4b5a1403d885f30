use serde::{Deserialize, Serialize};

use crate::nostr::MessageContent;

pub use store::MessageStore;

mod store;

/// A decoded chat message as the session stores it.
///
/// Derived once from a wire event (or from a local send) and never mutated
/// after insertion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub content: MessageContent,
    /// Author public key, hex.
    pub sender: String,
    /// Addressed recipient public key, hex, when the event carried one.
    pub receiver: Option<String>,
    /// Unix seconds from the event's `created_at`.
    pub timestamp: u64,
    pub is_from_me: bool,
}
