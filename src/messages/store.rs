use crate::nostr::ChatMode;

use super::Message;

/// Append-only, timestamp-ordered message log for one session.
///
/// Two messages with the same timestamp and text are one logical message and
/// only the first is kept — the relay echoes our own publishes and may
/// retransmit, so the store is the single dedup point for content. Display
/// order is by timestamp with ties kept in insertion order.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert in timestamp order. Returns false when the message is a
    /// duplicate of one already stored.
    pub fn insert(&mut self, message: Message) -> bool {
        let duplicate = self.messages.iter().any(|existing| {
            existing.timestamp == message.timestamp
                && existing.content.text == message.content.text
        });
        if duplicate {
            return false;
        }

        // Fast path: most messages arrive in order, just append.
        if self
            .messages
            .last()
            .map_or(true, |last| last.timestamp <= message.timestamp)
        {
            self.messages.push(message);
        } else {
            // Out-of-order delivery: insert after every message with an
            // equal or earlier timestamp so ties stay stable.
            let position = self
                .messages
                .partition_point(|existing| existing.timestamp <= message.timestamp);
            self.messages.insert(position, message);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Proof-mode messages in store order; the dialogue engine's only input.
    pub fn proof_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages
            .iter()
            .filter(|message| message.content.mode == ChatMode::Proof)
    }

    pub fn latest(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
