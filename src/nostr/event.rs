//! Wire event model and message content codec.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::Message;

/// Event kind carrying chat messages (NIP-01 text note).
pub const DIRECT_MESSAGE_KIND: u32 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed message content: {0}")]
    Content(#[from] serde_json::Error),
}

/// A Nostr tag expressed as an array of strings.
///
/// The first element is the tag name, the rest hold data. The only tag this
/// client produces is `["p", <recipient pubkey hex>]`, but incoming tags are
/// stored verbatim so events carrying extra tags survive a round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn recipient(pubkey_hex: &str) -> Self {
        Tag(vec!["p".to_string(), pubkey_hex.to_string()])
    }

    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed event as it travels over the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: String,
}

impl WireEvent {
    /// Pubkey from the first `p` tag, if the event addresses anyone.
    pub fn recipient(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.name() == Some("p"))
            .and_then(Tag::value)
    }
}

/// Unsigned event skeleton. The signer provider hashes and signs it.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl EventDraft {
    /// Build the skeleton of a direct message to `recipient_hex`. Pure.
    pub fn direct_message(
        content: &MessageContent,
        author_hex: &str,
        recipient_hex: &str,
        created_at: u64,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            pubkey: author_hex.to_string(),
            created_at,
            kind: DIRECT_MESSAGE_KIND,
            tags: vec![Tag::recipient(recipient_hex)],
            content: serde_json::to_string(content)?,
        })
    }

    pub fn into_signed(self, id: String, sig: String) -> WireEvent {
        WireEvent {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    Normal,
    Proof,
}

/// The structured payload serialized into an event's `content` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageContent {
    pub text: String,
    pub mode: ChatMode,
    /// Dialogue stage stamp, present only on proof-mode messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl MessageContent {
    pub fn normal(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mode: ChatMode::Normal,
            stage: None,
        }
    }

    pub fn proof(text: impl Into<String>, stage: Option<String>) -> Self {
        Self {
            text: text.into(),
            mode: ChatMode::Proof,
            stage,
        }
    }
}

/// Decode a wire event into a local message.
///
/// The `content` field must be a JSON-serialized [`MessageContent`]. Anything
/// else is an error the ingestion layer logs and drops; malformed network
/// input never propagates further.
pub fn decode_message(event: &WireEvent, local_pubkey: &str) -> Result<Message, CodecError> {
    let content: MessageContent = serde_json::from_str(&event.content)?;
    Ok(Message {
        content,
        sender: event.pubkey.clone(),
        receiver: event.recipient().map(str::to_string),
        timestamp: event.created_at,
        is_from_me: event.pubkey == local_pubkey,
    })
}

/// NIP-01 subscription filter. A subscription carries several filters and an
/// event matches when at least one filter accepts it (logical OR).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SubscriptionFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(rename = "#p", default, skip_serializing_if = "Option::is_none")]
    pub addressed_to: Option<Vec<String>>,
}

impl SubscriptionFilter {
    /// Messages addressed to `pubkey_hex` via a `p` tag.
    pub fn to_recipient(pubkey_hex: &str) -> Self {
        Self {
            kinds: vec![DIRECT_MESSAGE_KIND],
            authors: None,
            addressed_to: Some(vec![pubkey_hex.to_string()]),
        }
    }

    /// Messages authored by `pubkey_hex` (the relay echoes our own sends).
    pub fn by_author(pubkey_hex: &str) -> Self {
        Self {
            kinds: vec![DIRECT_MESSAGE_KIND],
            authors: Some(vec![pubkey_hex.to_string()]),
            addressed_to: None,
        }
    }

    /// Whether `event` satisfies this single filter.
    pub fn matches(&self, event: &WireEvent) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|author| author == &event.pubkey) {
                return false;
            }
        }
        if let Some(recipients) = &self.addressed_to {
            match event.recipient() {
                Some(recipient) => {
                    if !recipients.iter().any(|candidate| candidate == recipient) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}
