//! Reliable publish: ordered precondition checks, then sign and send under a
//! timeout with a bounded flat-delay retry.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::dialogue::DialogueEngine;
use crate::messages::{Message, MessageStore};
use crate::nostr::{
    is_hex_pubkey, AddressKind, ChatMode, CodecError, ConnectionState, EventDraft, Identity,
    MessageContent, RelayConnection, SignerError, SignerProvider, WireEvent,
};

/// Publish tuning. Defaults mirror the production policy: a ten-second
/// acknowledgment budget per attempt, three attempts total, two seconds
/// between attempts with no backoff growth.
#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub publish_timeout: Duration,
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(10),
            attempts: 3,
            retry_delay: Duration::from_millis(2000),
        }
    }
}

/// Why a send was refused or failed. Precondition variants are rejected
/// before any network attempt, in declaration order.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("no identity: initialize the session first")]
    NoIdentity,
    #[error("relay unavailable")]
    RelayUnavailable,
    #[error("invalid recipient address")]
    InvalidRecipient,
    #[error("empty message")]
    EmptyMessage,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("signing failed: {0}")]
    Signer(#[from] SignerError),
    #[error("publish failed after {attempts} attempts: {reason}")]
    PublishFailed { attempts: u32, reason: String },
}

/// Wraps the relay connection's publish with the session-level policy.
pub struct PublishPipeline {
    config: PublishConfig,
}

impl Default for PublishPipeline {
    fn default() -> Self {
        Self::new(PublishConfig::default())
    }
}

impl PublishPipeline {
    pub fn new(config: PublishConfig) -> Self {
        Self { config }
    }

    /// Send `text` to `recipient`, updating the store and dialogue engine on
    /// success. The message is not stored when every attempt fails — there
    /// is no optimistic insert to roll back.
    #[allow(clippy::too_many_arguments)]
    pub async fn send(
        &self,
        identity: Option<&Identity>,
        connection: &RelayConnection,
        provider: &dyn SignerProvider,
        recipient: &str,
        text: &str,
        mode: ChatMode,
        store: &mut MessageStore,
        engine: &mut DialogueEngine,
    ) -> Result<Message, SendError> {
        let identity = identity.ok_or(SendError::NoIdentity)?;

        if connection.state().await != ConnectionState::Connected {
            // One inline reconnect attempt before giving up on the relay.
            let _ = connection.connect().await;
            if connection.state().await != ConnectionState::Connected {
                return Err(SendError::RelayUnavailable);
            }
        }

        let recipient_hex = resolve_recipient(provider, recipient)?;

        if text.trim().is_empty() {
            return Err(SendError::EmptyMessage);
        }

        let stage = match mode {
            ChatMode::Proof => Some(engine.state().stage.as_wire().to_string()),
            ChatMode::Normal => None,
        };
        let content = MessageContent {
            text: text.to_string(),
            mode,
            stage,
        };
        let created_at = chrono::Utc::now().timestamp().max(0) as u64;
        let draft =
            EventDraft::direct_message(&content, &identity.public_key, &recipient_hex, created_at)?;
        let event_id = provider.event_id(&draft)?;
        let signature = provider.sign(&event_id, &identity.secret_key)?;
        let event = draft.into_signed(event_id, signature);

        self.publish_with_retry(connection, &event).await?;

        let message = Message {
            content,
            sender: identity.public_key.clone(),
            receiver: Some(recipient_hex),
            timestamp: created_at,
            is_from_me: true,
        };
        // Local append on success; we do not wait for our own relay echo.
        store.insert(message.clone());
        if message.content.mode == ChatMode::Proof {
            engine.apply(store);
            engine.note_published(&event.id);
        }
        Ok(message)
    }

    async fn publish_with_retry(
        &self,
        connection: &RelayConnection,
        event: &WireEvent,
    ) -> Result<(), SendError> {
        let mut last_failure = String::new();
        for attempt in 1..=self.config.attempts {
            match timeout(self.config.publish_timeout, connection.publish(event)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(error)) => last_failure = error.to_string(),
                Err(_) => last_failure = "acknowledgment timeout".to_string(),
            }
            if attempt < self.config.attempts {
                warn!(
                    "publish attempt {attempt}/{} failed: {last_failure}",
                    self.config.attempts
                );
                sleep(self.config.retry_delay).await;
            }
        }
        Err(SendError::PublishFailed {
            attempts: self.config.attempts,
            reason: last_failure,
        })
    }
}

/// Resolve a recipient given as 64-char hex or a bech32 `npub` address.
fn resolve_recipient(
    provider: &dyn SignerProvider,
    recipient: &str,
) -> Result<String, SendError> {
    let recipient = recipient.trim();
    if recipient.is_empty() {
        return Err(SendError::InvalidRecipient);
    }
    if recipient.starts_with("npub") {
        let decoded = provider
            .decode_address(recipient)
            .map_err(|_| SendError::InvalidRecipient)?;
        if decoded.kind != AddressKind::PublicKey {
            return Err(SendError::InvalidRecipient);
        }
        return Ok(decoded.data);
    }
    if is_hex_pubkey(recipient) {
        return Ok(recipient.to_ascii_lowercase());
    }
    Err(SendError::InvalidRecipient)
}
