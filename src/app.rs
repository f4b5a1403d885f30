//! Session context: identity, message log, dialogue state and relay wiring.
//!
//! One [`Session`] owns everything a conversation needs. Reinitializing the
//! identity replaces the per-identity state (identity, log, dialogue,
//! seen-event set) atomically and swaps the relay subscription, so a stale
//! delivery from a previous identity can never leak into the new one.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::dialogue::{DialogueEngine, DialogueError, ProofAction};
use crate::messages::{Message, MessageStore};
use crate::nostr::{
    decode_message, ChatMode, Identity, RelayConnection, RelayUpdate, SignerProvider,
    SubscriptionFilter, TransportError, WireEvent,
};
use crate::pipeline::{PublishPipeline, SendError};
use crate::wallet::WalletConnector;

/// What a relay update amounted to, for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Status(String),
    MessageReceived(Message),
}

pub struct Session {
    identity: Option<Identity>,
    store: MessageStore,
    engine: DialogueEngine,
    connection: RelayConnection,
    pipeline: PublishPipeline,
    provider: Arc<dyn SignerProvider>,
    wallet: Box<dyn WalletConnector>,
    recipient: Option<String>,
    seen_event_ids: HashSet<String>,
    subscription_generation: u64,
    active_subscription: Option<String>,
}

impl Session {
    pub fn new(
        connection: RelayConnection,
        provider: Arc<dyn SignerProvider>,
        wallet: Box<dyn WalletConnector>,
        pipeline: PublishPipeline,
    ) -> Self {
        Self {
            identity: None,
            store: MessageStore::new(),
            engine: DialogueEngine::new(),
            connection,
            pipeline,
            provider,
            wallet,
            recipient: None,
            seen_event_ids: HashSet::new(),
            subscription_generation: 0,
            active_subscription: None,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn engine(&self) -> &DialogueEngine {
        &self.engine
    }

    pub fn recipient(&self) -> Option<&str> {
        self.recipient.as_deref()
    }

    pub fn set_recipient(&mut self, address: String) {
        self.recipient = Some(address);
    }

    pub async fn connect(&self) -> Result<(), TransportError> {
        self.connection.connect().await
    }

    pub async fn shutdown(&self) {
        self.connection.close().await;
    }

    /// Initialize (or replace) the session identity. Clears the message
    /// log, dialogue state and seen-event set, generates a fresh key pair,
    /// and subscribes to traffic addressed to or authored by the new key.
    /// Returns the bech32 address to hand to the peer.
    pub async fn initialize_identity(&mut self, display_name: Option<String>) -> Result<String> {
        if let Some(previous) = self.active_subscription.take() {
            let _ = self.connection.unsubscribe(&previous).await;
        }
        self.store.clear();
        self.engine = DialogueEngine::new();
        self.seen_event_ids.clear();

        let identity = Identity::generate(self.provider.as_ref(), display_name)
            .context("key generation failed")?;
        let address = self
            .provider
            .encode_address(&identity.public_key)
            .context("address encoding failed")?;

        self.subscription_generation += 1;
        let subscription_id = format!("session-{}", self.subscription_generation);
        let filters = vec![
            SubscriptionFilter::to_recipient(&identity.public_key),
            SubscriptionFilter::by_author(&identity.public_key),
        ];
        self.connection
            .subscribe(&subscription_id, filters)
            .await
            .context("subscription failed")?;

        self.active_subscription = Some(subscription_id);
        self.identity = Some(identity);
        Ok(address)
    }

    /// Send a message to the configured recipient through the publish
    /// pipeline. Precondition failures surface as [`SendError`]s before any
    /// network attempt.
    pub async fn send_message(
        &mut self,
        mode: ChatMode,
        text: &str,
    ) -> Result<Message, SendError> {
        let recipient = self.recipient.clone().unwrap_or_default();
        self.pipeline
            .send(
                self.identity.as_ref(),
                &self.connection,
                self.provider.as_ref(),
                &recipient,
                text,
                mode,
                &mut self.store,
                &mut self.engine,
            )
            .await
    }

    /// Apply one relay update. Returns what happened when it is worth
    /// showing; ingestion drops (duplicates, malformed events, traffic for
    /// other identities) return `None`.
    pub fn apply_update(&mut self, update: RelayUpdate) -> Option<SessionEvent> {
        match update {
            RelayUpdate::Connected => {
                Some(SessionEvent::Status("connected to relay".to_string()))
            }
            RelayUpdate::Disconnected(reason) => Some(SessionEvent::Status(format!(
                "relay disconnected: {reason}"
            ))),
            RelayUpdate::Unreachable => Some(SessionEvent::Status(
                "relay unreachable, automatic reconnects exhausted; use /connect to retry"
                    .to_string(),
            )),
            RelayUpdate::Notice(text) => {
                Some(SessionEvent::Status(format!("relay notice: {text}")))
            }
            RelayUpdate::IncomingEvent(event) => self
                .ingest_event(event)
                .map(SessionEvent::MessageReceived),
        }
    }

    /// Ingestion pipeline for one wire event: event-id dedup, decode,
    /// relevance check, content dedup on store insert, dialogue transition.
    /// The single place where incoming traffic is deduplicated.
    pub fn ingest_event(&mut self, event: WireEvent) -> Option<Message> {
        if !self.seen_event_ids.insert(event.id.clone()) {
            return None;
        }

        let identity = self.identity.as_ref()?;

        let message = match decode_message(&event, &identity.public_key) {
            Ok(message) => message,
            Err(error) => {
                // Malformed network input is dropped, never surfaced.
                debug!("dropping undecodable event {}: {error}", event.id);
                return None;
            }
        };

        // The subscription filters should only deliver relevant traffic;
        // check anyway before it can reach the store.
        if !message.is_from_me
            && message.receiver.as_deref() != Some(identity.public_key.as_str())
        {
            return None;
        }

        if !self.store.insert(message.clone()) {
            return None;
        }

        if message.content.mode == ChatMode::Proof {
            self.engine.apply(&self.store);
        }
        Some(message)
    }

    pub fn permitted_actions(&self) -> Vec<ProofAction> {
        self.engine.permitted_actions(&self.store)
    }

    /// The initiator's confirm-understanding gesture.
    pub fn confirm_understanding(&mut self) -> Result<(), DialogueError> {
        self.engine.confirm_understanding(&self.store)
    }

    /// Leave the current proof dialogue; the thread stays resumable.
    pub fn exit_dialogue(&mut self) {
        self.engine.exit_dialogue();
    }

    pub async fn wallet_connect(&mut self) -> Result<String> {
        self.wallet.connect().await.context("wallet connect failed")?;
        let address = self.wallet.address().await.context("wallet address unavailable")?;
        let balance = self.wallet.balance().await.context("wallet balance unavailable")?;
        Ok(format!("wallet connected: {address} ({balance})"))
    }

    pub async fn wallet_disconnect(&mut self) -> Result<()> {
        self.wallet
            .disconnect()
            .await
            .context("wallet disconnect failed")
    }

    pub async fn wallet_status(&self) -> String {
        if !self.wallet.is_connected() {
            return "wallet: not connected".to_string();
        }
        match (self.wallet.address().await, self.wallet.balance().await) {
            (Ok(address), Ok(balance)) => format!("wallet: {address} ({balance})"),
            _ => "wallet: status unavailable".to_string(),
        }
    }
}
