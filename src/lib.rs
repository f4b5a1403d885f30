//! Two-party proof-of-understanding dialogue over Nostr relays.
//!
//! The crate intentionally exposes a small surface:
//! - a resilient single-relay client (bounded reconnect, acked publish)
//! - an append-only, deduplicated, timestamp-ordered message log
//! - the turn-based dialogue engine both peers derive from that log

pub mod app;
pub mod dialogue;
pub mod messages;
pub mod nostr;
pub mod pipeline;
pub mod wallet;
