//! Relay transport boundary and the production WebSocket implementation.
//!
//! The connection layer never touches a socket directly; it drives any
//! implementation of [`RelayTransport`], which keeps the reconnect and retry
//! logic testable against in-memory fakes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::event::{SubscriptionFilter, WireEvent};

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    Closed,
    #[error("relay rejected event: {0}")]
    Rejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Raw signals a transport pushes up to the connection supervisor.
#[derive(Debug)]
pub enum TransportSignal {
    /// The link dropped: read loop ended, close frame, or socket error.
    Closed(String),
    /// An EVENT frame for one of our subscriptions.
    Event(WireEvent),
    /// Relay NOTICE text.
    Notice(String),
}

/// Narrow capability interface a concrete relay transport satisfies.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Perform the handshake. Resolves when the link is usable.
    async fn connect(&self) -> TransportResult<()>;
    /// Send one event; resolves on relay acknowledgment. No retries here.
    async fn publish(&self, event: &WireEvent) -> TransportResult<()>;
    /// Open or replace a subscription; `filters` OR together.
    async fn subscribe(&self, id: &str, filters: &[SubscriptionFilter]) -> TransportResult<()>;
    async fn unsubscribe(&self, id: &str) -> TransportResult<()>;
    /// Tear the link down. Idempotent.
    async fn close(&self) -> TransportResult<()>;
}

/// Inbound relay frames this client understands (NIP-01 subset).
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Event(String, WireEvent),
    Ok(String, bool, String),
    Eose(String),
    Notice(String),
}

/// Parse one relay JSON text frame. Unknown frame kinds parse to `None`;
/// structurally broken frames are errors the read loop logs and drops.
pub fn parse_relay_frame(text: &str) -> TransportResult<Option<RelayFrame>> {
    let value: Value = serde_json::from_str(text)?;
    let array = value
        .as_array()
        .ok_or_else(|| TransportError::Protocol("relay frame is not an array".to_string()))?;
    if array.is_empty() {
        return Ok(None);
    }

    let label = array[0]
        .as_str()
        .ok_or_else(|| TransportError::Protocol("missing frame label".to_string()))?;

    match label {
        "EVENT" => {
            if array.len() < 3 {
                return Err(TransportError::Protocol("short EVENT frame".to_string()));
            }
            let subscription_id = array[1]
                .as_str()
                .ok_or_else(|| TransportError::Protocol("bad EVENT subscription id".to_string()))?
                .to_string();
            let event: WireEvent = serde_json::from_value(array[2].clone())
                .map_err(|error| TransportError::Protocol(format!("bad EVENT payload: {error}")))?;
            Ok(Some(RelayFrame::Event(subscription_id, event)))
        }
        "OK" => {
            if array.len() < 4 {
                return Err(TransportError::Protocol("short OK frame".to_string()));
            }
            let event_id = array[1]
                .as_str()
                .ok_or_else(|| TransportError::Protocol("bad OK event id".to_string()))?
                .to_string();
            let accepted = array[2]
                .as_bool()
                .ok_or_else(|| TransportError::Protocol("bad OK accepted flag".to_string()))?;
            let detail = array[3].as_str().unwrap_or_default().to_string();
            Ok(Some(RelayFrame::Ok(event_id, accepted, detail)))
        }
        "EOSE" => {
            let subscription_id = array
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| TransportError::Protocol("bad EOSE frame".to_string()))?
                .to_string();
            Ok(Some(RelayFrame::Eose(subscription_id)))
        }
        "NOTICE" => {
            let text = array
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| TransportError::Protocol("bad NOTICE frame".to_string()))?
                .to_string();
            Ok(Some(RelayFrame::Notice(text)))
        }
        _ => Ok(None),
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, WsMessage>;
type AckSender = oneshot::Sender<(bool, String)>;

/// WebSocket relay transport.
///
/// Publishes resolve on the relay's `OK` frame for the event id, so the
/// caller's timeout measures real acknowledgment rather than a socket write.
pub struct WsTransport {
    url: Url,
    signal_tx: mpsc::UnboundedSender<TransportSignal>,
    writer: Mutex<Option<WsWriter>>,
    pending_acks: Arc<Mutex<HashMap<String, AckSender>>>,
    read_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new(url: &str, signal_tx: mpsc::UnboundedSender<TransportSignal>) -> TransportResult<Self> {
        let parsed = Url::parse(url)?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(TransportError::InvalidUrl(format!(
                "relay url must be ws:// or wss://, got {}",
                parsed.scheme()
            )));
        }
        Ok(Self {
            url: parsed,
            signal_tx,
            writer: Mutex::new(None),
            pending_acks: Arc::new(Mutex::new(HashMap::new())),
            read_task: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    async fn send_text(&self, text: String) -> TransportResult<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(TransportError::NotConnected)?;
        writer
            .send(WsMessage::Text(text))
            .await
            .map_err(|error| TransportError::WebSocket(error.to_string()))
    }

    async fn send_json(&self, value: &Value) -> TransportResult<()> {
        self.send_text(serde_json::to_string(value)?).await
    }
}

#[async_trait]
impl RelayTransport for WsTransport {
    async fn connect(&self) -> TransportResult<()> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|error| TransportError::WebSocket(error.to_string()))?;
        let (writer, mut reader) = stream.split();
        *self.writer.lock().await = Some(writer);

        if let Some(task) = self.read_task.lock().await.take() {
            task.abort();
        }

        let signal_tx = self.signal_tx.clone();
        let pending_acks = Arc::clone(&self.pending_acks);
        let relay_url = self.url.to_string();

        let task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match parse_relay_frame(&text) {
                        Ok(Some(RelayFrame::Event(_, event))) => {
                            if signal_tx.send(TransportSignal::Event(event)).is_err() {
                                break;
                            }
                        }
                        Ok(Some(RelayFrame::Ok(event_id, accepted, detail))) => {
                            if let Some(ack) = pending_acks.lock().await.remove(&event_id) {
                                let _ = ack.send((accepted, detail));
                            }
                        }
                        Ok(Some(RelayFrame::Eose(subscription_id))) => {
                            debug!("end of stored events for {subscription_id} on {relay_url}");
                        }
                        Ok(Some(RelayFrame::Notice(text))) => {
                            if signal_tx.send(TransportSignal::Notice(text)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(error) => {
                            warn!("dropping unparseable frame from {relay_url}: {error}");
                        }
                    },
                    Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
                    Ok(WsMessage::Binary(_)) | Ok(WsMessage::Frame(_)) => {}
                    Ok(WsMessage::Close(_)) => break,
                    Err(error) => {
                        warn!("websocket read error on {relay_url}: {error}");
                        break;
                    }
                }
            }

            // Orphaned publish waiters learn the link is gone when their
            // ack senders drop here.
            pending_acks.lock().await.clear();
            let _ = signal_tx.send(TransportSignal::Closed("link lost".to_string()));
        });

        *self.read_task.lock().await = Some(task);
        Ok(())
    }

    async fn publish(&self, event: &WireEvent) -> TransportResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_acks
            .lock()
            .await
            .insert(event.id.clone(), ack_tx);

        if let Err(error) = self.send_json(&json!(["EVENT", event])).await {
            self.pending_acks.lock().await.remove(&event.id);
            return Err(error);
        }

        match ack_rx.await {
            Ok((true, _)) => Ok(()),
            Ok((false, detail)) => Err(TransportError::Rejected(detail)),
            Err(_) => Err(TransportError::Closed),
        }
    }

    async fn subscribe(&self, id: &str, filters: &[SubscriptionFilter]) -> TransportResult<()> {
        let mut frame = vec![json!("REQ"), json!(id)];
        for filter in filters {
            frame.push(serde_json::to_value(filter)?);
        }
        self.send_json(&Value::Array(frame)).await
    }

    async fn unsubscribe(&self, id: &str) -> TransportResult<()> {
        self.send_json(&json!(["CLOSE", id])).await
    }

    async fn close(&self) -> TransportResult<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.send(WsMessage::Close(None)).await;
        }
        if let Some(task) = self.read_task.lock().await.take() {
            task.abort();
        }
        self.pending_acks.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nostr::event::Tag;

    fn sample_event() -> WireEvent {
        WireEvent {
            id: "id".to_string(),
            pubkey: "pubkey".to_string(),
            created_at: 1,
            kind: 1,
            tags: vec![Tag::recipient("peer")],
            content: "{}".to_string(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn parses_known_frames() {
        let event_text =
            serde_json::to_string(&json!(["EVENT", "sub", sample_event()])).unwrap();
        match parse_relay_frame(&event_text).unwrap() {
            Some(RelayFrame::Event(sub, event)) => {
                assert_eq!(sub, "sub");
                assert_eq!(event, sample_event());
            }
            other => panic!("unexpected parse: {other:?}"),
        }

        assert_eq!(
            parse_relay_frame(r#"["OK","abcd",true,"stored"]"#).unwrap(),
            Some(RelayFrame::Ok("abcd".to_string(), true, "stored".to_string()))
        );
        assert_eq!(
            parse_relay_frame(r#"["EOSE","sub"]"#).unwrap(),
            Some(RelayFrame::Eose("sub".to_string()))
        );
        assert_eq!(
            parse_relay_frame(r#"["NOTICE","slow down"]"#).unwrap(),
            Some(RelayFrame::Notice("slow down".to_string()))
        );
    }

    #[test]
    fn unknown_frame_label_is_ignored() {
        assert_eq!(parse_relay_frame(r#"["AUTH","challenge"]"#).unwrap(), None);
        assert_eq!(parse_relay_frame("[]").unwrap(), None);
    }

    #[test]
    fn malformed_frames_are_errors() {
        struct Case {
            name: &'static str,
            input: &'static str,
        }

        let cases = [
            Case {
                name: "not an array",
                input: r#"{"EVENT":1}"#,
            },
            Case {
                name: "label not a string",
                input: "[42]",
            },
            Case {
                name: "short EVENT",
                input: r#"["EVENT","sub"]"#,
            },
            Case {
                name: "EVENT payload wrong shape",
                input: r#"["EVENT","sub",{"id":"only"}]"#,
            },
            Case {
                name: "short OK",
                input: r#"["OK","abcd",true]"#,
            },
            Case {
                name: "OK accepted not a bool",
                input: r#"["OK","abcd","yes","stored"]"#,
            },
            Case {
                name: "EOSE without id",
                input: r#"["EOSE"]"#,
            },
            Case {
                name: "NOTICE without text",
                input: r#"["NOTICE"]"#,
            },
        ];

        for case in cases {
            assert!(
                parse_relay_frame(case.input).is_err(),
                "{}: expected an error",
                case.name
            );
        }
    }

    #[test]
    fn rejects_non_websocket_urls() {
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(WsTransport::new("https://relay.example", tx).is_err());
    }
}
