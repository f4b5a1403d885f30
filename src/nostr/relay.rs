//! Relay connection lifecycle.
//!
//! The reconnect policy lives in [`ConnectionMachine`], a pure state machine:
//! every transition takes a typed [`LinkEvent`] and returns the [`Effect`]s
//! the supervisor must execute. The async half ([`RelayConnection`]) owns the
//! injected transport, runs the effects, and forwards relay traffic to the
//! session as [`RelayUpdate`]s.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::event::{SubscriptionFilter, WireEvent};
use super::transport::{RelayTransport, TransportError, TransportSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection tuning. Defaults mirror the production policy: five automatic
/// reconnect attempts two seconds apart, ten-second handshake budget.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_millis(2000),
            max_reconnect_attempts: 5,
        }
    }
}

/// Typed input driving [`ConnectionMachine`].
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    ConnectRequested,
    HandshakeSucceeded,
    HandshakeFailed(String),
    LinkLost(String),
    RetryTimerFired,
    CloseRequested,
}

/// Side effects a transition asks the supervisor to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartHandshake,
    ScheduleRetry(Duration),
    Notify(RelayUpdate),
    TearDown,
}

/// Updates surfaced to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayUpdate {
    Connected,
    Disconnected(String),
    /// Retry budget exhausted; no further automatic reconnects until a
    /// manual connect succeeds. Emitted at most once per outage.
    Unreachable,
    IncomingEvent(WireEvent),
    Notice(String),
}

/// Pure connection state machine.
pub struct ConnectionMachine {
    state: ConnectionState,
    reconnect_attempts: u32,
    unreachable_reported: bool,
    closed: bool,
    config: RelayConfig,
}

impl ConnectionMachine {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            unreachable_reported: false,
            closed: false,
            config,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Apply one event and return the effects the caller must execute.
    pub fn handle(&mut self, event: LinkEvent) -> Vec<Effect> {
        match event {
            LinkEvent::ConnectRequested => match self.state {
                // Already busy: a manual connect while connecting or
                // connected is a no-op.
                ConnectionState::Connecting | ConnectionState::Connected => Vec::new(),
                ConnectionState::Disconnected => {
                    self.closed = false;
                    self.state = ConnectionState::Connecting;
                    vec![Effect::StartHandshake]
                }
            },
            LinkEvent::HandshakeSucceeded => {
                if self.closed {
                    // Closed mid-handshake; the socket is torn down again.
                    return vec![Effect::TearDown];
                }
                self.state = ConnectionState::Connected;
                // The attempt counter resets only here, never on a manual
                // connect call.
                self.reconnect_attempts = 0;
                self.unreachable_reported = false;
                vec![Effect::Notify(RelayUpdate::Connected)]
            }
            LinkEvent::HandshakeFailed(reason) => {
                if self.closed {
                    return Vec::new();
                }
                self.state = ConnectionState::Disconnected;
                let mut effects = vec![Effect::Notify(RelayUpdate::Disconnected(reason))];
                effects.extend(self.retry_policy());
                effects
            }
            LinkEvent::LinkLost(reason) => {
                if self.closed || self.state != ConnectionState::Connected {
                    // Stale read-loop exit from a link already replaced.
                    return Vec::new();
                }
                self.state = ConnectionState::Disconnected;
                let mut effects = vec![Effect::Notify(RelayUpdate::Disconnected(reason))];
                effects.extend(self.retry_policy());
                effects
            }
            LinkEvent::RetryTimerFired => {
                if self.closed || self.state != ConnectionState::Disconnected {
                    return Vec::new();
                }
                self.state = ConnectionState::Connecting;
                vec![Effect::StartHandshake]
            }
            LinkEvent::CloseRequested => {
                self.closed = true;
                self.state = ConnectionState::Disconnected;
                vec![Effect::TearDown]
            }
        }
    }

    fn retry_policy(&mut self) -> Vec<Effect> {
        if self.reconnect_attempts < self.config.max_reconnect_attempts {
            // Incremented before the timer fires, so a failure during the
            // retry itself counts against the budget.
            self.reconnect_attempts += 1;
            vec![Effect::ScheduleRetry(self.config.reconnect_delay)]
        } else if !self.unreachable_reported {
            self.unreachable_reported = true;
            vec![Effect::Notify(RelayUpdate::Unreachable)]
        } else {
            Vec::new()
        }
    }
}

struct ConnectionInner {
    transport: Arc<dyn RelayTransport>,
    machine: Mutex<ConnectionMachine>,
    updates_tx: mpsc::UnboundedSender<RelayUpdate>,
    subscriptions: Mutex<Vec<(String, Vec<SubscriptionFilter>)>>,
    config: RelayConfig,
}

/// One relay connection per session, shared by the publish pipeline and the
/// ingestion side. All lifecycle decisions route through the machine.
pub struct RelayConnection {
    inner: Arc<ConnectionInner>,
}

impl RelayConnection {
    /// Wire a connection over `transport`. `signal_rx` must be the receiver
    /// paired with the sender handed to the transport; `updates_tx` is where
    /// session-facing updates land.
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        config: RelayConfig,
        signal_rx: mpsc::UnboundedReceiver<TransportSignal>,
        updates_tx: mpsc::UnboundedSender<RelayUpdate>,
    ) -> Self {
        let inner = Arc::new(ConnectionInner {
            transport,
            machine: Mutex::new(ConnectionMachine::new(config.clone())),
            updates_tx,
            subscriptions: Mutex::new(Vec::new()),
            config,
        });
        tokio::spawn(signal_loop(Arc::clone(&inner), signal_rx));
        Self { inner }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.machine.lock().await.state()
    }

    pub async fn reconnect_attempts(&self) -> u32 {
        self.inner.machine.lock().await.reconnect_attempts()
    }

    /// Request a connection. Resolves once the handshake settles; on failure
    /// the automatic reconnect policy keeps working in the background.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let effects = self
            .inner
            .machine
            .lock()
            .await
            .handle(LinkEvent::ConnectRequested);
        run_effects(Arc::clone(&self.inner), effects).await;
        match self.state().await {
            ConnectionState::Connected => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Publish one event; resolves on relay acknowledgment. Retries are the
    /// publish pipeline's job.
    pub async fn publish(&self, event: &WireEvent) -> Result<(), TransportError> {
        if self.state().await != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.inner.transport.publish(event).await
    }

    /// Register a subscription. It is sent immediately when connected and
    /// re-issued after every successful reconnect.
    pub async fn subscribe(
        &self,
        id: &str,
        filters: Vec<SubscriptionFilter>,
    ) -> Result<(), TransportError> {
        {
            let mut subscriptions = self.inner.subscriptions.lock().await;
            subscriptions.retain(|(existing, _)| existing != id);
            subscriptions.push((id.to_string(), filters.clone()));
        }
        if self.state().await == ConnectionState::Connected {
            self.inner.transport.subscribe(id, &filters).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, id: &str) -> Result<(), TransportError> {
        self.inner
            .subscriptions
            .lock()
            .await
            .retain(|(existing, _)| existing != id);
        if self.state().await == ConnectionState::Connected {
            self.inner.transport.unsubscribe(id).await?;
        }
        Ok(())
    }

    /// Tear the connection down and disarm pending retries. Idempotent.
    pub async fn close(&self) {
        let effects = self
            .inner
            .machine
            .lock()
            .await
            .handle(LinkEvent::CloseRequested);
        run_effects(Arc::clone(&self.inner), effects).await;
        self.inner.subscriptions.lock().await.clear();
    }
}

async fn signal_loop(
    inner: Arc<ConnectionInner>,
    mut signal_rx: mpsc::UnboundedReceiver<TransportSignal>,
) {
    while let Some(signal) = signal_rx.recv().await {
        match signal {
            TransportSignal::Event(event) => {
                let _ = inner.updates_tx.send(RelayUpdate::IncomingEvent(event));
            }
            TransportSignal::Notice(text) => {
                debug!("relay notice: {text}");
                let _ = inner.updates_tx.send(RelayUpdate::Notice(text));
            }
            TransportSignal::Closed(reason) => {
                let effects = inner.machine.lock().await.handle(LinkEvent::LinkLost(reason));
                run_effects(Arc::clone(&inner), effects).await;
            }
        }
    }
}

/// Execute machine effects. Handshake outcomes feed back into the machine
/// until the effect queue drains; retry timers run as detached tasks that
/// route their firing through the machine again, so stale timers are inert.
fn run_effects(inner: Arc<ConnectionInner>, effects: Vec<Effect>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::StartHandshake => {
                    let outcome = match timeout(
                        inner.config.connect_timeout,
                        inner.transport.connect(),
                    )
                    .await
                    {
                        Ok(Ok(())) => LinkEvent::HandshakeSucceeded,
                        Ok(Err(error)) => LinkEvent::HandshakeFailed(error.to_string()),
                        Err(_) => LinkEvent::HandshakeFailed("handshake timeout".to_string()),
                    };
                    let succeeded = outcome == LinkEvent::HandshakeSucceeded;
                    let next = inner.machine.lock().await.handle(outcome);
                    queue.extend(next);
                    if succeeded {
                        resubscribe(&inner).await;
                    }
                }
                Effect::ScheduleRetry(delay) => {
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let next = inner.machine.lock().await.handle(LinkEvent::RetryTimerFired);
                        run_effects(Arc::clone(&inner), next).await;
                    });
                }
                Effect::Notify(update) => {
                    let _ = inner.updates_tx.send(update);
                }
                Effect::TearDown => {
                    if let Err(error) = inner.transport.close().await {
                        debug!("transport close failed: {error}");
                    }
                }
            }
        }
    })
}

async fn resubscribe(inner: &Arc<ConnectionInner>) {
    let subscriptions = inner.subscriptions.lock().await.clone();
    for (id, filters) in subscriptions {
        if let Err(error) = inner.transport.subscribe(&id, &filters).await {
            warn!("re-subscribing {id} failed: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(RelayConfig::default())
    }

    fn count_retries(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|effect| matches!(effect, Effect::ScheduleRetry(_)))
            .count()
    }

    fn count_unreachable(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|effect| matches!(effect, Effect::Notify(RelayUpdate::Unreachable)))
            .count()
    }

    #[test]
    fn connect_is_noop_while_connecting_or_connected() {
        let mut machine = machine();
        assert_eq!(
            machine.handle(LinkEvent::ConnectRequested),
            vec![Effect::StartHandshake]
        );
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert!(machine.handle(LinkEvent::ConnectRequested).is_empty());

        machine.handle(LinkEvent::HandshakeSucceeded);
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert!(machine.handle(LinkEvent::ConnectRequested).is_empty());
    }

    #[test]
    fn success_resets_attempts_and_notifies() {
        let mut machine = machine();
        machine.handle(LinkEvent::ConnectRequested);
        machine.handle(LinkEvent::HandshakeFailed("refused".to_string()));
        assert_eq!(machine.reconnect_attempts(), 1);

        machine.handle(LinkEvent::RetryTimerFired);
        let effects = machine.handle(LinkEvent::HandshakeSucceeded);
        assert_eq!(machine.reconnect_attempts(), 0);
        assert_eq!(effects, vec![Effect::Notify(RelayUpdate::Connected)]);
    }

    #[test]
    fn reconnection_is_bounded_with_single_terminal_notice() {
        let mut machine = machine();
        let mut retries = 0;
        let mut unreachable = 0;

        let mut effects = machine.handle(LinkEvent::ConnectRequested);
        for _ in 0..20 {
            retries += count_retries(&effects);
            unreachable += count_unreachable(&effects);
            if !effects.contains(&Effect::StartHandshake)
                && count_retries(&effects) == 0
            {
                break;
            }
            if count_retries(&effects) > 0 {
                machine.handle(LinkEvent::RetryTimerFired);
            }
            effects = machine.handle(LinkEvent::HandshakeFailed("refused".to_string()));
        }

        assert_eq!(retries, 5, "exactly max_reconnect_attempts retries");
        assert_eq!(unreachable, 1, "terminal notice exactly once");
        assert_eq!(machine.state(), ConnectionState::Disconnected);

        // Further link events stay quiet.
        assert!(machine
            .handle(LinkEvent::HandshakeFailed("refused".to_string()))
            .is_empty());
    }

    #[test]
    fn manual_rearm_does_not_reset_attempts_or_repeat_notice() {
        let mut machine = machine();
        machine.handle(LinkEvent::ConnectRequested);
        for _ in 0..6 {
            machine.handle(LinkEvent::HandshakeFailed("refused".to_string()));
            machine.handle(LinkEvent::RetryTimerFired);
        }
        assert_eq!(machine.reconnect_attempts(), 5);

        // Manual re-arm: handshake starts, counter untouched.
        machine.handle(LinkEvent::CloseRequested);
        let effects = machine.handle(LinkEvent::ConnectRequested);
        assert_eq!(effects, vec![Effect::StartHandshake]);
        assert_eq!(machine.reconnect_attempts(), 5);

        // And a failure stays silent: budget spent, notice already sent.
        let effects = machine.handle(LinkEvent::HandshakeFailed("refused".to_string()));
        assert_eq!(count_retries(&effects), 0);
        assert_eq!(count_unreachable(&effects), 0);
    }

    #[test]
    fn link_loss_while_connected_schedules_retry() {
        let mut machine = machine();
        machine.handle(LinkEvent::ConnectRequested);
        machine.handle(LinkEvent::HandshakeSucceeded);

        let effects = machine.handle(LinkEvent::LinkLost("reset by peer".to_string()));
        assert_eq!(count_retries(&effects), 1);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(machine.reconnect_attempts(), 1);
    }

    #[test]
    fn stale_events_are_ignored_after_close() {
        let mut machine = machine();
        machine.handle(LinkEvent::ConnectRequested);
        machine.handle(LinkEvent::HandshakeSucceeded);
        machine.handle(LinkEvent::CloseRequested);

        assert!(machine.handle(LinkEvent::RetryTimerFired).is_empty());
        assert!(machine
            .handle(LinkEvent::LinkLost("reset".to_string()))
            .is_empty());
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn retry_timer_is_inert_outside_disconnected() {
        let mut machine = machine();
        machine.handle(LinkEvent::ConnectRequested);
        // Connecting: a stray timer must not double the handshake.
        assert!(machine.handle(LinkEvent::RetryTimerFired).is_empty());

        machine.handle(LinkEvent::HandshakeSucceeded);
        assert!(machine.handle(LinkEvent::RetryTimerFired).is_empty());
    }
}
