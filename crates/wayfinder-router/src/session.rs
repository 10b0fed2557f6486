//! Managed WebSocket session for a single relay.
//!
//! Each [`ConnectionSession`] owns one background task that connects to its
//! relay, demultiplexes incoming frames to per-subscription waiters, and
//! reconnects with exponential backoff after unexpected closes. Sessions are
//! created and owned exclusively by the pool; no other component touches
//! sockets directly.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ──ok──> Open ──socket lost──> Connecting (backoff)
//!     │                │
//!     │ budget spent   │ close()
//!     ▼                ▼
//!  Degraded          Closed
//! ```
//!
//! `Degraded` is terminal: the task exits and the session takes no new work
//! until the pool replaces it at a caller's explicit request. Active
//! subscriptions are re-issued after every successful reconnect so long-lived
//! streams survive transient drops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use metrics::counter;
use nostr::{Event, Filter};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};
use crate::wire::{self, RelayFrame};

/// Configuration for a single relay session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Timeout for the WebSocket handshake.
    pub connect_timeout: Duration,
    /// First reconnect delay; doubles on each consecutive failure.
    pub initial_backoff: Duration,
    /// Ceiling for the reconnect delay.
    pub max_backoff: Duration,
    /// Consecutive failed connects before the session is marked degraded.
    pub retry_budget: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            retry_budget: 5,
        }
    }
}

/// Socket lifecycle state, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Handshake in progress (also between reconnect attempts).
    Connecting,
    /// Socket is open and draining the outgoing queue.
    Open,
    /// Closed by [`ConnectionSession::close`]; terminal.
    Closed,
    /// Retry budget exhausted; terminal until the pool replaces the session.
    Degraded,
}

impl SocketState {
    /// Terminal states take no new work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Degraded)
    }
}

/// Per-subscription waiter registered with the session.
struct SubscriptionSink {
    /// Filter to replay on reconnect.
    filter: Filter,
    /// Where matching events are delivered.
    events: mpsc::UnboundedSender<Event>,
    /// Fired once on the first end-of-stored marker.
    eose: Option<oneshot::Sender<()>>,
}

/// State shared between the handle and the background task.
struct Shared {
    url: String,
    subscriptions: Mutex<HashMap<String, SubscriptionSink>>,
    pending_publishes: Mutex<HashMap<String, oneshot::Sender<(bool, String)>>>,
    last_activity: Mutex<Instant>,
}

impl Shared {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Drop every waiter so callers observe closed channels instead of hanging.
    fn fail_waiters(&self) {
        self.subscriptions.lock().clear();
        self.pending_publishes.lock().clear();
    }
}

/// One managed WebSocket connection to a single relay URL.
pub struct ConnectionSession {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Message>,
    state_rx: watch::Receiver<SocketState>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionSession {
    /// Spawn a session for `url`.
    ///
    /// Connecting happens in the background task; the handle is returned
    /// immediately in the `Connecting` state.
    pub fn spawn(url: String, config: SessionConfig) -> Self {
        let shared = Arc::new(Shared {
            url,
            subscriptions: Mutex::new(HashMap::new()),
            pending_publishes: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(Instant::now()),
        });

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SocketState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_session(
            Arc::clone(&shared),
            config,
            outgoing_rx,
            state_tx,
            shutdown_rx,
        ));

        Self {
            shared,
            outgoing: outgoing_tx,
            state_rx,
            shutdown_tx,
        }
    }

    /// The relay URL this session is bound to.
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Current socket state.
    pub fn state(&self) -> SocketState {
        *self.state_rx.borrow()
    }

    /// Instant of the last send or receive on this session.
    pub fn last_activity(&self) -> Instant {
        *self.shared.last_activity.lock()
    }

    /// Number of live subscriptions registered on this session.
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.lock().len()
    }

    /// Wait until the socket is open, up to `timeout`.
    ///
    /// # Errors
    ///
    /// `NotConnected` if the session reaches a terminal state first,
    /// `Timeout` if the deadline expires.
    pub async fn wait_until_open(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state_rx.clone();
        let wait = async {
            loop {
                match *rx.borrow_and_update() {
                    SocketState::Open => return Ok(()),
                    state if state.is_terminal() => {
                        return Err(Error::NotConnected(self.shared.url.clone()));
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(Error::NotConnected(self.shared.url.clone()));
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    /// Open a subscription on this session.
    ///
    /// Returns the event stream and a one-shot fired at the relay's
    /// end-of-stored marker. The subscription stays registered (and is
    /// replayed on reconnect) until [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(
        &self,
        subscription_id: &str,
        filter: Filter,
    ) -> Result<(mpsc::UnboundedReceiver<Event>, oneshot::Receiver<()>)> {
        if self.state().is_terminal() {
            return Err(Error::NotConnected(self.shared.url.clone()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (eose_tx, eose_rx) = oneshot::channel();

        let frame = wire::req_frame(subscription_id, &filter);
        self.shared.subscriptions.lock().insert(
            subscription_id.to_string(),
            SubscriptionSink {
                filter,
                events: events_tx,
                eose: Some(eose_tx),
            },
        );

        self.queue_text(frame)?;
        Ok((events_rx, eose_rx))
    }

    /// Close a subscription and tell the relay to stop sending for it.
    pub fn unsubscribe(&self, subscription_id: &str) {
        if self
            .shared
            .subscriptions
            .lock()
            .remove(subscription_id)
            .is_some()
        {
            let _ = self.queue_text(wire::close_frame(subscription_id));
        }
    }

    /// Send an event to the relay, returning a waiter for the OK frame.
    pub fn publish(&self, event: &Event) -> Result<oneshot::Receiver<(bool, String)>> {
        if self.state().is_terminal() {
            return Err(Error::NotConnected(self.shared.url.clone()));
        }

        let (ok_tx, ok_rx) = oneshot::channel();
        self.shared
            .pending_publishes
            .lock()
            .insert(event.id.to_hex(), ok_tx);

        self.queue_text(wire::event_frame(event))?;
        Ok(ok_rx)
    }

    /// Close the session. Idempotent; pending waiters observe closed channels.
    pub fn close(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Queue a text frame for the writer.
    ///
    /// Frames queued while `Connecting` are drained once the socket opens.
    fn queue_text(&self, text: String) -> Result<()> {
        if self.state().is_terminal() {
            return Err(Error::NotConnected(self.shared.url.clone()));
        }
        self.outgoing
            .send(Message::Text(text))
            .map_err(|_| Error::NotConnected(self.shared.url.clone()))
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Next reconnect delay: double, capped at `max`.
fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// The session's background task: connect, pump, reconnect.
async fn run_session(
    shared: Arc<Shared>,
    config: SessionConfig,
    mut outgoing_rx: mpsc::UnboundedReceiver<Message>,
    state_tx: watch::Sender<SocketState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = config.initial_backoff;
    let mut consecutive_failures = 0u32;
    let mut was_open_before = false;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        state_tx.send_replace(SocketState::Connecting);

        let attempt =
            tokio::time::timeout(config.connect_timeout, connect_async(shared.url.as_str()));
        let socket = tokio::select! {
            result = attempt => match result {
                Ok(Ok((ws, _response))) => Some(ws),
                Ok(Err(e)) => {
                    tracing::debug!("connect to {} failed: {}", shared.url, e);
                    None
                }
                Err(_) => {
                    tracing::debug!(
                        "connect to {} timed out after {:?}",
                        shared.url,
                        config.connect_timeout
                    );
                    None
                }
            },
            _ = shutdown_rx.changed() => break,
        };

        let Some(ws) = socket else {
            consecutive_failures += 1;
            counter!("pool_connect_failures_total").increment(1);

            if consecutive_failures >= config.retry_budget {
                tracing::warn!(
                    "session {} degraded after {} consecutive connect failures",
                    shared.url,
                    consecutive_failures
                );
                counter!("pool_sessions_degraded_total").increment(1);
                state_tx.send_replace(SocketState::Degraded);
                shared.fail_waiters();
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown_rx.changed() => break,
            }
            backoff = next_backoff(backoff, config.max_backoff);
            continue;
        };

        consecutive_failures = 0;
        backoff = config.initial_backoff;
        counter!("pool_connects_total").increment(1);
        if was_open_before {
            counter!("pool_reconnects_total").increment(1);
        }
        was_open_before = true;

        let (mut sink, mut source) = ws.split();

        // Replay REQs for subscriptions that survived the reconnect.
        let replays: Vec<String> = {
            let subs = shared.subscriptions.lock();
            subs.iter()
                .map(|(id, sub)| wire::req_frame(id, &sub.filter))
                .collect()
        };
        let mut replay_failed = false;
        for frame in replays {
            if sink.send(Message::Text(frame)).await.is_err() {
                replay_failed = true;
                break;
            }
        }
        if replay_failed {
            // Socket died right after the handshake; back off before retrying.
            tokio::select! {
                _ = tokio::time::sleep(config.initial_backoff) => {}
                _ = shutdown_rx.changed() => break,
            }
            continue;
        }

        state_tx.send_replace(SocketState::Open);
        shared.touch();

        // Pump outgoing frames and incoming messages until the socket drops.
        let mut clean_shutdown = false;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    clean_shutdown = true;
                    break;
                }
                queued = outgoing_rx.recv() => match queued {
                    Some(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                        shared.touch();
                    }
                    // All handles dropped.
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        clean_shutdown = true;
                        break;
                    }
                },
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        shared.touch();
                        handle_frame(&shared, &text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!("socket to {} closed by peer", shared.url);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("socket error on {}: {}", shared.url, e);
                        break;
                    }
                },
            }
        }

        // A lost socket fails in-flight publishes; the next attempt would
        // re-send an event the relay may already have accepted.
        shared.pending_publishes.lock().clear();

        if clean_shutdown || *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(config.initial_backoff) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    state_tx.send_replace(SocketState::Closed);
    shared.fail_waiters();
}

/// Demultiplex one incoming frame to its waiter.
fn handle_frame(shared: &Shared, text: &str) {
    match wire::parse_frame(text) {
        Ok(RelayFrame::Event {
            subscription_id,
            event,
        }) => {
            let subs = shared.subscriptions.lock();
            match subs.get(&subscription_id) {
                Some(sink) => {
                    let _ = sink.events.send(*event);
                }
                None => {
                    tracing::debug!(
                        "event from {} for unknown subscription {}",
                        shared.url,
                        subscription_id
                    );
                }
            }
        }
        Ok(RelayFrame::EndOfStored { subscription_id }) => {
            let mut subs = shared.subscriptions.lock();
            if let Some(sink) = subs.get_mut(&subscription_id)
                && let Some(tx) = sink.eose.take()
            {
                let _ = tx.send(());
            }
        }
        Ok(RelayFrame::Ok {
            event_id,
            accepted,
            message,
        }) => {
            if let Some(tx) = shared.pending_publishes.lock().remove(&event_id) {
                let _ = tx.send((accepted, message));
            }
        }
        Ok(RelayFrame::Notice { message }) => {
            tracing::debug!("notice from {}: {}", shared.url, message);
        }
        Ok(RelayFrame::Closed {
            subscription_id,
            message,
        }) => {
            tracing::warn!(
                "{} closed subscription {}: {}",
                shared.url,
                subscription_id,
                message
            );
            let mut subs = shared.subscriptions.lock();
            if let Some(mut sink) = subs.remove(&subscription_id)
                && let Some(tx) = sink.eose.take()
            {
                // Unblock collectors waiting for end-of-stored.
                let _ = tx.send(());
            }
        }
        Err(e) => {
            tracing::debug!("malformed frame from {}: {}", shared.url, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::Kind;

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let max = Duration::from_secs(30);
        let mut delay = Duration::from_secs(1);

        let mut observed = Vec::new();
        for _ in 0..6 {
            delay = next_backoff(delay, max);
            observed.push(delay.as_secs());
        }
        assert_eq!(observed, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_socket_state_terminality() {
        assert!(!SocketState::Connecting.is_terminal());
        assert!(!SocketState::Open.is_terminal());
        assert!(SocketState::Closed.is_terminal());
        assert!(SocketState::Degraded.is_terminal());
    }

    #[tokio::test]
    async fn test_unreachable_relay_degrades() {
        // Port 1 on loopback refuses immediately; no network needed.
        let config = SessionConfig {
            connect_timeout: Duration::from_secs(2),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            retry_budget: 3,
        };
        let session = ConnectionSession::spawn("ws://127.0.0.1:1".to_string(), config);

        let result = session
            .wait_until_open(Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(Error::NotConnected(_))));
        assert_eq!(session.state(), SocketState::Degraded);

        // Terminal sessions refuse new work.
        let filter = Filter::new().kind(Kind::RelayList);
        assert!(matches!(
            session.subscribe("sub-1", filter),
            Err(Error::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fails_waiters() {
        let config = SessionConfig {
            connect_timeout: Duration::from_secs(60),
            retry_budget: 1000,
            ..Default::default()
        };
        // 10.255.255.1 is non-routable; the session stays in Connecting.
        let session = ConnectionSession::spawn("ws://10.255.255.1:8080".to_string(), config);
        assert_eq!(session.state(), SocketState::Connecting);

        let filter = Filter::new().kind(Kind::TextNote);
        let (mut events_rx, _eose_rx) = session.subscribe("sub-1", filter).unwrap();

        session.close();
        session.close();

        // The task shuts down and drops the waiters.
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.state() != SocketState::Closed {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session should reach Closed");

        assert!(events_rx.recv().await.is_none());
        assert!(matches!(
            session.wait_until_open(Duration::from_millis(50)).await,
            Err(Error::NotConnected(_))
        ));
    }
}
