//! Bounded, multiplexed pool of relay sessions.
//!
//! The pool is the single owner of live socket state. It enforces the
//! connection ceiling (open + connecting sessions ≤ `max_connections`),
//! evicts the least-recently-active subscription-free session when a new
//! relay is needed at capacity, and exposes the three network primitives
//! everything above it is built on:
//!
//! - [`RelayPool::query_sync`]: request-scoped fan-out, union of results
//! - [`RelayPool::publish`]: parallel send with per-relay outcomes
//! - [`RelayPool::subscribe_many`]: long-lived streams behind one handle
//!
//! Per-relay failures never fail a multi-relay call: a relay that refuses,
//! times out, or degrades simply contributes nothing to the aggregate.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use nostr::{Event, EventId, Filter};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::session::{ConnectionSession, SessionConfig, SocketState};

/// Configuration for the relay pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum simultaneous open/connecting sessions.
    pub max_connections: usize,
    /// How long `get_connection` waits for a slot at the ceiling before
    /// failing with `MaxConnectionsExceeded`.
    pub connection_wait: Duration,
    /// Sessions with no subscriptions and no activity for this long are
    /// closed by `force_cleanup`.
    pub idle_timeout: Duration,
    /// Default deadline for `query_sync`.
    pub query_timeout: Duration,
    /// Default per-relay deadline for `publish`.
    pub publish_timeout: Duration,
    /// Settings for individual sessions.
    pub session: SessionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connection_wait: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(60),
            query_timeout: Duration::from_secs(8),
            publish_timeout: Duration::from_secs(10),
            session: SessionConfig::default(),
        }
    }
}

/// Per-relay outcome of a publish call.
#[derive(Debug, Clone)]
pub struct PublishResult {
    /// Relay the event was sent to.
    pub relay_url: String,
    /// Whether the relay acknowledged the event.
    pub success: bool,
    /// Relay-provided message (rejection reason, duplicate notice, ...).
    pub message: String,
}

/// Notification forwarded to `subscribe_many` consumers.
#[derive(Debug, Clone)]
pub enum PoolNotification {
    /// An event arrived on one of the subscribed relays.
    Event {
        relay_url: String,
        event: Box<Event>,
    },
    /// A relay reported end of stored events for this subscription.
    EndOfStored { relay_url: String },
}

/// Handle over a multi-relay subscription. `close()` is idempotent.
pub struct SubscriptionHandle {
    closed: AtomicBool,
    entries: Vec<(Arc<ConnectionSession>, String)>,
}

impl SubscriptionHandle {
    /// Unsubscribe from every relay. Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (session, subscription_id) in &self.entries {
            session.unsubscribe(subscription_id);
        }
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of relays this subscription reached.
    pub fn relay_count(&self) -> usize {
        self.entries.len()
    }
}

/// Bounded collection of relay sessions.
pub struct RelayPool {
    config: PoolConfig,
    sessions: Mutex<HashMap<String, Arc<ConnectionSession>>>,
}

impl RelayPool {
    /// Create an empty pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Return an existing session for `url` or create one under the ceiling.
    ///
    /// At capacity, the least-recently-active session with no subscriptions
    /// is evicted to make room. If nothing is evictable, the call retries
    /// until `connection_wait` elapses and then fails.
    ///
    /// A degraded session is not replaced here; use [`retry`](Self::retry)
    /// to explicitly give a failing relay another chance.
    pub async fn get_connection(&self, url: &str) -> Result<Arc<ConnectionSession>> {
        let url = wayfinder_core::normalize_relay_url(url)
            .ok()
            .ok_or_else(|| Error::Validation(format!("invalid relay URL '{}'", url)))?;

        let deadline = Instant::now() + self.config.connection_wait;
        loop {
            match self.try_acquire(&url) {
                Acquire::Ready(session) => return Ok(session),
                Acquire::Degraded => {
                    return Err(Error::Connect {
                        url,
                        reason: "session degraded; retry explicitly".to_string(),
                    });
                }
                Acquire::AtCapacity { current } => {
                    if Instant::now() >= deadline {
                        counter!("pool_capacity_rejections_total").increment(1);
                        return Err(Error::MaxConnectionsExceeded {
                            current,
                            max: self.config.max_connections,
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    /// Drop any session for `url` (degraded or not) and connect fresh.
    pub async fn retry(&self, url: &str) -> Result<Arc<ConnectionSession>> {
        if let Some(normalized) = wayfinder_core::normalize_relay_url(url).ok()
            && let Some(old) = self.sessions.lock().remove(&normalized)
        {
            old.close();
        }
        self.get_connection(url).await
    }

    /// One non-blocking acquisition attempt under the sessions lock.
    fn try_acquire(&self, url: &str) -> Acquire {
        let mut sessions = self.sessions.lock();

        if let Some(existing) = sessions.get(url) {
            match existing.state() {
                SocketState::Degraded => return Acquire::Degraded,
                SocketState::Closed => {
                    sessions.remove(url);
                }
                _ => return Acquire::Ready(Arc::clone(existing)),
            }
        }

        // Closed sessions no longer hold a slot.
        sessions.retain(|_, s| s.state() != SocketState::Closed);

        let live = sessions
            .values()
            .filter(|s| !s.state().is_terminal())
            .count();

        if live >= self.config.max_connections {
            // Evict the least-recently-active session with no live
            // subscriptions; sessions carrying streams are never evicted.
            let victim = sessions
                .iter()
                .filter(|(_, s)| !s.state().is_terminal() && s.subscription_count() == 0)
                .min_by_key(|(_, s)| s.last_activity())
                .map(|(u, _)| u.clone());

            match victim {
                Some(victim_url) => {
                    if let Some(old) = sessions.remove(&victim_url) {
                        old.close();
                    }
                    counter!("pool_sessions_evicted_total", "reason" => "capacity").increment(1);
                }
                None => return Acquire::AtCapacity { current: live },
            }
        }

        let session = Arc::new(ConnectionSession::spawn(
            url.to_string(),
            self.config.session.clone(),
        ));
        sessions.insert(url.to_string(), Arc::clone(&session));

        let live = sessions
            .values()
            .filter(|s| !s.state().is_terminal())
            .count();
        gauge!("pool_sessions_open").set(live as f64);

        Acquire::Ready(session)
    }

    /// Query several relays and return the union of their results.
    ///
    /// Each relay gets a request-scoped subscription collected until its
    /// end-of-stored marker or the deadline; the subscription is then closed.
    /// Failing relays contribute zero events. Results are deduplicated by
    /// event id; no cross-relay ordering is implied.
    pub async fn query_sync(
        &self,
        relay_urls: &[String],
        filter: Filter,
        timeout: Option<Duration>,
    ) -> Vec<Event> {
        let deadline = timeout.unwrap_or(self.config.query_timeout);
        let started = Instant::now();

        let tasks = relay_urls
            .iter()
            .map(|url| self.query_relay(url, filter.clone(), deadline));
        let per_relay = futures::future::join_all(tasks).await;

        let mut by_id: HashMap<EventId, Event> = HashMap::new();
        for events in per_relay {
            for event in events {
                by_id.entry(event.id).or_insert(event);
            }
        }

        counter!("query_events_total").increment(by_id.len() as u64);
        histogram!("query_duration_seconds").record(started.elapsed().as_secs_f64());

        by_id.into_values().collect()
    }

    /// Query one relay, returning whatever was collected before the deadline.
    async fn query_relay(&self, url: &str, filter: Filter, deadline: Duration) -> Vec<Event> {
        let deadline_at = tokio::time::Instant::now() + deadline;

        let session = match self.get_connection(url).await {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!("query skipping {}: {}", url, e);
                counter!("query_relay_failures_total").increment(1);
                return Vec::new();
            }
        };

        let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
        if let Err(e) = session.wait_until_open(remaining).await {
            tracing::debug!("query skipping {}: {}", url, e);
            counter!("query_relay_failures_total").increment(1);
            return Vec::new();
        }

        let subscription_id = next_subscription_id();
        let (mut events_rx, mut eose_rx) = match session.subscribe(&subscription_id, filter) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::debug!("query skipping {}: {}", url, e);
                counter!("query_relay_failures_total").increment(1);
                return Vec::new();
            }
        };

        let mut collected = Vec::new();
        loop {
            tokio::select! {
                maybe = events_rx.recv() => match maybe {
                    Some(event) => collected.push(event),
                    None => break,
                },
                _ = &mut eose_rx => break,
                _ = tokio::time::sleep_until(deadline_at) => {
                    tracing::debug!(
                        "query to {} timed out with {} partial events",
                        url,
                        collected.len()
                    );
                    break;
                }
            }
        }

        session.unsubscribe(&subscription_id);
        collected
    }

    /// Publish an event to several relays in parallel.
    ///
    /// Each relay has an independent deadline; the returned vec has one
    /// outcome per input URL and the call itself never fails.
    pub async fn publish(
        &self,
        relay_urls: &[String],
        event: &Event,
        timeout: Option<Duration>,
    ) -> Vec<PublishResult> {
        let deadline = timeout.unwrap_or(self.config.publish_timeout);
        let tasks = relay_urls
            .iter()
            .map(|url| self.publish_relay(url, event, deadline));
        futures::future::join_all(tasks).await
    }

    /// Publish to one relay and wait for its acknowledgement.
    async fn publish_relay(&self, url: &str, event: &Event, deadline: Duration) -> PublishResult {
        let outcome = tokio::time::timeout(deadline, async {
            let session = self.get_connection(url).await?;
            session.wait_until_open(deadline).await?;
            let ok_rx = session.publish(event)?;
            ok_rx
                .await
                .map_err(|_| Error::NotConnected(url.to_string()))
        })
        .await;

        match outcome {
            Ok(Ok((accepted, message))) => {
                if accepted {
                    counter!("publish_ok_total").increment(1);
                } else {
                    counter!("publish_failures_total").increment(1);
                }
                PublishResult {
                    relay_url: url.to_string(),
                    success: accepted,
                    message,
                }
            }
            Ok(Err(e)) => {
                counter!("publish_failures_total").increment(1);
                PublishResult {
                    relay_url: url.to_string(),
                    success: false,
                    message: e.to_string(),
                }
            }
            Err(_) => {
                counter!("publish_failures_total").increment(1);
                PublishResult {
                    relay_url: url.to_string(),
                    success: false,
                    message: Error::Timeout(deadline).to_string(),
                }
            }
        }
    }

    /// Open a long-lived subscription across several relays.
    ///
    /// Events and end-of-stored markers are forwarded into `sender`; relays
    /// that cannot be reached are skipped. The returned handle unsubscribes
    /// everywhere on `close()`.
    pub async fn subscribe_many(
        &self,
        relay_urls: &[String],
        filter: Filter,
        sender: mpsc::UnboundedSender<PoolNotification>,
    ) -> SubscriptionHandle {
        let mut entries = Vec::new();

        for url in relay_urls {
            let session = match self.get_connection(url).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("subscription skipping {}: {}", url, e);
                    continue;
                }
            };

            let subscription_id = next_subscription_id();
            let (mut events_rx, mut eose_rx) =
                match session.subscribe(&subscription_id, filter.clone()) {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("subscription skipping {}: {}", url, e);
                        continue;
                    }
                };

            let relay_url = session.url().to_string();
            let tx = sender.clone();
            tokio::spawn(async move {
                let mut eose_seen = false;
                loop {
                    tokio::select! {
                        maybe = events_rx.recv() => match maybe {
                            Some(event) => {
                                let notification = PoolNotification::Event {
                                    relay_url: relay_url.clone(),
                                    event: Box::new(event),
                                };
                                if tx.send(notification).is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        result = &mut eose_rx, if !eose_seen => {
                            eose_seen = true;
                            if result.is_ok() {
                                let _ = tx.send(PoolNotification::EndOfStored {
                                    relay_url: relay_url.clone(),
                                });
                            }
                        }
                    }
                }
            });

            entries.push((session, subscription_id));
        }

        SubscriptionHandle {
            closed: AtomicBool::new(false),
            entries,
        }
    }

    /// Snapshot of relays with a currently open socket.
    pub fn connected_relays(&self) -> Vec<String> {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.state() == SocketState::Open)
            .map(|s| s.url().to_string())
            .collect()
    }

    /// Close sessions that have been idle beyond the idle threshold.
    ///
    /// Suitable for visibility-change or memory-pressure signals.
    pub fn force_cleanup(&self) {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();

        sessions.retain(|_, session| {
            if session.state().is_terminal() {
                return false;
            }
            let idle = session.subscription_count() == 0
                && session.last_activity().elapsed() >= self.config.idle_timeout;
            if idle {
                session.close();
                counter!("pool_sessions_evicted_total", "reason" => "idle").increment(1);
            }
            !idle
        });

        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::debug!("force_cleanup closed {} idle sessions", evicted);
        }
        gauge!("pool_sessions_open").set(sessions.len() as f64);
    }

    /// Close every session and empty the pool.
    pub fn shutdown(&self) {
        let mut sessions = self.sessions.lock();
        for session in sessions.values() {
            session.close();
        }
        sessions.clear();
        gauge!("pool_sessions_open").set(0.0);
    }

    /// Number of sessions currently tracked (open or connecting).
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| !s.state().is_terminal())
            .count()
    }
}

enum Acquire {
    Ready(Arc<ConnectionSession>),
    Degraded,
    AtCapacity { current: usize },
}

/// Mint a process-unique subscription id.
fn next_subscription_id() -> String {
    use std::sync::atomic::AtomicU64;
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("wf-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::Kind;

    fn test_config(max_connections: usize) -> PoolConfig {
        PoolConfig {
            max_connections,
            connection_wait: Duration::from_millis(100),
            session: SessionConfig {
                // Non-routable targets stay in Connecting for the whole test.
                connect_timeout: Duration::from_secs(60),
                retry_budget: 1000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn unroutable(n: u16) -> String {
        format!("ws://10.255.255.{}:8080", n)
    }

    #[tokio::test]
    async fn test_get_connection_reuses_session() {
        let pool = RelayPool::new(test_config(4));

        let a = pool.get_connection(&unroutable(1)).await.unwrap();
        let b = pool.get_connection(&unroutable(1)).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.session_count(), 1);
    }

    #[tokio::test]
    async fn test_ceiling_rejects_when_nothing_evictable() {
        let pool = RelayPool::new(test_config(2));
        let filter = Filter::new().kind(Kind::TextNote);

        let a = pool.get_connection(&unroutable(1)).await.unwrap();
        let b = pool.get_connection(&unroutable(2)).await.unwrap();

        // Live subscriptions pin both sessions.
        let _sub_a = a.subscribe("sub-a", filter.clone()).unwrap();
        let _sub_b = b.subscribe("sub-b", filter).unwrap();

        let result = pool.get_connection(&unroutable(3)).await;
        assert!(matches!(
            result,
            Err(Error::MaxConnectionsExceeded { current: 2, max: 2 })
        ));
        assert_eq!(pool.session_count(), 2);
    }

    #[tokio::test]
    async fn test_ceiling_evicts_lru_idle_session() {
        let pool = RelayPool::new(test_config(2));

        let a = pool.get_connection(&unroutable(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _b = pool.get_connection(&unroutable(2)).await.unwrap();

        // Third relay: the oldest subscription-free session makes room.
        let _c = pool.get_connection(&unroutable(3)).await.unwrap();
        assert!(pool.session_count() <= 2);

        // The evicted session winds down to Closed.
        tokio::time::timeout(Duration::from_secs(5), async {
            while a.state() != SocketState::Closed {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("evicted session should close");
    }

    #[tokio::test]
    async fn test_ceiling_holds_under_concurrent_get_connection() {
        let pool = RelayPool::new(test_config(3));
        let urls: Vec<String> = (1..=8).map(unroutable).collect();

        let attempts: Vec<_> = urls.iter().map(|u| pool.get_connection(u)).collect();
        let results = futures::future::join_all(attempts).await;

        assert!(pool.session_count() <= 3);
        for result in results {
            match result {
                Ok(_) | Err(Error::MaxConnectionsExceeded { .. }) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let pool = RelayPool::new(test_config(2));
        let result = pool.get_connection("https://not-a-relay.example.com").await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_subscription_handle_close_is_idempotent() {
        let pool = RelayPool::new(test_config(4));
        let filter = Filter::new().kind(Kind::TextNote);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let urls = vec![unroutable(1), unroutable(2)];
        let first = pool.subscribe_many(&urls, filter.clone(), tx).await;
        let second = pool.subscribe_many(&urls, filter, tx2).await;
        assert_eq!(first.relay_count(), 2);

        let session = pool.get_connection(&unroutable(1)).await.unwrap();
        assert_eq!(session.subscription_count(), 2);

        first.close();
        first.close();
        assert!(first.is_closed());

        // The other subscription is untouched.
        assert_eq!(session.subscription_count(), 1);
        second.close();
        assert_eq!(session.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_query_sync_with_no_relays_is_empty() {
        let pool = RelayPool::new(test_config(2));
        let filter = Filter::new().kind(Kind::RelayList);
        let events = pool.query_sync(&[], filter, None).await;
        assert!(events.is_empty());
    }
}
