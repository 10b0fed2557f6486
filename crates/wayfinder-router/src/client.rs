//! Caller-facing facade wiring storage, pool, router, and scheduler together.
//!
//! Feed, profile, and payment flows consume this surface; none of them touch
//! sockets or write routes directly. Discovery is fire-and-forget with
//! progress observed separately; query/publish/subscribe are direct pool
//! pass-throughs for callers needing ad hoc network access.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nostr::{Event, Filter, PublicKey};
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;
use crate::outbox::{OutboxConfig, OutboxRouter};
use crate::pool::{PoolConfig, PoolNotification, PublishResult, RelayPool, SubscriptionHandle};
use crate::routing::{RelayRoute, RouteStore};
use crate::scheduler::{
    DiscoveryProgress, DiscoveryScheduler, SchedulerConfig, SchedulerEvent,
};

/// Top-level configuration for an [`OutboxClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the routing SQLite database.
    pub db_path: PathBuf,
    /// Connection pool settings.
    pub pool: PoolConfig,
    /// Discovery protocol settings.
    pub outbox: OutboxConfig,
    /// Scheduling and refresh settings.
    pub scheduler: SchedulerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/routes.db"),
            pool: PoolConfig::default(),
            outbox: OutboxConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// The outbox subsystem behind one handle.
pub struct OutboxClient {
    pool: Arc<RelayPool>,
    store: Arc<RouteStore>,
    router: Arc<OutboxRouter>,
    scheduler: Arc<DiscoveryScheduler>,
}

impl OutboxClient {
    /// Open the client with a durable routing database.
    pub fn open(config: ClientConfig) -> Result<Self> {
        let store = Arc::new(RouteStore::open(&config.db_path)?);
        Ok(Self::build(store, config))
    }

    /// Open the client with an in-memory routing database (for testing).
    pub fn open_in_memory(config: ClientConfig) -> Result<Self> {
        let store = Arc::new(RouteStore::open_in_memory()?);
        Ok(Self::build(store, config))
    }

    fn build(store: Arc<RouteStore>, config: ClientConfig) -> Self {
        let pool = Arc::new(RelayPool::new(config.pool));
        let router = Arc::new(OutboxRouter::new(
            Arc::clone(&pool),
            Arc::clone(&store),
            config.outbox,
        ));
        let scheduler = Arc::new(DiscoveryScheduler::new(
            Arc::clone(&router),
            Arc::clone(&store),
            config.scheduler,
        ));

        Self {
            pool,
            store,
            router,
            scheduler,
        }
    }

    // =========================================================================
    // Discovery surface
    // =========================================================================

    /// Fire-and-forget discovery for `user_ids`; progress is observed via
    /// [`subscribe_events`](Self::subscribe_events) or
    /// [`discovery_progress`](Self::discovery_progress).
    pub fn discover_for_users(&self, user_ids: Vec<PublicKey>) {
        Arc::clone(&self.scheduler).discover_for_users(user_ids);
    }

    /// Whether a discovery run is active.
    pub fn is_discovering(&self) -> bool {
        self.scheduler.is_discovering()
    }

    /// Whether at least one discovery run has completed.
    pub fn has_completed_initial_discovery(&self) -> bool {
        self.scheduler.has_completed_initial_discovery()
    }

    /// Progress of the current (or last) discovery run.
    pub fn discovery_progress(&self) -> DiscoveryProgress {
        self.scheduler.progress()
    }

    /// Subscribe to run lifecycle and progress events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.scheduler.subscribe()
    }

    /// Relay set a running sweep is using; `None` when idle.
    pub fn active_discovery_relays(&self) -> Option<Vec<String>> {
        self.scheduler.active_discovery_relays()
    }

    // =========================================================================
    // Routing read path
    // =========================================================================

    /// Discovered routes for a user; empty if never discovered.
    pub fn get_routes(&self, pubkey: &PublicKey) -> Result<Vec<RelayRoute>> {
        self.store.get_routes(&pubkey.to_hex())
    }

    /// Explicit cache-clear of the routing table and checkpoints.
    pub fn clear_routes(&self) -> Result<()> {
        self.store.clear()
    }

    // =========================================================================
    // Pool pass-throughs
    // =========================================================================

    /// Relays with a currently open socket, without paying discovery cost.
    pub fn connected_relays(&self) -> Vec<String> {
        self.pool.connected_relays()
    }

    /// Query several relays and return the union of their results.
    pub async fn query_sync(
        &self,
        relay_urls: &[String],
        filter: Filter,
        timeout: Option<Duration>,
    ) -> Vec<Event> {
        self.pool.query_sync(relay_urls, filter, timeout).await
    }

    /// Publish an event to several relays with per-relay outcomes.
    pub async fn publish(
        &self,
        relay_urls: &[String],
        event: &Event,
        timeout: Option<Duration>,
    ) -> Vec<PublishResult> {
        self.pool.publish(relay_urls, event, timeout).await
    }

    /// Open a long-lived subscription across several relays.
    pub async fn subscribe_many(
        &self,
        relay_urls: &[String],
        filter: Filter,
        sender: mpsc::UnboundedSender<PoolNotification>,
    ) -> SubscriptionHandle {
        self.pool.subscribe_many(relay_urls, filter, sender).await
    }

    /// Close sessions idle beyond the idle threshold.
    pub fn force_cleanup(&self) {
        self.pool.force_cleanup()
    }

    /// Cancel any active run and close every session.
    pub fn shutdown(&self) {
        self.scheduler.cancel();
        self.scheduler.stop();
        self.pool.shutdown();
    }

    // =========================================================================
    // Component access for advanced callers
    // =========================================================================

    /// The underlying connection pool.
    pub fn pool(&self) -> &Arc<RelayPool> {
        &self.pool
    }

    /// The underlying route store.
    pub fn store(&self) -> &Arc<RouteStore> {
        &self.store
    }

    /// The underlying outbox router.
    pub fn router(&self) -> &Arc<OutboxRouter> {
        &self.router
    }

    /// The underlying scheduler (e.g. to drive `run_periodic`).
    pub fn scheduler(&self) -> &Arc<DiscoveryScheduler> {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::Keys;

    #[tokio::test]
    async fn test_open_in_memory_defaults() {
        let client = OutboxClient::open_in_memory(ClientConfig::default()).unwrap();

        assert!(!client.is_discovering());
        assert!(!client.has_completed_initial_discovery());
        assert_eq!(client.discovery_progress(), DiscoveryProgress::default());
        assert!(client.connected_relays().is_empty());

        let pk = Keys::generate().public_key();
        assert!(client.get_routes(&pk).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discover_with_empty_identity_set_is_noop() {
        let client = OutboxClient::open_in_memory(ClientConfig::default()).unwrap();
        client.discover_for_users(Vec::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!client.is_discovering());
        assert!(!client.has_completed_initial_discovery());
    }

    #[tokio::test]
    async fn test_shutdown_is_safe_when_idle() {
        let client = OutboxClient::open_in_memory(ClientConfig::default()).unwrap();
        client.shutdown();
        client.shutdown();
        assert!(client.connected_relays().is_empty());
    }
}
