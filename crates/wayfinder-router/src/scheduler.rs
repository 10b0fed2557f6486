//! Decides *when* and *for whom* to run outbox discovery.
//!
//! The scheduler owns all run state explicitly (no ambient globals): the
//! running/cancel flags, progress counters, the per-process discovered-user
//! set, and the active-relay conflict list. One run is active at a time;
//! triggers arriving mid-run are no-ops.
//!
//! # Triggers
//!
//! - Cold routing table: forces a run regardless of freshness
//! - Explicit [`DiscoveryScheduler::discover_for_users`]
//! - The periodic timer in [`DiscoveryScheduler::run_periodic`]
//! - Elapsed time since the persisted last run beyond the minimum refresh
//!   interval
//!
//! Any true condition triggers exactly one run; there is no priority between
//! them.
//!
//! # Progress
//!
//! Batches run sequentially with a politeness delay between them. After each
//! batch a [`SchedulerEvent::Progress`] is broadcast; callers subscribe via
//! [`DiscoveryScheduler::subscribe`] or poll
//! [`DiscoveryScheduler::progress`]. A run always reaches `Completed`, even
//! when every bootstrap relay is unreachable, so callers are never blocked on
//! a stuck run.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use nostr::PublicKey;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::outbox::{DiscoveryResult, OutboxRouter};
use crate::routing::{RouteStore, unix_now};

/// Configuration for the discovery scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Known-good relays queried for preference documents.
    pub bootstrap_relays: Vec<String>,
    /// How often the periodic loop re-runs discovery.
    pub refresh_interval: Duration,
    /// Minimum gap between runs; triggers inside the gap are no-ops unless
    /// the routing table is cold.
    pub min_refresh_interval: Duration,
    /// Politeness delay between consecutive batches within one run.
    pub batch_delay: Duration,
    /// Capacity of the progress broadcast channel.
    pub event_channel_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            bootstrap_relays: vec![
                "wss://purplepag.es".to_string(),
                "wss://relay.damus.io".to_string(),
                "wss://relay.nostr.band".to_string(),
                "wss://nos.lol".to_string(),
            ],
            refresh_interval: Duration::from_secs(2 * 3600),
            min_refresh_interval: Duration::from_secs(30 * 60),
            batch_delay: Duration::from_millis(500),
            event_channel_size: 64,
        }
    }
}

/// Snapshot of a run's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryProgress {
    /// Users whose batch has finished.
    pub completed: usize,
    /// Users in the run.
    pub total: usize,
}

impl DiscoveryProgress {
    /// Progress as a percentage; 100 only when every user is done.
    pub fn percentage(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        if self.completed >= self.total {
            return 100;
        }
        let pct = ((self.completed as f64 / self.total as f64) * 100.0).round() as u8;
        pct.min(99)
    }
}

/// Broadcast notifications about discovery runs.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A run started for `total` users.
    Started { total: usize },
    /// A batch finished.
    Progress(DiscoveryProgress),
    /// The run finished (successfully, partially, or cancelled).
    Completed { result: DiscoveryResult },
}

/// Orchestrates discovery runs over the router and store.
pub struct DiscoveryScheduler {
    router: Arc<OutboxRouter>,
    store: Arc<RouteStore>,
    config: SchedulerConfig,
    /// Mutual exclusion for runs; a trigger while set is a no-op.
    running: AtomicBool,
    /// Cooperative cancellation, honored between batches.
    cancel: AtomicBool,
    /// Stops the periodic loop.
    periodic_stop: AtomicBool,
    /// Latched after the first run completes.
    completed_initial: AtomicBool,
    progress: Mutex<DiscoveryProgress>,
    /// Users touched by any run in this process.
    discovered: Mutex<HashSet<PublicKey>>,
    /// Relay set in use while a run is active, for contention avoidance.
    active_relays: Mutex<Vec<String>>,
    events_tx: broadcast::Sender<SchedulerEvent>,
}

impl DiscoveryScheduler {
    /// Create a scheduler over the given router and store.
    pub fn new(router: Arc<OutboxRouter>, store: Arc<RouteStore>, config: SchedulerConfig) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_channel_size.max(1));
        Self {
            router,
            store,
            config,
            running: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            periodic_stop: AtomicBool::new(false),
            completed_initial: AtomicBool::new(false),
            progress: Mutex::new(DiscoveryProgress::default()),
            discovered: Mutex::new(HashSet::new()),
            active_relays: Mutex::new(Vec::new()),
            events_tx,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Subscribe to run lifecycle and progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events_tx.subscribe()
    }

    /// Whether a run is currently active.
    pub fn is_discovering(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether at least one run has completed since process start.
    pub fn has_completed_initial_discovery(&self) -> bool {
        self.completed_initial.load(Ordering::SeqCst)
    }

    /// Snapshot of the current (or last) run's progress.
    pub fn progress(&self) -> DiscoveryProgress {
        *self.progress.lock()
    }

    /// The relay set a running sweep is using, for callers that want to
    /// avoid contending for the same sockets. `None` when idle.
    pub fn active_discovery_relays(&self) -> Option<Vec<String>> {
        if self.is_discovering() {
            Some(self.active_relays.lock().clone())
        } else {
            None
        }
    }

    /// Users touched by any run in this process.
    pub fn discovered_users(&self) -> usize {
        self.discovered.lock().len()
    }

    /// Request cancellation of the active run; honored between batches.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Stop the periodic loop.
    pub fn stop(&self) {
        self.periodic_stop.store(true, Ordering::SeqCst);
    }

    /// Decide whether a trigger should start a run.
    ///
    /// Any of these makes it a yes: the routing table is cold, no run was
    /// ever recorded, or the minimum refresh interval has elapsed. A run in
    /// progress or an empty identity set is always a no.
    fn should_run(&self, user_ids: &[PublicKey]) -> bool {
        if user_ids.is_empty() {
            return false;
        }
        if self.running.load(Ordering::SeqCst) {
            return false;
        }

        // A cold table forces discovery regardless of freshness.
        match self.store.is_empty() {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("failed to check routing table: {}", e);
                return true;
            }
        }

        match self.store.last_discovery_at() {
            Ok(Some(last_run)) => {
                let elapsed = (unix_now() as u64).saturating_sub(last_run);
                elapsed >= self.config.min_refresh_interval.as_secs()
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!("failed to read last discovery time: {}", e);
                true
            }
        }
    }

    /// Fire-and-forget discovery for `user_ids`.
    ///
    /// No-op when a run is active or the freshness gate says the routing
    /// table is still warm. Progress is observed via [`subscribe`] or
    /// [`progress`].
    ///
    /// [`subscribe`]: Self::subscribe
    /// [`progress`]: Self::progress
    pub fn discover_for_users(self: Arc<Self>, user_ids: Vec<PublicKey>) {
        if !self.should_run(&user_ids) {
            tracing::debug!(
                "discovery trigger for {} users skipped (running or fresh)",
                user_ids.len()
            );
            return;
        }
        tokio::spawn(async move {
            self.run_discovery(user_ids).await;
        });
    }

    /// Run one discovery sweep for `user_ids`.
    ///
    /// Mutually exclusive: a call while another run is active returns an
    /// empty result immediately. The run always terminates and records its
    /// completion time, even when every bootstrap relay fails.
    pub async fn run_discovery(&self, user_ids: Vec<PublicKey>) -> DiscoveryResult {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("discovery already running, trigger is a no-op");
            return DiscoveryResult::empty();
        }

        self.cancel.store(false, Ordering::SeqCst);
        let started = Instant::now();
        let total = user_ids.len();
        *self.progress.lock() = DiscoveryProgress {
            completed: 0,
            total,
        };
        *self.active_relays.lock() = self.config.bootstrap_relays.clone();

        gauge!("discovery_in_progress").set(1.0);
        counter!("discovery_runs_total").increment(1);
        let _ = self.events_tx.send(SchedulerEvent::Started { total });
        tracing::info!(
            "discovery run starting: {} users across {} bootstrap relays",
            total,
            self.config.bootstrap_relays.len()
        );

        let mut result = DiscoveryResult::empty();
        let batch_size = self.router.config().batch_size.max(1);
        let batch_count = total.div_ceil(batch_size);

        for (index, batch) in user_ids.chunks(batch_size).enumerate() {
            if self.cancel.load(Ordering::SeqCst) {
                tracing::info!(
                    "discovery run cancelled after {} of {} batches",
                    index,
                    batch_count
                );
                break;
            }

            let outcome = self
                .router
                .discover_batch(batch, &self.config.bootstrap_relays)
                .await;
            result.merge(outcome);

            let snapshot = {
                let mut progress = self.progress.lock();
                progress.completed += batch.len();
                *progress
            };
            self.discovered.lock().extend(batch.iter().copied());
            let _ = self.events_tx.send(SchedulerEvent::Progress(snapshot));

            if index + 1 < batch_count {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        // Completion is unconditional so callers never see a stuck run.
        let finished_at = unix_now() as u64;
        if let Err(e) = self.store.set_last_discovery_at(finished_at) {
            tracing::warn!("failed to persist last discovery time: {}", e);
        }

        gauge!("discovery_last_run_unix").set(finished_at as f64);
        gauge!("discovery_in_progress").set(0.0);
        histogram!("discovery_run_duration_seconds").record(started.elapsed().as_secs_f64());

        self.active_relays.lock().clear();
        self.completed_initial.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(SchedulerEvent::Completed { result });

        tracing::info!(
            "discovery run finished: {} documents, {} users in {:?}",
            result.events_found,
            result.users_discovered,
            started.elapsed()
        );

        result
    }

    /// Periodic refresh loop.
    ///
    /// Every `refresh_interval`, asks `user_ids_fn` for the current identity
    /// set and runs discovery if the freshness gate allows it. Returns when
    /// [`stop`](Self::stop) is called.
    pub async fn run_periodic<F>(&self, user_ids_fn: F)
    where
        F: Fn() -> Vec<PublicKey> + Send + Sync,
    {
        self.periodic_stop.store(false, Ordering::SeqCst);
        tracing::info!(
            "periodic discovery started (interval: {}s)",
            self.config.refresh_interval.as_secs()
        );

        loop {
            let waited_from = Instant::now();
            while waited_from.elapsed() < self.config.refresh_interval {
                if self.periodic_stop.load(Ordering::SeqCst) {
                    tracing::info!("periodic discovery stopped");
                    return;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            let users = user_ids_fn();
            if self.should_run(&users) {
                let _ = self.run_discovery(users).await;
            }
        }
    }
}
