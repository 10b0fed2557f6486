//! Relay connection pool and outbox discovery router for Nostr clients.
//!
//! The hard problem this crate solves is not rendering notes but locating,
//! connecting to, and querying the correct subset of many independent,
//! unreliable relays for a given user, and keeping a locally persisted
//! routing table telling the rest of the application which relays to use per
//! author (the "outbox model").
//!
//! # Modules
//!
//! - [`wire`] - NIP-01 frame encoding and the typed parse boundary
//! - [`session`] - one managed WebSocket per relay, reconnect with backoff
//! - [`pool`] - bounded multiplexed session pool: query, publish, subscribe
//! - [`routing`] - SQLite-persisted routing table and run checkpoints
//! - [`outbox`] - NIP-65 discovery protocol: fetch, validate, parse, upsert
//! - [`scheduler`] - when to discover: triggers, batching, progress
//! - [`client`] - the facade callers consume
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │ DiscoveryScheduler │  triggers, freshness gate, batches, progress
//! └─────────┬──────────┘
//!           ▼
//! ┌────────────────────┐
//! │    OutboxRouter    │  kind-10002 queries, newest-per-author, parsing
//! └───┬──────────┬─────┘
//!     │          ▼
//!     │   ┌────────────┐
//!     │   │ RouteStore │  SQLite: routes + last-run checkpoint
//!     │   └────────────┘
//!     ▼
//! ┌────────────────────┐
//! │     RelayPool      │  connection ceiling, LRU idle eviction
//! └─────────┬──────────┘
//!           ▼
//! ┌────────────────────┐
//! │ ConnectionSession  │  one WebSocket, demux by request id, backoff
//! └────────────────────┘
//! ```
//!
//! Results flow back up into the route store, which feed and profile loaders
//! read independently of the discovery path.

pub mod client;
pub mod error;
pub mod outbox;
pub mod pool;
pub mod routing;
pub mod scheduler;
pub mod session;
pub mod wire;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use client::{ClientConfig, OutboxClient};
pub use outbox::{DiscoveryResult, OutboxConfig, OutboxRouter};
pub use pool::{
    PoolConfig, PoolNotification, PublishResult, RelayPool, SubscriptionHandle,
};
pub use routing::{RelayRoute, RouteStore};
pub use scheduler::{
    DiscoveryProgress, DiscoveryScheduler, SchedulerConfig, SchedulerEvent,
};
pub use session::{ConnectionSession, SessionConfig, SocketState};
