//! Persisted routing table: which relays to use per author.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          RouteStore                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  - Persists (pubkey, relay_url, read, write) routes to SQLite   │
//! │  - Wholesale-replaces a user's routes on upsert                 │
//! │  - Holds the last-discovery-run checkpoint                      │
//! │  - Survives process restart; in-memory variant for tests        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Routes are written only by the outbox router's upsert path; feed and
//! profile loaders read through [`RouteStore::get_routes`] and never write.

mod schema;
mod store;

use serde::{Deserialize, Serialize};

pub use store::{LAST_DISCOVERY_KEY, RouteStore, unix_now};

/// One discovered relay preference for one author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRoute {
    /// Author the route belongs to (hex pubkey).
    pub pubkey: String,
    /// Normalized relay URL.
    pub relay_url: String,
    /// The author reads from this relay; query it for mentions of them.
    pub can_read: bool,
    /// The author writes to this relay; query it for their content.
    pub can_write: bool,
    /// Unix time the route was discovered.
    pub discovered_at: u64,
}

impl RelayRoute {
    /// Routes must be usable in at least one direction.
    pub fn is_usable(&self) -> bool {
        self.can_read || self.can_write
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_usability() {
        let mut route = RelayRoute {
            pubkey: "ab".repeat(32),
            relay_url: "wss://relay.example.com".to_string(),
            can_read: true,
            can_write: false,
            discovered_at: 1_700_000_000,
        };
        assert!(route.is_usable());

        route.can_read = false;
        assert!(!route.is_usable());
    }
}
