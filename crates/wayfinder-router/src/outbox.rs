//! Outbox discovery: fetch relay-preference documents and turn them into routes.
//!
//! Each user publishes a kind 10002 relay list (NIP-65) declaring where they
//! read and write. Discovery queries the bootstrap relays for those documents,
//! keeps the newest per author, parses the `r` tags, and replaces the author's
//! route set in storage.
//!
//! Documents are untrusted: they are authenticated (ID + signature), their
//! timestamps sanity-checked, and every relay URL passes hygiene filtering
//! before it can become a route. A malformed tag skips that tag; a malformed
//! document skips that document; neither fails discovery.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use nostr::{Event, Filter, Kind, PublicKey};

use crate::pool::RelayPool;
use crate::routing::{RelayRoute, RouteStore, unix_now};
use wayfinder_core::{UrlOutcome, sanitize_discovered_url, validate_created_at, validate_event};

/// Configuration for the outbox router.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Users per discovery request; bounds the relay-side filter size.
    pub batch_size: usize,
    /// Verify document IDs and signatures before trusting them.
    pub verify_documents: bool,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            verify_documents: true,
        }
    }
}

/// Outcome of a discovery call, summed across batches.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoveryResult {
    /// False only when writing routes to storage failed.
    pub success: bool,
    /// Preference documents returned by the bootstrap relays.
    pub events_found: usize,
    /// Users whose route sets were upserted.
    pub users_discovered: usize,
}

impl DiscoveryResult {
    /// A successful result with nothing discovered yet.
    pub fn empty() -> Self {
        Self {
            success: true,
            events_found: 0,
            users_discovered: 0,
        }
    }

    /// Fold another batch outcome into this one.
    pub fn merge(&mut self, other: DiscoveryResult) {
        self.success = self.success && other.success;
        self.events_found += other.events_found;
        self.users_discovered += other.users_discovered;
    }
}

/// Discovery protocol logic over a pool and a route store.
pub struct OutboxRouter {
    pool: Arc<RelayPool>,
    store: Arc<RouteStore>,
    config: OutboxConfig,
}

impl OutboxRouter {
    /// Create a router over the given pool and store.
    pub fn new(pool: Arc<RelayPool>, store: Arc<RouteStore>, config: OutboxConfig) -> Self {
        Self {
            pool,
            store,
            config,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Discover routes for up to one batch of users.
    ///
    /// Issues a single `query_sync` against the bootstrap relays, selects the
    /// newest document per author, and upserts the parsed routes. Callers
    /// wanting batching and politeness delays use
    /// [`discover_outbox_events`](Self::discover_outbox_events) or the
    /// scheduler.
    pub async fn discover_batch(
        &self,
        user_ids: &[PublicKey],
        bootstrap_relays: &[String],
    ) -> DiscoveryResult {
        if user_ids.is_empty() {
            return DiscoveryResult::empty();
        }

        let filter = Filter::new()
            .authors(user_ids.iter().copied())
            .kind(Kind::RelayList)
            .limit(user_ids.len().saturating_mul(4));

        let events = self.pool.query_sync(bootstrap_relays, filter, None).await;
        counter!("discovery_batches_total").increment(1);
        counter!("discovery_documents_total").increment(events.len() as u64);

        let events_found = events.len();
        let latest = latest_per_author(events, self.config.verify_documents);

        let discovered_at = unix_now() as u64;
        let mut users_discovered = 0usize;
        let mut success = true;

        for (author, document) in latest {
            let routes = parse_relay_list(&document, discovered_at);
            tracing::debug!(
                "parsed {} routes for {} from document {}",
                routes.len(),
                author.to_hex(),
                document.id.to_hex()
            );

            // An empty set still replaces: a fresher document with no usable
            // relays clears the author's stale routes.
            match self.store.upsert_routes(&author.to_hex(), &routes) {
                Ok(_) => users_discovered += 1,
                Err(e) => {
                    tracing::error!("failed to upsert routes for {}: {}", author.to_hex(), e);
                    success = false;
                }
            }
        }

        counter!("discovery_users_discovered_total").increment(users_discovered as u64);

        DiscoveryResult {
            success,
            events_found,
            users_discovered,
        }
    }

    /// Discover routes for any number of users, in fixed-size batches.
    ///
    /// Batches run sequentially; the result is the sum of per-batch outcomes.
    pub async fn discover_outbox_events(
        &self,
        user_ids: &[PublicKey],
        bootstrap_relays: &[String],
    ) -> DiscoveryResult {
        let mut total = DiscoveryResult::empty();
        for batch in user_ids.chunks(self.config.batch_size) {
            total.merge(self.discover_batch(batch, bootstrap_relays).await);
        }
        total
    }
}

/// Select the authoritative document per author.
///
/// Strictly newer `created_at` wins; equal timestamps keep the first seen.
/// Documents failing kind, timestamp, or (when enabled) ID/signature
/// validation are skipped and counted.
fn latest_per_author(events: Vec<Event>, verify: bool) -> HashMap<PublicKey, Event> {
    let mut latest: HashMap<PublicKey, Event> = HashMap::new();

    for event in events {
        if event.kind != Kind::RelayList {
            counter!("discovery_documents_invalid_total").increment(1);
            continue;
        }
        if let Err(e) = validate_created_at(&event) {
            counter!("discovery_documents_invalid_total").increment(1);
            tracing::debug!("skipping document {}: {}", event.id.to_hex(), e);
            continue;
        }
        if verify && let Err(e) = validate_event(&event) {
            counter!("discovery_documents_invalid_total").increment(1);
            tracing::debug!("skipping document {}: {}", event.id.to_hex(), e);
            continue;
        }

        match latest.entry(event.pubkey) {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                if event.created_at > slot.get().created_at {
                    slot.insert(event);
                }
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(event);
            }
        }
    }

    latest
}

/// Parse a relay-preference document's `r` tags into routes.
///
/// Tag forms:
/// - `["r", <url>]`: read and write
/// - `["r", <url>, "read"]`: read only
/// - `["r", <url>, "write"]`: write only
///
/// Unknown markers fall back to read+write. Tags without a URL, with an
/// invalid URL, or with a blocked URL are skipped. A relay listed more than
/// once merges by OR-ing the flags.
fn parse_relay_list(event: &Event, discovered_at: u64) -> Vec<RelayRoute> {
    let author = event.pubkey.to_hex();
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, (bool, bool)> = HashMap::new();

    for tag in event.tags.iter() {
        let slice = tag.as_slice();
        if slice.first().map(String::as_str) != Some("r") {
            continue;
        }
        let Some(raw_url) = slice.get(1) else {
            tracing::debug!("skipping relay tag without URL in {}", event.id.to_hex());
            continue;
        };

        let url = match sanitize_discovered_url(raw_url) {
            UrlOutcome::Ok(url) => url,
            UrlOutcome::Invalid(reason) => {
                tracing::debug!("skipping invalid relay URL '{}': {}", raw_url, reason);
                continue;
            }
            UrlOutcome::Blocked(reason) => {
                tracing::debug!("skipping blocked relay URL '{}': {}", raw_url, reason);
                continue;
            }
        };

        let (can_read, can_write) = match slice.get(2).map(String::as_str) {
            Some("read") => (true, false),
            Some("write") => (false, true),
            _ => (true, true),
        };

        match merged.entry(url.clone()) {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let flags = slot.get_mut();
                flags.0 |= can_read;
                flags.1 |= can_write;
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert((can_read, can_write));
                order.push(url);
            }
        }
    }

    order
        .into_iter()
        .map(|url| {
            let (can_read, can_write) = merged[&url];
            RelayRoute {
                pubkey: author.clone(),
                relay_url: url,
                can_read,
                can_write,
                discovered_at,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Tag, Timestamp};

    fn relay_list(keys: &Keys, tags: &[&[&str]], created_at: u64) -> Event {
        EventBuilder::new(Kind::RelayList, "")
            .tags(tags.iter().map(|t| Tag::parse(t.to_vec()).unwrap()))
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(keys)
            .unwrap()
    }

    fn now() -> u64 {
        Timestamp::now().as_secs()
    }

    #[test]
    fn test_parse_markers_round_trip() {
        let keys = Keys::generate();
        let event = relay_list(
            &keys,
            &[&["r", "wss://a.com"], &["r", "wss://b.com", "read"]],
            now(),
        );

        let routes = parse_relay_list(&event, 1);
        assert_eq!(routes.len(), 2);

        assert_eq!(routes[0].relay_url, "wss://a.com");
        assert!(routes[0].can_read && routes[0].can_write);

        assert_eq!(routes[1].relay_url, "wss://b.com");
        assert!(routes[1].can_read);
        assert!(!routes[1].can_write);
    }

    #[test]
    fn test_parse_write_marker() {
        let keys = Keys::generate();
        let event = relay_list(&keys, &[&["r", "wss://w.com", "write"]], now());

        let routes = parse_relay_list(&event, 1);
        assert_eq!(routes.len(), 1);
        assert!(!routes[0].can_read);
        assert!(routes[0].can_write);
    }

    #[test]
    fn test_parse_unknown_marker_implies_both() {
        let keys = Keys::generate();
        let event = relay_list(&keys, &[&["r", "wss://x.com", "inbox"]], now());

        let routes = parse_relay_list(&event, 1);
        assert!(routes[0].can_read && routes[0].can_write);
    }

    #[test]
    fn test_parse_skips_malformed_tags() {
        let keys = Keys::generate();
        let event = relay_list(
            &keys,
            &[
                &["r"],                          // missing URL
                &["r", "not-a-websocket-url"],   // invalid scheme
                &["r", "wss://localhost:8080"],  // blocked by hygiene
                &["e", "wss://decoy.com"],       // different tag kind
                &["r", "wss://good.com"],
            ],
            now(),
        );

        let routes = parse_relay_list(&event, 1);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].relay_url, "wss://good.com");
    }

    #[test]
    fn test_parse_merges_duplicate_relays() {
        let keys = Keys::generate();
        let event = relay_list(
            &keys,
            &[
                &["r", "wss://dup.com", "read"],
                &["r", "wss://dup.com/", "write"],
            ],
            now(),
        );

        let routes = parse_relay_list(&event, 1);
        assert_eq!(routes.len(), 1);
        assert!(routes[0].can_read && routes[0].can_write);
    }

    #[test]
    fn test_parse_normalizes_urls() {
        let keys = Keys::generate();
        let event = relay_list(&keys, &[&["r", "wss://Mixed.Case.COM/"]], now());

        let routes = parse_relay_list(&event, 1);
        assert_eq!(routes[0].relay_url, "wss://mixed.case.com");
    }

    #[test]
    fn test_latest_per_author_prefers_newer() {
        let keys = Keys::generate();
        let older = relay_list(&keys, &[&["r", "wss://old.com"]], now() - 100);
        let newer = relay_list(&keys, &[&["r", "wss://new.com"]], now());

        let latest = latest_per_author(vec![older, newer.clone()], true);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[&keys.public_key()].id, newer.id);
    }

    #[test]
    fn test_latest_per_author_tie_keeps_first_seen() {
        let keys = Keys::generate();
        let ts = now();
        let first = relay_list(&keys, &[&["r", "wss://first.com"]], ts);
        let second = relay_list(&keys, &[&["r", "wss://second.com"]], ts);

        let latest = latest_per_author(vec![first.clone(), second], true);
        assert_eq!(latest[&keys.public_key()].id, first.id);
    }

    #[test]
    fn test_latest_per_author_skips_tampered_documents() {
        use nostr::JsonUtil;

        let keys = Keys::generate();
        let event = relay_list(&keys, &[&["r", "wss://a.com"]], now());

        let mut json: serde_json::Value = serde_json::from_str(&event.as_json()).unwrap();
        json["tags"] = serde_json::json!([["r", "wss://evil.example.com"]]);
        let tampered = Event::from_json(json.to_string()).unwrap();

        let latest = latest_per_author(vec![tampered], true);
        assert!(latest.is_empty());
    }

    #[test]
    fn test_latest_per_author_keeps_distinct_authors() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let a = relay_list(&alice, &[&["r", "wss://a.com"]], now());
        let b = relay_list(&bob, &[&["r", "wss://b.com"]], now());

        let latest = latest_per_author(vec![a, b], true);
        assert_eq!(latest.len(), 2);
    }

    #[test]
    fn test_latest_per_author_rejects_wrong_kind() {
        let keys = Keys::generate();
        let note = EventBuilder::new(Kind::TextNote, "not a relay list")
            .sign_with_keys(&keys)
            .unwrap();

        let latest = latest_per_author(vec![note], true);
        assert!(latest.is_empty());
    }

    #[test]
    fn test_result_merge() {
        let mut total = DiscoveryResult::empty();
        total.merge(DiscoveryResult {
            success: true,
            events_found: 3,
            users_discovered: 2,
        });
        total.merge(DiscoveryResult {
            success: false,
            events_found: 1,
            users_discovered: 1,
        });

        assert!(!total.success);
        assert_eq!(total.events_found, 4);
        assert_eq!(total.users_discovered, 3);
    }
}
