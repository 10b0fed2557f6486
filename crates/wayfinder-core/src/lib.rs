//! Shared foundations for the Wayfinder relay router.
//!
//! This crate provides:
//! - Relay URL normalization and hygiene filtering
//! - Event validation (ID and signature verification per NIP-01) via the
//!   nostr crate, plus timestamp sanity checks for preference documents
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
pub mod event;
pub mod metrics;
pub mod url;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Nostr genesis date: November 7, 2020.
/// This is the date of the first Nostr commit. Documents with `created_at`
/// before this date are considered bogus.
pub const NOSTR_GENESIS_TIMESTAMP: u32 = 1604707200; // 2020-11-07 00:00:00 UTC

pub use error::{Error, Result};
pub use event::{validate_created_at, validate_document, validate_event};
pub use url::{UrlOutcome, normalize_relay_url, sanitize_discovered_url};
