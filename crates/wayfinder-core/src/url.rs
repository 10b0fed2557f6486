//! Relay URL normalization and hygiene filtering.
//!
//! Route quality depends on URL identity: `wss://Relay.Example.COM/` and
//! `wss://relay.example.com` must map to the same routing-table row, or a
//! single relay accumulates duplicate routes. All URLs entering the system
//! pass through [`normalize_relay_url`].
//!
//! URLs extracted from relay-preference documents are additionally untrusted
//! input: authors publish whatever they like, including loopback addresses,
//! private ranges, and mDNS names that a client must never dial. Those pass
//! through [`sanitize_discovered_url`], which applies a hygiene blocklist on
//! top of normalization. Caller-supplied connect URLs skip the blocklist so
//! local relays stay reachable in tests and private deployments.

use nostr::RelayUrl;

/// Outcome of normalizing or sanitizing a relay URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlOutcome {
    /// URL is valid and normalized.
    Ok(String),
    /// URL is syntactically invalid.
    Invalid(String),
    /// URL is valid but matches a hygiene blocklist pattern.
    Blocked(String),
}

impl UrlOutcome {
    /// Returns the normalized URL if valid.
    pub fn ok(self) -> Option<String> {
        match self {
            Self::Ok(url) => Some(url),
            _ => None,
        }
    }

    /// Returns true if the URL is valid and unblocked.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Normalize a relay URL without hygiene filtering.
///
/// Rules:
/// 1. Require a websocket scheme (`wss://` or `ws://`)
/// 2. Parse and canonicalize with [`RelayUrl`] (lowercases scheme and host,
///    drops default ports)
/// 3. Strip trailing slashes
pub fn normalize_relay_url(url: &str) -> UrlOutcome {
    let url = url.trim();

    if !url.starts_with("wss://") && !url.starts_with("ws://") {
        return UrlOutcome::Invalid("URL must start with wss:// or ws://".to_string());
    }

    let parsed = match RelayUrl::parse(url) {
        Ok(u) => u,
        Err(e) => return UrlOutcome::Invalid(format!("invalid relay URL: {}", e)),
    };

    let mut normalized = parsed.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }

    UrlOutcome::Ok(normalized)
}

/// Normalize and hygiene-filter a relay URL from an untrusted source.
///
/// Applies [`normalize_relay_url`] and then rejects addresses a client must
/// never dial on behalf of a third party:
/// - localhost / loopback (127.x)
/// - 0.0.0.0
/// - private IPv4 ranges (10/8, 172.16/12, 192.168/16)
/// - link-local IPv4 (169.254/16)
/// - IPv6 loopback, link-local, and unique-local ranges
/// - `.onion` (Tor) and `.local` (mDNS) names
pub fn sanitize_discovered_url(url: &str) -> UrlOutcome {
    let normalized = match normalize_relay_url(url) {
        UrlOutcome::Ok(u) => u,
        other => return other,
    };

    if let Some(reason) = hygiene_block_reason(&normalized) {
        return UrlOutcome::Blocked(reason);
    }

    UrlOutcome::Ok(normalized)
}

/// Check a normalized URL against the hygiene blocklist.
///
/// Returns `Some(reason)` if blocked, `None` if allowed.
fn hygiene_block_reason(url: &str) -> Option<String> {
    let host = extract_host(url);

    if host == "localhost" || host.starts_with("localhost:") {
        return Some("localhost not allowed".to_string());
    }
    if host.starts_with("0.0.0.0") {
        return Some("unspecified address (0.0.0.0) not allowed".to_string());
    }
    if host.starts_with("127.") {
        return Some("loopback address not allowed".to_string());
    }
    if host.starts_with("192.168.") {
        return Some("private IP (192.168.x.x) not allowed".to_string());
    }
    if host.starts_with("10.") {
        return Some("private IP (10.x.x.x) not allowed".to_string());
    }
    // 172.16.0.0 - 172.31.255.255
    if host.starts_with("172.")
        && let Some(second_octet) = host.split('.').nth(1)
        && let Ok(n) = second_octet.parse::<u8>()
        && (16..=31).contains(&n)
    {
        return Some("private IP (172.16-31.x.x) not allowed".to_string());
    }
    if host.starts_with("169.254.") {
        return Some("link-local address (169.254.x.x) not allowed".to_string());
    }
    if host.starts_with("[::1]") {
        return Some("IPv6 loopback (::1) not allowed".to_string());
    }
    if host.starts_with("[fe80:") {
        return Some("IPv6 link-local (fe80::) not allowed".to_string());
    }
    if host.starts_with("[fc") || host.starts_with("[fd") {
        return Some("IPv6 unique local (fc00::/7) not allowed".to_string());
    }
    if host.ends_with(".onion") || host.contains(".onion:") {
        return Some(".onion addresses not allowed".to_string());
    }
    if host.ends_with(".local") || host.contains(".local:") {
        return Some(".local addresses not allowed".to_string());
    }
    if host.is_empty() || host.len() < 3 {
        return Some("host too short".to_string());
    }

    None
}

/// Extract the host portion from a websocket URL.
fn extract_host(url: &str) -> &str {
    let without_scheme = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .unwrap_or(url);

    without_scheme.split('/').next().unwrap_or(without_scheme)
}
