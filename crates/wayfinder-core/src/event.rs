//! Event validation utilities using the nostr crate.
//!
//! Relay-preference documents arrive from relays the client does not control,
//! so every document is authenticated per NIP-01 before it can influence
//! routing:
//! - Event ID is the SHA-256 of the canonical serialization
//! - Signature is a valid Schnorr signature over the event ID
//! - `created_at` falls inside a sane window

use nostr::{Event, Timestamp};

use crate::error::{Error, Result};
use crate::NOSTR_GENESIS_TIMESTAMP;

/// Maximum tolerated clock skew for `created_at` values in the future.
const MAX_FUTURE_SKEW_SECS: u64 = 86_400;

/// Validate the ID and signature of an event.
///
/// # Errors
///
/// Returns an error if the event ID doesn't match the computed hash or the
/// signature doesn't verify against the author's public key.
pub fn validate_event(event: &Event) -> Result<()> {
    if !event.verify_id() {
        return Err(Error::InvalidEventId(event.id.to_hex()));
    }
    if !event.verify_signature() {
        return Err(Error::InvalidSignature(format!(
            "signature verification failed for event {}",
            event.id.to_hex()
        )));
    }
    Ok(())
}

/// Validate an event's `created_at` timestamp.
///
/// Rejects timestamps before the Nostr genesis date and timestamps more than
/// a day in the future. Bogus `created_at` values would otherwise win the
/// newest-document-per-author selection forever.
pub fn validate_created_at(event: &Event) -> Result<()> {
    let created_at = event.created_at.as_secs();

    if created_at < u64::from(NOSTR_GENESIS_TIMESTAMP) {
        return Err(Error::InvalidField {
            field: "created_at",
            reason: format!("{} predates the Nostr genesis", created_at),
        });
    }

    let horizon = Timestamp::now().as_secs().saturating_add(MAX_FUTURE_SKEW_SECS);
    if created_at > horizon {
        return Err(Error::InvalidField {
            field: "created_at",
            reason: format!("{} is too far in the future", created_at),
        });
    }

    Ok(())
}

/// Full validation for a document of an expected kind.
///
/// Combines kind check, timestamp sanity, and ID/signature verification.
pub fn validate_document(event: &Event, expected_kind: nostr::Kind) -> Result<()> {
    if event.kind != expected_kind {
        return Err(Error::InvalidField {
            field: "kind",
            reason: format!(
                "expected kind {}, got {}",
                expected_kind.as_u16(),
                event.kind.as_u16()
            ),
        });
    }
    validate_created_at(event)?;
    validate_event(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, JsonUtil, Keys, Kind, Tag};

    fn signed_relay_list(keys: &Keys) -> Event {
        EventBuilder::new(Kind::RelayList, "")
            .tags([Tag::parse(["r", "wss://relay.example.com"]).unwrap()])
            .sign_with_keys(keys)
            .unwrap()
    }

    #[test]
    fn test_validate_signed_event() {
        let keys = Keys::generate();
        let event = signed_relay_list(&keys);
        assert!(validate_event(&event).is_ok());
        assert!(validate_document(&event, Kind::RelayList).is_ok());
    }

    #[test]
    fn test_validate_rejects_tampered_content() {
        let keys = Keys::generate();
        let event = signed_relay_list(&keys);

        // Rewrite the content without re-signing: the ID no longer matches.
        let mut json: serde_json::Value = serde_json::from_str(&event.as_json()).unwrap();
        json["content"] = serde_json::Value::String("tampered".to_string());
        let tampered = Event::from_json(json.to_string()).unwrap();

        assert!(validate_event(&tampered).is_err());
    }

    #[test]
    fn test_validate_rejects_wrong_kind() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::TextNote, "hello")
            .sign_with_keys(&keys)
            .unwrap();

        let err = validate_document(&event, Kind::RelayList).unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "kind", .. }));
    }

    #[test]
    fn test_validate_rejects_pre_genesis_timestamp() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::RelayList, "")
            .custom_created_at(Timestamp::from(1_000_000u64))
            .sign_with_keys(&keys)
            .unwrap();

        let err = validate_created_at(&event).unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "created_at", .. }));
    }

    #[test]
    fn test_validate_rejects_far_future_timestamp() {
        let keys = Keys::generate();
        let future = Timestamp::now().as_secs() + 7 * 86_400;
        let event = EventBuilder::new(Kind::RelayList, "")
            .custom_created_at(Timestamp::from(future))
            .sign_with_keys(&keys)
            .unwrap();

        assert!(validate_created_at(&event).is_err());
    }
}
