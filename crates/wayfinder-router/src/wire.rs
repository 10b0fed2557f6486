//! NIP-01 wire framing for relay WebSocket messages.
//!
//! Relays speak JSON arrays whose first element is a verb. This module is the
//! parse boundary between raw socket text and typed values: outgoing frames
//! are built from `nostr` types, incoming text becomes a [`RelayFrame`] or a
//! `MalformedFrame` error. Sessions log and skip malformed frames; they are
//! never fatal to the connection.
//!
//! Frames handled:
//!
//! ```text
//! client -> relay    ["REQ", <sub_id>, <filter>]
//!                    ["CLOSE", <sub_id>]
//!                    ["EVENT", <event>]
//! relay -> client    ["EVENT", <sub_id>, <event>]
//!                    ["EOSE", <sub_id>]
//!                    ["OK", <event_id>, <accepted>, <message>]
//!                    ["NOTICE", <message>]
//!                    ["CLOSED", <sub_id>, <message>]
//! ```

use nostr::{Event, Filter};
use serde_json::{Value, json};

use crate::error::{Error, Result};

/// A parsed relay-to-client frame.
#[derive(Debug, Clone)]
pub enum RelayFrame {
    /// An event matching one of our subscriptions.
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    /// End of stored events for a subscription; live events may follow.
    EndOfStored { subscription_id: String },
    /// Acknowledgement of a published event.
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// Human-readable notice from the relay.
    Notice { message: String },
    /// The relay closed one of our subscriptions.
    Closed {
        subscription_id: String,
        message: String,
    },
}

/// Build a `REQ` frame opening a subscription.
pub fn req_frame(subscription_id: &str, filter: &Filter) -> String {
    json!(["REQ", subscription_id, filter]).to_string()
}

/// Build a `CLOSE` frame ending a subscription.
pub fn close_frame(subscription_id: &str) -> String {
    json!(["CLOSE", subscription_id]).to_string()
}

/// Build an `EVENT` frame publishing an event.
pub fn event_frame(event: &Event) -> String {
    json!(["EVENT", event]).to_string()
}

/// Parse a relay-to-client frame.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] for anything that is not a well-formed
/// known frame: non-array JSON, unknown verbs, missing or mistyped fields.
pub fn parse_frame(text: &str) -> Result<RelayFrame> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::MalformedFrame(format!("not JSON: {}", e)))?;

    let arr = value
        .as_array()
        .ok_or_else(|| Error::MalformedFrame("frame is not an array".to_string()))?;

    let verb = arr
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedFrame("missing verb".to_string()))?;

    match verb {
        "EVENT" => {
            let subscription_id = str_at(arr, 1, "subscription id")?;
            let raw = arr
                .get(2)
                .ok_or_else(|| Error::MalformedFrame("EVENT missing payload".to_string()))?;
            let event: Event = serde_json::from_value(raw.clone())
                .map_err(|e| Error::MalformedFrame(format!("bad event payload: {}", e)))?;
            Ok(RelayFrame::Event {
                subscription_id,
                event: Box::new(event),
            })
        }
        "EOSE" => Ok(RelayFrame::EndOfStored {
            subscription_id: str_at(arr, 1, "subscription id")?,
        }),
        "OK" => {
            let event_id = str_at(arr, 1, "event id")?;
            let accepted = arr
                .get(2)
                .and_then(Value::as_bool)
                .ok_or_else(|| Error::MalformedFrame("OK missing accepted flag".to_string()))?;
            let message = arr
                .get(3)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(RelayFrame::Ok {
                event_id,
                accepted,
                message,
            })
        }
        "NOTICE" => Ok(RelayFrame::Notice {
            message: str_at(arr, 1, "message")?,
        }),
        "CLOSED" => Ok(RelayFrame::Closed {
            subscription_id: str_at(arr, 1, "subscription id")?,
            message: arr
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        other => Err(Error::MalformedFrame(format!("unknown verb '{}'", other))),
    }
}

fn str_at(arr: &[Value], index: usize, what: &str) -> Result<String> {
    arr.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::MalformedFrame(format!("missing {}", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, JsonUtil, Keys, Kind};

    fn signed_event() -> Event {
        EventBuilder::new(Kind::TextNote, "hello")
            .sign_with_keys(&Keys::generate())
            .unwrap()
    }

    #[test]
    fn test_req_frame_shape() {
        let filter = Filter::new().kind(Kind::RelayList).limit(10);
        let frame = req_frame("sub-1", &filter);

        let value: Value = serde_json::from_str(&frame).unwrap();
        let arr = value.as_array().unwrap();
        assert_eq!(arr[0], "REQ");
        assert_eq!(arr[1], "sub-1");
        assert_eq!(arr[2]["kinds"][0], 10002);
        assert_eq!(arr[2]["limit"], 10);
    }

    #[test]
    fn test_event_frame_round_trips() {
        let event = signed_event();
        let frame = event_frame(&event);

        let value: Value = serde_json::from_str(&frame).unwrap();
        let arr = value.as_array().unwrap();
        assert_eq!(arr[0], "EVENT");
        let parsed = Event::from_json(arr[1].to_string()).unwrap();
        assert_eq!(parsed.id, event.id);
    }

    #[test]
    fn test_parse_event_frame() {
        let event = signed_event();
        let text = format!(r#"["EVENT","sub-9",{}]"#, event.as_json());

        match parse_frame(&text).unwrap() {
            RelayFrame::Event {
                subscription_id,
                event: parsed,
            } => {
                assert_eq!(subscription_id, "sub-9");
                assert_eq!(parsed.id, event.id);
            }
            other => panic!("expected Event frame, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_eose_frame() {
        match parse_frame(r#"["EOSE","sub-2"]"#).unwrap() {
            RelayFrame::EndOfStored { subscription_id } => assert_eq!(subscription_id, "sub-2"),
            other => panic!("expected EndOfStored, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ok_frame() {
        match parse_frame(r#"["OK","abcd",true,"stored"]"#).unwrap() {
            RelayFrame::Ok {
                event_id,
                accepted,
                message,
            } => {
                assert_eq!(event_id, "abcd");
                assert!(accepted);
                assert_eq!(message, "stored");
            }
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ok_frame_without_message() {
        match parse_frame(r#"["OK","abcd",false]"#).unwrap() {
            RelayFrame::Ok { accepted, message, .. } => {
                assert!(!accepted);
                assert!(message.is_empty());
            }
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_closed_frame() {
        match parse_frame(r#"["CLOSED","sub-3","auth-required: restricted"]"#).unwrap() {
            RelayFrame::Closed {
                subscription_id,
                message,
            } => {
                assert_eq!(subscription_id, "sub-3");
                assert!(message.contains("auth-required"));
            }
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame(r#"{"verb":"EVENT"}"#).is_err());
        assert!(parse_frame(r#"["UNKNOWN","x"]"#).is_err());
        assert!(parse_frame(r#"["EVENT","sub"]"#).is_err());
        assert!(parse_frame(r#"["EVENT","sub",{"not":"an event"}]"#).is_err());
        assert!(parse_frame(r#"[]"#).is_err());
    }
}
