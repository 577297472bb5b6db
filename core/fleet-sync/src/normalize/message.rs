use super::{
    bool_value, field, has_any, resolve_timestamp, split_compact, text_field, timestamp_field,
    TimestampSource,
};
use fleet_protocol::RawRecord;
use serde::Serialize;
use serde_json::Value;

const DIRECTION_FIELDS: &[&str] = &["type", "direction", "message_type"];
const ADDRESS_FIELDS: &[&str] = &["phone", "address", "counterpartyAddress", "number"];
const BODY_FIELDS: &[&str] = &["body", "message", "text"];
const TIMESTAMP_FIELDS: &[&str] = &["timestamp", "timestampMillis", "date", "time"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
    Unknown,
}

impl Direction {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "sent" | "outgoing" | "outbox" => Direction::Sent,
            "received" | "incoming" | "inbox" => Direction::Received,
            _ => Direction::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    /// Store key the message was written under.
    pub key: String,
    pub direction: Direction,
    pub counterparty_address: String,
    pub body: String,
    pub timestamp_millis: i64,
    pub timestamp_source: TimestampSource,
    pub read: bool,
}

pub(super) fn normalize(
    raw_key: &str,
    raw: &RawRecord,
    now_millis: i64,
) -> Result<Message, &'static str> {
    match raw {
        Value::String(compact) => from_compact(raw_key, compact, now_millis),
        Value::Object(map) => {
            if !has_any(map, DIRECTION_FIELDS)
                && !has_any(map, ADDRESS_FIELDS)
                && !has_any(map, BODY_FIELDS)
            {
                return Err("no message fields");
            }
            let direction = text_field(map, DIRECTION_FIELDS)
                .map(|value| Direction::parse(&value))
                .unwrap_or(Direction::Unknown);
            let (timestamp_millis, timestamp_source) =
                resolve_timestamp(timestamp_field(map, TIMESTAMP_FIELDS), raw_key, now_millis);
            Ok(Message {
                key: raw_key.to_string(),
                direction,
                counterparty_address: text_field(map, ADDRESS_FIELDS).unwrap_or_default(),
                body: text_field(map, BODY_FIELDS).unwrap_or_default(),
                timestamp_millis,
                timestamp_source,
                read: field(map, &["read"]).and_then(bool_value).unwrap_or(false),
            })
        }
        _ => Err("message is neither a compact string nor a mapping"),
    }
}

fn from_compact(raw_key: &str, compact: &str, now_millis: i64) -> Result<Message, &'static str> {
    if compact.trim().is_empty() {
        return Err("empty compact message");
    }
    let [direction, address, body] = split_compact(compact);
    let (timestamp_millis, timestamp_source) = resolve_timestamp(None, raw_key, now_millis);
    Ok(Message {
        key: raw_key.to_string(),
        direction: direction.map(Direction::parse).unwrap_or(Direction::Unknown),
        counterparty_address: address.unwrap_or_default().trim().to_string(),
        body: body.unwrap_or_default().to_string(),
        timestamp_millis,
        timestamp_source,
        read: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_800_000_000_000;

    #[test]
    fn compact_sent_message_with_timestamp_key() {
        let message =
            normalize("1700000000000", &json!("sent~+15551234567~Hello"), NOW).expect("message");
        assert_eq!(message.direction, Direction::Sent);
        assert_eq!(message.counterparty_address, "+15551234567");
        assert_eq!(message.body, "Hello");
        assert_eq!(message.timestamp_millis, 1_700_000_000_000);
        assert_eq!(message.timestamp_source, TimestampSource::Key);
    }

    #[test]
    fn compact_body_keeps_extra_delimiters() {
        let message = normalize("1", &json!("received~+1~a~b~c"), NOW).expect("message");
        assert_eq!(message.direction, Direction::Received);
        assert_eq!(message.body, "a~b~c");
    }

    #[test]
    fn compact_with_missing_segments_defaults_to_empty() {
        let message = normalize("1", &json!("sent"), NOW).expect("message");
        assert_eq!(message.counterparty_address, "");
        assert_eq!(message.body, "");
    }

    #[test]
    fn unknown_direction_is_unknown_not_rejected() {
        let message = normalize("1", &json!("draft~+1~x"), NOW).expect("message");
        assert_eq!(message.direction, Direction::Unknown);
    }

    #[test]
    fn backend_message_type_sets_direction() {
        let raw = json!({
            "message_type": "sent",
            "phone": "+1",
            "body": "hi",
            "timestamp": 1_600_000_000_000i64
        });
        let message = normalize("1", &raw, NOW).expect("message");
        assert_eq!(message.direction, Direction::Sent);
        assert_eq!(message.body, "hi");
    }

    #[test]
    fn structured_timestamp_beats_key() {
        let raw = json!({
            "type": "received",
            "phone": "+1",
            "body": "hi",
            "timestamp": "1600000000000",
            "read": true
        });
        let message = normalize("1700000000000", &raw, NOW).expect("message");
        assert_eq!(message.timestamp_millis, 1_600_000_000_000);
        assert_eq!(message.timestamp_source, TimestampSource::Field);
        assert!(message.read);
    }

    #[test]
    fn push_id_key_without_timestamp_uses_now() {
        let message = normalize("-Nabc", &json!({"body": "hi"}), NOW).expect("message");
        assert_eq!(message.timestamp_millis, NOW);
        assert_eq!(message.timestamp_source, TimestampSource::Now);
        assert_eq!(message.direction, Direction::Unknown);
    }

    #[test]
    fn numeric_phone_is_rendered() {
        let message =
            normalize("1", &json!({"phone": 15551234567u64, "body": "x"}), NOW).expect("message");
        assert_eq!(message.counterparty_address, "15551234567");
    }

    #[test]
    fn rejects_unreadable_shapes() {
        assert!(normalize("1", &json!(""), NOW).is_err());
        assert!(normalize("1", &json!(42), NOW).is_err());
        assert!(normalize("1", &json!({"unrelated": 1}), NOW).is_err());
    }
}
