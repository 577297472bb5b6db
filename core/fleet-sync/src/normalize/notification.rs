use super::{
    has_any, resolve_timestamp, split_compact, text_field, timestamp_field, TimestampSource,
};
use fleet_protocol::RawRecord;
use serde::Serialize;
use serde_json::Value;

const PACKAGE_FIELDS: &[&str] = &["package", "packageName", "package_name"];
const TITLE_FIELDS: &[&str] = &["title"];
const TEXT_FIELDS: &[&str] = &["text", "body", "content"];
const TIMESTAMP_FIELDS: &[&str] = &["timestamp", "time", "postTime"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub key: String,
    pub package_name: String,
    pub title: String,
    pub text: String,
    pub timestamp_millis: i64,
    pub timestamp_source: TimestampSource,
}

/// A notification without a source package cannot be attributed and is
/// reported as unrecognized.
pub(super) fn normalize(
    raw_key: &str,
    raw: &RawRecord,
    now_millis: i64,
) -> Result<Notification, &'static str> {
    let (package_name, title, text, structured_ts) = match raw {
        Value::String(compact) => {
            let [package, title, text] = split_compact(compact);
            (
                package.unwrap_or_default().trim().to_string(),
                title.unwrap_or_default().to_string(),
                text.unwrap_or_default().to_string(),
                None,
            )
        }
        Value::Object(map) => {
            if !has_any(map, PACKAGE_FIELDS) {
                return Err("no package field");
            }
            (
                text_field(map, PACKAGE_FIELDS).unwrap_or_default().trim().to_string(),
                text_field(map, TITLE_FIELDS).unwrap_or_default(),
                text_field(map, TEXT_FIELDS).unwrap_or_default(),
                timestamp_field(map, TIMESTAMP_FIELDS),
            )
        }
        _ => return Err("notification is neither a compact string nor a mapping"),
    };

    if package_name.is_empty() {
        return Err("empty package name");
    }

    let (timestamp_millis, timestamp_source) =
        resolve_timestamp(structured_ts, raw_key, now_millis);
    Ok(Notification {
        key: raw_key.to_string(),
        package_name,
        title,
        text,
        timestamp_millis,
        timestamp_source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_800_000_000_000;

    #[test]
    fn compact_notification() {
        let raw = json!("com.bank.app~Payment~You received $5");
        let n = normalize("1700000000000", &raw, NOW).expect("notification");
        assert_eq!(n.package_name, "com.bank.app");
        assert_eq!(n.title, "Payment");
        assert_eq!(n.text, "You received $5");
        assert_eq!(n.timestamp_millis, 1_700_000_000_000);
    }

    #[test]
    fn structured_aliases() {
        let raw = json!({
            "packageName": "com.chat",
            "title": "Hi",
            "body": "there",
            "time": 1650000000000i64
        });
        let n = normalize("-Nx", &raw, NOW).expect("notification");
        assert_eq!(n.package_name, "com.chat");
        assert_eq!(n.text, "there");
        assert_eq!(n.timestamp_millis, 1_650_000_000_000);
        assert_eq!(n.timestamp_source, TimestampSource::Field);
    }

    #[test]
    fn empty_package_is_unrecognized() {
        assert!(normalize("1", &json!("~title~text"), NOW).is_err());
        assert!(normalize("1", &json!({"package": "  ", "title": "x"}), NOW).is_err());
        assert!(normalize("1", &json!({"title": "x"}), NOW).is_err());
    }
}
