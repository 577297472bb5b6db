use super::{field, has_any, text_field, timestamp_field, timestamp_value, Normalizer, Revision};
use fleet_protocol::{RawRecord, StorePath};
use serde::Serialize;
use serde_json::Value;

const NAME_FIELDS: &[&str] = &["name", "deviceName", "device_name"];
const MODEL_FIELDS: &[&str] = &["model", "deviceModel"];
const PHONE_FIELDS: &[&str] = &["currentPhone", "phone"];
const CODE_FIELDS: &[&str] = &["code", "activationCode"];
const ACTIVE_FIELDS: &[&str] = &["isActive", "is_active", "status"];
const HEARTBEAT_FIELDS: &[&str] = &["heartbeat", "lastHeartbeat"];
const LAST_SEEN_FIELDS: &[&str] = &["lastSeen", "last_seen"];
const LEGACY_TIME_FIELDS: &[&str] = &["time"];
const BATTERY_FIELDS: &[&str] =
    &["batteryPercentage", "battery_percentage", "battery", "batteryLevel"];

const KNOWN_FIELDS: &[&[&str]] = &[
    NAME_FIELDS,
    MODEL_FIELDS,
    PHONE_FIELDS,
    CODE_FIELDS,
    ACTIVE_FIELDS,
    HEARTBEAT_FIELDS,
    LAST_SEEN_FIELDS,
    LEGACY_TIME_FIELDS,
    BATTERY_FIELDS,
];

/// Canonical view of a device record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub phone: Option<String>,
    pub code: Option<String>,
    pub is_active: Option<bool>,
    pub heartbeat_millis: Option<i64>,
    pub last_seen_millis: Option<i64>,
    pub legacy_time_millis: Option<i64>,
    /// Clamped to 0..=100.
    pub battery_percent: Option<u8>,
}

impl DeviceStatus {
    pub fn empty(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            name: None,
            model: None,
            phone: None,
            code: None,
            is_active: None,
            heartbeat_millis: None,
            last_seen_millis: None,
            legacy_time_millis: None,
            battery_percent: None,
        }
    }
}

/// Activation flags have been written as booleans and as status words.
fn active_value(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        Value::String(s) => Some(matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "opened" | "active" | "true" | "1" | "yes"
        )),
        _ => None,
    }
}

fn battery_value(value: &Value) -> Option<u8> {
    let percent = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok()?,
        _ => return None,
    };
    if !percent.is_finite() {
        return None;
    }
    Some(percent.round().clamp(0.0, 100.0) as u8)
}

pub(super) fn normalize(raw_key: &str, raw: &RawRecord) -> Result<DeviceStatus, &'static str> {
    let Value::Object(map) = raw else {
        return Err("device record is not a mapping");
    };
    if !KNOWN_FIELDS.iter().any(|names| has_any(map, names)) {
        return Err("no device fields");
    }

    Ok(DeviceStatus {
        device_id: raw_key.to_string(),
        name: text_field(map, NAME_FIELDS),
        model: text_field(map, MODEL_FIELDS),
        phone: text_field(map, PHONE_FIELDS),
        code: text_field(map, CODE_FIELDS),
        is_active: field(map, ACTIVE_FIELDS).and_then(active_value),
        heartbeat_millis: timestamp_field(map, HEARTBEAT_FIELDS),
        last_seen_millis: timestamp_field(map, LAST_SEEN_FIELDS),
        legacy_time_millis: timestamp_field(map, LEGACY_TIME_FIELDS),
        battery_percent: field(map, BATTERY_FIELDS).and_then(battery_value),
    })
}

/// Normalizes a standalone heartbeat path: a millisecond scalar, or a
/// mapping carrying one.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatNormalizer;

impl Normalizer for HeartbeatNormalizer {
    type Output = Option<i64>;

    fn normalize(&self, _path: &StorePath, raw: &RawRecord, _now_millis: i64) -> Option<i64> {
        match raw {
            Value::Object(map) => timestamp_field(map, &["timestamp", "time", "heartbeat"]),
            other => timestamp_value(other),
        }
    }

    fn revision(&self, raw: &RawRecord) -> Option<Revision> {
        self.normalize(&StorePath::root(), raw, 0)
            .map(|ts| Revision::new(ts.to_string()))
    }
}
