//! Schema normalization: every accepted wire shape of an entity maps to one
//! canonical record.
//!
//! Writers of different ages put different shapes at the same logical path
//! (structured mappings, `~`-delimited compact strings, flat legacy flags).
//! `normalize` is total and deterministic: it never panics, never consults
//! ambient state (the caller supplies `now_millis`), and degrades anything it
//! cannot read to a typed [`Unrecognized`] value instead of dropping it.
//!
//! # Module Structure
//!
//! - [`message`]: SMS-style messages (`direction~address~body`)
//! - [`notification`]: captured notifications (`package~title~text`)
//! - [`permission`]: permission snapshots, structured and legacy flat
//! - [`device`]: device records and heartbeats
//! - [`contact`]: contacts and instruction cards

mod contact;
mod device;
mod message;
mod notification;
mod permission;

pub use contact::{Contact, InstructionCard};
pub use device::{DeviceStatus, HeartbeatNormalizer};
pub use message::{Direction, Message};
pub use notification::Notification;
pub use permission::{PermissionSnapshot, PermissionSource};

use fleet_protocol::{RawRecord, StorePath};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Message,
    Notification,
    PermissionSnapshot,
    Device,
    Contact,
    InstructionCard,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Message => "message",
            EntityKind::Notification => "notification",
            EntityKind::PermissionSnapshot => "permission_snapshot",
            EntityKind::Device => "device",
            EntityKind::Contact => "contact",
            EntityKind::InstructionCard => "instruction_card",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "message" | "messages" => Ok(EntityKind::Message),
            "notification" | "notifications" => Ok(EntityKind::Notification),
            "permission" | "permissions" | "permission_snapshot" => {
                Ok(EntityKind::PermissionSnapshot)
            }
            "device" => Ok(EntityKind::Device),
            "contact" | "contacts" => Ok(EntityKind::Contact),
            "instruction" | "instruction_card" => Ok(EntityKind::InstructionCard),
            other => Err(format!("unknown entity kind: {}", other)),
        }
    }
}

/// Where a record's timestamp came from, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    Field,
    Key,
    Now,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanonicalRecord {
    Message(Message),
    Notification(Notification),
    Permissions(PermissionSnapshot),
    Device(DeviceStatus),
    Contact(Contact),
    InstructionCard(InstructionCard),
}

impl CanonicalRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            CanonicalRecord::Message(_) => EntityKind::Message,
            CanonicalRecord::Notification(_) => EntityKind::Notification,
            CanonicalRecord::Permissions(_) => EntityKind::PermissionSnapshot,
            CanonicalRecord::Device(_) => EntityKind::Device,
            CanonicalRecord::Contact(_) => EntityKind::Contact,
            CanonicalRecord::InstructionCard(_) => EntityKind::InstructionCard,
        }
    }

    pub fn timestamp_millis(&self) -> Option<i64> {
        match self {
            CanonicalRecord::Message(message) => Some(message.timestamp_millis),
            CanonicalRecord::Notification(notification) => Some(notification.timestamp_millis),
            CanonicalRecord::Device(device) => device.legacy_time_millis,
            _ => None,
        }
    }
}

/// Input the normalizer could not read. Data, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Unrecognized {
    pub kind: EntityKind,
    pub raw_key: String,
    pub raw_value: RawRecord,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalized {
    Record(CanonicalRecord),
    Unrecognized(Unrecognized),
}

impl Normalized {
    pub fn record(&self) -> Option<&CanonicalRecord> {
        match self {
            Normalized::Record(record) => Some(record),
            Normalized::Unrecognized(_) => None,
        }
    }

    pub fn is_unrecognized(&self) -> bool {
        matches!(self, Normalized::Unrecognized(_))
    }

    pub fn timestamp_millis(&self) -> Option<i64> {
        self.record().and_then(CanonicalRecord::timestamp_millis)
    }

    pub fn raw_key(&self) -> &str {
        match self {
            Normalized::Record(record) => match record {
                CanonicalRecord::Message(message) => &message.key,
                CanonicalRecord::Notification(notification) => &notification.key,
                CanonicalRecord::Permissions(_) => "",
                CanonicalRecord::Device(device) => &device.device_id,
                CanonicalRecord::Contact(contact) => &contact.key,
                CanonicalRecord::InstructionCard(card) => &card.key,
            },
            Normalized::Unrecognized(unrecognized) => &unrecognized.raw_key,
        }
    }
}

/// Maps one raw store entry to its canonical form.
pub fn normalize(
    kind: EntityKind,
    raw_key: &str,
    raw_value: &RawRecord,
    now_millis: i64,
) -> Normalized {
    let result = match kind {
        EntityKind::Message => {
            message::normalize(raw_key, raw_value, now_millis).map(CanonicalRecord::Message)
        }
        EntityKind::Notification => notification::normalize(raw_key, raw_value, now_millis)
            .map(CanonicalRecord::Notification),
        EntityKind::PermissionSnapshot => {
            permission::normalize(raw_value).map(CanonicalRecord::Permissions)
        }
        EntityKind::Device => device::normalize(raw_key, raw_value).map(CanonicalRecord::Device),
        EntityKind::Contact => {
            contact::normalize_contact(raw_key, raw_value).map(CanonicalRecord::Contact)
        }
        EntityKind::InstructionCard => {
            contact::normalize_card(raw_key, raw_value).map(CanonicalRecord::InstructionCard)
        }
    };

    match result {
        Ok(record) => Normalized::Record(record),
        Err(reason) => Normalized::Unrecognized(Unrecognized {
            kind,
            raw_key: raw_key.to_string(),
            raw_value: raw_value.clone(),
            reason,
        }),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Revisions
// ═══════════════════════════════════════════════════════════════════════════════

/// Store-internal revision order of a value at a path.
///
/// Numeric keys (millisecond timestamps) compare numerically and sort before
/// any other key; the rest compare lexicographically, which matches push-id
/// style keys.
#[derive(Debug, Clone, Serialize)]
pub struct Revision(String);

impl Revision {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Greatest child key of a mapping, or the value of an integer scalar.
    pub fn latest_of(raw: &RawRecord) -> Option<Revision> {
        match raw {
            Value::Object(map) => map.keys().map(|key| Revision::new(key.as_str())).max(),
            Value::Array(items) if !items.is_empty() => {
                Some(Revision::new((items.len() - 1).to_string()))
            }
            Value::Number(_) | Value::String(_) => {
                timestamp_value(raw).map(|ts| Revision::new(ts.to_string()))
            }
            _ => None,
        }
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Revision {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Revision {}

// ═══════════════════════════════════════════════════════════════════════════════
// Path normalizers (used by LiveBinding)
// ═══════════════════════════════════════════════════════════════════════════════

/// Turns the whole raw value at a bound path into the consumer's type.
pub trait Normalizer: Send + Sync + 'static {
    type Output: Clone + Send + 'static;

    fn normalize(&self, path: &StorePath, raw: &RawRecord, now_millis: i64) -> Self::Output;

    /// Revision used to decide whether a late one-shot read is staler than
    /// an already-delivered push.
    fn revision(&self, raw: &RawRecord) -> Option<Revision> {
        Revision::latest_of(raw)
    }
}

/// The bound path holds a single entity; its key is the last path segment.
#[derive(Debug, Clone, Copy)]
pub struct RecordNormalizer {
    pub kind: EntityKind,
}

impl RecordNormalizer {
    pub fn new(kind: EntityKind) -> Self {
        Self { kind }
    }
}

impl Normalizer for RecordNormalizer {
    type Output = Normalized;

    fn normalize(&self, path: &StorePath, raw: &RawRecord, now_millis: i64) -> Normalized {
        normalize(self.kind, path.last().unwrap_or_default(), raw, now_millis)
    }
}

/// The bound path holds a keyed collection of entities.
///
/// Output is newest-first by timestamp (then by key) and optionally
/// truncated to the newest `limit` entries.
#[derive(Debug, Clone, Copy)]
pub struct CollectionNormalizer {
    pub kind: EntityKind,
    pub limit: Option<usize>,
}

impl CollectionNormalizer {
    pub fn new(kind: EntityKind) -> Self {
        Self { kind, limit: None }
    }

    pub fn with_limit(kind: EntityKind, limit: usize) -> Self {
        Self {
            kind,
            limit: Some(limit),
        }
    }
}

impl Normalizer for CollectionNormalizer {
    type Output = Vec<Normalized>;

    fn normalize(&self, path: &StorePath, raw: &RawRecord, now_millis: i64) -> Vec<Normalized> {
        let mut items: Vec<Normalized> = match raw {
            Value::Object(map) => map
                .iter()
                .map(|(key, value)| normalize(self.kind, key, value, now_millis))
                .collect(),
            Value::Array(values) => values
                .iter()
                .enumerate()
                .filter(|(_, value)| !value.is_null())
                .map(|(index, value)| normalize(self.kind, &index.to_string(), value, now_millis))
                .collect(),
            Value::Null => Vec::new(),
            other => vec![Normalized::Unrecognized(Unrecognized {
                kind: self.kind,
                raw_key: path.last().unwrap_or_default().to_string(),
                raw_value: other.clone(),
                reason: "collection is not a mapping",
            })],
        };

        items.sort_by(|a, b| {
            b.timestamp_millis()
                .cmp(&a.timestamp_millis())
                .then_with(|| Revision::new(b.raw_key()).cmp(&Revision::new(a.raw_key())))
        });

        if let Some(limit) = self.limit {
            items.truncate(limit);
        }
        items
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Field helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// First non-null value among `names`.
pub(crate) fn field<'a>(map: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| map.get(*name))
        .find(|value| !value.is_null())
}

pub(crate) fn has_any(map: &Map<String, Value>, names: &[&str]) -> bool {
    names.iter().any(|name| map.contains_key(*name))
}

/// Strings as-is; numbers and booleans rendered (phone numbers are
/// sometimes written as numbers).
pub(crate) fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// First non-empty text among `names`; empty strings fall through to the
/// next alias.
pub(crate) fn text_field(map: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| map.get(*name))
        .filter_map(text_value)
        .find(|text| !text.trim().is_empty())
}

/// Integer milliseconds from a number or numeric string.
pub(crate) fn timestamp_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|v| v.min(i64::MAX as u64) as i64))
            .or_else(|| n.as_f64().filter(|v| v.is_finite()).map(|v| v as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

pub(crate) fn timestamp_field(map: &Map<String, Value>, names: &[&str]) -> Option<i64> {
    names
        .iter()
        .filter_map(|name| map.get(*name))
        .find_map(timestamp_value)
}

pub(crate) fn bool_value(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "granted" | "on" => Some(true),
            "false" | "0" | "no" | "denied" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Structured field, else the entry's store key, else `now_millis`.
pub(crate) fn resolve_timestamp(
    structured: Option<i64>,
    raw_key: &str,
    now_millis: i64,
) -> (i64, TimestampSource) {
    if let Some(ts) = structured {
        return (ts, TimestampSource::Field);
    }
    if let Ok(ts) = raw_key.trim().parse::<i64>() {
        return (ts, TimestampSource::Key);
    }
    (now_millis, TimestampSource::Now)
}

/// Splits a compact `a~b~c` record into at most three segments. The last
/// segment keeps any further `~`.
pub(crate) fn split_compact(value: &str) -> [Option<&str>; 3] {
    let mut parts = value.splitn(3, '~');
    [parts.next(), parts.next(), parts.next()]
}
