use super::bool_value;
use fleet_protocol::RawRecord;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Fully-qualified permissions that make up each coarse category.
const SMS_PERMISSIONS: &[&str] = &[
    "android.permission.READ_SMS",
    "android.permission.RECEIVE_SMS",
    "android.permission.SEND_SMS",
];
const CONTACTS_PERMISSIONS: &[&str] = &["android.permission.READ_CONTACTS"];
const PHONE_PERMISSIONS: &[&str] = &[
    "android.permission.READ_PHONE_STATE",
    "android.permission.CALL_PHONE",
];
const STORAGE_PERMISSIONS: &[&str] = &[
    "android.permission.READ_EXTERNAL_STORAGE",
    "android.permission.WRITE_EXTERNAL_STORAGE",
];
const NOTIFICATION_LISTENER_PERMISSIONS: &[&str] =
    &["android.permission.BIND_NOTIFICATION_LISTENER_SERVICE"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionSource {
    Structured,
    Legacy,
    Mixed,
}

/// Canonical permission snapshot.
///
/// Coarse flags are `None` when neither representation mentions the
/// category. Structured entries win over legacy flags for the same category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionSnapshot {
    pub source: PermissionSource,
    /// Structured entries keyed by fully-qualified permission name.
    pub permissions: BTreeMap<String, bool>,
    pub sms_granted: Option<bool>,
    pub contacts_granted: Option<bool>,
    pub phone_granted: Option<bool>,
    pub storage_granted: Option<bool>,
    pub notification_listener_granted: Option<bool>,
    pub battery_optimization_exempt: Option<bool>,
}

impl PermissionSnapshot {
    /// Every known category granted.
    pub fn all_granted(&self) -> bool {
        [
            self.sms_granted,
            self.contacts_granted,
            self.phone_granted,
            self.storage_granted,
            self.notification_listener_granted,
        ]
        .iter()
        .flatten()
        .all(|granted| *granted)
    }
}

#[derive(Default)]
struct LegacyFlags {
    sms: Option<bool>,
    contacts: Option<bool>,
    phone: Option<bool>,
    storage: Option<bool>,
    notification_listener: Option<bool>,
    battery_optimization: Option<bool>,
}

impl LegacyFlags {
    fn any(&self) -> bool {
        self.sms.is_some()
            || self.contacts.is_some()
            || self.phone.is_some()
            || self.storage.is_some()
            || self.notification_listener.is_some()
            || self.battery_optimization.is_some()
    }
}

fn granted_value(value: &Value) -> Option<bool> {
    match value {
        Value::Object(map) => map.get("granted").and_then(bool_value),
        other => bool_value(other),
    }
}

fn category(permissions: &BTreeMap<String, bool>, members: &[&str]) -> Option<bool> {
    let present: Vec<bool> = members
        .iter()
        .filter_map(|name| permissions.get(*name).copied())
        .collect();
    if present.is_empty() {
        None
    } else {
        Some(present.iter().all(|granted| *granted))
    }
}

fn legacy_flags(map: &Map<String, Value>) -> LegacyFlags {
    let mut flags = LegacyFlags::default();
    for (key, value) in map {
        if key.contains('.') {
            continue;
        }
        let Some(granted) = granted_value(value) else {
            continue;
        };
        let normalized: String = key
            .chars()
            .filter(|c| *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        let slot = match normalized.as_str() {
            "sms" => &mut flags.sms,
            "contacts" => &mut flags.contacts,
            "phone" => &mut flags.phone,
            "storage" => &mut flags.storage,
            "notificationlistener" | "notification" => &mut flags.notification_listener,
            "batteryoptimization" => &mut flags.battery_optimization,
            _ => continue,
        };
        *slot = Some(granted);
    }
    flags
}

pub(super) fn normalize(raw: &RawRecord) -> Result<PermissionSnapshot, &'static str> {
    let Value::Object(map) = raw else {
        return Err("permission snapshot is not a mapping");
    };

    let permissions: BTreeMap<String, bool> = map
        .iter()
        .filter(|(key, _)| key.contains('.'))
        .filter_map(|(key, value)| granted_value(value).map(|granted| (key.clone(), granted)))
        .collect();
    let legacy = legacy_flags(map);

    let source = match (permissions.is_empty(), legacy.any()) {
        (true, true) => PermissionSource::Legacy,
        (false, false) => PermissionSource::Structured,
        (false, true) => PermissionSource::Mixed,
        (true, false) => return Err("no recognizable permission entries"),
    };

    Ok(PermissionSnapshot {
        source,
        sms_granted: category(&permissions, SMS_PERMISSIONS).or(legacy.sms),
        contacts_granted: category(&permissions, CONTACTS_PERMISSIONS).or(legacy.contacts),
        phone_granted: category(&permissions, PHONE_PERMISSIONS).or(legacy.phone),
        storage_granted: category(&permissions, STORAGE_PERMISSIONS).or(legacy.storage),
        notification_listener_granted: category(&permissions, NOTIFICATION_LISTENER_PERMISSIONS)
            .or(legacy.notification_listener),
        battery_optimization_exempt: legacy.battery_optimization,
        permissions,
    })
}
