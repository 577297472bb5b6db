use super::{field, text_field, text_value, bool_value};
use fleet_protocol::RawRecord;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contact {
    /// Store key, usually the primary phone number.
    pub key: String,
    pub name: String,
    pub phones: Vec<String>,
    pub emails: Vec<String>,
    pub starred: bool,
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::Object(map) => text_field(map, &["number", "value", "address"]),
                other => text_value(other),
            })
            .filter(|s| !s.trim().is_empty())
            .collect(),
        Some(other) => text_value(other).into_iter().collect(),
        None => Vec::new(),
    }
}

pub(super) fn normalize_contact(raw_key: &str, raw: &RawRecord) -> Result<Contact, &'static str> {
    match raw {
        Value::Object(map) => {
            let mut phones = string_list(field(map, &["phones", "phoneNumbers", "phone"]));
            if phones.is_empty() && !raw_key.is_empty() {
                phones.push(raw_key.to_string());
            }
            Ok(Contact {
                key: raw_key.to_string(),
                name: text_field(map, &["displayName", "display_name", "name"]).unwrap_or_default(),
                phones,
                emails: string_list(field(map, &["emails", "email"])),
                starred: field(map, &["isStarred", "starred"])
                    .and_then(bool_value)
                    .unwrap_or(false),
            })
        }
        // Older writers store `phone -> display name` directly.
        Value::String(_) | Value::Number(_) => Ok(Contact {
            key: raw_key.to_string(),
            name: text_value(raw).unwrap_or_default(),
            phones: if raw_key.is_empty() { Vec::new() } else { vec![raw_key.to_string()] },
            emails: Vec::new(),
            starred: false,
        }),
        _ => Err("contact is neither a mapping nor a scalar"),
    }
}

/// Operator-facing help content pushed to devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstructionCard {
    pub key: String,
    pub title: String,
    pub body: String,
}

pub(super) fn normalize_card(
    raw_key: &str,
    raw: &RawRecord,
) -> Result<InstructionCard, &'static str> {
    match raw {
        Value::Object(map) => {
            let body = text_field(map, &["body", "content", "html"]);
            let title = text_field(map, &["title", "heading"]);
            if body.is_none() && title.is_none() {
                return Err("no title or body");
            }
            Ok(InstructionCard {
                key: raw_key.to_string(),
                title: title.unwrap_or_default(),
                body: body.unwrap_or_default(),
            })
        }
        Value::String(body) if !body.trim().is_empty() => Ok(InstructionCard {
            key: raw_key.to_string(),
            title: String::new(),
            body: body.clone(),
        }),
        _ => Err("instruction card is neither a mapping nor text"),
    }
}
