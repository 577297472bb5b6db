//! Wire types shared by the sync core, its store backends and the device
//! directory client.
//!
//! Store payloads are untrusted and stay as raw JSON until the normalizer
//! turns them into canonical records. Directory responses use the backend's
//! `success/data/meta` envelope with skip/limit pagination.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Whatever the store returns at a path. Shape is not trusted.
pub type RawRecord = Value;

pub const MAX_PATH_SEGMENTS: usize = 32;
pub const MAX_SEGMENT_BYTES: usize = 768;
pub const MAX_DEVICE_ID_LEN: usize = 128;

pub const DEFAULT_PAGE_LIMIT: u32 = 100;
pub const MAX_PAGE_LIMIT: u32 = 500;

const FORBIDDEN_SEGMENT_CHARS: [char; 6] = ['/', '.', '#', '$', '[', ']'];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

// ═══════════════════════════════════════════════════════════════════════════════
// Store paths
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordered string segments addressing one node in the hierarchical store.
///
/// Serialized as the slash-joined form (`device/abc/Messages`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn new<I, S>(segments: I) -> Result<Self, ErrorInfo>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.len() > MAX_PATH_SEGMENTS {
            return Err(ErrorInfo::new(
                "invalid_path",
                format!("path has more than {} segments", MAX_PATH_SEGMENTS),
            ));
        }
        for segment in &segments {
            validate_segment(segment)?;
        }
        Ok(Self { segments })
    }

    /// Parses `a/b/c`. Leading, trailing and doubled slashes are ignored.
    pub fn parse(value: &str) -> Result<Self, ErrorInfo> {
        Self::new(value.split('/').filter(|segment| !segment.is_empty()))
    }

    pub fn child(&self, segment: &str) -> Result<Self, ErrorInfo> {
        validate_segment(segment)?;
        if self.segments.len() >= MAX_PATH_SEGMENTS {
            return Err(ErrorInfo::new(
                "invalid_path",
                format!("path has more than {} segments", MAX_PATH_SEGMENTS),
            ));
        }
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True when `self` equals `other` or is one of its ancestors.
    pub fn contains(&self, other: &StorePath) -> bool {
        other.segments.len() >= self.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a == b)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl TryFrom<String> for StorePath {
    type Error = ErrorInfo;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StorePath::parse(&value)
    }
}

impl From<StorePath> for String {
    fn from(path: StorePath) -> Self {
        path.to_string()
    }
}

fn validate_segment(segment: &str) -> Result<(), ErrorInfo> {
    if segment.trim().is_empty() {
        return Err(ErrorInfo::new("invalid_path", "path segment is empty"));
    }
    if segment.len() > MAX_SEGMENT_BYTES {
        return Err(ErrorInfo::new(
            "invalid_path",
            format!("path segment exceeds {} bytes", MAX_SEGMENT_BYTES),
        ));
    }
    if let Some(bad) = segment
        .chars()
        .find(|c| FORBIDDEN_SEGMENT_CHARS.contains(c) || c.is_control())
    {
        return Err(ErrorInfo::new(
            "invalid_path",
            format!("path segment {:?} contains forbidden character {:?}", segment, bad),
        ));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Device directory
// ═══════════════════════════════════════════════════════════════════════════════

/// Coarse device metadata supplied by the request/response backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub device_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl DirectoryEntry {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            name: None,
            phone: None,
            is_active: true,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.device_id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_device_id", "device_id is required"));
        }
        if self.device_id.len() > MAX_DEVICE_ID_LEN {
            return Err(ErrorInfo::new(
                "invalid_device_id",
                format!("device_id must be {} characters or fewer", MAX_DEVICE_ID_LEN),
            ));
        }
        validate_segment(&self.device_id)
            .map_err(|err| ErrorInfo::new("invalid_device_id", err.message))
    }
}

/// Skip/limit page request. `limit` is clamped to `MAX_PAGE_LIMIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub skip: u32,
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl PageRequest {
    pub fn clamped(self) -> Self {
        Self {
            skip: self.skip,
            limit: self.limit.clamp(1, MAX_PAGE_LIMIT),
        }
    }

    pub fn next(self) -> Self {
        let page = self.clamped();
        Self {
            skip: page.skip.saturating_add(page.limit),
            limit: page.limit,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
}

/// Response envelope used by every backend endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub meta: Option<PageMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn ok(data: Value, meta: Option<PageMeta>) -> Self {
        Self {
            success: true,
            data: Some(data),
            meta,
            message: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            meta: None,
            message: None,
            error: Some(message.into()),
        }
    }
}

/// One decoded page of the device directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryPage {
    pub entries: Vec<DirectoryEntry>,
    pub rejected: Vec<ErrorInfo>,
    pub meta: PageMeta,
}

/// Decodes a directory envelope. Entries that fail validation are reported
/// in `rejected` rather than failing the whole page.
pub fn parse_directory_page(envelope: Envelope) -> Result<DirectoryPage, ErrorInfo> {
    if !envelope.success {
        let message = envelope
            .error
            .or(envelope.message)
            .unwrap_or_else(|| "directory request failed".to_string());
        return Err(ErrorInfo::new("directory_error", message));
    }

    let items = match envelope.data {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => {
            return Err(ErrorInfo::new(
                "invalid_payload",
                "directory data must be an array",
            ))
        }
    };

    let mut page = DirectoryPage {
        meta: envelope.meta.unwrap_or_default(),
        ..DirectoryPage::default()
    };

    for item in items {
        match serde_json::from_value::<DirectoryEntry>(item) {
            Ok(entry) => match entry.validate() {
                Ok(()) => page.entries.push(entry),
                Err(err) => page.rejected.push(err),
            },
            Err(err) => page.rejected.push(ErrorInfo::new(
                "invalid_entry",
                format!("directory entry is invalid JSON: {}", err),
            )),
        }
    }

    Ok(page)
}
