//! Where device data lives in the store.
//!
//! Devices written by different app generations put the same section under
//! different roots. The fallback order is a table, resolved once with a cold
//! read; the binding is then created on the winning path.

use crate::normalize::EntityKind;
use crate::store::Store;
use fleet_protocol::{ErrorInfo, StorePath};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathLayout {
    /// `device/{id}/...` first.
    #[default]
    Device,
    /// `fastpay/{id}/...` first, for fleets still on the older app.
    Fastpay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Device,
    Fastpay,
    /// `{kind-root}/{id}`: a per-kind top-level root.
    KindRoot,
    FastpayTesting,
    FastpayRunning,
}

const DEVICE_FIRST: &[Root] = &[
    Root::Device,
    Root::Fastpay,
    Root::KindRoot,
    Root::FastpayTesting,
    Root::FastpayRunning,
];

const FASTPAY_FIRST: &[Root] = &[
    Root::Fastpay,
    Root::Device,
    Root::KindRoot,
    Root::FastpayTesting,
    Root::FastpayRunning,
];

/// Section segments under a device, and the per-kind legacy root if any.
fn section(kind: EntityKind) -> (&'static [&'static str], Option<&'static str>) {
    match kind {
        EntityKind::Message => (&["messages"], Some("message")),
        EntityKind::Notification => (&["Notification"], Some("notification")),
        EntityKind::Contact => (&["Contact"], Some("contact")),
        EntityKind::InstructionCard => (&["instructioncard"], None),
        EntityKind::PermissionSnapshot => (&["systemInfo", "permissionStatus"], None),
        EntityKind::Device => (&[], None),
    }
}

impl PathLayout {
    /// Candidate paths for `kind` of `device_id`, highest precedence first.
    pub fn candidates(
        &self,
        kind: EntityKind,
        device_id: &str,
    ) -> Result<Vec<StorePath>, ErrorInfo> {
        let roots = match self {
            PathLayout::Device => DEVICE_FIRST,
            PathLayout::Fastpay => FASTPAY_FIRST,
        };
        let (sections, kind_root) = section(kind);

        let mut candidates = Vec::with_capacity(roots.len());
        for root in roots {
            let prefix: &[&str] = match root {
                Root::Device => &["device"],
                Root::Fastpay => &["fastpay"],
                Root::FastpayTesting => &["fastpay", "testing"],
                Root::FastpayRunning => &["fastpay", "running"],
                Root::KindRoot => {
                    if let Some(kind_root) = kind_root {
                        candidates.push(StorePath::new([kind_root, device_id])?);
                    }
                    continue;
                }
            };
            let segments = prefix
                .iter()
                .copied()
                .chain(std::iter::once(device_id))
                .chain(sections.iter().copied());
            candidates.push(StorePath::new(segments)?);
        }
        Ok(candidates)
    }
}

/// Candidates in the default layout.
pub fn candidates(kind: EntityKind, device_id: &str) -> Result<Vec<StorePath>, ErrorInfo> {
    PathLayout::Device.candidates(kind, device_id)
}

pub fn heartbeat_path(device_id: &str) -> Result<StorePath, ErrorInfo> {
    StorePath::new(["heartbeat", device_id])
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Reads `candidates` in order and returns the first holding data. Read
/// errors and reads slower than `read_timeout` skip to the next candidate.
pub async fn resolve_first_present(
    store: &dyn Store,
    candidates: &[StorePath],
    read_timeout: Duration,
) -> Option<StorePath> {
    for candidate in candidates {
        match tokio::time::timeout(read_timeout, store.read(candidate)).await {
            Ok(Ok(Some(value))) if is_present(&value) => return Some(candidate.clone()),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                debug!(path = %candidate, error = %err, "Candidate read failed; trying next")
            }
            Err(_) => debug!(
                path = %candidate,
                timeout_ms = read_timeout.as_millis() as u64,
                "Candidate read timed out; trying next"
            ),
        }
    }
    None
}

/// Like [`resolve_first_present`], falling back to the primary candidate so
/// a binding can wait for data to appear there.
pub async fn resolve_or_primary(
    store: &dyn Store,
    candidates: &[StorePath],
    read_timeout: Duration,
) -> Option<StorePath> {
    match resolve_first_present(store, candidates, read_timeout).await {
        Some(path) => Some(path),
        None => candidates.first().cloned(),
    }
}
