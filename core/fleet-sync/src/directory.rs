//! The device directory: a cold request/response source of device ids and
//! coarse metadata. Not part of the live-binding machinery; polled rarely.

use crate::error::DirectoryError;
use async_trait::async_trait;
use fleet_protocol::{
    parse_directory_page, DirectoryEntry, Envelope, ErrorInfo, PageMeta, PageRequest,
};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Upper bound on pages fetched by one listing.
const MAX_PAGES: usize = 1_000;

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Fetches one skip/limit page.
    async fn page(&self, request: PageRequest) -> Result<Envelope, DirectoryError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceListing {
    pub entries: Vec<DirectoryEntry>,
    /// Entries the directory returned that failed validation.
    pub rejected: Vec<ErrorInfo>,
}

/// Walks every page of the directory. Duplicate device ids keep their
/// first occurrence.
pub async fn list_devices(
    directory: &dyn DeviceDirectory,
) -> Result<DeviceListing, DirectoryError> {
    let mut listing = DeviceListing::default();
    let mut seen = HashSet::new();
    let mut request = PageRequest::default().clamped();

    for _ in 0..MAX_PAGES {
        let envelope = directory.page(request).await?;
        let page = parse_directory_page(envelope).map_err(DirectoryError::Rejected)?;
        let fetched = page.entries.len() + page.rejected.len();
        debug!(skip = request.skip, fetched, "Fetched directory page");

        for rejected in &page.rejected {
            warn!(
                code = %rejected.code,
                message = %rejected.message,
                "Skipping invalid directory entry"
            );
        }
        listing.rejected.extend(page.rejected);
        for entry in page.entries {
            if seen.insert(entry.device_id.clone()) {
                listing.entries.push(entry);
            }
        }

        if page.meta.next.is_none() || fetched == 0 {
            return Ok(listing);
        }
        request = request.next();
    }

    warn!(max_pages = MAX_PAGES, "Directory listing truncated");
    Ok(listing)
}

/// In-memory directory, served with the same paging contract as the
/// backend.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: Vec<DirectoryEntry>,
}

impl StaticDirectory {
    pub fn new(entries: Vec<DirectoryEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl DeviceDirectory for StaticDirectory {
    async fn page(&self, request: PageRequest) -> Result<Envelope, DirectoryError> {
        let request = request.clamped();
        let start = (request.skip as usize).min(self.entries.len());
        let end = start.saturating_add(request.limit as usize).min(self.entries.len());

        let data = self.entries[start..end]
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<Value>, _>>()
            .map_err(|err| DirectoryError::Unavailable(err.to_string()))?;

        let meta = PageMeta {
            count: self.entries.len() as u64,
            next: (end < self.entries.len())
                .then(|| format!("?skip={}&limit={}", end, request.limit)),
            previous: (start > 0).then(|| {
                let previous = start.saturating_sub(request.limit as usize);
                format!("?skip={}&limit={}", previous, request.limit)
            }),
        };
        Ok(Envelope::ok(Value::Array(data), Some(meta)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn entries(count: usize) -> Vec<DirectoryEntry> {
        (0..count).map(|i| DirectoryEntry::new(format!("dev-{}", i))).collect()
    }

    #[tokio::test]
    async fn lists_every_page() {
        let directory = StaticDirectory::new(entries(250));
        let listing = list_devices(&directory).await.expect("listing");
        assert_eq!(listing.entries.len(), 250);
        assert_eq!(listing.entries[249].device_id, "dev-249");
        assert!(listing.rejected.is_empty());
    }

    #[tokio::test]
    async fn empty_directory_is_empty_listing() {
        let listing = list_devices(&StaticDirectory::default()).await.expect("listing");
        assert!(listing.entries.is_empty());
    }

    struct Scripted {
        pages: Mutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl DeviceDirectory for Scripted {
        async fn page(&self, _request: PageRequest) -> Result<Envelope, DirectoryError> {
            let mut pages = self.pages.lock().expect("pages");
            if pages.is_empty() {
                return Err(DirectoryError::Unavailable("no more pages".into()));
            }
            Ok(pages.remove(0))
        }
    }

    #[tokio::test]
    async fn invalid_entries_are_reported_and_duplicates_dropped() {
        let directory = Scripted {
            pages: Mutex::new(vec![Envelope::ok(
                json!([
                    {"device_id": "a", "name": "Pixel"},
                    {"device_id": "a"},
                    {"device_id": ""},
                    {"name": "no id"}
                ]),
                None,
            )]),
        };
        let listing = list_devices(&directory).await.expect("listing");
        assert_eq!(listing.entries.len(), 1);
        assert_eq!(listing.entries[0].name.as_deref(), Some("Pixel"));
        assert_eq!(listing.rejected.len(), 2);
    }

    #[tokio::test]
    async fn failed_envelope_is_rejected() {
        let directory = Scripted {
            pages: Mutex::new(vec![Envelope::error("backend down")]),
        };
        let err = list_devices(&directory).await.expect_err("should fail");
        assert!(matches!(err, DirectoryError::Rejected(info) if info.message == "backend down"));
    }
}
