//! Store fixtures: a directory listing plus a store tree in one JSON file.
//!
//! ```json
//! {
//!   "directory": [{"device_id": "abc", "name": "Pixel"}],
//!   "store": {"device": {"abc": {"batteryPercentage": 80}}}
//! }
//! ```

use crate::CliError;
use fleet_protocol::DirectoryEntry;
use fleet_sync::{MemoryStore, StaticDirectory};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub directory: Vec<DirectoryEntry>,
    #[serde(default)]
    pub store: Value,
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let content = fs_err::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|source| CliError::Fixture {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn into_parts(self) -> (MemoryStore, StaticDirectory) {
        (MemoryStore::from_value(self.store), StaticDirectory::new(self.directory))
    }
}
