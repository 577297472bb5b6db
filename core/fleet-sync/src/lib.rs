//! # fleet-sync
//!
//! Live state synchronization core for the device-fleet dashboard: keeps a
//! consistent view of a remote tree-structured store and turns heterogeneous
//! device records into canonical shapes.
//!
//! ## Design Principles
//!
//! - **Fetch, then subscribe**: every binding delivers a fast cold read and
//!   then transitions to a push subscription without flicker or stale
//!   overwrites.
//! - **Nothing after release**: once a binding's handle is released no
//!   callback fires and the store subscription is cancelled.
//! - **Total normalization**: malformed input becomes an `Unrecognized`
//!   record, never a panic.
//! - **Injected time**: presence and aggregation take `now` as an argument.
//!
//! ## Module Structure
//!
//! - [`store`]: the `Store` seam and an in-memory implementation
//! - [`binding`]: `LiveBinding` lifecycle and its handle
//! - [`normalize`]: per-kind schema normalizers
//! - [`presence`]: online/offline/unknown classification
//! - [`retry`]: bounded exponential backoff
//! - [`fleet`]: fleet-wide aggregation and summary statistics
//! - [`carousel`]: instruction-card rotation state machine
//! - [`paths`], [`directory`], [`config`], [`error`]: supporting pieces
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fleet_sync::{Callbacks, CollectionNormalizer, EntityKind, LiveBinding, MemoryStore};
//!
//! let store = Arc::new(MemoryStore::new());
//! let handle = LiveBinding::spawn(
//!     store,
//!     StorePath::parse("device/abc/messages")?,
//!     CollectionNormalizer::new(EntityKind::Message),
//!     BindingOptions::default(),
//!     Callbacks::new().on_update(|update| println!("{update:?}")),
//! );
//! // ...
//! handle.release();
//! ```

pub mod binding;
pub mod carousel;
pub mod config;
pub mod directory;
pub mod error;
pub mod fleet;
pub mod normalize;
pub mod paths;
pub mod presence;
pub mod retry;
pub mod store;

// Re-export commonly used items at crate root
pub use binding::{BindingHandle, BindingOptions, BindingState, Callbacks, LiveBinding, Update};
pub use carousel::{Carousel, CarouselPhase, CarouselState, CarouselTimings};
pub use config::{load_config, load_config_from, SyncConfig};
pub use directory::{list_devices, DeviceDirectory, DeviceListing, StaticDirectory};
pub use error::{DirectoryError, FleetSyncError, Result, StoreError, SyncError};
pub use fleet::{DeviceCache, DeviceView, FleetAggregator, FleetMode, FleetSnapshot, FleetSummary};
pub use normalize::{
    normalize, CanonicalRecord, CollectionNormalizer, EntityKind, Normalized, Normalizer,
    RecordNormalizer, Revision, Unrecognized,
};
pub use paths::PathLayout;
pub use presence::{classify, now_millis, Presence, PresenceClassifier, PresenceVerdict};
pub use retry::RetryPolicy;
pub use store::{MemoryStore, PushEvent, Store, Subscription};

pub use fleet_protocol::{DirectoryEntry, ErrorInfo, RawRecord, StorePath};
