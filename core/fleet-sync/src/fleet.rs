//! Fleet-level view composed from per-device bindings.
//!
//! Every device gets a record binding and a heartbeat binding; detail mode
//! adds a bounded message feed. Binding callbacks only forward events into
//! a channel. A single aggregator task owns the [`DeviceCache`], applies the
//! events, re-classifies presence and publishes a [`FleetSnapshot`] through
//! a `watch` channel on every emission and on every presence tick.
//!
//! A device whose binding errored counts as `unknown` until that binding
//! delivers a value again; every other device keeps its correct counts.

use crate::binding::{BindingHandle, Callbacks, LiveBinding, Update};
use crate::config::SyncConfig;
use crate::directory::{list_devices, DeviceDirectory};
use crate::error::{DirectoryError, FleetSyncError, SyncError};
use crate::normalize::{
    CanonicalRecord, CollectionNormalizer, DeviceStatus, EntityKind, HeartbeatNormalizer, Message,
    Normalized, RecordNormalizer,
};
use crate::paths::{heartbeat_path, resolve_or_primary, PathLayout};
use crate::presence::{now_millis, Presence, PresenceClassifier, PresenceSource, PresenceVerdict};
use crate::store::Store;
use fleet_protocol::{DirectoryEntry, StorePath};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetMode {
    /// Record and heartbeat bindings only; fetches are unbounded.
    PresenceOnly,
    /// Adds a message feed per device; one-shot reads share a concurrency cap.
    Detail,
}

/// Presence sources of a device, highest precedence first.
pub const DEVICE_PRESENCE_SOURCES: [PresenceSource<DeviceRow>; 3] = [
    PresenceSource {
        name: "heartbeat",
        read: |row| {
            row.heartbeat_millis
                .or_else(|| row.status.as_ref().and_then(|status| status.heartbeat_millis))
        },
    },
    PresenceSource {
        name: "last_seen",
        read: |row| row.status.as_ref().and_then(|status| status.last_seen_millis),
    },
    PresenceSource {
        name: "legacy_time",
        read: |row| row.status.as_ref().and_then(|status| status.legacy_time_millis),
    },
];

// ═══════════════════════════════════════════════════════════════════════════════
// Device cache
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingSource {
    Status,
    Heartbeat,
    Messages,
}

/// Everything the aggregator knows about one device.
#[derive(Debug, Clone)]
pub struct DeviceRow {
    pub directory: DirectoryEntry,
    pub status: Option<DeviceStatus>,
    pub heartbeat_millis: Option<i64>,
    pub latest_message: Option<Message>,
    pub message_count: usize,
    pub errors: BTreeMap<BindingSource, String>,
    status_settled: bool,
    heartbeat_settled: bool,
}

impl DeviceRow {
    fn new(directory: DirectoryEntry) -> Self {
        Self {
            directory,
            status: None,
            heartbeat_millis: None,
            latest_message: None,
            message_count: 0,
            errors: BTreeMap::new(),
            status_settled: false,
            heartbeat_settled: false,
        }
    }

    /// The record's activation flag wins over the directory's.
    pub fn is_active(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|status| status.is_active)
            .unwrap_or(self.directory.is_active)
    }

    pub fn battery_percent(&self) -> Option<u8> {
        self.status.as_ref().and_then(|status| status.battery_percent)
    }

    fn has_presence_error(&self) -> bool {
        self.errors.contains_key(&BindingSource::Status)
            || self.errors.contains_key(&BindingSource::Heartbeat)
    }

    fn is_settled(&self) -> bool {
        self.status_settled && self.heartbeat_settled
    }
}

enum FleetEvent {
    Status(String, Update<Normalized>),
    Heartbeat(String, Update<Option<i64>>),
    Messages(String, Update<Vec<Normalized>>),
    Error(String, BindingSource, SyncError),
}

/// Per-device state owned by one aggregator for its lifetime. No eviction.
#[derive(Debug, Clone, Default)]
pub struct DeviceCache {
    devices: BTreeMap<String, DeviceRow>,
}

impl DeviceCache {
    pub fn new(entries: impl IntoIterator<Item = DirectoryEntry>) -> Self {
        let devices = entries
            .into_iter()
            .map(|entry| (entry.device_id.clone(), DeviceRow::new(entry)))
            .collect();
        Self { devices }
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceRow> {
        self.devices.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn apply(&mut self, event: FleetEvent) {
        let device_id = match &event {
            FleetEvent::Status(id, _)
            | FleetEvent::Heartbeat(id, _)
            | FleetEvent::Messages(id, _)
            | FleetEvent::Error(id, _, _) => id.clone(),
        };
        let Some(row) = self.devices.get_mut(&device_id) else {
            debug!(device_id = %device_id, "Event for unknown device ignored");
            return;
        };

        match event {
            FleetEvent::Status(_, update) => {
                row.status_settled = true;
                row.errors.remove(&BindingSource::Status);
                row.status = match update {
                    Update::Value(Normalized::Record(CanonicalRecord::Device(status))) => {
                        Some(status)
                    }
                    Update::Value(other) => {
                        debug!(
                            device_id = %device_id,
                            record = ?other,
                            "Device record not recognized"
                        );
                        None
                    }
                    Update::Absent => None,
                };
            }
            FleetEvent::Heartbeat(_, update) => {
                row.heartbeat_settled = true;
                row.errors.remove(&BindingSource::Heartbeat);
                row.heartbeat_millis = update.value().copied().flatten();
            }
            FleetEvent::Messages(_, update) => {
                row.errors.remove(&BindingSource::Messages);
                let items = update.value().map(Vec::as_slice).unwrap_or_default();
                row.message_count = items.iter().filter(|item| !item.is_unrecognized()).count();
                row.latest_message = items.iter().find_map(|item| match item.record() {
                    Some(CanonicalRecord::Message(message)) => Some(message.clone()),
                    _ => None,
                });
            }
            FleetEvent::Error(_, source, error) => {
                match source {
                    BindingSource::Status => row.status_settled = true,
                    BindingSource::Heartbeat => row.heartbeat_settled = true,
                    BindingSource::Messages => {}
                }
                row.errors.insert(source, error.to_string());
            }
        }
    }

    /// Classifies every device at `now_millis` and derives the summary.
    pub fn snapshot(
        &self,
        classifier: &PresenceClassifier,
        low_battery_threshold: u8,
        now_millis: i64,
    ) -> FleetSnapshot {
        let devices: Vec<DeviceView> = self
            .devices
            .iter()
            .map(|(device_id, row)| {
                let presence = if row.has_presence_error() {
                    PresenceVerdict {
                        presence: Presence::Unknown,
                        last_seen_millis: None,
                        window_millis: classifier.window_millis,
                        source_index: None,
                        clock_skewed: false,
                    }
                } else {
                    classifier.classify_record(row, &DEVICE_PRESENCE_SOURCES, now_millis)
                };
                let battery_percent = row.battery_percent();
                DeviceView {
                    device_id: device_id.clone(),
                    name: row
                        .status
                        .as_ref()
                        .and_then(|status| status.name.clone())
                        .or_else(|| row.directory.name.clone()),
                    phone: row
                        .status
                        .as_ref()
                        .and_then(|status| status.phone.clone())
                        .or_else(|| row.directory.phone.clone()),
                    presence_source: presence
                        .source_index
                        .map(|index| DEVICE_PRESENCE_SOURCES[index].name),
                    presence,
                    is_active: row.is_active(),
                    battery_percent,
                    low_battery: battery_percent
                        .is_some_and(|battery| battery <= low_battery_threshold),
                    latest_message: row.latest_message.clone(),
                    message_count: row.message_count,
                    errors: row.errors.clone(),
                }
            })
            .collect();

        let pending = self.devices.values().filter(|row| !row.is_settled()).count();
        FleetSnapshot {
            summary: FleetSummary::from_devices(&devices),
            devices,
            pending,
            computed_at_millis: now_millis,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshots
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceView {
    pub device_id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub presence: PresenceVerdict,
    pub presence_source: Option<&'static str>,
    pub is_active: bool,
    pub battery_percent: Option<u8>,
    pub low_battery: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_message: Option<Message>,
    pub message_count: usize,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<BindingSource, String>,
}

/// Fleet counts. `online + offline + unknown == total`; `inactive` and
/// `low_battery` are orthogonal to presence.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetSummary {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub unknown: usize,
    pub inactive: usize,
    pub low_battery: usize,
    /// Mean over devices reporting a battery level.
    pub average_battery: Option<f64>,
}

impl FleetSummary {
    pub fn from_devices(devices: &[DeviceView]) -> Self {
        let mut summary = FleetSummary {
            total: devices.len(),
            ..FleetSummary::default()
        };
        let mut battery_sum = 0u64;
        let mut battery_count = 0u64;

        for device in devices {
            match device.presence.presence {
                Presence::Online => summary.online += 1,
                Presence::Offline => summary.offline += 1,
                Presence::Unknown => summary.unknown += 1,
            }
            if !device.is_active {
                summary.inactive += 1;
            }
            if device.low_battery {
                summary.low_battery += 1;
            }
            if let Some(battery) = device.battery_percent {
                battery_sum += u64::from(battery);
                battery_count += 1;
            }
        }

        if battery_count > 0 {
            summary.average_battery = Some(battery_sum as f64 / battery_count as f64);
        }
        summary
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetSnapshot {
    pub summary: FleetSummary,
    pub devices: Vec<DeviceView>,
    /// Devices whose record or heartbeat binding has not delivered yet.
    pub pending: usize,
    pub computed_at_millis: i64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Aggregator
// ═══════════════════════════════════════════════════════════════════════════════

struct DeviceBindings {
    status: BindingHandle<Normalized>,
    heartbeat: BindingHandle<Option<i64>>,
    messages: Option<BindingHandle<Vec<Normalized>>>,
}

impl DeviceBindings {
    fn release(&self) {
        self.status.release();
        self.heartbeat.release();
        if let Some(messages) = &self.messages {
            messages.release();
        }
    }
}

struct Settings {
    classifier: PresenceClassifier,
    low_battery_threshold: u8,
    tick: Duration,
    clock: fn() -> i64,
}

pub struct FleetAggregator {
    bindings: Vec<DeviceBindings>,
    snapshots: watch::Receiver<FleetSnapshot>,
    task: Option<JoinHandle<()>>,
}

fn forward<T: Send + 'static>(
    events: &mpsc::UnboundedSender<FleetEvent>,
    device_id: &str,
    source: BindingSource,
    wrap: fn(String, Update<T>) -> FleetEvent,
) -> Callbacks<T> {
    let update_tx = events.clone();
    let update_id = device_id.to_string();
    let error_tx = events.clone();
    let error_id = device_id.to_string();
    Callbacks::new()
        .on_update(move |update| {
            let _ = update_tx.send(wrap(update_id.clone(), update));
        })
        .on_error(move |error| {
            let _ = error_tx.send(FleetEvent::Error(error_id.clone(), source, error));
        })
}

impl FleetAggregator {
    /// Lists the directory and binds every device.
    pub async fn start(
        store: Arc<dyn Store>,
        directory: &dyn DeviceDirectory,
        config: &SyncConfig,
        mode: FleetMode,
    ) -> Result<Self, FleetSyncError> {
        Self::start_with_clock(store, directory, config, mode, now_millis).await
    }

    pub async fn start_with_clock(
        store: Arc<dyn Store>,
        directory: &dyn DeviceDirectory,
        config: &SyncConfig,
        mode: FleetMode,
        clock: fn() -> i64,
    ) -> Result<Self, FleetSyncError> {
        let listing = list_devices(directory).await?;
        info!(
            devices = listing.entries.len(),
            rejected = listing.rejected.len(),
            mode = ?mode,
            "Starting fleet aggregator"
        );

        let mut options = config.binding_options();
        options.clock = clock;
        if mode == FleetMode::Detail {
            options.fetch_limiter = config.fetch_limiter();
        }

        let resolved = resolve_fleet_paths(
            &store,
            &listing.entries,
            config.paths.layout,
            mode,
            options.read_timeout,
        )
        .await?;

        let message_limit = config.fleet.message_limit;
        let (events, receiver) = mpsc::unbounded_channel();
        let mut bindings = Vec::with_capacity(listing.entries.len());

        for (entry, paths) in listing.entries.iter().zip(resolved) {
            let device_id = entry.device_id.as_str();

            let status = LiveBinding::spawn(
                Arc::clone(&store),
                paths.record,
                RecordNormalizer::new(EntityKind::Device),
                options.clone(),
                forward(&events, device_id, BindingSource::Status, FleetEvent::Status),
            );

            let heartbeat = LiveBinding::spawn(
                Arc::clone(&store),
                heartbeat_path(device_id)?,
                HeartbeatNormalizer,
                options.clone(),
                forward(&events, device_id, BindingSource::Heartbeat, FleetEvent::Heartbeat),
            );

            let messages = paths.messages.map(|path| {
                LiveBinding::spawn(
                    Arc::clone(&store),
                    path,
                    CollectionNormalizer::with_limit(EntityKind::Message, message_limit),
                    options.clone(),
                    forward(&events, device_id, BindingSource::Messages, FleetEvent::Messages),
                )
            });

            bindings.push(DeviceBindings {
                status,
                heartbeat,
                messages,
            });
        }
        // Only the bindings hold senders now; the task ends once they are gone.
        drop(events);

        let settings = Settings {
            classifier: config.presence,
            low_battery_threshold: config.fleet.low_battery_threshold,
            tick: config.presence_tick(),
            clock,
        };
        let cache = DeviceCache::new(listing.entries);
        let initial = cache.snapshot(&settings.classifier, settings.low_battery_threshold, clock());
        let (publisher, snapshots) = watch::channel(initial);
        let task = tokio::spawn(run_aggregator(cache, receiver, publisher, settings));

        Ok(Self {
            bindings,
            snapshots,
            task: Some(task),
        })
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> FleetSnapshot {
        self.snapshots.borrow().clone()
    }

    /// A receiver whose `changed()` resolves on the next published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<FleetSnapshot> {
        let mut receiver = self.snapshots.clone();
        receiver.borrow_and_update();
        receiver
    }

    /// Waits until every device's record and heartbeat binding has
    /// delivered a value or an error.
    pub async fn settled(&self) -> FleetSnapshot {
        let mut receiver = self.snapshots.clone();
        loop {
            {
                let current = receiver.borrow_and_update();
                if current.pending == 0 {
                    return current.clone();
                }
            }
            if receiver.changed().await.is_err() {
                return receiver.borrow().clone();
            }
        }
    }

    pub fn device_count(&self) -> usize {
        self.bindings.len()
    }

    /// Releases every binding and stops the aggregator task. Idempotent.
    pub fn shutdown(&mut self) {
        for device in self.bindings.drain(..) {
            device.release();
        }
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Fleet aggregator stopped");
        }
    }
}

impl Drop for FleetAggregator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Store paths one device's bindings attach to.
struct DevicePaths {
    record: StorePath,
    messages: Option<StorePath>,
}

/// Resolves every device's paths concurrently. Results keep directory order.
async fn resolve_fleet_paths(
    store: &Arc<dyn Store>,
    entries: &[DirectoryEntry],
    layout: PathLayout,
    mode: FleetMode,
    read_timeout: Duration,
) -> Result<Vec<DevicePaths>, FleetSyncError> {
    let mut tasks = Vec::with_capacity(entries.len());
    for entry in entries {
        let record = layout.candidates(EntityKind::Device, &entry.device_id)?;
        let messages = match mode {
            FleetMode::PresenceOnly => None,
            FleetMode::Detail => Some(layout.candidates(EntityKind::Message, &entry.device_id)?),
        };
        let store = Arc::clone(store);
        tasks.push(tokio::spawn(async move {
            let record = resolve_device_path(store.as_ref(), record, read_timeout).await?;
            let messages = match messages {
                Some(candidates) => {
                    Some(resolve_device_path(store.as_ref(), candidates, read_timeout).await?)
                }
                None => None,
            };
            Ok::<_, FleetSyncError>(DevicePaths { record, messages })
        }));
    }

    let mut resolved = Vec::with_capacity(tasks.len());
    for task in tasks {
        let paths = task.await.map_err(|err| {
            DirectoryError::Unavailable(format!("path resolution task failed: {err}"))
        })??;
        resolved.push(paths);
    }
    Ok(resolved)
}

async fn resolve_device_path(
    store: &dyn Store,
    candidates: Vec<StorePath>,
    read_timeout: Duration,
) -> Result<StorePath, FleetSyncError> {
    resolve_or_primary(store, &candidates, read_timeout).await.ok_or_else(|| {
        DirectoryError::Unavailable("no candidate paths for device".to_string()).into()
    })
}

async fn run_aggregator(
    mut cache: DeviceCache,
    mut events: mpsc::UnboundedReceiver<FleetEvent>,
    publisher: watch::Sender<FleetSnapshot>,
    settings: Settings,
) {
    let mut tick = tokio::time::interval(settings.tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    tick.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => cache.apply(event),
                None => break,
            },
            _ = tick.tick() => {}
        }
        let snapshot = cache.snapshot(
            &settings.classifier,
            settings.low_battery_threshold,
            (settings.clock)(),
        );
        publisher.send_replace(snapshot);
    }

    debug!(devices = cache.len(), "Fleet bindings released; aggregator exiting");
}
