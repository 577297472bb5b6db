//! Integration tests for bindings, normalization and fleet aggregation
//! running together over the in-memory store.

use fleet_sync::normalize::Direction;
use fleet_sync::{
    classify, load_config_from, normalize, BindingOptions, BindingState, Callbacks,
    CanonicalRecord, CollectionNormalizer, DirectoryEntry, EntityKind, FleetAggregator, FleetMode,
    LiveBinding, MemoryStore, Normalized, Presence, PresenceClassifier, RecordNormalizer,
    StaticDirectory, StorePath, SyncError, Update,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const NOW: i64 = 1_700_000_600_000;

fn path(value: &str) -> StorePath {
    StorePath::parse(value).expect("path")
}

fn fixed_clock() -> i64 {
    NOW
}

fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<Update<T>>>>, Callbacks<T>) {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);
    let callbacks =
        Callbacks::new().on_update(move |update| sink.lock().expect("updates").push(update));
    (updates, callbacks)
}

fn bodies(update: &Update<Vec<Normalized>>) -> Vec<String> {
    update
        .value()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item.record() {
                    Some(CanonicalRecord::Message(message)) => Some(message.body.clone()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn test_compact_message_scenario() {
    let normalized = normalize(
        EntityKind::Message,
        "1700000000000",
        &json!("sent~+15551234567~Hello"),
        NOW,
    );
    let Some(CanonicalRecord::Message(message)) = normalized.record() else {
        panic!("expected a message, got {normalized:?}");
    };
    assert_eq!(message.direction, Direction::Sent);
    assert_eq!(message.counterparty_address, "+15551234567");
    assert_eq!(message.body, "Hello");
    assert_eq!(message.timestamp_millis, 1_700_000_000_000);
}

#[test]
fn test_legacy_permission_scenario() {
    let normalized = normalize(
        EntityKind::PermissionSnapshot,
        "permissionStatus",
        &json!({"sms": true, "contacts": false}),
        NOW,
    );
    let Some(CanonicalRecord::Permissions(snapshot)) = normalized.record() else {
        panic!("expected permissions, got {normalized:?}");
    };
    assert_eq!(snapshot.sms_granted, Some(true));
    assert_eq!(snapshot.contacts_granted, Some(false));
    assert_eq!(snapshot.phone_granted, None);
}

#[test]
fn test_presence_falls_through_to_second_source() {
    let verdict = classify(&[None, Some(1_700_000_000_000)], 1_700_000_300_001, 300_000);
    assert_eq!(verdict.presence, Presence::Offline);
    assert_eq!(verdict.source_index, Some(1));

    let classifier = PresenceClassifier::default();
    assert_eq!(classifier.classify(&[Some(NOW - 299_999)], NOW).presence, Presence::Online);
    assert_eq!(classifier.classify(&[Some(NOW - 300_000)], NOW).presence, Presence::Offline);
}

#[tokio::test(start_paused = true)]
async fn test_message_feed_binding_follows_the_store() {
    let store = MemoryStore::from_value(json!({
        "device": {"abc": {"messages": {
            "1700000000001": "received~+1~older",
            "1700000000002": "sent~+1~newer"
        }}}
    }));
    let (updates, callbacks) = recorder();
    let handle = LiveBinding::spawn(
        Arc::new(store.clone()),
        path("device/abc/messages"),
        CollectionNormalizer::new(EntityKind::Message),
        BindingOptions::default(),
        callbacks,
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.state(), BindingState::Subscribed);
    {
        let updates = updates.lock().expect("updates");
        assert_eq!(updates.len(), 1);
        assert_eq!(bodies(&updates[0]), vec!["newer", "older"]);
    }

    store.set(&path("device/abc/messages/1700000000003"), json!("received~+2~newest"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    {
        let updates = updates.lock().expect("updates");
        assert_eq!(updates.len(), 2);
        assert_eq!(bodies(&updates[1]), vec!["newest", "newer", "older"]);
    }

    handle.release();
    tokio::time::sleep(Duration::from_millis(10)).await;
    store.set(&path("device/abc/messages/1700000000004"), json!("received~+2~after"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(updates.lock().expect("updates").len(), 2);
    assert_eq!(store.total_active_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_independent_consumers_of_one_path() {
    let store = MemoryStore::from_value(json!({"device": {"abc": {"name": "Pixel"}}}));
    let record = path("device/abc");

    let (first_updates, first_callbacks) = recorder();
    let first = LiveBinding::spawn(
        Arc::new(store.clone()),
        record.clone(),
        RecordNormalizer::new(EntityKind::Device),
        BindingOptions::default(),
        first_callbacks,
    );
    let (second_updates, second_callbacks) = recorder();
    let second = LiveBinding::spawn(
        Arc::new(store.clone()),
        record.clone(),
        RecordNormalizer::new(EntityKind::Device),
        BindingOptions::default(),
        second_callbacks,
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.active_subscriptions(&record), 2);

    // A remount: the old consumer goes away and must not see later writes.
    drop(first);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.active_subscriptions(&record), 1);

    store.set(&path("device/abc/name"), json!("Pixel 8"));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(first_updates.lock().expect("updates").len(), 1);
    assert_eq!(second_updates.lock().expect("updates").len(), 2);
    let latest = second.latest().expect("latest");
    match latest.value().and_then(Normalized::record) {
        Some(CanonicalRecord::Device(status)) => {
            assert_eq!(status.name.as_deref(), Some("Pixel 8"))
        }
        other => panic!("unexpected record {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_read_failure_then_subscription_success() {
    let store = MemoryStore::from_value(json!({"device": {"abc": {"name": "Pixel"}}}));
    store.fail_next_reads([fleet_sync::StoreError::PermissionDenied("rules".into())]);

    let errors: Arc<Mutex<Vec<SyncError>>> = Arc::new(Mutex::new(Vec::new()));
    let error_sink = Arc::clone(&errors);
    let (updates, callbacks) = recorder();
    let callbacks = callbacks.on_error(move |error| error_sink.lock().expect("errors").push(error));

    let handle = LiveBinding::spawn(
        Arc::new(store.clone()),
        path("device/abc"),
        RecordNormalizer::new(EntityKind::Device),
        BindingOptions::default(),
        callbacks,
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    let errors = errors.lock().expect("errors");
    assert_eq!(errors.len(), 1);
    assert!(!errors[0].is_retryable());
    assert_eq!(updates.lock().expect("updates").len(), 1);
    assert_eq!(handle.state(), BindingState::Subscribed);
}

#[tokio::test(start_paused = true)]
async fn test_aggregator_over_configured_fleet() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let config_path = temp_dir.path().join("config.toml");
    fs_err::write(
        &config_path,
        "[fleet]\nlow_battery_threshold = 30\n\n[paths]\nlayout = \"fastpay\"\n",
    )
    .expect("write config");
    let config = load_config_from(&config_path).expect("load config");

    let store = MemoryStore::from_value(json!({
        "fastpay": {
            "a": {"name": "Alpha", "batteryPercentage": 25, "lastSeen": NOW - 1_000},
            "b": {"name": "Bravo", "batteryPercentage": 75, "lastSeen": NOW - 600_000}
        },
        "device": {
            "c": {"name": "Charlie", "isActive": "closed"}
        },
        "heartbeat": {"c": NOW - 5}
    }));
    let directory = StaticDirectory::new(vec![
        DirectoryEntry::new("a"),
        DirectoryEntry::new("b"),
        DirectoryEntry::new("c"),
    ]);

    let mut aggregator = FleetAggregator::start_with_clock(
        Arc::new(store.clone()),
        &directory,
        &config,
        FleetMode::PresenceOnly,
        fixed_clock,
    )
    .await
    .expect("start");
    assert_eq!(aggregator.device_count(), 3);

    let snapshot = aggregator.settled().await;
    let summary = &snapshot.summary;
    assert_eq!(summary.total, 3);
    assert_eq!(summary.online, 2);
    assert_eq!(summary.offline, 1);
    assert_eq!(summary.unknown, 0);
    assert_eq!(summary.inactive, 1);
    assert_eq!(summary.low_battery, 1);
    assert_eq!(summary.average_battery, Some(50.0));

    let mut receiver = aggregator.subscribe();
    store.set(&path("fastpay/b/lastSeen"), json!(NOW - 10));
    receiver.changed().await.expect("changed");
    assert_eq!(receiver.borrow().summary.online, 3);

    aggregator.shutdown();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.total_active_subscriptions(), 0);
}
