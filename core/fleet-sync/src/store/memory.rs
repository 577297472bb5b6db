//! In-process store backed by a JSON tree.
//!
//! Writes notify every subscriber whose path is an ancestor or descendant of
//! the written path, mirroring how a hierarchical realtime store fans out
//! changes. Scripted latency and failures make the binding's timing edges
//! reproducible under paused tokio time.

use super::{PushEvent, PushSender, Store, Subscription};
use crate::error::StoreError;
use async_trait::async_trait;
use fleet_protocol::{RawRecord, StorePath};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    active: HashMap<u64, (StorePath, PushSender)>,
    unsubscribed: usize,
}

#[derive(Default)]
struct Inner {
    root: Mutex<Value>,
    subscribers: Mutex<Subscribers>,
    read_failures: Mutex<VecDeque<StoreError>>,
    subscribe_failure: Mutex<Option<StoreError>>,
    read_latency: Mutex<HashMap<StorePath, Duration>>,
    reads: Mutex<HashMap<StorePath, usize>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cheap to clone; clones share the same tree.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `root` as the whole tree.
    pub fn from_value(root: Value) -> Self {
        let store = Self::new();
        *lock(&store.inner.root) = root;
        store
    }

    pub fn get(&self, path: &StorePath) -> Option<RawRecord> {
        let root = lock(&self.inner.root);
        value_at(&root, path.segments()).cloned()
    }

    /// Writes `value` at `path`; `Value::Null` removes it. Notifies every
    /// affected subscriber with its path's new value.
    pub fn set(&self, path: &StorePath, value: Value) {
        {
            let mut root = lock(&self.inner.root);
            write_at(&mut root, path.segments(), value);
        }
        self.notify(path);
    }

    pub fn remove(&self, path: &StorePath) {
        self.set(path, Value::Null);
    }

    /// Delivers `error` to every subscriber of exactly `path`.
    pub fn fail_subscribers(&self, path: &StorePath, error: StoreError) {
        let subscribers = lock(&self.inner.subscribers);
        for (subscribed, tx) in subscribers.active.values() {
            if subscribed == path {
                let _ = tx.send(PushEvent::Error(error.clone()));
            }
        }
    }

    /// The next `errors.len()` reads (on any path) fail in order.
    pub fn fail_next_reads(&self, errors: impl IntoIterator<Item = StoreError>) {
        lock(&self.inner.read_failures).extend(errors);
    }

    /// Every subsequent subscribe fails with `error` until cleared.
    pub fn fail_subscriptions(&self, error: Option<StoreError>) {
        *lock(&self.inner.subscribe_failure) = error;
    }

    /// Reads of `path` take `latency` before resolving.
    pub fn set_read_latency(&self, path: &StorePath, latency: Duration) {
        lock(&self.inner.read_latency).insert(path.clone(), latency);
    }

    pub fn active_subscriptions(&self, path: &StorePath) -> usize {
        lock(&self.inner.subscribers)
            .active
            .values()
            .filter(|(subscribed, _)| subscribed == path)
            .count()
    }

    pub fn total_active_subscriptions(&self) -> usize {
        lock(&self.inner.subscribers).active.len()
    }

    pub fn unsubscribe_count(&self) -> usize {
        lock(&self.inner.subscribers).unsubscribed
    }

    pub fn read_count(&self, path: &StorePath) -> usize {
        lock(&self.inner.reads).get(path).copied().unwrap_or(0)
    }

    fn notify(&self, changed: &StorePath) {
        let root = lock(&self.inner.root);
        let mut subscribers = lock(&self.inner.subscribers);
        subscribers.active.retain(|id, (subscribed, tx)| {
            if !(subscribed.contains(changed) || changed.contains(subscribed)) {
                return true;
            }
            let value = value_at(&root, subscribed.segments()).cloned();
            trace!(subscription = id, path = %subscribed, "Pushing change");
            // A closed receiver means the subscription is mid-drop.
            tx.send(PushEvent::Value(value)).is_ok()
        });
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self, path: &StorePath) -> Result<Option<RawRecord>, StoreError> {
        *lock(&self.inner.reads).entry(path.clone()).or_insert(0) += 1;

        // The response reflects the tree when the request was served, even
        // if it is delivered late.
        let failure = lock(&self.inner.read_failures).pop_front();
        let response = match failure {
            Some(err) => Err(err),
            None => Ok(self.get(path)),
        };

        let latency = lock(&self.inner.read_latency).get(path).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        response
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError> {
        if let Some(err) = lock(&self.inner.subscribe_failure).clone() {
            return Err(err);
        }

        let id = {
            let mut subscribers = lock(&self.inner.subscribers);
            subscribers.next_id += 1;
            subscribers.next_id
        };

        let inner = Arc::downgrade(&self.inner);
        let (tx, subscription) = Subscription::channel(move || {
            if let Some(inner) = inner.upgrade() {
                let mut subscribers = lock(&inner.subscribers);
                subscribers.active.remove(&id);
                subscribers.unsubscribed += 1;
            }
        });

        // Initial value first, then register, both under the tree lock so no
        // write can slip between them.
        let root = lock(&self.inner.root);
        let _ = tx.send(PushEvent::Value(value_at(&root, path.segments()).cloned()));
        lock(&self.inner.subscribers)
            .active
            .insert(id, (path.clone(), tx));
        drop(root);

        Ok(subscription)
    }
}

fn value_at<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = match node {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if node.is_null() {
        None
    } else {
        Some(node)
    }
}

/// Writes and prunes: empty mappings left behind by a removal disappear.
fn write_at(node: &mut Value, segments: &[String], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        if value.is_null() {
            return;
        }
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry(head.clone()).or_insert(Value::Null);
        write_at(child, rest, value);
        let prune = match map.get(head) {
            Some(Value::Null) => true,
            Some(Value::Object(inner)) => inner.is_empty(),
            _ => false,
        };
        if prune {
            map.remove(head);
        }
    }
}
