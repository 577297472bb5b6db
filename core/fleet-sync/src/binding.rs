//! Fetch-then-subscribe binding of one store path to one consumer.
//!
//! A [`LiveBinding`] starts a retrying one-shot read immediately, hands off
//! to a push subscription once the read settles or a short grace delay
//! elapses (whichever is first), and from then on forwards every push.
//!
//! # State machine
//!
//! ```text
//! Idle ─▶ FetchingInitial ─┬─▶ Subscribing ─▶ Subscribed
//!                          └─▶ FetchFailed ─▶ Subscribing ─▶ SubscriptionFailed
//!
//! any state ─▶ Released
//! ```
//!
//! # Ordering
//!
//! Values reach the consumer in non-decreasing store revision order. A
//! one-shot read that settles after a push has already been delivered is
//! emitted only when its revision is strictly greater than every revision
//! seen so far; otherwise it is discarded. An absent push is never
//! overwritten by a late read. A read emitted before the first push is
//! remembered, so an identical first push is not delivered twice.
//!
//! # Release
//!
//! [`BindingHandle::release`] is idempotent and safe from any state. Once it
//! returns no new callback invocation starts. The driver task is aborted,
//! which drops the in-flight read and the [`Subscription`], whose `Drop`
//! unsubscribes exactly once.

use crate::error::{StoreError, SyncError};
use crate::normalize::{Normalizer, Revision};
use crate::presence::now_millis;
use crate::retry::RetryPolicy;
use crate::store::{PushEvent, Store, Subscription};
use fleet_protocol::{RawRecord, StorePath};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default hand-off delay between starting the read and subscribing.
pub const DEFAULT_GRACE_DELAY: Duration = Duration::from_millis(100);

/// Default per-attempt timeout for the one-shot read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Public types
// ═══════════════════════════════════════════════════════════════════════════════

/// A value delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "update", content = "value", rename_all = "snake_case")]
pub enum Update<T> {
    /// Nothing is stored at the path.
    Absent,
    Value(T),
}

impl<T> Update<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Update::Absent => None,
            Update::Value(value) => Some(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    Idle,
    FetchingInitial,
    /// The one-shot read failed before the subscription started.
    FetchFailed,
    Subscribing,
    Subscribed,
    /// The subscription could not be opened or ended with an error. The
    /// binding does not retry it.
    SubscriptionFailed,
    Released,
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BindingState::Idle => "idle",
            BindingState::FetchingInitial => "fetching_initial",
            BindingState::FetchFailed => "fetch_failed",
            BindingState::Subscribing => "subscribing",
            BindingState::Subscribed => "subscribed",
            BindingState::SubscriptionFailed => "subscription_failed",
            BindingState::Released => "released",
        };
        f.write_str(name)
    }
}

type UpdateFn<T> = Box<dyn FnMut(Update<T>) + Send>;
type ErrorFn = Box<dyn FnMut(SyncError) + Send>;

/// Consumer callbacks. Both are optional; a binding without callbacks still
/// runs and keeps only its latest value.
pub struct Callbacks<T> {
    on_update: Option<UpdateFn<T>>,
    on_error: Option<ErrorFn>,
}

impl<T> Default for Callbacks<T> {
    fn default() -> Self {
        Self {
            on_update: None,
            on_error: None,
        }
    }
}

impl<T> Callbacks<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_update(mut self, f: impl FnMut(Update<T>) + Send + 'static) -> Self {
        self.on_update = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(SyncError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

#[derive(Debug, Clone)]
pub struct BindingOptions {
    pub retry: RetryPolicy,
    pub grace_delay: Duration,
    pub read_timeout: Duration,
    /// Which read failures the retry policy retries.
    pub is_retryable: fn(&StoreError) -> bool,
    /// Shared cap on concurrent one-shot reads across bindings.
    pub fetch_limiter: Option<Arc<Semaphore>>,
    /// Supplies `now_millis` to the normalizer.
    pub clock: fn() -> i64,
}

impl Default for BindingOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            grace_delay: DEFAULT_GRACE_DELAY,
            read_timeout: DEFAULT_READ_TIMEOUT,
            is_retryable: StoreError::is_transient,
            fetch_limiter: None,
            clock: now_millis,
        }
    }
}

impl BindingOptions {
    pub fn with_fetch_limiter(mut self, limiter: Arc<Semaphore>) -> Self {
        self.fetch_limiter = Some(limiter);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Shared state between the handle and the driver task
// ═══════════════════════════════════════════════════════════════════════════════

struct Shared<T> {
    path: StorePath,
    released: AtomicBool,
    state: Mutex<BindingState>,
    latest: Mutex<Option<Update<T>>>,
    callbacks: Mutex<Option<Callbacks<T>>>,
}

impl<T: Clone> Shared<T> {
    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: BindingState) {
        let mut state = lock(&self.state);
        if *state == BindingState::Released {
            return;
        }
        let from = *state;
        debug!(path = %self.path, from = %from, to = %next, "Binding state transition");
        *state = next;
    }

    /// Runs `f` with the callbacks taken out of the mutex, so a callback may
    /// release its own binding without deadlocking.
    fn with_callbacks(&self, f: impl FnOnce(&mut Callbacks<T>)) {
        let taken = {
            let mut guard = lock(&self.callbacks);
            if self.is_released() {
                return;
            }
            guard.take()
        };
        let Some(mut callbacks) = taken else {
            return;
        };

        f(&mut callbacks);

        let mut guard = lock(&self.callbacks);
        if !self.is_released() {
            *guard = Some(callbacks);
        }
    }

    fn emit_update(&self, update: Update<T>) {
        if self.is_released() {
            return;
        }
        *lock(&self.latest) = Some(update.clone());
        self.with_callbacks(|callbacks| {
            if let Some(on_update) = callbacks.on_update.as_mut() {
                on_update(update);
            }
        });
    }

    fn emit_error(&self, error: SyncError) {
        if self.is_released() {
            return;
        }
        warn!(path = %self.path, error = %error, "Binding error");
        self.with_callbacks(|callbacks| {
            if let Some(on_error) = callbacks.on_error.as_mut() {
                on_error(error);
            }
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LiveBinding
// ═══════════════════════════════════════════════════════════════════════════════

pub struct LiveBinding;

impl LiveBinding {
    /// Starts a binding on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn<N: Normalizer>(
        store: Arc<dyn Store>,
        path: StorePath,
        normalizer: N,
        options: BindingOptions,
        callbacks: Callbacks<N::Output>,
    ) -> BindingHandle<N::Output> {
        let shared = Arc::new(Shared {
            path: path.clone(),
            released: AtomicBool::new(false),
            state: Mutex::new(BindingState::Idle),
            latest: Mutex::new(None),
            callbacks: Mutex::new(Some(callbacks)),
        });

        debug!(path = %path, "Spawning live binding");
        let driver = Driver {
            store,
            path,
            normalizer,
            options,
            shared: Arc::clone(&shared),
        };
        let task = tokio::spawn(driver.run());

        BindingHandle {
            shared,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Owner of one running binding. Dropping it releases the binding.
pub struct BindingHandle<T: Clone> {
    shared: Arc<Shared<T>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone> BindingHandle<T> {
    pub fn path(&self) -> &StorePath {
        &self.shared.path
    }

    pub fn state(&self) -> BindingState {
        *lock(&self.shared.state)
    }

    /// The newest update delivered so far. No history is kept.
    pub fn latest(&self) -> Option<Update<T>> {
        lock(&self.shared.latest).clone()
    }

    pub fn is_released(&self) -> bool {
        self.shared.is_released()
    }

    /// Stops the binding. Calling it again is a no-op.
    pub fn release(&self) {
        if self.shared.released.swap(true, Ordering::SeqCst) {
            return;
        }
        *lock(&self.shared.state) = BindingState::Released;
        // Dropped outside the lock in case a callback owns something whose
        // drop re-enters the binding.
        let callbacks = lock(&self.shared.callbacks).take();
        drop(callbacks);
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        debug!(path = %self.shared.path, "Released live binding");
    }
}

impl<T: Clone> Drop for BindingHandle<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: Clone> fmt::Debug for BindingHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingHandle")
            .field("path", &self.shared.path)
            .field("state", &self.state())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Driver task
// ═══════════════════════════════════════════════════════════════════════════════

type ReadResult = Result<Option<RawRecord>, SyncError>;

struct Driver<N: Normalizer> {
    store: Arc<dyn Store>,
    path: StorePath,
    normalizer: N,
    options: BindingOptions,
    shared: Arc<Shared<N::Output>>,
}

/// What the consumer has been shown so far.
#[derive(Default)]
struct Delivered {
    /// Raw value of an emitted one-shot read; the first push is compared
    /// against it so the hand-off does not repeat it.
    read: Option<Option<RawRecord>>,
    pushed: bool,
    /// The most recent push reported no value.
    absent: bool,
    /// Highest revision seen across every push and the emitted read. A push
    /// that deletes the newest child lowers the current revision, never this.
    high_water: Option<Revision>,
}

impl Delivered {
    fn observe(&mut self, revision: Option<Revision>) {
        let Some(revision) = revision else {
            return;
        };
        if self.high_water.as_ref().map_or(true, |high| revision > *high) {
            self.high_water = Some(revision);
        }
    }
}

impl<N: Normalizer> Driver<N> {
    async fn run(self) {
        self.shared.set_state(BindingState::FetchingInitial);

        let mut fetch = Box::pin(fetch_initial(
            Arc::clone(&self.store),
            self.path.clone(),
            self.options.clone(),
        ));
        let mut read_pending = true;
        let mut delivered = Delivered::default();

        let grace = tokio::time::sleep(self.options.grace_delay);
        tokio::pin!(grace);

        tokio::select! {
            biased;
            result = &mut fetch => {
                read_pending = false;
                match result {
                    Ok(raw) => self.deliver_read(raw, &mut delivered),
                    Err(err) => {
                        self.shared.set_state(BindingState::FetchFailed);
                        self.shared.emit_error(err);
                    }
                }
            }
            _ = &mut grace => {
                debug!(path = %self.path, "Grace delay elapsed before initial read settled");
            }
        }

        if self.shared.is_released() {
            return;
        }
        self.shared.set_state(BindingState::Subscribing);

        let subscribed = {
            let subscribe = self.store.subscribe(&self.path);
            tokio::pin!(subscribe);
            loop {
                tokio::select! {
                    biased;
                    result = &mut fetch, if read_pending => {
                        read_pending = false;
                        self.settle_late_read(result, &mut delivered);
                    }
                    result = &mut subscribe => break result,
                }
            }
        };

        let mut subscription = match subscribed {
            Ok(subscription) => subscription,
            Err(source) => {
                self.shared.set_state(BindingState::SubscriptionFailed);
                self.shared.emit_error(SyncError::Subscription {
                    path: self.path.clone(),
                    source,
                });
                if read_pending {
                    let result = fetch.await;
                    self.settle_late_read(result, &mut delivered);
                }
                return;
            }
        };
        self.shared.set_state(BindingState::Subscribed);

        loop {
            tokio::select! {
                biased;
                result = &mut fetch, if read_pending => {
                    read_pending = false;
                    self.settle_late_read(result, &mut delivered);
                }
                event = subscription.next() => {
                    let source = match event {
                        Some(PushEvent::Value(raw)) => {
                            let first_push = !delivered.pushed;
                            delivered.pushed = true;
                            delivered.absent = raw.is_none();
                            delivered.observe(self.revision_of(raw.as_ref()));
                            // The subscription's initial value usually repeats the read.
                            if first_push && delivered.read.as_ref() == Some(&raw) {
                                continue;
                            }
                            self.emit_raw(raw.as_ref());
                            continue;
                        }
                        Some(PushEvent::Error(source)) => source,
                        None => StoreError::Closed,
                    };
                    self.shared.set_state(BindingState::SubscriptionFailed);
                    self.shared.emit_error(SyncError::Subscription {
                        path: self.path.clone(),
                        source,
                    });
                    break;
                }
            }
        }

        drop(subscription);
        if read_pending {
            let result = fetch.await;
            self.settle_late_read(result, &mut delivered);
        }
    }

    fn revision_of(&self, raw: Option<&RawRecord>) -> Option<Revision> {
        raw.and_then(|raw| self.normalizer.revision(raw))
    }

    fn emit_raw(&self, raw: Option<&RawRecord>) {
        let update = match raw {
            Some(raw) => {
                let now = (self.options.clock)();
                Update::Value(self.normalizer.normalize(&self.path, raw, now))
            }
            None => Update::Absent,
        };
        self.shared.emit_update(update);
    }

    fn deliver_read(&self, raw: Option<RawRecord>, delivered: &mut Delivered) {
        self.emit_raw(raw.as_ref());
        delivered.observe(self.revision_of(raw.as_ref()));
        delivered.read = Some(raw);
    }

    /// A read that settled after the subscription was requested.
    fn settle_late_read(&self, result: ReadResult, delivered: &mut Delivered) {
        let raw = match result {
            Ok(raw) => raw,
            Err(err) => {
                self.shared.emit_error(err);
                return;
            }
        };

        if !delivered.pushed {
            self.deliver_read(raw, delivered);
            return;
        }

        let read_revision = self.revision_of(raw.as_ref());
        match (read_revision, delivered.high_water.clone()) {
            (Some(read), Some(high)) if !delivered.absent && read > high => {
                debug!(
                    path = %self.path,
                    read = read.as_str(),
                    high_water = high.as_str(),
                    "Late read is newer than every push"
                );
                self.deliver_read(raw, delivered);
            }
            (read, high) => {
                debug!(
                    path = %self.path,
                    read = read.as_ref().map(Revision::as_str),
                    high_water = high.as_ref().map(Revision::as_str),
                    "Discarding stale initial read"
                );
            }
        }
    }
}

async fn fetch_initial(
    store: Arc<dyn Store>,
    path: StorePath,
    options: BindingOptions,
) -> ReadResult {
    // Held for the whole retry sequence.
    let _permit = match &options.fetch_limiter {
        Some(limiter) => match Arc::clone(limiter).acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => None,
        },
        None => None,
    };

    let read_timeout = options.read_timeout;
    let result = options
        .retry
        .attempt(
            |attempt| {
                let store = Arc::clone(&store);
                let path = path.clone();
                async move {
                    debug!(path = %path, attempt, "One-shot read");
                    tokio::time::timeout(read_timeout, store.read(&path))
                        .await
                        .unwrap_or(Err(StoreError::Timeout(read_timeout)))
                }
            },
            options.is_retryable,
        )
        .await;

    result.map_err(|source| SyncError::Read {
        retryable: (options.is_retryable)(&source),
        path,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::OnceLock;

    struct Identity;

    impl Normalizer for Identity {
        type Output = Value;

        fn normalize(&self, _path: &StorePath, raw: &RawRecord, _now_millis: i64) -> Value {
            raw.clone()
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        updates: Arc<Mutex<Vec<Update<Value>>>>,
        errors: Arc<Mutex<Vec<SyncError>>>,
    }

    impl Recorder {
        fn callbacks(&self) -> Callbacks<Value> {
            let updates = Arc::clone(&self.updates);
            let errors = Arc::clone(&self.errors);
            Callbacks::new()
                .on_update(move |update| updates.lock().expect("updates").push(update))
                .on_error(move |error| errors.lock().expect("errors").push(error))
        }

        fn updates(&self) -> Vec<Update<Value>> {
            self.updates.lock().expect("updates").clone()
        }

        fn errors(&self) -> Vec<SyncError> {
            self.errors.lock().expect("errors").clone()
        }
    }

    fn path(value: &str) -> StorePath {
        StorePath::parse(value).expect("path")
    }

    fn options() -> BindingOptions {
        BindingOptions {
            retry: RetryPolicy::new(3, Duration::from_millis(10)),
            ..BindingOptions::default()
        }
    }

    fn spawn(store: &MemoryStore, p: &StorePath, recorder: &Recorder) -> BindingHandle<Value> {
        LiveBinding::spawn(
            Arc::new(store.clone()),
            p.clone(),
            Identity,
            options(),
            recorder.callbacks(),
        )
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn fast_read_is_delivered_then_pushes_follow() {
        let store = MemoryStore::from_value(json!({"device": {"a": {"battery": 50}}}));
        let p = path("device/a");
        let recorder = Recorder::default();
        let handle = spawn(&store, &p, &recorder);

        sleep_ms(10).await;
        assert_eq!(handle.state(), BindingState::Subscribed);
        assert_eq!(recorder.updates(), vec![Update::Value(json!({"battery": 50}))]);

        store.set(&path("device/a/battery"), json!(49));
        sleep_ms(1).await;
        assert_eq!(
            recorder.updates().last(),
            Some(&Update::Value(json!({"battery": 49})))
        );
        assert_eq!(recorder.updates().len(), 2);
        assert_eq!(store.active_subscriptions(&p), 1);
        assert!(recorder.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn absent_path_emits_absent() {
        let store = MemoryStore::new();
        let p = path("device/missing");
        let recorder = Recorder::default();
        let _handle = spawn(&store, &p, &recorder);

        sleep_ms(10).await;
        assert_eq!(recorder.updates(), vec![Update::Absent]);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_waits_for_grace_delay_when_read_is_slow() {
        let store = MemoryStore::from_value(json!({"x": 1}));
        let p = path("x");
        store.set_read_latency(&p, Duration::from_secs(1));
        let recorder = Recorder::default();
        let handle = spawn(&store, &p, &recorder);

        sleep_ms(99).await;
        assert_eq!(handle.state(), BindingState::FetchingInitial);
        assert_eq!(store.active_subscriptions(&p), 0);

        sleep_ms(2).await;
        assert_eq!(handle.state(), BindingState::Subscribed);
        assert_eq!(store.active_subscriptions(&p), 1);
        assert_eq!(recorder.updates(), vec![Update::Value(json!(1))]);
    }

    #[tokio::test(start_paused = true)]
    async fn release_before_read_settles_delivers_nothing() {
        let store = MemoryStore::from_value(json!({"x": 1}));
        let p = path("x");
        store.set_read_latency(&p, Duration::from_secs(1));
        let recorder = Recorder::default();
        let handle = spawn(&store, &p, &recorder);

        sleep_ms(50).await;
        handle.release();
        sleep_ms(5_000).await;

        assert!(recorder.updates().is_empty());
        assert!(recorder.errors().is_empty());
        assert_eq!(handle.state(), BindingState::Released);
        assert_eq!(store.active_subscriptions(&p), 0);
        assert_eq!(handle.latest(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn release_after_subscribing_delivers_nothing_more() {
        let store = MemoryStore::from_value(json!({"x": 1}));
        let p = path("x");
        store.set_read_latency(&p, Duration::from_secs(1));
        let recorder = Recorder::default();
        let handle = spawn(&store, &p, &recorder);

        sleep_ms(150).await;
        assert_eq!(recorder.updates().len(), 1);
        handle.release();
        store.set(&p, json!(2));
        sleep_ms(5_000).await;

        assert_eq!(recorder.updates().len(), 1);
        assert_eq!(store.active_subscriptions(&p), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn read_failure_does_not_poison_subscription() {
        let store = MemoryStore::from_value(json!({"x": {"v": 7}}));
        let p = path("x");
        store.fail_next_reads(vec![StoreError::Transient("reset".into()); 3]);
        let recorder = Recorder::default();
        let handle = spawn(&store, &p, &recorder);

        sleep_ms(500).await;
        let errors = recorder.errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], SyncError::Read { retryable: true, .. }));
        assert_eq!(recorder.updates(), vec![Update::Value(json!({"v": 7}))]);
        assert_eq!(handle.state(), BindingState::Subscribed);
        assert_eq!(store.read_count(&p), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_read_fails_fast_and_marks_fetch_failed() {
        let store = MemoryStore::new();
        let p = path("x");
        store.fail_next_reads([StoreError::PermissionDenied("rules".into())]);
        store.fail_subscriptions(Some(StoreError::PermissionDenied("rules".into())));
        let recorder = Recorder::default();
        let handle = spawn(&store, &p, &recorder);

        sleep_ms(10).await;
        assert_eq!(store.read_count(&p), 1);
        let errors = recorder.errors();
        assert_eq!(errors.len(), 2);
        assert!(matches!(&errors[0], SyncError::Read { retryable: false, .. }));
        assert!(matches!(&errors[1], SyncError::Subscription { .. }));
        assert_eq!(handle.state(), BindingState::SubscriptionFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_late_read_is_discarded() {
        let store = MemoryStore::from_value(json!({"feed": {"1000": "a"}}));
        let p = path("feed");
        store.set_read_latency(&p, Duration::from_secs(1));
        let recorder = Recorder::default();
        let handle = spawn(&store, &p, &recorder);

        sleep_ms(150).await;
        store.set(&path("feed/2000"), json!("b"));
        sleep_ms(2_000).await;

        // Initial push, then the newer push; the read snapshot ({"1000"}) is dropped.
        assert_eq!(
            recorder.updates(),
            vec![
                Update::Value(json!({"1000": "a"})),
                Update::Value(json!({"1000": "a", "2000": "b"})),
            ]
        );
        assert_eq!(handle.latest(), Some(Update::Value(json!({"1000": "a", "2000": "b"}))));
    }

    #[tokio::test(start_paused = true)]
    async fn late_read_stays_discarded_after_newest_key_is_deleted() {
        let store = MemoryStore::from_value(json!({"feed": {"1000": "a", "2000": "b"}}));
        let p = path("feed");
        store.set_read_latency(&p, Duration::from_secs(1));
        let recorder = Recorder::default();
        let handle = spawn(&store, &p, &recorder);

        sleep_ms(150).await;
        store.remove(&path("feed/2000"));
        sleep_ms(2_000).await;

        // The read snapshot still holds "2000"; the deletion must win.
        assert_eq!(
            recorder.updates(),
            vec![
                Update::Value(json!({"1000": "a", "2000": "b"})),
                Update::Value(json!({"1000": "a"})),
            ]
        );
        assert_eq!(handle.latest(), Some(Update::Value(json!({"1000": "a"}))));
    }

    #[tokio::test(start_paused = true)]
    async fn late_read_never_overwrites_absent_push() {
        let store = MemoryStore::from_value(json!({"feed": {"1000": "a"}}));
        let p = path("feed");
        store.set_read_latency(&p, Duration::from_secs(1));
        let recorder = Recorder::default();
        let handle = spawn(&store, &p, &recorder);

        sleep_ms(50).await;
        store.set(&p, json!({"500": "x"}));
        sleep_ms(100).await;
        store.remove(&p);
        sleep_ms(2_000).await;

        assert_eq!(
            recorder.updates(),
            vec![Update::Value(json!({"500": "x"})), Update::Absent]
        );
        assert_eq!(handle.latest(), Some(Update::Absent));
    }

    /// Delays every `subscribe` call so reads can settle mid-hand-off.
    struct SlowSubscribe {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl Store for SlowSubscribe {
        async fn read(&self, path: &StorePath) -> Result<Option<RawRecord>, StoreError> {
            self.inner.read(path).await
        }

        async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.subscribe(path).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn read_settling_while_subscribing_is_not_repeated_by_first_push() {
        let inner = MemoryStore::from_value(json!({"x": 1}));
        let p = path("x");
        inner.set_read_latency(&p, Duration::from_millis(150));
        let store = SlowSubscribe {
            inner,
            delay: Duration::from_millis(100),
        };
        let recorder = Recorder::default();
        let handle =
            LiveBinding::spawn(Arc::new(store), p, Identity, options(), recorder.callbacks());

        sleep_ms(500).await;
        assert_eq!(handle.state(), BindingState::Subscribed);
        assert_eq!(recorder.updates(), vec![Update::Value(json!(1))]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_read_is_delivered_when_no_push_arrived() {
        let store = MemoryStore::from_value(json!({"x": 1}));
        let p = path("x");
        store.set_read_latency(&p, Duration::from_secs(1));
        store.fail_subscriptions(Some(StoreError::Closed));
        let recorder = Recorder::default();
        let _handle = spawn(&store, &p, &recorder);

        sleep_ms(2_000).await;
        assert_eq!(recorder.updates(), vec![Update::Value(json!(1))]);
        assert_eq!(recorder.errors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_error_is_surfaced_once_and_not_retried() {
        let store = MemoryStore::from_value(json!({"x": 1}));
        let p = path("x");
        let recorder = Recorder::default();
        let handle = spawn(&store, &p, &recorder);

        sleep_ms(10).await;
        store.fail_subscribers(&p, StoreError::PermissionDenied("revoked".into()));
        sleep_ms(60_000).await;

        let errors = recorder.errors();
        assert_eq!(errors.len(), 1);
        assert!(!errors[0].is_retryable());
        assert_eq!(handle.state(), BindingState::SubscriptionFailed);
        assert_eq!(store.active_subscriptions(&p), 0);
        assert_eq!(store.unsubscribe_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn double_release_and_drop_unsubscribe_exactly_once() {
        let store = MemoryStore::from_value(json!({"x": 1}));
        let p = path("x");
        let recorder = Recorder::default();
        let handle = spawn(&store, &p, &recorder);

        sleep_ms(10).await;
        assert_eq!(store.active_subscriptions(&p), 1);
        handle.release();
        handle.release();
        drop(handle);
        sleep_ms(10).await;

        assert_eq!(store.active_subscriptions(&p), 0);
        assert_eq!(store.unsubscribe_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn independent_bindings_on_same_path_each_subscribe() {
        let store = MemoryStore::from_value(json!({"x": 1}));
        let p = path("x");
        let first = spawn(&store, &p, &Recorder::default());
        let second = spawn(&store, &p, &Recorder::default());

        sleep_ms(10).await;
        assert_eq!(store.active_subscriptions(&p), 2);
        drop(first);
        sleep_ms(10).await;
        assert_eq!(store.active_subscriptions(&p), 1);
        assert_eq!(second.state(), BindingState::Subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn binding_without_callbacks_keeps_only_latest() {
        let store = MemoryStore::from_value(json!({"x": 1}));
        let p = path("x");
        let handle = LiveBinding::spawn(
            Arc::new(store.clone()),
            p.clone(),
            Identity,
            options(),
            Callbacks::new(),
        );

        sleep_ms(10).await;
        store.set(&p, json!(2));
        store.set(&p, json!(3));
        sleep_ms(10).await;
        assert_eq!(handle.latest(), Some(Update::Value(json!(3))));
    }

    #[tokio::test(start_paused = true)]
    async fn read_timeout_counts_as_transient() {
        let store = MemoryStore::from_value(json!({"x": 1}));
        let p = path("x");
        store.set_read_latency(&p, Duration::from_secs(60));
        store.fail_subscriptions(Some(StoreError::Closed));
        let recorder = Recorder::default();
        let opts = BindingOptions {
            retry: RetryPolicy::new(2, Duration::from_millis(10)),
            read_timeout: Duration::from_millis(200),
            ..BindingOptions::default()
        };
        let _handle = LiveBinding::spawn(
            Arc::new(store.clone()),
            p.clone(),
            Identity,
            opts,
            recorder.callbacks(),
        );

        sleep_ms(1_000).await;
        assert_eq!(store.read_count(&p), 2);
        let errors = recorder.errors();
        assert!(errors.iter().any(|e| matches!(
            e,
            SyncError::Read { source: StoreError::Timeout(_), retryable: true, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_limiter_bounds_concurrent_reads() {
        let store = MemoryStore::from_value(json!({"a": 1, "b": 2}));
        store.set_read_latency(&path("a"), Duration::from_millis(500));
        store.set_read_latency(&path("b"), Duration::from_millis(500));
        let limiter = Arc::new(Semaphore::new(1));
        let spawn_limited = |p: &str| {
            LiveBinding::spawn(
                Arc::new(store.clone()),
                path(p),
                Identity,
                options().with_fetch_limiter(Arc::clone(&limiter)),
                Callbacks::new(),
            )
        };
        let _a = spawn_limited("a");
        let _b = spawn_limited("b");

        sleep_ms(250).await;
        assert_eq!(store.read_count(&path("a")) + store.read_count(&path("b")), 1);
        sleep_ms(500).await;
        assert_eq!(store.read_count(&path("a")) + store.read_count(&path("b")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_may_release_its_own_binding() {
        let store = MemoryStore::from_value(json!({"x": 1}));
        let p = path("x");
        let slot: Arc<OnceLock<Arc<BindingHandle<Value>>>> = Arc::new(OnceLock::new());
        let calls = Arc::new(Mutex::new(0));

        let inner_slot = Arc::clone(&slot);
        let inner_calls = Arc::clone(&calls);
        let callbacks = Callbacks::new().on_update(move |_| {
            *inner_calls.lock().expect("calls") += 1;
            if let Some(handle) = inner_slot.get() {
                handle.release();
            }
        });
        store.set_read_latency(&p, Duration::from_millis(50));
        let handle = Arc::new(LiveBinding::spawn(
            Arc::new(store.clone()),
            p.clone(),
            Identity,
            options(),
            callbacks,
        ));
        let _ = slot.set(Arc::clone(&handle));

        sleep_ms(100).await;
        store.set(&p, json!(2));
        sleep_ms(10).await;

        assert_eq!(*calls.lock().expect("calls"), 1);
        assert!(handle.is_released());
        assert_eq!(store.active_subscriptions(&p), 0);
    }
}
