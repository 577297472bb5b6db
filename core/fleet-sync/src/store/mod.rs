//! The hierarchical key-value store as seen by bindings.
//!
//! A store offers two primitives: a one-shot read of the value at a path,
//! and a subscription that pushes the value at a path whenever it (or
//! anything beneath it) changes. Subscriptions are RAII: dropping a
//! [`Subscription`] unsubscribes exactly once.

mod memory;

pub use memory::MemoryStore;

use crate::error::StoreError;
use async_trait::async_trait;
use fleet_protocol::{RawRecord, StorePath};
use std::fmt;
use tokio::sync::mpsc;

/// One push from a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// Current value at the subscribed path; `None` when absent.
    Value(Option<RawRecord>),
    /// The subscription failed. No further values follow.
    Error(StoreError),
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// One-shot read. `Ok(None)` means the path holds no value.
    async fn read(&self, path: &StorePath) -> Result<Option<RawRecord>, StoreError>;

    /// Opens a live subscription. Implementations may deliver the current
    /// value as the first event.
    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError>;
}

pub type PushSender = mpsc::UnboundedSender<PushEvent>;

/// Handle to a live subscription. Dropping it unsubscribes.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<PushEvent>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        events: mpsc::UnboundedReceiver<PushEvent>,
        on_cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    /// A sender/subscription pair for store implementations.
    pub fn channel(on_cancel: impl FnOnce() + Send + 'static) -> (PushSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx, on_cancel))
    }

    /// Next push, or `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<PushEvent> {
        self.events.recv().await
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.on_cancel.is_some())
            .finish()
    }
}
