//! Instruction-card carousel as an explicit state machine.
//!
//! ```text
//! Expanded ─▶ Collapsing ─▶ Collapsed ─▶ Flipping ─▶ Expanding ─▶ Expanded
//! ```
//!
//! Each phase lasts a configured dwell. A per-card suppress flag is checked
//! only when leaving `Expanded`; a suppressed card stays expanded and is
//! re-checked after another dwell. The driver is a state value plus one
//! cancellable timer task.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::trace;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CarouselPhase {
    Expanded,
    Collapsing,
    Collapsed,
    Flipping,
    Expanding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarouselTimings {
    pub expanded_ms: u64,
    pub collapsing_ms: u64,
    pub collapsed_ms: u64,
    pub flipping_ms: u64,
    pub expanding_ms: u64,
}

impl Default for CarouselTimings {
    fn default() -> Self {
        Self {
            expanded_ms: 8_000,
            collapsing_ms: 300,
            collapsed_ms: 1_500,
            flipping_ms: 600,
            expanding_ms: 300,
        }
    }
}

impl CarouselTimings {
    pub fn dwell(&self, phase: CarouselPhase) -> Duration {
        let ms = match phase {
            CarouselPhase::Expanded => self.expanded_ms,
            CarouselPhase::Collapsing => self.collapsing_ms,
            CarouselPhase::Collapsed => self.collapsed_ms,
            CarouselPhase::Flipping => self.flipping_ms,
            CarouselPhase::Expanding => self.expanding_ms,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CarouselState {
    pub phase: CarouselPhase,
    pub card: usize,
    pub card_count: usize,
}

impl CarouselState {
    pub fn new(card_count: usize) -> Self {
        Self {
            phase: CarouselPhase::Expanded,
            card: 0,
            card_count,
        }
    }

    /// The following state, or `None` when the carousel holds still.
    /// `suppressed` is only consulted on the `Expanded` exit.
    pub fn next(&self, suppressed: bool) -> Option<CarouselState> {
        let phase = match self.phase {
            CarouselPhase::Expanded => {
                if suppressed || self.card_count < 2 {
                    return None;
                }
                CarouselPhase::Collapsing
            }
            CarouselPhase::Collapsing => CarouselPhase::Collapsed,
            CarouselPhase::Collapsed => CarouselPhase::Flipping,
            CarouselPhase::Flipping => {
                return Some(CarouselState {
                    phase: CarouselPhase::Expanding,
                    card: (self.card + 1) % self.card_count.max(1),
                    card_count: self.card_count,
                })
            }
            CarouselPhase::Expanding => CarouselPhase::Expanded,
        };
        Some(CarouselState { phase, ..*self })
    }
}

/// Running carousel. Dropping it stops the timer chain.
pub struct Carousel {
    state: watch::Receiver<CarouselState>,
    suppressed: Arc<Mutex<Vec<bool>>>,
    task: Option<JoinHandle<()>>,
}

impl Carousel {
    /// Starts cycling `card_count` cards on the current tokio runtime.
    pub fn start(card_count: usize, timings: CarouselTimings) -> Self {
        let (publisher, state) = watch::channel(CarouselState::new(card_count));
        let suppressed = Arc::new(Mutex::new(vec![false; card_count]));
        let task = tokio::spawn(drive(publisher, Arc::clone(&suppressed), timings));
        Self {
            state,
            suppressed,
            task: Some(task),
        }
    }

    pub fn state(&self) -> CarouselState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CarouselState> {
        self.state.clone()
    }

    /// Holds `card` expanded while set. Out-of-range cards are ignored.
    pub fn set_suppressed(&self, card: usize, suppressed: bool) {
        if let Some(flag) = lock(&self.suppressed).get_mut(card) {
            *flag = suppressed;
        }
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for Carousel {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn drive(
    publisher: watch::Sender<CarouselState>,
    suppressed: Arc<Mutex<Vec<bool>>>,
    timings: CarouselTimings,
) {
    let mut state = *publisher.borrow();
    loop {
        tokio::time::sleep(timings.dwell(state.phase)).await;
        let held = lock(&suppressed).get(state.card).copied().unwrap_or(false);
        if let Some(next) = state.next(held) {
            trace!(from = ?state.phase, to = ?next.phase, card = next.card, "Carousel transition");
            state = next;
            publisher.send_replace(state);
        }
    }
}
