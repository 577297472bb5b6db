//! Online/offline classification from last-activity timestamps.
//!
//! A device can report "last seen" through several channels of differing
//! age. Callers pass them as an ordered precedence list; the first present
//! source is the only one consulted, even when a lower-precedence source is
//! newer.
//!
//! Classification is cheap and pure so it can be re-run on every display
//! tick: a device goes offline purely by time passing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum age (ms) of a last-seen timestamp still classified as online.
pub const LIVENESS_WINDOW_MILLIS: i64 = 300_000; // 5 minutes

/// Timestamps further in the future than this are flagged as clock skew.
pub const CLOCK_SKEW_TOLERANCE_MILLIS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Online,
    Offline,
    Unknown,
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Presence::Online => write!(f, "online"),
            Presence::Offline => write!(f, "offline"),
            Presence::Unknown => write!(f, "unknown"),
        }
    }
}

/// Derived verdict; never stored apart from the timestamp it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PresenceVerdict {
    pub presence: Presence,
    pub last_seen_millis: Option<i64>,
    pub window_millis: i64,
    /// Index into the precedence list of the source that decided.
    pub source_index: Option<usize>,
    /// Timestamp was ahead of `now` by more than the skew tolerance.
    pub clock_skewed: bool,
}

impl PresenceVerdict {
    pub fn is_online(&self) -> bool {
        self.presence == Presence::Online
    }
}

/// Named accessor for one presence source of a record type.
pub struct PresenceSource<T> {
    pub name: &'static str,
    pub read: fn(&T) -> Option<i64>,
}

impl<T> Clone for PresenceSource<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PresenceSource<T> {}

impl<T> fmt::Debug for PresenceSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceSource")
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceClassifier {
    #[serde(rename = "liveness_window_ms")]
    pub window_millis: i64,
    #[serde(rename = "clock_skew_tolerance_ms")]
    pub skew_tolerance_millis: i64,
}

impl Default for PresenceClassifier {
    fn default() -> Self {
        Self {
            window_millis: LIVENESS_WINDOW_MILLIS,
            skew_tolerance_millis: CLOCK_SKEW_TOLERANCE_MILLIS,
        }
    }
}

impl PresenceClassifier {
    pub fn with_window(window_millis: i64) -> Self {
        Self {
            window_millis,
            ..Self::default()
        }
    }

    /// `sources` is ordered by precedence; `None` entries are skipped.
    pub fn classify(&self, sources: &[Option<i64>], now_millis: i64) -> PresenceVerdict {
        let found = sources
            .iter()
            .enumerate()
            .find_map(|(index, source)| source.map(|ts| (index, ts)));

        let Some((index, last_seen)) = found else {
            return PresenceVerdict {
                presence: Presence::Unknown,
                last_seen_millis: None,
                window_millis: self.window_millis,
                source_index: None,
                clock_skewed: false,
            };
        };

        let elapsed = now_millis.saturating_sub(last_seen);
        let clock_skewed = elapsed < 0 && elapsed.saturating_neg() > self.skew_tolerance_millis;
        // Future timestamps get the benefit of the doubt.
        let presence = if elapsed < self.window_millis {
            Presence::Online
        } else {
            Presence::Offline
        };

        PresenceVerdict {
            presence,
            last_seen_millis: Some(last_seen),
            window_millis: self.window_millis,
            source_index: Some(index),
            clock_skewed,
        }
    }

    /// Reads `record` through `sources` in order and classifies the result.
    pub fn classify_record<T>(
        &self,
        record: &T,
        sources: &[PresenceSource<T>],
        now_millis: i64,
    ) -> PresenceVerdict {
        let values: Vec<Option<i64>> = sources.iter().map(|source| (source.read)(record)).collect();
        self.classify(&values, now_millis)
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Classifies with the default skew tolerance.
pub fn classify(sources: &[Option<i64>], now_millis: i64, window_millis: i64) -> PresenceVerdict {
    PresenceClassifier::with_window(window_millis).classify(sources, now_millis)
}
