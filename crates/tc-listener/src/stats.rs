//! Dispatch statistics with atomic counters.
//!
//! [`DispatchStats`] is shared between producers (enqueue side) and the
//! worker. All counters use relaxed ordering; they are informational and
//! never drive control flow inside the dispatcher.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic counters for one dispatcher.
#[derive(Debug, Default)]
pub struct DispatchStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    unrelated: AtomicU64,
    suppressed: AtomicU64,
    triggered: AtomicU64,
    trigger_failures: AtomicU64,
    detached: AtomicU64,
    discarded: AtomicU64,
}

macro_rules! counter {
    ($(#[$doc:meta] $name:ident => $field:ident),* $(,)?) => {
        $(
            #[$doc]
            #[inline]
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl DispatchStats {
    /// Creates a new [`DispatchStats`] with all counters at zero.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        /// An event entered the queue.
        record_accepted => accepted,
        /// An event was refused because the queue is closed.
        record_rejected => rejected,
        /// A queued event was dropped on overflow.
        record_dropped => dropped,
        /// The worker finished processing an event.
        record_processed => processed,
        /// The event's path was outside every root.
        record_unrelated => unrelated,
        /// The event was filtered as noise.
        record_suppressed => suppressed,
        /// The trigger was invoked.
        record_triggered => triggered,
        /// The trigger was invoked and failed.
        record_trigger_failure => trigger_failures,
        /// A relevant event found the entry point already gone.
        record_detached => detached,
    }

    /// Adds `count` events left in the queue at shutdown.
    #[inline]
    pub fn record_discarded(&self, count: u64) {
        self.discarded.fetch_add(count, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            unrelated: self.unrelated.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            triggered: self.triggered.load(Ordering::Relaxed),
            trigger_failures: self.trigger_failures.load(Ordering::Relaxed),
            detached: self.detached.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`DispatchStats`].
///
/// # Examples
///
/// ```
/// use tc_listener::DispatchStats;
///
/// let stats = DispatchStats::new();
/// stats.record_accepted();
/// stats.record_accepted();
/// stats.record_processed();
///
/// let snap = stats.snapshot();
/// assert_eq!(snap.pending(), 1);
/// assert!(!snap.is_idle());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DispatchSnapshot {
    /// Events that entered the queue.
    pub accepted: u64,
    /// Events refused after stop.
    pub rejected: u64,
    /// Events dropped on overflow.
    pub dropped: u64,
    /// Events the worker finished.
    pub processed: u64,
    /// Processed events outside every root.
    pub unrelated: u64,
    /// Processed events filtered as noise.
    pub suppressed: u64,
    /// Processed events that invoked the trigger.
    pub triggered: u64,
    /// Trigger invocations that failed.
    pub trigger_failures: u64,
    /// Relevant events skipped because the entry point was gone.
    #[serde(default)]
    pub detached: u64,
    /// Events left in the queue at shutdown.
    pub discarded: u64,
}

impl DispatchSnapshot {
    /// Events accepted but not yet processed, dropped, or discarded.
    #[must_use]
    pub const fn pending(&self) -> u64 {
        self.accepted
            .saturating_sub(self.processed + self.dropped + self.discarded)
    }

    /// Returns `true` if every accepted event has been accounted for.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}
