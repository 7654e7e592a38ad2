//! The re-evaluation trigger.
//!
//! The cluster-membership subsystem exposes a single entry point that checks
//! whether the topology changed. It is modelled as the [`TopologyTrigger`]
//! trait so it can be swapped per test or per deployment.
//!
//! [`DebouncedTrigger`] is what the dispatcher worker calls. It holds only a
//! weak reference to the entry point and contains every failure: an `Err`,
//! a panic, or an entry point that has gone away all end up as a
//! [`TriggerOutcome`] instead of unwinding into the worker loop. It does not
//! deduplicate calls; the entry point short-circuits cheaply when nothing
//! changed.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Errors raised by a re-evaluation entry point.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// Re-evaluation ran and failed.
    #[error("topology re-evaluation failed: {reason}")]
    Failed {
        /// Why re-evaluation failed.
        reason: String,
    },

    /// The entry point cannot run right now.
    #[error("topology re-evaluation unavailable")]
    Unavailable,
}

impl TriggerError {
    /// Creates a new [`TriggerError::Failed`] error.
    #[inline]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// The external "check for topology change" entry point.
///
/// Implementations may be slow; they are only ever called from the
/// dispatcher worker, never from an observation callback.
pub trait TopologyTrigger: Send + Sync {
    /// Re-evaluates the topology.
    ///
    /// # Errors
    ///
    /// Any error is logged by the caller and otherwise ignored.
    fn check_for_topology_change(&self) -> Result<(), TriggerError>;
}

/// What happened when the trigger fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The entry point ran successfully.
    Fired,
    /// The entry point returned an error.
    Failed,
    /// The entry point panicked.
    Panicked,
    /// The entry point has been dropped.
    Detached,
}

impl TriggerOutcome {
    /// Returns `true` if the entry point was invoked but did not succeed.
    #[inline]
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Panicked)
    }
}

/// Calls a [`TopologyTrigger`] without owning it and without letting its
/// failures escape.
#[derive(Clone)]
pub struct DebouncedTrigger {
    target: Weak<dyn TopologyTrigger>,
}

impl std::fmt::Debug for DebouncedTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebouncedTrigger")
            .field("attached", &(self.target.strong_count() > 0))
            .finish()
    }
}

impl DebouncedTrigger {
    /// Creates a trigger for the given entry point.
    #[must_use]
    pub fn new(target: Weak<dyn TopologyTrigger>) -> Self {
        Self { target }
    }

    /// Invokes the entry point once.
    pub fn fire(&self) -> TriggerOutcome {
        let Some(target) = self.target.upgrade() else {
            tracing::debug!("Re-evaluation entry point dropped, skipping trigger");
            return TriggerOutcome::Detached;
        };

        match catch_unwind(AssertUnwindSafe(|| target.check_for_topology_change())) {
            Ok(Ok(())) => TriggerOutcome::Fired,
            Ok(Err(error)) => {
                tracing::warn!(error = %error, "Topology re-evaluation failed, continuing");
                TriggerOutcome::Failed
            }
            Err(payload) => {
                tracing::error!(
                    panic = panic_message(payload.as_ref()),
                    "Topology re-evaluation panicked, continuing"
                );
                TriggerOutcome::Panicked
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// A [`TopologyTrigger`] that counts and logs every call.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tc_listener::{RecordingTrigger, TopologyTrigger};
///
/// let trigger = Arc::new(RecordingTrigger::new());
/// trigger.check_for_topology_change().unwrap();
/// assert_eq!(trigger.count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct RecordingTrigger {
    calls: AtomicU64,
}

impl RecordingTrigger {
    /// Creates a trigger with a zero count.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many times the topology check was requested.
    #[inline]
    #[must_use]
    pub fn count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Wraps `self` in an [`Arc`] and returns it with a weak handle suitable
    /// for a listener.
    #[must_use]
    pub fn shared() -> (Arc<Self>, Weak<dyn TopologyTrigger>) {
        let trigger = Arc::new(Self::new());
        let as_dyn: Arc<dyn TopologyTrigger> = Arc::<Self>::clone(&trigger);
        let weak = Arc::downgrade(&as_dyn);
        (trigger, weak)
    }
}

impl TopologyTrigger for RecordingTrigger {
    fn check_for_topology_change(&self) -> Result<(), TriggerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(call, "Topology may have changed");
        Ok(())
    }
}
