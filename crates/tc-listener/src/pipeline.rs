//! The per-event decision chain run by the dispatcher worker.
//!
//! ```text
//! ChangeEvent ──► classify ──► NoiseFilter ──► DebouncedTrigger
//!                    │              │
//!                 Unrelated     Suppressed
//! ```

use std::sync::Arc;

use tc_core::{Category, ChangeEvent, DiscoveryConfig};

use crate::classify::{TopologyRoots, classify};
use crate::filter::{HeartbeatFilter, KeepAllFilter, NoiseFilter};
use crate::stats::DispatchStats;
use crate::trigger::{DebouncedTrigger, TriggerOutcome};

/// Result of running one event through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The path is outside every root.
    Unrelated,
    /// The event was filtered as noise.
    Suppressed(Category),
    /// The trigger was fired.
    Triggered(Category, TriggerOutcome),
}

/// Classify → filter → trigger.
pub struct ChangePipeline {
    roots: TopologyRoots,
    filter: Box<dyn NoiseFilter>,
    trigger: DebouncedTrigger,
    stats: Arc<DispatchStats>,
}

impl std::fmt::Debug for ChangePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangePipeline")
            .field("roots", &self.roots)
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

impl ChangePipeline {
    /// Creates a pipeline from its parts.
    ///
    /// `stats` is replaced by the dispatcher's own counters when the
    /// pipeline is handed to [`Dispatcher::start`](crate::Dispatcher::start).
    #[must_use]
    pub fn new<F: NoiseFilter>(roots: TopologyRoots, filter: F, trigger: DebouncedTrigger) -> Self {
        Self {
            roots,
            filter: Box::new(filter),
            trigger,
            stats: Arc::new(DispatchStats::new()),
        }
    }

    /// Builds the pipeline described by the discovery configuration.
    #[must_use]
    pub fn from_config(config: &DiscoveryConfig, trigger: DebouncedTrigger) -> Self {
        let roots = TopologyRoots::from_config(config);
        if config.ignore_heartbeats {
            Self::new(roots, HeartbeatFilter::new(config.heartbeat_property.as_str()), trigger)
        } else {
            Self::new(roots, KeepAllFilter, trigger)
        }
    }

    pub(crate) fn with_stats(mut self, stats: Arc<DispatchStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Runs one event through the chain.
    pub fn process(&self, event: &ChangeEvent) -> ProcessOutcome {
        let category = classify(&event.path, &self.roots);
        let outcome = match category {
            Category::Unrelated => {
                tracing::trace!(path = %event.path, "Ignoring unrelated change");
                self.stats.record_unrelated();
                ProcessOutcome::Unrelated
            }
            _ if self.filter.is_noise(event, category) => {
                tracing::trace!(path = %event.path, %category, "Ignoring heartbeat-only change");
                self.stats.record_suppressed();
                ProcessOutcome::Suppressed(category)
            }
            _ => {
                tracing::debug!(
                    path = %event.path,
                    kind = %event.kind,
                    %category,
                    "Relevant change, checking for topology change"
                );
                let fired = self.trigger.fire();
                match fired {
                    TriggerOutcome::Detached => self.stats.record_detached(),
                    TriggerOutcome::Fired => self.stats.record_triggered(),
                    TriggerOutcome::Failed | TriggerOutcome::Panicked => {
                        self.stats.record_triggered();
                        self.stats.record_trigger_failure();
                    }
                }
                ProcessOutcome::Triggered(category, fired)
            }
        };
        self.stats.record_processed();
        outcome
    }
}
