//! Listener registration and lifecycle.
//!
//! [`TopologyChangeListener`] ties the pieces together: on activation it
//! creates a [`Dispatcher`], registers the dispatcher's producer handle with
//! an [`ObservationService`] for the discovery subtree, and starts the
//! worker. Deactivation reverses the order so no new changes arrive while the
//! worker shuts down.
//!
//! Activation and deactivation are serialized by a lifecycle lock that is
//! held until the worker has been joined, so at most one worker exists per
//! listener. A trigger that deactivates its own listener runs on the worker
//! and cannot wait for itself; its dispatcher is parked and joined by the
//! next lifecycle call from another thread.

use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tc_core::Config;

use crate::dispatcher::Dispatcher;
use crate::error::ListenerError;
use crate::observation::{ChangeListener, ObservationService, RegistrationId};
use crate::pipeline::ChangePipeline;
use crate::stats::DispatchSnapshot;
use crate::trigger::{DebouncedTrigger, TopologyTrigger};

struct Active {
    registration: RegistrationId,
    dispatcher: Dispatcher,
}

/// Watches the discovery subtree and re-evaluates the topology on relevant
/// changes.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tc_core::{ChangeEvent, Config};
/// use tc_listener::{ObservationHub, RecordingTrigger, TopologyChangeListener};
///
/// # fn main() -> Result<(), tc_listener::ListenerError> {
/// let hub = Arc::new(ObservationHub::new());
/// let (trigger, weak) = RecordingTrigger::shared();
///
/// let listener = TopologyChangeListener::new(Config::default(), hub.clone(), weak);
/// listener.activate()?;
/// hub.publish_one(ChangeEvent::changed("/var/discovery/impl/establishedView/foo"));
///
/// while !listener.stats().is_idle() {
///     std::thread::yield_now();
/// }
/// listener.deactivate();
/// assert_eq!(trigger.count(), 1);
/// # Ok(())
/// # }
/// ```
pub struct TopologyChangeListener {
    config: Config,
    observation: Arc<dyn ObservationService>,
    trigger: Weak<dyn TopologyTrigger>,
    /// Held for the whole of `activate` and `deactivate`.
    lifecycle: Mutex<()>,
    active: Mutex<Option<Active>>,
    /// Worker of the most recent dispatcher.
    worker: Mutex<Option<ThreadId>>,
    /// Stopped from its own worker, not yet joined.
    retired: Mutex<Option<Dispatcher>>,
    last_stats: Mutex<DispatchSnapshot>,
}

impl std::fmt::Debug for TopologyChangeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyChangeListener")
            .field("listener_path", &self.listener_path())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl TopologyChangeListener {
    /// Creates an inactive listener.
    ///
    /// The listener never owns the re-evaluation entry point; once `trigger`
    /// is dropped, relevant changes are logged and skipped.
    #[must_use]
    pub fn new(
        config: Config,
        observation: Arc<dyn ObservationService>,
        trigger: Weak<dyn TopologyTrigger>,
    ) -> Self {
        Self {
            config,
            observation,
            trigger,
            lifecycle: Mutex::new(()),
            active: Mutex::new(None),
            worker: Mutex::new(None),
            retired: Mutex::new(None),
            last_stats: Mutex::new(DispatchSnapshot::default()),
        }
    }

    /// Returns the subtree the listener registers for.
    #[must_use]
    pub fn listener_path(&self) -> String {
        self.config.discovery.listener_path()
    }

    /// Returns `true` between a successful [`activate`](Self::activate) and
    /// the next [`deactivate`](Self::deactivate).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Returns the counters of the current dispatcher, or of the last one if
    /// the listener is inactive.
    #[must_use]
    pub fn stats(&self) -> DispatchSnapshot {
        match self.active.lock().as_ref() {
            Some(active) => active.dispatcher.stats(),
            None => *self.last_stats.lock(),
        }
    }

    /// Registers with the observation service and starts the worker.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::AlreadyActive`] if the listener is active,
    /// the observation service's error if registration fails, and
    /// [`ListenerError::WorkerSpawn`] if the worker cannot be started. On
    /// error nothing stays registered or running, and a later call may
    /// succeed.
    pub fn activate(&self) -> Result<(), ListenerError> {
        let _lifecycle = self.lifecycle.lock();
        if self.active.lock().is_some() {
            return Err(ListenerError::AlreadyActive);
        }
        self.join_retired();

        let discovery = &self.config.discovery;
        let path = discovery.listener_path();
        let mut dispatcher =
            Dispatcher::new(&self.config.dispatch, discovery.instance_id.as_str());
        let handle: Arc<dyn ChangeListener> = Arc::new(dispatcher.handle());

        let registration = match self.observation.register(&path, handle) {
            Ok(id) => id,
            Err(error) => {
                tracing::warn!(
                    path = %path,
                    error = %error,
                    "Failed to register topology change listener"
                );
                return Err(error);
            }
        };

        let trigger = DebouncedTrigger::new(Weak::clone(&self.trigger));
        let pipeline = ChangePipeline::from_config(discovery, trigger);
        if let Err(error) = dispatcher.start(pipeline) {
            self.unregister(registration);
            return Err(error);
        }

        tracing::info!(
            path = %path,
            instance = %discovery.instance_id,
            %registration,
            ignore_heartbeats = discovery.ignore_heartbeats,
            "Topology change listener activated"
        );
        *self.worker.lock() = dispatcher.worker_thread();
        *self.active.lock() = Some(Active {
            registration,
            dispatcher,
        });
        Ok(())
    }

    /// Unregisters from the observation service and stops the worker.
    ///
    /// Blocks for at most the change currently being processed; queued
    /// changes are discarded. Once this returns the trigger is not invoked
    /// again and no worker of this listener is running. Concurrent calls
    /// all wait for the same shutdown. Safe to call repeatedly and from
    /// within the trigger itself, in which case it does not wait.
    pub fn deactivate(&self) {
        if self.on_worker_thread() {
            self.deactivate_from_worker();
            return;
        }

        let _lifecycle = self.lifecycle.lock();
        let taken = self.active.lock().take();
        if let Some(mut active) = taken {
            self.unregister(active.registration);
            active.dispatcher.stop();
            self.finish(&active.dispatcher);
        }
        self.join_retired();
    }

    /// The lifecycle lock may be held by a thread joining this very worker,
    /// so only the short-lived slots are touched here.
    fn deactivate_from_worker(&self) {
        let taken = self.active.lock().take();
        let Some(mut active) = taken else {
            return;
        };
        self.unregister(active.registration);
        active.dispatcher.stop();
        *self.last_stats.lock() = active.dispatcher.stats();
        tracing::debug!(
            path = %self.listener_path(),
            "Topology change listener deactivated from its own worker"
        );
        *self.retired.lock() = Some(active.dispatcher);
    }

    fn join_retired(&self) {
        let retired = self.retired.lock().take();
        if let Some(mut dispatcher) = retired {
            dispatcher.stop();
            self.finish(&dispatcher);
        }
    }

    fn finish(&self, dispatcher: &Dispatcher) {
        let stats = dispatcher.stats();
        *self.last_stats.lock() = stats;
        tracing::info!(
            path = %self.listener_path(),
            processed = stats.processed,
            triggered = stats.triggered,
            discarded = stats.discarded,
            "Topology change listener deactivated"
        );
    }

    fn on_worker_thread(&self) -> bool {
        *self.worker.lock() == Some(thread::current().id())
    }

    fn unregister(&self, registration: RegistrationId) {
        if let Err(error) = self.observation.unregister(registration) {
            tracing::warn!(
                %registration,
                error = %error,
                "Failed to unregister topology change listener, continuing"
            );
        }
    }
}

impl Drop for TopologyChangeListener {
    fn drop(&mut self) {
        self.deactivate();
    }
}
