//! The decoupling dispatcher.
//!
//! Observation callbacks run on threads owned by the observation subsystem
//! and must return quickly. The dispatcher puts a queue between them and the
//! (possibly slow) re-evaluation entry point:
//!
//! ```text
//! ┌──────────────────────────────┐          ┌──────────────────────────────────┐
//! │ Observation callback threads │          │ Worker thread (tc-dispatch-*)    │
//! │  DispatchHandle::enqueue ────┼─ queue ─►│  select! { events, shutdown,     │
//! │  (try_send, never blocks)    │  (FIFO)  │           poll interval }        │
//! └──────────────────────────────┘          │  ChangePipeline::process         │
//!                                           └──────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! `Stopped → Running → Stopping → Stopped`. A dispatcher is created
//! `Stopped` with its queue already open, so producers registered before
//! [`Dispatcher::start`] lose nothing. [`Dispatcher::stop`] closes the queue,
//! wakes the worker, waits for at most the in-flight event and discards the
//! rest. A stopped dispatcher cannot be restarted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, select};
use tc_core::{ChangeBatch, ChangeEvent, DispatchConfig};

use crate::error::ListenerError;
use crate::observation::ChangeListener;
use crate::pipeline::ChangePipeline;
use crate::stats::{DispatchSnapshot, DispatchStats};

/// Lifecycle state of a [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatcherState {
    /// No worker is running.
    Stopped = 0,
    /// The worker is processing events.
    Running = 1,
    /// Stop was requested; the worker exits at its next check.
    Stopping = 2,
}

impl DispatcherState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// What happened to an enqueued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The event is queued.
    Accepted,
    /// The queue was full; the oldest event was dropped to make room.
    AcceptedDroppingOldest,
    /// The queue stayed full under competing producers; the event was dropped.
    Dropped,
    /// The dispatcher is stopped; the event was ignored.
    Rejected,
}

#[derive(Debug)]
struct Shared {
    name: String,
    state: AtomicU8,
    closed: AtomicBool,
    stats: Arc<DispatchStats>,
}

impl Shared {
    fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: DispatcherState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.state() == DispatcherState::Running
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// The producer side of a [`Dispatcher`].
///
/// Cheap to clone and safe to call from any number of threads. Enqueueing
/// never blocks: it is a `try_send` plus counter bookkeeping.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    tx: Sender<ChangeEvent>,
    /// Present only for bounded queues, to evict the oldest entry.
    evict_rx: Option<Receiver<ChangeEvent>>,
    shared: Arc<Shared>,
}

impl DispatchHandle {
    /// Queues one event for the worker.
    pub fn enqueue(&self, event: ChangeEvent) -> EnqueueOutcome {
        let stats = &self.shared.stats;
        if self.shared.is_closed() {
            tracing::debug!(
                dispatcher = %self.shared.name,
                path = %event.path,
                "Dispatcher stopped, ignoring change"
            );
            stats.record_rejected();
            return EnqueueOutcome::Rejected;
        }

        let event = match self.tx.try_send(event) {
            Ok(()) => {
                stats.record_accepted();
                return EnqueueOutcome::Accepted;
            }
            Err(TrySendError::Disconnected(_)) => {
                stats.record_rejected();
                return EnqueueOutcome::Rejected;
            }
            Err(TrySendError::Full(event)) => event,
        };

        // Bounded queue overflow: drop the oldest queued event.
        if let Some(oldest) = self.evict_rx.as_ref().and_then(|rx| rx.try_recv().ok()) {
            stats.record_dropped();
            tracing::warn!(
                dispatcher = %self.shared.name,
                dropped = %oldest.path,
                "Dispatch queue full, dropped oldest change"
            );
        }

        stats.record_accepted();
        match self.tx.try_send(event) {
            Ok(()) => EnqueueOutcome::AcceptedDroppingOldest,
            Err(TrySendError::Full(event) | TrySendError::Disconnected(event)) => {
                stats.record_dropped();
                tracing::warn!(
                    dispatcher = %self.shared.name,
                    dropped = %event.path,
                    "Dispatch queue still full, dropped change"
                );
                EnqueueOutcome::Dropped
            }
        }
    }

    /// Returns `true` once the dispatcher has been stopped.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Returns a snapshot of the dispatcher's counters.
    #[must_use]
    pub fn stats(&self) -> DispatchSnapshot {
        self.shared.stats.snapshot()
    }
}

impl ChangeListener for DispatchHandle {
    fn on_change(&self, changes: ChangeBatch) {
        if self.is_closed() {
            tracing::info!(
                dispatcher = %self.shared.name,
                changes = changes.len(),
                "Received late changes after stop, ignoring"
            );
            for _ in 0..changes.len() {
                self.shared.stats.record_rejected();
            }
            return;
        }
        for change in changes {
            self.enqueue(change);
        }
    }
}

/// A queue plus exactly one background worker.
///
/// # Examples
///
/// ```
/// use tc_core::{ChangeEvent, DiscoveryConfig, DispatchConfig};
/// use tc_listener::{ChangePipeline, DebouncedTrigger, Dispatcher, RecordingTrigger};
///
/// # fn main() -> Result<(), tc_listener::ListenerError> {
/// let (_trigger, weak) = RecordingTrigger::shared();
/// let trigger = DebouncedTrigger::new(weak);
/// let pipeline = ChangePipeline::from_config(&DiscoveryConfig::default(), trigger);
///
/// let mut dispatcher = Dispatcher::new(&DispatchConfig::default(), "doc");
/// dispatcher.start(pipeline)?;
/// dispatcher.handle().enqueue(ChangeEvent::changed("/var/discovery/impl/establishedView/v"));
/// dispatcher.stop();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Dispatcher {
    handle: DispatchHandle,
    /// Consumer end, moved into the worker on start.
    events_rx: Option<Receiver<ChangeEvent>>,
    /// Second consumer end used to discard the backlog on stop.
    discard_rx: Receiver<ChangeEvent>,
    /// Dropping this wakes the worker.
    shutdown_tx: Option<Sender<()>>,
    shutdown_rx: Option<Receiver<()>>,
    worker: Option<JoinHandle<()>>,
    poll_interval: Duration,
}

impl Dispatcher {
    /// Creates a stopped dispatcher with an open queue.
    ///
    /// `name` identifies the dispatcher in logs and in its thread name.
    #[must_use]
    pub fn new(config: &DispatchConfig, name: impl Into<String>) -> Self {
        let (tx, rx) = match config.queue_capacity {
            Some(capacity) => crossbeam_channel::bounded(capacity),
            None => crossbeam_channel::unbounded(),
        };
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);

        let shared = Arc::new(Shared {
            name: name.into(),
            state: AtomicU8::new(DispatcherState::Stopped as u8),
            closed: AtomicBool::new(false),
            stats: Arc::new(DispatchStats::new()),
        });

        let handle = DispatchHandle {
            tx,
            evict_rx: config.queue_capacity.map(|_| rx.clone()),
            shared,
        };

        Self {
            handle,
            discard_rx: rx.clone(),
            events_rx: Some(rx),
            shutdown_tx: Some(shutdown_tx),
            shutdown_rx: Some(shutdown_rx),
            worker: None,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }

    /// Returns a producer handle.
    #[must_use]
    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DispatcherState {
        self.handle.shared.state()
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> DispatchSnapshot {
        self.handle.stats()
    }

    /// Returns the id of the worker thread, if one was started and has not
    /// been joined.
    #[must_use]
    pub fn worker_thread(&self) -> Option<ThreadId> {
        self.worker.as_ref().map(|worker| worker.thread().id())
    }

    /// Returns `true` if the caller is running on this dispatcher's worker.
    #[must_use]
    pub fn is_worker_thread(&self) -> bool {
        self.worker_thread() == Some(thread::current().id())
    }

    /// Spawns the worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::AlreadyStarted`] if the worker was started
    /// before (or the dispatcher was stopped), and
    /// [`ListenerError::WorkerSpawn`] if the thread cannot be created.
    pub fn start(&mut self, pipeline: ChangePipeline) -> Result<(), ListenerError> {
        if self.handle.is_closed() {
            return Err(ListenerError::AlreadyStarted);
        }
        let (Some(events_rx), Some(shutdown_rx)) = (self.events_rx.take(), self.shutdown_rx.take())
        else {
            return Err(ListenerError::AlreadyStarted);
        };

        let shared = Arc::clone(&self.handle.shared);
        let pipeline = pipeline.with_stats(Arc::clone(&shared.stats));
        let poll_interval = self.poll_interval;

        shared.set_state(DispatcherState::Running);
        let spawned = thread::Builder::new()
            .name(format!("tc-dispatch-{}", shared.name))
            .spawn({
                let shared = Arc::clone(&shared);
                move || run_worker(&shared, &events_rx, &shutdown_rx, &pipeline, poll_interval)
            });

        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(error) => {
                shared.set_state(DispatcherState::Stopped);
                Err(ListenerError::WorkerSpawn(error))
            }
        }
    }

    /// Stops the worker and discards queued events.
    ///
    /// Blocks for at most the event currently being processed. After this
    /// returns the pipeline is never invoked again. When called from the
    /// worker thread itself (for example from a trigger) it does not wait;
    /// the state stays [`DispatcherState::Stopping`] until the worker
    /// returns from the current event.
    pub fn stop(&mut self) {
        let shared = Arc::clone(&self.handle.shared);

        // Stopping must be visible before the queue reports closed.
        let _ = shared.state.compare_exchange(
            DispatcherState::Running as u8,
            DispatcherState::Stopping as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let was_open = !shared.closed.swap(true, Ordering::SeqCst);
        self.shutdown_tx.take();

        let on_worker = self.is_worker_thread();
        if on_worker {
            // The worker marks itself stopped once it returns.
            tracing::debug!(dispatcher = %shared.name, "Stop requested from worker thread");
        } else if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(dispatcher = %shared.name, "Dispatcher worker panicked");
            }
        }

        let mut discarded = 0_u64;
        while self.discard_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            shared.stats.record_discarded(discarded);
        }
        if !on_worker {
            shared.set_state(DispatcherState::Stopped);
        }

        if was_open {
            tracing::info!(dispatcher = %shared.name, discarded, "Dispatcher stopped");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker loop: wait for an event, the shutdown signal, or the poll
/// interval, whichever comes first, and re-check the running flag.
fn run_worker(
    shared: &Shared,
    events: &Receiver<ChangeEvent>,
    shutdown: &Receiver<()>,
    pipeline: &ChangePipeline,
    poll_interval: Duration,
) {
    tracing::info!(dispatcher = %shared.name, "Dispatcher worker started");

    while shared.is_running() {
        select! {
            recv(events) -> message => match message {
                Ok(event) => {
                    if !shared.is_running() {
                        shared.stats.record_discarded(1);
                        break;
                    }
                    pipeline.process(&event);
                }
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
            default(poll_interval) => {}
        }
    }

    shared.set_state(DispatcherState::Stopped);
    tracing::info!(dispatcher = %shared.name, "Dispatcher worker exiting");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::{Barrier, Weak};
    use std::time::Instant;

    use parking_lot::Mutex;
    use tc_core::{Category, DiscoveryConfig};

    use super::*;
    use crate::classify::TopologyRoots;
    use crate::filter::NoiseFilter;
    use crate::trigger::{
        DebouncedTrigger, RecordingTrigger, TopologyTrigger, TriggerError,
    };

    const VIEW: &str = "/var/discovery/impl/establishedView/";

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    /// Records every path that reaches the filter, in order.
    #[derive(Clone, Default)]
    struct OrderFilter(Arc<Mutex<Vec<String>>>);

    impl NoiseFilter for OrderFilter {
        fn is_noise(&self, event: &ChangeEvent, _category: Category) -> bool {
            self.0.lock().push(event.path.clone());
            false
        }
    }

    /// Blocks every call until released.
    struct GateTrigger {
        calls: AtomicU64,
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl TopologyTrigger for GateTrigger {
        fn check_for_topology_change(&self) -> Result<(), TriggerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.entered.send(());
            let _ = self.release.recv_timeout(Duration::from_secs(10));
            Ok(())
        }
    }

    struct FailingTrigger(AtomicU64);

    impl TopologyTrigger for FailingTrigger {
        fn check_for_topology_change(&self) -> Result<(), TriggerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(TriggerError::failed("view store offline"))
        }
    }

    fn pipeline_for(target: &Arc<dyn TopologyTrigger>) -> ChangePipeline {
        let weak: Weak<dyn TopologyTrigger> = Arc::downgrade(target);
        ChangePipeline::from_config(&DiscoveryConfig::default(), DebouncedTrigger::new(weak))
    }

    fn view_event(i: usize) -> ChangeEvent {
        ChangeEvent::changed(format!("{VIEW}{i}"))
    }

    #[test]
    fn test_new_dispatcher_is_stopped() {
        let dispatcher = Dispatcher::new(&DispatchConfig::default(), "t");
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        assert!(!dispatcher.handle().is_closed());
    }

    #[test]
    fn test_processes_events_in_fifo_order() {
        let (_trigger, weak) = RecordingTrigger::shared();
        let order = OrderFilter::default();
        let pipeline = ChangePipeline::new(
            TopologyRoots::from_config(&DiscoveryConfig::default()),
            order.clone(),
            DebouncedTrigger::new(weak),
        );

        let mut dispatcher = Dispatcher::new(&DispatchConfig::default(), "fifo");
        dispatcher.start(pipeline).unwrap();
        let handle = dispatcher.handle();
        for i in 0..200 {
            assert_eq!(handle.enqueue(view_event(i)), EnqueueOutcome::Accepted);
        }

        assert!(wait_until(Duration::from_secs(5), || dispatcher.stats().processed == 200));
        dispatcher.stop();

        let expected: Vec<String> = (0..200).map(|i| format!("{VIEW}{i}")).collect();
        assert_eq!(*order.0.lock(), expected);
    }

    #[test]
    fn test_events_queued_before_start_are_processed() {
        let (trigger, weak) = RecordingTrigger::shared();
        let pipeline =
            ChangePipeline::from_config(&DiscoveryConfig::default(), DebouncedTrigger::new(weak));

        let mut dispatcher = Dispatcher::new(&DispatchConfig::default(), "early");
        dispatcher.handle().enqueue(view_event(1));
        dispatcher.start(pipeline).unwrap();

        assert!(wait_until(Duration::from_secs(5), || trigger.count() == 1));
        dispatcher.stop();
    }

    #[test]
    fn test_enqueue_does_not_block_on_stalled_trigger() {
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let target: Arc<dyn TopologyTrigger> = Arc::new(GateTrigger {
            calls: AtomicU64::new(0),
            entered: entered_tx,
            release: release_rx,
        });

        let mut dispatcher = Dispatcher::new(&DispatchConfig::default(), "stall");
        dispatcher.start(pipeline_for(&target)).unwrap();
        let handle = dispatcher.handle();

        handle.enqueue(view_event(0));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // The worker is now stuck inside the trigger.
        let started = Instant::now();
        for i in 1..=10_000 {
            assert_eq!(handle.enqueue(view_event(i)), EnqueueOutcome::Accepted);
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(dispatcher.stats().accepted, 10_001);

        drop(release_tx);
        dispatcher.stop();
    }

    #[test]
    fn test_stop_discards_backlog_and_never_triggers_again() {
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let gate = Arc::new(GateTrigger {
            calls: AtomicU64::new(0),
            entered: entered_tx,
            release: release_rx,
        });
        let target: Arc<dyn TopologyTrigger> = Arc::<GateTrigger>::clone(&gate);

        let mut dispatcher = Dispatcher::new(&DispatchConfig::default(), "backlog");
        dispatcher.start(pipeline_for(&target)).unwrap();
        let handle = dispatcher.handle();
        for i in 0..50 {
            handle.enqueue(view_event(i));
        }
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let stopper = thread::spawn(move || {
            dispatcher.stop();
            dispatcher
        });
        assert!(wait_until(Duration::from_secs(5), || handle.is_closed()));
        drop(release_tx);
        let dispatcher = stopper.join().unwrap();

        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);

        let snap = dispatcher.stats();
        assert_eq!(snap.processed, 1);
        assert_eq!(snap.discarded, 49);
        assert!(snap.is_idle());

        // Nothing runs after stop, even if more events arrive.
        assert_eq!(handle.enqueue(view_event(99)), EnqueueOutcome::Rejected);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_trigger_does_not_kill_worker() {
        let failing = Arc::new(FailingTrigger(AtomicU64::new(0)));
        let target: Arc<dyn TopologyTrigger> = Arc::<FailingTrigger>::clone(&failing);

        let mut dispatcher = Dispatcher::new(&DispatchConfig::default(), "failing");
        dispatcher.start(pipeline_for(&target)).unwrap();
        let handle = dispatcher.handle();
        for i in 0..3 {
            handle.enqueue(view_event(i));
        }

        assert!(wait_until(Duration::from_secs(5), || dispatcher.stats().processed == 3));
        assert_eq!(dispatcher.state(), DispatcherState::Running);
        assert_eq!(failing.0.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.stats().trigger_failures, 3);
        dispatcher.stop();
    }

    #[test]
    fn test_bounded_queue_drops_oldest() {
        let config = DispatchConfig {
            queue_capacity: Some(2),
            ..DispatchConfig::default()
        };
        let mut dispatcher = Dispatcher::new(&config, "bounded");
        let handle = dispatcher.handle();

        assert_eq!(handle.enqueue(view_event(1)), EnqueueOutcome::Accepted);
        assert_eq!(handle.enqueue(view_event(2)), EnqueueOutcome::Accepted);
        assert_eq!(
            handle.enqueue(view_event(3)),
            EnqueueOutcome::AcceptedDroppingOldest
        );
        assert_eq!(dispatcher.stats().dropped, 1);

        let (_trigger, weak) = RecordingTrigger::shared();
        let order = OrderFilter::default();
        let pipeline = ChangePipeline::new(
            TopologyRoots::from_config(&DiscoveryConfig::default()),
            order.clone(),
            DebouncedTrigger::new(weak),
        );
        dispatcher.start(pipeline).unwrap();

        assert!(wait_until(Duration::from_secs(5), || dispatcher.stats().is_idle()));
        dispatcher.stop();
        assert_eq!(
            *order.0.lock(),
            vec![format!("{VIEW}2"), format!("{VIEW}3")]
        );
    }

    #[test]
    fn test_start_twice_fails() {
        let (_trigger, weak) = RecordingTrigger::shared();
        let config = DiscoveryConfig::default();
        let mut dispatcher = Dispatcher::new(&DispatchConfig::default(), "twice");
        dispatcher
            .start(ChangePipeline::from_config(&config, DebouncedTrigger::new(weak.clone())))
            .unwrap();
        let second =
            dispatcher.start(ChangePipeline::from_config(&config, DebouncedTrigger::new(weak)));
        assert!(matches!(second, Err(ListenerError::AlreadyStarted)));
        dispatcher.stop();
    }

    #[test]
    fn test_stopped_dispatcher_cannot_restart() {
        let (_trigger, weak) = RecordingTrigger::shared();
        let mut dispatcher = Dispatcher::new(&DispatchConfig::default(), "restart");
        dispatcher.stop();
        let result = dispatcher.start(ChangePipeline::from_config(
            &DiscoveryConfig::default(),
            DebouncedTrigger::new(weak),
        ));
        assert!(matches!(result, Err(ListenerError::AlreadyStarted)));
    }

    #[test]
    fn test_stop_is_idempotent_and_prompt() {
        let (_trigger, weak) = RecordingTrigger::shared();
        let config = DispatchConfig {
            poll_interval_ms: 10_000,
            ..DispatchConfig::default()
        };
        let mut dispatcher = Dispatcher::new(&config, "prompt");
        dispatcher
            .start(ChangePipeline::from_config(
                &DiscoveryConfig::default(),
                DebouncedTrigger::new(weak),
            ))
            .unwrap();

        // The shutdown channel wakes the worker long before the poll interval.
        let started = Instant::now();
        dispatcher.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        dispatcher.stop();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    }

    #[test]
    fn test_concurrent_producers_keep_their_order() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 500;

        let (_trigger, weak) = RecordingTrigger::shared();
        let order = OrderFilter::default();
        let pipeline = ChangePipeline::new(
            TopologyRoots::from_config(&DiscoveryConfig::default()),
            order.clone(),
            DebouncedTrigger::new(weak),
        );
        let mut dispatcher = Dispatcher::new(&DispatchConfig::default(), "producers");
        dispatcher.start(pipeline).unwrap();

        let barrier = Arc::new(Barrier::new(PRODUCERS));
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let handle = dispatcher.handle();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..PER_PRODUCER {
                        let event = ChangeEvent::changed(format!("{VIEW}p{producer}/{i}"));
                        assert_eq!(handle.enqueue(event), EnqueueOutcome::Accepted);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let total = (PRODUCERS * PER_PRODUCER) as u64;
        assert!(wait_until(Duration::from_secs(10), || dispatcher.stats().processed == total));
        dispatcher.stop();

        let snap = dispatcher.stats();
        assert_eq!(snap.accepted, total);
        assert_eq!(snap.processed, snap.accepted);
        assert_eq!(snap.dropped, 0);
        assert_eq!(snap.discarded, 0);

        // Interleaving across producers is free, each producer's own order is not.
        let seen = order.0.lock();
        assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER);
        let mut next = [0_usize; PRODUCERS];
        for path in seen.iter() {
            let tag = path.strip_prefix(VIEW).and_then(|rest| rest.strip_prefix('p')).unwrap();
            let (producer, index) = tag.split_once('/').unwrap();
            let producer: usize = producer.parse().unwrap();
            let index: usize = index.parse().unwrap();
            assert_eq!(index, next[producer], "producer {producer} out of order");
            next[producer] += 1;
        }
        assert!(next.iter().all(|&count| count == PER_PRODUCER));
    }

    /// Stops its own dispatcher from inside the trigger and records the
    /// state seen right after.
    #[derive(Default)]
    struct StopFromTrigger {
        slot: Mutex<Option<Dispatcher>>,
        state_after_stop: Mutex<Option<DispatcherState>>,
    }

    impl TopologyTrigger for StopFromTrigger {
        fn check_for_topology_change(&self) -> Result<(), TriggerError> {
            if let Some(dispatcher) = self.slot.lock().as_mut() {
                dispatcher.stop();
                *self.state_after_stop.lock() = Some(dispatcher.state());
            }
            Ok(())
        }
    }

    #[test]
    fn test_stop_from_worker_stays_stopping_until_worker_exits() {
        let target = Arc::new(StopFromTrigger::default());
        let trigger: Arc<dyn TopologyTrigger> = Arc::<StopFromTrigger>::clone(&target);

        let mut dispatcher = Dispatcher::new(&DispatchConfig::default(), "self-stop");
        dispatcher.start(pipeline_for(&trigger)).unwrap();
        let handle = dispatcher.handle();
        *target.slot.lock() = Some(dispatcher);

        handle.enqueue(view_event(0));
        handle.enqueue(view_event(1));

        assert!(wait_until(Duration::from_secs(5), || {
            target
                .slot
                .lock()
                .as_ref()
                .is_some_and(|dispatcher| dispatcher.state() == DispatcherState::Stopped)
        }));
        assert_eq!(*target.state_after_stop.lock(), Some(DispatcherState::Stopping));

        let dispatcher = target.slot.lock().take().unwrap();
        assert!(!dispatcher.is_worker_thread());
        let snap = dispatcher.stats();
        assert_eq!(snap.triggered, 1);
        assert_eq!(snap.processed, 1);
        drop(dispatcher);
    }

    #[test]
    fn test_late_batch_after_stop_is_rejected() {
        let mut dispatcher = Dispatcher::new(&DispatchConfig::default(), "late");
        let handle = dispatcher.handle();
        dispatcher.stop();

        let batch: ChangeBatch = [view_event(1), view_event(2)].into_iter().collect();
        handle.on_change(batch);
        assert_eq!(handle.stats().rejected, 2);
        assert_eq!(handle.stats().accepted, 0);
    }
}
