//! Non-blocking topology change listener.
//!
//! This crate watches the discovery subtree of a hierarchical repository and
//! asks the cluster-membership subsystem to re-evaluate the topology whenever
//! a change might have altered it. Heartbeat refreshes are filtered out, and
//! the re-evaluation runs on a dedicated worker so observation callbacks
//! never block.
//!
//! # Overview
//!
//! The tc-listener crate is designed to:
//!
//! - Classify change paths against the established-view, cluster-instance
//!   and voting sub-roots
//! - Drop changes that only refresh an instance's liveness property
//! - Queue changes from any number of callback threads without blocking
//! - Process queued changes strictly in order on exactly one worker thread
//! - Contain every failure of the re-evaluation entry point
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │              Observation threads (hub publisher, notify)         │
//! │  ┌────────────────────┐    ┌───────────────────────────────────┐ │
//! │  │ ObservationService │ -> │ DispatchHandle::on_change         │ │
//! │  │ (subtree scoped)   │    │ (try_send per change, never waits)│ │
//! │  └────────────────────┘    └─────────────────┬─────────────────┘ │
//! └──────────────────────────────────────────────│───────────────────┘
//!                                                │ crossbeam channel
//!                                                ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                 Worker thread (tc-dispatch-<instance>)           │
//! │  ┌──────────┐    ┌─────────────┐    ┌──────────────────────────┐ │
//! │  │ classify │ -> │ NoiseFilter │ -> │ DebouncedTrigger         │ │
//! │  │          │    │ (heartbeat) │    │ -> check_for_topology_   │ │
//! │  └──────────┘    └─────────────┘    │    change()              │ │
//! │                                     └──────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Crate Dependencies
//!
//! ```text
//! tc-cli ──► tc-listener ──► tc-core
//! ```
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use tc_core::{ChangeEvent, Config};
//! use tc_listener::{ObservationHub, RecordingTrigger, TopologyChangeListener};
//!
//! # fn main() -> Result<(), tc_listener::ListenerError> {
//! let hub = Arc::new(ObservationHub::new());
//! let (trigger, weak) = RecordingTrigger::shared();
//! let listener = TopologyChangeListener::new(Config::default(), hub.clone(), weak);
//! listener.activate()?;
//!
//! // A heartbeat refresh is ignored, a view change is not.
//! hub.publish_one(
//!     ChangeEvent::changed("/var/discovery/impl/clusterInstances/a")
//!         .with_properties(["lastHeartbeat"]),
//! );
//! hub.publish_one(ChangeEvent::changed("/var/discovery/impl/establishedView/b"));
//!
//! while !listener.stats().is_idle() {
//!     std::thread::yield_now();
//! }
//! listener.deactivate();
//! assert_eq!(trigger.count(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! Lifecycle and observation failures surface as [`ListenerError`].
//! Failures of the re-evaluation entry point are [`TriggerError`]s; they are
//! logged on the worker and never reach the caller.
//!
//! ```
//! use tc_listener::ListenerError;
//!
//! fn handle_activation_error(err: ListenerError) {
//!     if err.is_recoverable() {
//!         // Retry activation later
//!     } else {
//!         eprintln!("Listener cannot start: {err}");
//!     }
//! }
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod classify;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod fs_observation;
pub mod listener;
pub mod observation;
pub mod pipeline;
pub mod stats;
pub mod trigger;

// Re-export classification
pub use classify::{TopologyRoots, classify};

// Re-export dispatcher types
pub use dispatcher::{DispatchHandle, Dispatcher, DispatcherState, EnqueueOutcome};

// Re-export error types
pub use error::ListenerError;

// Re-export filter types
pub use filter::{HeartbeatFilter, KeepAllFilter, NoiseFilter};

// Re-export observation types
pub use fs_observation::FsObservation;
pub use observation::{ChangeListener, ObservationHub, ObservationService, RegistrationId};

// Re-export the listener
pub use listener::TopologyChangeListener;

// Re-export pipeline and statistics
pub use pipeline::{ChangePipeline, ProcessOutcome};
pub use stats::{DispatchSnapshot, DispatchStats};

// Re-export trigger types
pub use trigger::{
    DebouncedTrigger, RecordingTrigger, TopologyTrigger, TriggerError, TriggerOutcome,
};
