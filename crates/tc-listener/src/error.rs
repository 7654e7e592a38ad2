//! Error types for the tc-listener crate.
//!
//! This module provides the [`ListenerError`] type for errors that can occur
//! while registering with an observation subsystem or managing the dispatcher
//! lifecycle. Failures of the re-evaluation entry point have their own type,
//! [`TriggerError`](crate::TriggerError), because they never leave the
//! dispatcher worker.

use camino::Utf8PathBuf;

use crate::observation::RegistrationId;

/// Errors that can occur during listener activation and observation.
///
/// # Error Recovery Strategy
///
/// - **Unavailable** ([`ListenerError::Unavailable`]): Recoverable - retry activation later
/// - **Unknown registration** ([`ListenerError::UnknownRegistration`]): Recoverable - already gone
/// - **Path not found** ([`ListenerError::PathNotFound`]): Fatal - the mirror root is wrong
/// - **Already active/started** : Fatal - lifecycle misuse
/// - **Worker spawn** ([`ListenerError::WorkerSpawn`]): Fatal - the OS refused a thread
/// - **I/O errors** ([`ListenerError::Io`]): Fatal - the mirror root cannot be resolved
/// - **Notify errors** ([`ListenerError::Notify`]): Fatal - propagate immediately
///
/// # Examples
///
/// ```
/// use tc_listener::ListenerError;
///
/// let err = ListenerError::unavailable("repository offline");
/// assert!(err.is_recoverable());
/// assert!(err.to_string().contains("repository offline"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// The observation subsystem cannot accept registrations right now.
    #[error("observation subsystem unavailable: {reason}")]
    Unavailable {
        /// Why the subsystem is unavailable.
        reason: String,
    },

    /// The path to observe does not exist in the filesystem mirror.
    #[error("observed path does not exist: {0}")]
    PathNotFound(Utf8PathBuf),

    /// An unregister call named a registration the subsystem does not know.
    #[error("unknown registration: {0}")]
    UnknownRegistration(RegistrationId),

    /// The listener is already active.
    #[error("listener is already active")]
    AlreadyActive,

    /// The dispatcher worker was already started once.
    #[error("dispatcher worker already started")]
    AlreadyStarted,

    /// The dispatcher worker thread could not be spawned.
    #[error("failed to spawn dispatcher worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// Resolving the filesystem mirror failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The filesystem watcher failed.
    #[error("notify watcher error: {0}")]
    Notify(#[from] notify::Error),
}

impl ListenerError {
    /// Creates a new [`ListenerError::Unavailable`] error.
    #[inline]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Creates a new [`ListenerError::PathNotFound`] error.
    #[inline]
    pub fn path_not_found(path: impl Into<Utf8PathBuf>) -> Self {
        Self::PathNotFound(path.into())
    }

    /// Returns `true` if a later attempt may succeed.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::UnknownRegistration(_)
        )
    }

    /// Returns `true` if this error is fatal.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_is_recoverable() {
        let err = ListenerError::unavailable("offline");
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "observation subsystem unavailable: offline");
    }

    #[test]
    fn test_path_not_found_is_fatal() {
        let err = ListenerError::path_not_found("/mirror/var/discovery");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("/mirror/var/discovery"));
    }

    #[test]
    fn test_lifecycle_errors_are_fatal() {
        assert!(ListenerError::AlreadyActive.is_fatal());
        assert!(ListenerError::AlreadyStarted.is_fatal());
    }

    #[test]
    fn test_worker_spawn_display() {
        let err = ListenerError::WorkerSpawn(std::io::Error::other("no threads"));
        assert!(err.to_string().contains("no threads"));
        assert!(err.is_fatal());
    }
}
