//! The observation subsystem boundary.
//!
//! An [`ObservationService`] delivers [`ChangeBatch`]es for a registered path
//! subtree to a [`ChangeListener`]. Delivery happens on threads the service
//! owns, so listeners must return quickly.
//!
//! [`ObservationHub`] is an in-memory service: publishers call
//! [`ObservationHub::publish`] and matching listeners are invoked on the
//! publisher's thread. It backs the replay command and the tests. The
//! filesystem-backed service lives in [`crate::fs_observation`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tc_core::ChangeBatch;

use crate::error::ListenerError;

/// Receives change notifications from an observation service.
pub trait ChangeListener: Send + Sync {
    /// Handles changes below the registered path.
    ///
    /// Called on the observation service's thread; must not block.
    fn on_change(&self, changes: ChangeBatch);
}

/// Identifies one registration with an [`ObservationService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(u64);

impl RegistrationId {
    /// Creates an id from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A subscription API scoped by path prefix.
pub trait ObservationService: Send + Sync {
    /// Registers `listener` for changes at or below `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the service cannot accept the registration.
    fn register(
        &self,
        path: &str,
        listener: Arc<dyn ChangeListener>,
    ) -> Result<RegistrationId, ListenerError>;

    /// Removes a registration.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::UnknownRegistration`] if `id` is not
    /// registered.
    fn unregister(&self, id: RegistrationId) -> Result<(), ListenerError>;
}

/// Returns `true` if `path` is `prefix` itself or lies below it.
#[must_use]
pub fn is_within(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

struct Subscription {
    path: String,
    listener: Arc<dyn ChangeListener>,
}

/// In-memory observation service.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use parking_lot::Mutex;
/// use tc_core::{ChangeBatch, ChangeEvent};
/// use tc_listener::{ChangeListener, ObservationHub, ObservationService};
///
/// #[derive(Default)]
/// struct Collect(Mutex<Vec<String>>);
///
/// impl ChangeListener for Collect {
///     fn on_change(&self, changes: ChangeBatch) {
///         self.0.lock().extend(changes.into_iter().map(|c| c.path));
///     }
/// }
///
/// let hub = ObservationHub::new();
/// let collect = Arc::new(Collect::default());
/// hub.register("/var/discovery", collect.clone()).unwrap();
///
/// hub.publish_one(ChangeEvent::changed("/var/discovery/impl/x"));
/// hub.publish_one(ChangeEvent::changed("/etc/other"));
/// assert_eq!(*collect.0.lock(), vec!["/var/discovery/impl/x".to_owned()]);
/// ```
#[derive(Default)]
pub struct ObservationHub {
    subscriptions: RwLock<FxHashMap<RegistrationId, Subscription>>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
}

impl fmt::Debug for ObservationHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservationHub")
            .field("registrations", &self.registration_count())
            .field("available", &self.is_available())
            .finish()
    }
}

impl ObservationHub {
    /// Creates an available hub with no registrations.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the hub available or unavailable for new registrations.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Returns `true` if the hub accepts registrations.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    /// Returns the number of active registrations.
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Delivers `changes` to every listener whose path covers them.
    ///
    /// Each listener receives one batch containing only the changes within
    /// its registered path, in their original order. Returns the number of
    /// listeners invoked.
    pub fn publish(&self, changes: &ChangeBatch) -> usize {
        let targets: Vec<(ChangeBatch, Arc<dyn ChangeListener>)> = {
            let subscriptions = self.subscriptions.read();
            subscriptions
                .values()
                .filter_map(|sub| {
                    let matching: ChangeBatch = changes
                        .iter()
                        .filter(|change| is_within(&change.path, &sub.path))
                        .cloned()
                        .collect();
                    (!matching.is_empty()).then(|| (matching, Arc::clone(&sub.listener)))
                })
                .collect()
        };

        // Listeners run without the lock held so they may (un)register.
        let delivered = targets.len();
        for (batch, listener) in targets {
            listener.on_change(batch);
        }
        delivered
    }

    /// Delivers a single change.
    pub fn publish_one(&self, change: tc_core::ChangeEvent) -> usize {
        let mut batch = ChangeBatch::new();
        batch.push(change);
        self.publish(&batch)
    }
}

impl ObservationService for ObservationHub {
    fn register(
        &self,
        path: &str,
        listener: Arc<dyn ChangeListener>,
    ) -> Result<RegistrationId, ListenerError> {
        if !self.is_available() {
            return Err(ListenerError::unavailable(
                "observation hub is not accepting registrations",
            ));
        }
        let id = RegistrationId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.subscriptions.write().insert(
            id,
            Subscription {
                path: path.to_owned(),
                listener,
            },
        );
        tracing::debug!(%id, path, "Registered change listener");
        Ok(id)
    }

    fn unregister(&self, id: RegistrationId) -> Result<(), ListenerError> {
        match self.subscriptions.write().remove(&id) {
            Some(sub) => {
                tracing::debug!(%id, path = %sub.path, "Unregistered change listener");
                Ok(())
            }
            None => Err(ListenerError::UnknownRegistration(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tc_core::ChangeEvent;

    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Vec<String>>>);

    impl ChangeListener for Collect {
        fn on_change(&self, changes: ChangeBatch) {
            self.0
                .lock()
                .push(changes.into_iter().map(|c| c.path).collect());
        }
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/var/discovery/impl", "/var/discovery/impl"));
        assert!(is_within("/var/discovery/impl/x", "/var/discovery/impl"));
        assert!(is_within("/var/discovery/impl/x", "/var/discovery/impl/"));
        assert!(!is_within("/var/discovery/implx", "/var/discovery/impl"));
        assert!(!is_within("/unrelated", "/var/discovery/impl"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn test_publish_filters_by_path() {
        let hub = ObservationHub::new();
        let collect = Arc::new(Collect::default());
        let listener: Arc<dyn ChangeListener> = Arc::<Collect>::clone(&collect);
        hub.register("/var/discovery/impl", listener).unwrap();

        let batch: ChangeBatch = [
            ChangeEvent::changed("/var/discovery/impl/a"),
            ChangeEvent::changed("/unrelated"),
            ChangeEvent::changed("/var/discovery/impl/b"),
        ]
        .into_iter()
        .collect();
        assert_eq!(hub.publish(&batch), 1);
        assert_eq!(
            *collect.0.lock(),
            vec![vec![
                "/var/discovery/impl/a".to_owned(),
                "/var/discovery/impl/b".to_owned()
            ]]
        );

        assert_eq!(hub.publish_one(ChangeEvent::changed("/unrelated")), 0);
    }

    #[test]
    fn test_unregister() {
        let hub = ObservationHub::new();
        let collect = Arc::new(Collect::default());
        let listener: Arc<dyn ChangeListener> = Arc::<Collect>::clone(&collect);
        let id = hub.register("/a", listener).unwrap();
        assert_eq!(hub.registration_count(), 1);

        hub.unregister(id).unwrap();
        assert_eq!(hub.registration_count(), 0);
        assert_eq!(hub.publish_one(ChangeEvent::changed("/a/b")), 0);

        let err = hub.unregister(id).unwrap_err();
        assert!(matches!(err, ListenerError::UnknownRegistration(found) if found == id));
    }

    #[test]
    fn test_unavailable_hub_rejects_registration() {
        let hub = ObservationHub::new();
        hub.set_available(false);
        let collect: Arc<dyn ChangeListener> = Arc::new(Collect::default());
        let err = hub.register("/a", collect).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(hub.registration_count(), 0);
    }

    #[test]
    fn test_registration_ids_are_distinct() {
        let hub = ObservationHub::new();
        let a = hub.register("/a", Arc::new(Collect::default())).unwrap();
        let b = hub.register("/b", Arc::new(Collect::default())).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), format!("#{}", a.get()));
    }
}
