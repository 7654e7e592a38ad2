//! Filesystem-backed observation service.
//!
//! [`FsObservation`] treats a directory tree as a mirror of the repository:
//! directories are nodes and regular files are properties of the directory
//! that contains them. A `notify` watcher per registration turns filesystem
//! events into [`ChangeEvent`]s and hands them to the registered listener on
//! `notify`'s own thread.
//!
//! ```text
//! <root>/var/discovery/impl/clusterInstances/a/lastHeartbeat   (file modified)
//!        │
//!        ▼
//! ChangeEvent { path: "/var/discovery/impl/clusterInstances/a",
//!               kind: Changed, changed_properties: {"lastHeartbeat"} }
//! ```
//!
//! # Kind Mapping
//!
//! | `notify::EventKind` | [`ChangeKind`]      |
//! |---------------------|---------------------|
//! | `Create`            | `Added`             |
//! | `Remove`            | `Removed`           |
//! | `Access`            | ignored             |
//! | anything else       | `Changed`           |
//!
//! A file event is always reported as `Changed` on the parent node, because
//! adding or rewriting a property modifies its node. A removed file can no
//! longer be told apart from a removed directory, so it is reported as a
//! node removal with unknown properties.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tc_core::{ChangeBatch, ChangeEvent, ChangeKind};

use crate::error::ListenerError;
use crate::observation::{ChangeListener, ObservationService, RegistrationId};

/// Maps a native `notify` event kind onto a [`ChangeKind`].
///
/// Returns `None` for read-only access events.
#[must_use]
pub fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Access(_) => None,
        EventKind::Create(_) => Some(ChangeKind::Added),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        EventKind::Any | EventKind::Modify(_) | EventKind::Other => Some(ChangeKind::Changed),
    }
}

/// Converts a mirrored filesystem path into a change event.
///
/// Returns `None` for paths outside `root` and for non-UTF-8 paths.
#[must_use]
pub fn to_change(root: &Utf8Path, path: &Path, kind: ChangeKind) -> Option<ChangeEvent> {
    let Some(path) = Utf8Path::from_path(path) else {
        tracing::warn!(path = %path.display(), "Skipping non-UTF-8 path in file event");
        return None;
    };
    let relative = path.strip_prefix(root).ok()?;
    let segments: Vec<&str> = relative.components().map(|c| c.as_str()).collect();

    if path.is_file() {
        let (property, node) = segments.split_last()?;
        let change = ChangeEvent::changed(resource_path(node)).with_properties([*property]);
        return Some(change);
    }
    Some(ChangeEvent::new(resource_path(&segments), kind))
}

fn resource_path(segments: &[&str]) -> String {
    format!("/{}", segments.join("/"))
}

/// An [`ObservationService`] backed by a directory tree.
pub struct FsObservation {
    root: Utf8PathBuf,
    watchers: Mutex<FxHashMap<RegistrationId, RecommendedWatcher>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for FsObservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsObservation")
            .field("root", &self.root)
            .field("registrations", &self.watchers.lock().len())
            .finish()
    }
}

impl FsObservation {
    /// Creates a service mirroring the repository at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::PathNotFound`] if `root` does not exist.
    pub fn new(root: &Utf8Path) -> Result<Self, ListenerError> {
        if !root.exists() {
            return Err(ListenerError::path_not_found(root));
        }
        let root = root.canonicalize_utf8()?;
        Ok(Self {
            root,
            watchers: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Returns the mirror root.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Returns the directory that mirrors a resource path.
    #[must_use]
    pub fn mirror_path(&self, resource_path: &str) -> Utf8PathBuf {
        self.root.join(resource_path.trim_start_matches('/'))
    }
}

impl ObservationService for FsObservation {
    fn register(
        &self,
        path: &str,
        listener: Arc<dyn ChangeListener>,
    ) -> Result<RegistrationId, ListenerError> {
        let watch_path = self.mirror_path(path);
        if !watch_path.is_dir() {
            return Err(ListenerError::path_not_found(watch_path));
        }

        let root = self.root.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    let Some(kind) = change_kind(&event.kind) else {
                        return;
                    };
                    let batch: ChangeBatch = event
                        .paths
                        .iter()
                        .filter_map(|p| to_change(&root, p, kind))
                        .collect();
                    if !batch.is_empty() {
                        listener.on_change(batch);
                    }
                }
                Err(error) => {
                    tracing::warn!(error = %error, "Filesystem observation error");
                }
            }
        })?;
        watcher.watch(watch_path.as_std_path(), RecursiveMode::Recursive)?;

        let id = RegistrationId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.watchers.lock().insert(id, watcher);
        tracing::info!(%id, path = %watch_path, "Watching repository mirror");
        Ok(id)
    }

    fn unregister(&self, id: RegistrationId) -> Result<(), ListenerError> {
        // Dropping the watcher stops it.
        match self.watchers.lock().remove(&id) {
            Some(_watcher) => {
                tracing::info!(%id, "Stopped watching repository mirror");
                Ok(())
            }
            None => Err(ListenerError::UnknownRegistration(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;
    use std::time::{Duration, Instant};

    use crossbeam_channel::Sender;
    use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind};
    use tc_core::Config;
    use tempfile::TempDir;

    use super::*;
    use crate::listener::TopologyChangeListener;
    use crate::trigger::RecordingTrigger;

    struct Forward(Sender<ChangeEvent>);

    impl ChangeListener for Forward {
        fn on_change(&self, changes: ChangeBatch) {
            for change in changes {
                let _ = self.0.send(change);
            }
        }
    }

    fn mirror() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let root = Utf8Path::from_path(dir.path())
            .expect("Invalid path")
            .canonicalize_utf8()
            .expect("Failed to canonicalize");
        fs::create_dir_all(root.join("var/discovery/impl/clusterInstances/a"))
            .expect("Failed to create mirror");
        (dir, root)
    }

    #[test]
    fn test_change_kind_mapping() {
        assert_eq!(
            change_kind(&EventKind::Create(CreateKind::Folder)),
            Some(ChangeKind::Added)
        );
        assert_eq!(
            change_kind(&EventKind::Remove(RemoveKind::Any)),
            Some(ChangeKind::Removed)
        );
        assert_eq!(
            change_kind(&EventKind::Modify(ModifyKind::Any)),
            Some(ChangeKind::Changed)
        );
        assert_eq!(change_kind(&EventKind::Other), Some(ChangeKind::Changed));
        assert_eq!(change_kind(&EventKind::Any), Some(ChangeKind::Changed));
        assert_eq!(change_kind(&EventKind::Access(AccessKind::Any)), None);
    }

    #[test]
    fn test_to_change_for_property_file() {
        let (_dir, root) = mirror();
        let file = root.join("var/discovery/impl/clusterInstances/a/lastHeartbeat");
        fs::write(&file, "1700000000").unwrap();

        let change = to_change(&root, file.as_std_path(), ChangeKind::Added).unwrap();
        assert_eq!(change.path, "/var/discovery/impl/clusterInstances/a");
        assert_eq!(change.kind, ChangeKind::Changed);
        assert!(change.touches_only("lastHeartbeat"));
    }

    #[test]
    fn test_to_change_for_node_directory() {
        let (_dir, root) = mirror();
        let node = root.join("var/discovery/impl/clusterInstances/a");

        let change = to_change(&root, node.as_std_path(), ChangeKind::Added).unwrap();
        assert_eq!(change.path, "/var/discovery/impl/clusterInstances/a");
        assert_eq!(change.kind, ChangeKind::Added);
        assert!(change.changed_properties.is_none());
    }

    #[test]
    fn test_to_change_for_removed_path() {
        let (_dir, root) = mirror();
        let gone = root.join("var/discovery/impl/clusterInstances/b");

        let change = to_change(&root, gone.as_std_path(), ChangeKind::Removed).unwrap();
        assert_eq!(change.path, "/var/discovery/impl/clusterInstances/b");
        assert_eq!(change.kind, ChangeKind::Removed);
    }

    #[test]
    fn test_to_change_outside_root() {
        let (_dir, root) = mirror();
        assert!(to_change(&root, Path::new("/somewhere/else"), ChangeKind::Changed).is_none());
    }

    #[test]
    fn test_new_missing_root() {
        let result = FsObservation::new(Utf8Path::new("/nonexistent/mirror/root"));
        assert!(matches!(result, Err(ListenerError::PathNotFound(_))));
    }

    #[test]
    fn test_register_missing_path() {
        let (_dir, root) = mirror();
        let observation = FsObservation::new(&root).unwrap();
        let (tx, _rx) = crossbeam_channel::unbounded();

        let result = observation.register("/var/other", Arc::new(Forward(tx)));
        assert!(matches!(result, Err(ListenerError::PathNotFound(_))));
    }

    #[test]
    fn test_register_and_unregister() {
        let (_dir, root) = mirror();
        let observation = FsObservation::new(&root).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        let id = observation
            .register("/var/discovery/impl", Arc::new(Forward(tx)))
            .unwrap();

        fs::write(
            root.join("var/discovery/impl/clusterInstances/a/properties"),
            "{}",
        )
        .unwrap();

        let change = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("No change delivered for the written property");
        assert_eq!(change.path, "/var/discovery/impl/clusterInstances/a");
        assert_eq!(change.kind, ChangeKind::Changed);
        assert!(change.touches_only("properties"));

        observation.unregister(id).unwrap();
        assert!(matches!(
            observation.unregister(id),
            Err(ListenerError::UnknownRegistration(_))
        ));
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_listener_over_mirror_ignores_heartbeats() {
        let (_dir, root) = mirror();
        let observation: Arc<dyn ObservationService> =
            Arc::new(FsObservation::new(&root).unwrap());
        let (trigger, weak) = RecordingTrigger::shared();
        let listener = TopologyChangeListener::new(Config::default(), observation, weak);
        listener.activate().unwrap();

        let instance = root.join("var/discovery/impl/clusterInstances/a");
        for beat in 0..3_u64 {
            fs::write(instance.join("lastHeartbeat"), (1_700_000_000 + beat).to_string())
                .unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        assert!(wait_until(Duration::from_secs(5), || {
            let stats = listener.stats();
            stats.suppressed > 0 && stats.is_idle()
        }));
        assert_eq!(trigger.count(), 0);
        assert_eq!(listener.stats().triggered, 0);

        fs::write(instance.join("properties"), r#"{"role":"leader"}"#).unwrap();
        assert!(wait_until(Duration::from_secs(5), || trigger.count() >= 1));
        assert!(listener.stats().triggered >= 1);

        listener.deactivate();
        assert!(!listener.is_active());
    }
}
