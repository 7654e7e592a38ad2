//! Domain types for observed repository changes.
//!
//! An observation subsystem reports mutations below a registered path as
//! [`ChangeEvent`]s, usually several at a time in a [`ChangeBatch`]. The
//! listener classifies each event's path into a [`Category`] before deciding
//! whether the topology may have changed.
//!
//! # Examples
//!
//! ```
//! use tc_core::{ChangeEvent, ChangeKind};
//!
//! let event = ChangeEvent::changed("/var/discovery/impl/clusterInstances/a")
//!     .with_properties(["lastHeartbeat"]);
//!
//! assert_eq!(event.kind, ChangeKind::Changed);
//! assert!(event.touches_only("lastHeartbeat"));
//! ```

use std::fmt;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Set of property names touched by a change.
pub type PropertySet = FxHashSet<String>;

/// The kind of mutation an observation subsystem reported.
///
/// Native observation APIs use their own event codes. They are mapped onto
/// this enum with [`ChangeKind::from_native`]; anything unrecognised becomes
/// [`ChangeKind::Changed`], so an unknown event is still treated as relevant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum ChangeKind {
    /// A node was created.
    Added,
    /// A node or one of its properties was modified (or moved).
    #[default]
    Changed,
    /// A node was deleted.
    Removed,
}

impl ChangeKind {
    /// Maps a native event code onto a [`ChangeKind`].
    ///
    /// Matching is case-insensitive. Unknown codes map to
    /// [`ChangeKind::Changed`].
    ///
    /// # Examples
    ///
    /// ```
    /// use tc_core::ChangeKind;
    ///
    /// assert_eq!(ChangeKind::from_native("NODE_ADDED"), ChangeKind::Added);
    /// assert_eq!(ChangeKind::from_native("deleted"), ChangeKind::Removed);
    /// assert_eq!(ChangeKind::from_native("NODE_MOVED"), ChangeKind::Changed);
    /// assert_eq!(ChangeKind::from_native("???"), ChangeKind::Changed);
    /// ```
    #[must_use]
    pub fn from_native(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().as_str() {
            "added" | "node_added" | "created" | "create" => Self::Added,
            "removed" | "node_removed" | "deleted" | "delete" | "remove" => Self::Removed,
            _ => Self::Changed,
        }
    }

    /// Returns a short lowercase label for display.
    #[inline]
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Changed => "changed",
            Self::Removed => "removed",
        }
    }
}

impl From<String> for ChangeKind {
    fn from(code: String) -> Self {
        Self::from_native(&code)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single observed mutation.
///
/// Events are created by the observation subsystem, consumed once by the
/// dispatch pipeline and then discarded.
///
/// `changed_properties` distinguishes "unknown" (`None`) from "none reported"
/// (`Some` of an empty set). The listener treats both as relevant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Absolute path of the changed node.
    pub path: String,

    /// What happened to the node.
    #[serde(default)]
    pub kind: ChangeKind,

    /// Names of the properties touched by the change, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_properties: Option<PropertySet>,
}

impl ChangeEvent {
    /// Creates an event with unknown changed properties.
    #[must_use]
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            changed_properties: None,
        }
    }

    /// Creates a [`ChangeKind::Changed`] event.
    #[inline]
    #[must_use]
    pub fn changed(path: impl Into<String>) -> Self {
        Self::new(path, ChangeKind::Changed)
    }

    /// Creates a [`ChangeKind::Added`] event.
    #[inline]
    #[must_use]
    pub fn added(path: impl Into<String>) -> Self {
        Self::new(path, ChangeKind::Added)
    }

    /// Creates a [`ChangeKind::Removed`] event.
    #[inline]
    #[must_use]
    pub fn removed(path: impl Into<String>) -> Self {
        Self::new(path, ChangeKind::Removed)
    }

    /// Sets the changed property names, replacing any previous set.
    #[must_use]
    pub fn with_properties<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changed_properties = Some(properties.into_iter().map(Into::into).collect());
        self
    }

    /// Returns `true` if the change is known to touch exactly one property,
    /// and that property is `name`.
    #[must_use]
    pub fn touches_only(&self, name: &str) -> bool {
        self.changed_properties
            .as_ref()
            .is_some_and(|props| props.len() == 1 && props.contains(name))
    }
}

/// Changes delivered together by one observation callback.
pub type ChangeBatch = SmallVec<[ChangeEvent; 4]>;

/// Semantic category of a change path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Below the established (agreed) view.
    EstablishedView,
    /// Below the per-instance records.
    ClusterInstance,
    /// Below the ongoing votings.
    Voting,
    /// Anywhere else.
    Unrelated,
}

impl Category {
    /// Returns a short label for display and logging.
    #[inline]
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::EstablishedView => "established_view",
            Self::ClusterInstance => "cluster_instance",
            Self::Voting => "voting",
            Self::Unrelated => "unrelated",
        }
    }

    /// Returns `true` for every category except [`Category::Unrelated`].
    #[inline]
    #[must_use]
    pub const fn is_related(self) -> bool {
        !matches!(self, Self::Unrelated)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
