//! Noise filtering for classified change events.
//!
//! Instances refresh a liveness timestamp on their own record all the time.
//! Those writes say nothing about the topology, so a change that touches only
//! that property is dropped before it reaches the trigger.
//!
//! # Examples
//!
//! ```
//! use tc_core::{Category, ChangeEvent};
//! use tc_listener::{HeartbeatFilter, NoiseFilter};
//!
//! let filter = HeartbeatFilter::default();
//! let ping = ChangeEvent::changed("/var/discovery/impl/clusterInstances/a")
//!     .with_properties(["lastHeartbeat"]);
//!
//! assert!(filter.is_noise(&ping, Category::ClusterInstance));
//! assert!(!filter.is_noise(&ping, Category::EstablishedView));
//! ```

use tc_core::{Category, ChangeEvent, DEFAULT_HEARTBEAT_PROPERTY};

/// Decides whether a classified change carries no topological meaning.
///
/// Filters run on the dispatcher worker, so they must be [`Send`], [`Sync`]
/// and `'static`.
pub trait NoiseFilter: Send + Sync + 'static {
    /// Returns `true` if the event should be dropped.
    fn is_noise(&self, event: &ChangeEvent, category: Category) -> bool;
}

/// Drops cluster-instance changes that touch only the heartbeat property.
///
/// Unknown or empty property sets, sets with more than one property, and
/// every category other than [`Category::ClusterInstance`] are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatFilter {
    property: String,
}

impl HeartbeatFilter {
    /// Creates a filter for the given heartbeat property name.
    #[must_use]
    pub fn new(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
        }
    }

    /// Returns the heartbeat property name.
    #[inline]
    #[must_use]
    pub fn property(&self) -> &str {
        &self.property
    }
}

impl Default for HeartbeatFilter {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_PROPERTY)
    }
}

impl NoiseFilter for HeartbeatFilter {
    fn is_noise(&self, event: &ChangeEvent, category: Category) -> bool {
        category == Category::ClusterInstance && event.touches_only(&self.property)
    }
}

/// A filter that never reports noise.
///
/// Used when heartbeat suppression is switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAllFilter;

impl NoiseFilter for KeepAllFilter {
    #[inline]
    fn is_noise(&self, _event: &ChangeEvent, _category: Category) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSTANCE: &str = "/var/discovery/impl/clusterInstances/foo";

    #[test]
    fn test_heartbeat_only_is_noise() {
        let filter = HeartbeatFilter::default();
        let event = ChangeEvent::changed(INSTANCE).with_properties(["lastHeartbeat"]);
        assert!(filter.is_noise(&event, Category::ClusterInstance));
    }

    #[test]
    fn test_other_property_is_not_noise() {
        let filter = HeartbeatFilter::default();
        let event = ChangeEvent::changed(INSTANCE).with_properties(["properties"]);
        assert!(!filter.is_noise(&event, Category::ClusterInstance));
    }

    #[test]
    fn test_heartbeat_with_other_property_is_not_noise() {
        let filter = HeartbeatFilter::default();
        let event =
            ChangeEvent::changed(INSTANCE).with_properties(["lastHeartbeat", "leaderElectionId"]);
        assert!(!filter.is_noise(&event, Category::ClusterInstance));
    }

    #[test]
    fn test_unknown_and_empty_properties_are_not_noise() {
        let filter = HeartbeatFilter::default();

        let unknown = ChangeEvent::changed(INSTANCE);
        assert!(!filter.is_noise(&unknown, Category::ClusterInstance));

        let empty = ChangeEvent::changed(INSTANCE).with_properties(Vec::<String>::new());
        assert!(!filter.is_noise(&empty, Category::ClusterInstance));
    }

    #[test]
    fn test_change_kind_does_not_matter() {
        let filter = HeartbeatFilter::default();
        let added = ChangeEvent::added(INSTANCE).with_properties(["lastHeartbeat"]);
        assert!(filter.is_noise(&added, Category::ClusterInstance));

        let removed = ChangeEvent::removed(INSTANCE);
        assert!(!filter.is_noise(&removed, Category::ClusterInstance));
    }

    #[test]
    fn test_other_categories_never_noise() {
        let filter = HeartbeatFilter::default();
        let event = ChangeEvent::changed("/x").with_properties(["lastHeartbeat"]);
        assert!(!filter.is_noise(&event, Category::EstablishedView));
        assert!(!filter.is_noise(&event, Category::Voting));
    }

    #[test]
    fn test_custom_property() {
        let filter = HeartbeatFilter::new("ping");
        assert_eq!(filter.property(), "ping");
        let event = ChangeEvent::changed(INSTANCE).with_properties(["ping"]);
        assert!(filter.is_noise(&event, Category::ClusterInstance));
        let event = ChangeEvent::changed(INSTANCE).with_properties(["lastHeartbeat"]);
        assert!(!filter.is_noise(&event, Category::ClusterInstance));
    }

    #[test]
    fn test_keep_all_filter() {
        let event = ChangeEvent::changed(INSTANCE).with_properties(["lastHeartbeat"]);
        assert!(!KeepAllFilter.is_noise(&event, Category::ClusterInstance));
    }
}
