//! Path classification.
//!
//! Maps a change path onto a [`Category`] using the configured discovery
//! sub-roots. Classification is a plain string-prefix test evaluated in a
//! fixed order; the first matching root wins and anything else is
//! [`Category::Unrelated`].

use tc_core::{Category, DiscoveryConfig};

/// The sub-roots a change path is classified against.
///
/// # Examples
///
/// ```
/// use tc_core::{Category, DiscoveryConfig};
/// use tc_listener::{TopologyRoots, classify};
///
/// let roots = TopologyRoots::from_config(&DiscoveryConfig::default());
/// assert_eq!(
///     classify("/var/discovery/impl/establishedView/foo", &roots),
///     Category::EstablishedView,
/// );
/// assert_eq!(classify("/unrelated", &roots), Category::Unrelated);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyRoots {
    /// Root of the established view.
    pub established_view: String,
    /// Root of the per-instance records.
    pub cluster_instances: String,
    /// Root of the ongoing votings.
    pub voting: String,
}

impl TopologyRoots {
    /// Creates roots from explicit paths.
    #[must_use]
    pub fn new(
        established_view: impl Into<String>,
        cluster_instances: impl Into<String>,
        voting: impl Into<String>,
    ) -> Self {
        Self {
            established_view: established_view.into(),
            cluster_instances: cluster_instances.into(),
            voting: voting.into(),
        }
    }

    /// Derives the roots from the discovery configuration.
    #[must_use]
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(
            config.established_view_path(),
            config.cluster_instances_path(),
            config.ongoing_votings_path(),
        )
    }
}

/// Classifies `path` against `roots`.
///
/// Never fails: empty or malformed paths are [`Category::Unrelated`].
#[must_use]
pub fn classify(path: &str, roots: &TopologyRoots) -> Category {
    if path.is_empty() {
        return Category::Unrelated;
    }
    if path.starts_with(&roots.established_view) {
        Category::EstablishedView
    } else if path.starts_with(&roots.cluster_instances) {
        Category::ClusterInstance
    } else if path.starts_with(&roots.voting) {
        Category::Voting
    } else {
        Category::Unrelated
    }
}
