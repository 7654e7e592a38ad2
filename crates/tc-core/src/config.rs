//! Configuration structures for the topology change listener.
//!
//! This module provides configuration types for all components:
//!
//! - [`DiscoveryConfig`] - Where the discovery data lives and which property is
//!   the liveness heartbeat
//! - [`DispatchConfig`] - Queue sizing and worker wake-up interval
//! - [`Config`] - Root configuration combining all settings
//!
//! All configuration types implement [`Default`] and deserialize with
//! `#[serde(default)]`, so a configuration file only needs the values it
//! overrides.

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default root below which all discovery data is stored.
pub const DEFAULT_DISCOVERY_RESOURCE_PATH: &str = "/var/discovery/impl/";

/// Default name of the per-instance liveness timestamp property.
pub const DEFAULT_HEARTBEAT_PROPERTY: &str = "lastHeartbeat";

const CLUSTER_INSTANCES_RESOURCE: &str = "clusterInstances";
const ESTABLISHED_VIEW_RESOURCE: &str = "establishedView";
const ONGOING_VOTINGS_RESOURCE: &str = "ongoingVotings";
const PREVIOUS_VIEW_RESOURCE: &str = "previousView";
const SYNC_TOKENS_RESOURCE: &str = "syncTokens";
const ID_MAP_RESOURCE: &str = "idMap";

/// Configuration for the discovery resource layout.
///
/// # Examples
///
/// ```
/// use tc_core::DiscoveryConfig;
///
/// let config = DiscoveryConfig::default();
/// assert_eq!(config.resource_path(), "/var/discovery/impl/");
/// assert_eq!(config.established_view_path(), "/var/discovery/impl/establishedView");
/// assert_eq!(config.listener_path(), "/var/discovery/impl");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Root path of the discovery data, as configured.
    ///
    /// Normalized on access, see [`normalize_resource_path`].
    pub resource_path: String,

    /// Property that only signals liveness and never changes topology.
    pub heartbeat_property: String,

    /// Whether heartbeat-only changes are suppressed.
    pub ignore_heartbeats: bool,

    /// Identifier of the local instance, used in log output.
    pub instance_id: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            resource_path: DEFAULT_DISCOVERY_RESOURCE_PATH.to_owned(),
            heartbeat_property: DEFAULT_HEARTBEAT_PROPERTY.to_owned(),
            ignore_heartbeats: true,
            instance_id: "local".to_owned(),
        }
    }
}

impl DiscoveryConfig {
    /// Returns the normalized discovery root, always ending in `/`.
    #[must_use]
    pub fn resource_path(&self) -> String {
        normalize_resource_path(&self.resource_path)
    }

    /// Path under which the established view is stored.
    #[must_use]
    pub fn established_view_path(&self) -> String {
        self.child(ESTABLISHED_VIEW_RESOURCE)
    }

    /// Path under which every instance publishes its record.
    #[must_use]
    pub fn cluster_instances_path(&self) -> String {
        self.child(CLUSTER_INSTANCES_RESOURCE)
    }

    /// Path under which ongoing votings are stored.
    #[must_use]
    pub fn ongoing_votings_path(&self) -> String {
        self.child(ONGOING_VOTINGS_RESOURCE)
    }

    /// Path under which the previous view is kept.
    #[must_use]
    pub fn previous_view_path(&self) -> String {
        self.child(PREVIOUS_VIEW_RESOURCE)
    }

    /// Path under which sync tokens are stored.
    #[must_use]
    pub fn sync_tokens_path(&self) -> String {
        self.child(SYNC_TOKENS_RESOURCE)
    }

    /// Path under which the instance id map is stored.
    #[must_use]
    pub fn id_map_path(&self) -> String {
        self.child(ID_MAP_RESOURCE)
    }

    /// Path the listener registers for: the discovery root without its
    /// trailing slash.
    #[must_use]
    pub fn listener_path(&self) -> String {
        let mut root = self.resource_path();
        root.pop();
        root
    }

    fn child(&self, name: &str) -> String {
        let mut path = self.resource_path();
        path.push_str(name);
        path
    }
}

/// Normalizes a configured discovery root.
///
/// Trailing slashes are stripped and exactly one is appended. A root that
/// ends up empty (or just `/`) falls back to
/// [`DEFAULT_DISCOVERY_RESOURCE_PATH`]. Whitespace is kept as configured.
///
/// # Examples
///
/// ```
/// use tc_core::config::normalize_resource_path;
///
/// assert_eq!(normalize_resource_path("/var/disco///"), "/var/disco/");
/// assert_eq!(normalize_resource_path("/var/disco"), "/var/disco/");
/// assert_eq!(normalize_resource_path("/"), "/var/discovery/impl/");
/// ```
#[must_use]
pub fn normalize_resource_path(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_DISCOVERY_RESOURCE_PATH.to_owned();
    }
    format!("{trimmed}/")
}

/// Configuration for the decoupling dispatcher.
///
/// # Examples
///
/// ```
/// use tc_core::DispatchConfig;
///
/// let config = DispatchConfig::default();
/// assert_eq!(config.queue_capacity, None);
/// assert_eq!(config.poll_interval_ms, 100);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum number of queued events.
    ///
    /// `None` means unbounded. When bounded, the oldest queued event is
    /// dropped to make room for a new one.
    pub queue_capacity: Option<usize>,

    /// Upper bound in milliseconds on how long the worker waits before
    /// re-checking its running flag.
    pub poll_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: None,
            poll_interval_ms: 100,
        }
    }
}

/// Root configuration.
///
/// # Examples
///
/// ```
/// use tc_core::Config;
///
/// let config = Config::from_json_str(r#"{"discovery": {"resource_path": "/disco"}}"#).unwrap();
/// assert_eq!(config.discovery.cluster_instances_path(), "/disco/clusterInstances");
/// assert_eq!(config.dispatch.poll_interval_ms, 100);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Discovery layout configuration.
    pub discovery: DiscoveryConfig,

    /// Dispatcher configuration.
    pub dispatch: DispatchConfig,
}

impl Config {
    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and
    /// [`ConfigError::InvalidOption`] if validation fails.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise the
    /// same errors as [`Config::from_json_str`].
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Checks option values that deserialize fine but cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] naming the first bad option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery.heartbeat_property.trim().is_empty() {
            return Err(ConfigError::invalid_option(
                "discovery.heartbeat_property",
                "must not be empty",
            ));
        }
        if self.dispatch.poll_interval_ms == 0 {
            return Err(ConfigError::invalid_option(
                "dispatch.poll_interval_ms",
                "must be positive",
            ));
        }
        if self.dispatch.queue_capacity == Some(0) {
            return Err(ConfigError::invalid_option(
                "dispatch.queue_capacity",
                "must be positive or null for unbounded",
            ));
        }
        Ok(())
    }
}
