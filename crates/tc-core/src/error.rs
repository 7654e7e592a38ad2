//! Error types for the tc-core crate.
//!
//! This module provides the [`ConfigError`] type for configuration-related errors
//! that can occur across the workspace.

/// Errors that can occur during configuration loading and validation.
///
/// # Examples
///
/// ```
/// use tc_core::ConfigError;
///
/// let error = ConfigError::invalid_option("dispatch.poll_interval_ms", "must be positive");
/// assert!(error.to_string().contains("poll_interval_ms"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A configuration option has an invalid value.
    #[error("invalid configuration option '{option}': {reason}")]
    InvalidOption {
        /// The name of the invalid option.
        option: String,
        /// Explanation of why the option is invalid.
        reason: String,
    },

    /// An I/O error occurred while reading configuration.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    /// Creates a new [`ConfigError::InvalidOption`] error.
    #[inline]
    pub fn invalid_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}
