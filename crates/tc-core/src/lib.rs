//! Core types, configuration, and errors for the topology change listener.
//!
//! This crate provides the foundational types used across the workspace:
//!
//! - [`ChangeEvent`], [`ChangeKind`] and [`ChangeBatch`] describing raw
//!   mutations reported by an observation subsystem
//! - [`Category`], the semantic classification of a change path
//! - Configuration structures ([`Config`], [`DiscoveryConfig`], [`DispatchConfig`])
//! - [`ConfigError`] for configuration loading and validation
//!
//! # Crate Dependencies
//!
//! ```text
//! tc-cli ──► tc-listener ──► tc-core
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    Config, DEFAULT_DISCOVERY_RESOURCE_PATH, DEFAULT_HEARTBEAT_PROPERTY, DiscoveryConfig,
    DispatchConfig,
};
pub use error::ConfigError;
pub use types::{Category, ChangeBatch, ChangeEvent, ChangeKind, PropertySet};
