//! Shared utilities for wgns components.
//!
//! This crate provides the configuration model and logging setup used by both
//! the namespace helper library and the `wgnsctl` control tool.

pub mod config;
pub mod logging;

// Re-export commonly used items for convenience
pub use config::{Config, ConfigError, PanelKind};
