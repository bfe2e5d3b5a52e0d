//! Shared utilities for wgroster components.
//!
//! Configuration loading and logging setup used by both the privileged
//! helper and the operator CLI.

pub mod config;
pub mod logging;

// Re-export commonly used types for convenience
pub use config::{Config, ConfigError};
