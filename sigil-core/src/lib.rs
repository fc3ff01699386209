//! Shared configuration and filesystem layout for the sigil binaries.

pub mod config;
pub mod paths;

pub use config::{Config, ConfigError, KeyEntry};

/// Serialises tests that mutate process environment variables.
#[cfg(test)]
pub(crate) static TEST_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());
