// ABOUTME: Configuration loading and validation for the marquee binary.
// ABOUTME: Reads MARQUEE_* environment variables and falls back to defaults under the home directory.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MARQUEE_SAVE_RETRIES is not a non-negative integer: {0}")]
    InvalidSaveRetries(String),

    #[error("{0} is set but empty")]
    EmptyPath(&'static str),
}

/// Binary configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct MarqueeConfig {
    pub home: PathBuf,
    pub db_path: PathBuf,
    pub save_retries: usize,
}

impl MarqueeConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - MARQUEE_HOME: data directory (default: ~/.marquee)
    /// - MARQUEE_DB: catalog file (default: $MARQUEE_HOME/catalog.sqlite)
    /// - MARQUEE_SAVE_RETRIES: extra save attempts after a transient failure (default: 2)
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = match path_var("MARQUEE_HOME")? {
            Some(home) => home,
            None => std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp"))
                .join(".marquee"),
        };

        let db_path = path_var("MARQUEE_DB")?.unwrap_or_else(|| home.join("catalog.sqlite"));

        let save_retries = match std::env::var("MARQUEE_SAVE_RETRIES") {
            Ok(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidSaveRetries(raw))?,
            Err(_) => 2,
        };

        Ok(Self {
            home,
            db_path,
            save_retries,
        })
    }
}

fn path_var(name: &'static str) -> Result<Option<PathBuf>, ConfigError> {
    match std::env::var(name) {
        Ok(v) if v.trim().is_empty() => Err(ConfigError::EmptyPath(name)),
        Ok(v) => Ok(Some(PathBuf::from(v))),
        Err(_) => Ok(None),
    }
}
