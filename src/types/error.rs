use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Error type shared by the save, restore, and scheduling paths.
#[derive(Debug, Error)]
pub enum HibernateError {
    /// I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A save-file is structurally invalid or truncated.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// Invalid argument or identifier.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A save-file, database, or relation could not be found.
    #[error("{0} not found")]
    NotFound(String),
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A restore worker could not be registered.
    #[error("worker registration failed: {0}")]
    Launch(String),
}

/// Result type alias for hibernation operations.
pub type Result<T> = std::result::Result<T, HibernateError>;

impl HibernateError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, offset: u64, reason: impl AsRef<str>) -> Self {
        HibernateError::Corruption(format!(
            "{} at byte {offset}: {}",
            path.into().display(),
            reason.as_ref()
        ))
    }

    /// Returns true when the error describes an invalid save-file rather than
    /// an environmental failure.
    pub fn is_corruption(&self) -> bool {
        matches!(self, HibernateError::Corruption(_))
    }
}

/// Errors raised while loading hibernation settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read hibernate config {path}: {source}")]
    Read {
        /// Config file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// The config file is not valid TOML for the expected schema.
    #[error("failed to parse hibernate config {path}: {source}")]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// A setting has a value outside its accepted range.
    #[error("hibernate setting '{field}' has invalid value '{value}'")]
    Invalid {
        /// Setting name.
        field: &'static str,
        /// Offending value.
        value: String,
    },
}
