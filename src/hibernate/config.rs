#![forbid(unsafe_code)]

//! Hibernation settings and their TOML source.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::types::ConfigError;

/// Default bounded wait of the control loop.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);
/// Default capacity of the thread launcher.
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// Runtime settings for the saver and its restore workers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HibernateOptions {
    /// Whether restore runs at startup and snapshots are written at shutdown.
    pub enabled: bool,
    /// Launch restore workers without waiting for the previous one.
    pub parallel: bool,
    /// Database used for the global-objects file and unnamed files.
    pub default_database: String,
    /// Directory holding save-files.
    pub save_dir: PathBuf,
    /// Upper bound on the control loop's sleep between ticks.
    pub tick_interval: Duration,
    /// Maximum number of live restore workers.
    pub max_workers: usize,
}

impl Default for HibernateOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            parallel: false,
            default_database: "postgres".to_string(),
            save_dir: PathBuf::from("hibernate"),
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

impl HibernateOptions {
    /// Loads settings from `path`, falling back to defaults for a missing
    /// file or missing keys.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(path, &contents)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        raw.hibernate.into_options()
    }

    /// Applies the settings that may change while running.
    ///
    /// `default_database`, `save_dir` and `max_workers` are fixed at startup;
    /// the names of fields whose new value was ignored are returned.
    pub fn apply_reload(&mut self, fresh: HibernateOptions) -> Vec<&'static str> {
        let mut ignored = Vec::new();
        if fresh.default_database != self.default_database {
            ignored.push("default_database");
        }
        if fresh.save_dir != self.save_dir {
            ignored.push("save_dir");
        }
        if fresh.max_workers != self.max_workers {
            ignored.push("max_workers");
        }
        self.enabled = fresh.enabled;
        self.parallel = fresh.parallel;
        self.tick_interval = fresh.tick_interval;
        ignored
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    hibernate: RawHibernate,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHibernate {
    enabled: Option<bool>,
    parallel: Option<bool>,
    default_database: Option<String>,
    save_dir: Option<PathBuf>,
    tick_interval_ms: Option<u64>,
    max_workers: Option<usize>,
}

impl RawHibernate {
    fn into_options(self) -> Result<HibernateOptions, ConfigError> {
        let defaults = HibernateOptions::default();
        let default_database = match self.default_database {
            Some(name) if name.is_empty() => {
                return Err(ConfigError::Invalid {
                    field: "default_database",
                    value: name,
                })
            }
            Some(name) => name,
            None => defaults.default_database,
        };
        let tick_interval = match self.tick_interval_ms {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    field: "tick_interval_ms",
                    value: "0".to_string(),
                })
            }
            Some(ms) => Duration::from_millis(ms),
            None => defaults.tick_interval,
        };
        let max_workers = match self.max_workers {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    field: "max_workers",
                    value: "0".to_string(),
                })
            }
            Some(n) => n,
            None => defaults.max_workers,
        };
        Ok(HibernateOptions {
            enabled: self.enabled.unwrap_or(defaults.enabled),
            parallel: self.parallel.unwrap_or(defaults.parallel),
            default_database,
            save_dir: self.save_dir.unwrap_or(defaults.save_dir),
            tick_interval,
            max_workers,
        })
    }
}

/// Where settings come from and are re-read from on reload.
#[derive(Clone, Debug, Default)]
pub struct ConfigSource {
    path: Option<PathBuf>,
}

impl ConfigSource {
    /// Reads from `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Reads from the explicit path if given, else the per-user default.
    pub fn resolve(explicit: Option<PathBuf>) -> Self {
        Self {
            path: explicit.or_else(default_config_path),
        }
    }

    /// Source that always yields defaults.
    pub fn defaults() -> Self {
        Self::default()
    }

    /// Config file path, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Loads the current settings.
    pub fn load(&self) -> Result<HibernateOptions, ConfigError> {
        match &self.path {
            Some(path) => HibernateOptions::load(path),
            None => Ok(HibernateOptions::default()),
        }
    }
}

/// Per-user config file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sombra").join("hibernate.toml"))
}
