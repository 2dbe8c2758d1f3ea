//! Tool configuration.
//!
//! Settings come from zero or more TOML files merged in order, then from the
//! environment. Command line flags are applied on top by the caller.
//!
//! ```toml
//! source_path = "../resources"
//! binary = true
//! platform = "platform=1,arch=2"
//! log_level = "debug"
//! ```

use crate::error::{Error, Result};
use crate::platform::Platform;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the configured source path.
pub const SOURCE_PATH_ENV: &str = "RESOURCE_SOURCE_PATH";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding sources, blobs and the import map.
    pub source_path: Option<PathBuf>,
    /// Write binary logs; unset keeps the persisted encoding.
    pub binary: Option<bool>,
    /// Platform for operations, in any form [`Platform`] parses.
    pub platform: Option<String>,
    /// One of error, warn, info, debug, trace.
    pub log_level: Option<String>,
}

impl Config {
    /// Parse a config from TOML text.
    ///
    /// `origin` is used in error messages and to resolve a relative
    /// `source_path` against the file's directory.
    pub fn from_toml(content: &str, origin: &Path) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).map_err(|e| Error::config(origin, e.to_string()))?;

        if let Some(source_path) = &config.source_path
            && source_path.is_relative()
            && let Some(dir) = origin.parent()
        {
            config.source_path = Some(dir.join(source_path));
        }
        Ok(config)
    }

    /// Load a single config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::config(path, format!("cannot read: {}", e)))?;
        let config = Self::from_toml(&content, path)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Load and merge config files in order; later files win.
    pub fn load_all<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        paths.iter().try_fold(Config::default(), |merged, path| {
            Ok(merged.merge(Self::load(path.as_ref())?))
        })
    }

    /// Overlay `other` on `self`; set fields in `other` win.
    pub fn merge(self, other: Config) -> Config {
        Config {
            source_path: other.source_path.or(self.source_path),
            binary: other.binary.or(self.binary),
            platform: other.platform.or(self.platform),
            log_level: other.log_level.or(self.log_level),
        }
    }

    /// Apply environment overrides, reading variables through `lookup`.
    pub fn with_env(self, lookup: impl Fn(&str) -> Option<String>) -> Config {
        let source_path = lookup(SOURCE_PATH_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        self.merge(Config {
            source_path,
            ..Config::default()
        })
    }

    /// Parsed platform, generic if unset.
    pub fn platform(&self) -> Result<Platform> {
        match &self.platform {
            Some(platform) => platform.parse(),
            None => Ok(Platform::GENERIC),
        }
    }
}
