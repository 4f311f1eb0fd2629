use std::path::{Path, PathBuf};
use std::{env, fs};

use thiserror::Error;
use tracing::{debug, info};

use crate::models::CoreConfig;
use crate::validation::{self, ConfigGuardRailError};

const DEFAULT_CONFIG_LOCATIONS: &[&str] =
    &["sluice.toml", "config/sluice.toml"];

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
}

/// Loads [`CoreConfig`] from defaults, an optional TOML file, and
/// environment overrides, in that order.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<CoreConfig, ConfigLoadError> {
        let mut config = match self.resolve_path() {
            Some(path) => Self::from_file(&path)?,
            None => {
                debug!("no config file found, using built-in defaults");
                CoreConfig::default()
            }
        };

        Self::apply_env(&mut config);
        validation::validate(&config)?;
        Ok(config)
    }

    fn resolve_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            return Some(path.clone());
        }
        if let Ok(path) = env::var("SLUICE_CONFIG") {
            return Some(PathBuf::from(path));
        }
        DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    fn from_file(path: &Path) -> Result<CoreConfig, ConfigLoadError> {
        let raw = fs::read_to_string(path).map_err(|source| {
            ConfigLoadError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let config =
            toml::from_str(&raw).map_err(|source| ConfigLoadError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    fn apply_env(config: &mut CoreConfig) {
        if let Ok(url) = env::var("SLUICE_REDIS_URL") {
            config.redis.url = url;
        }
        if let Ok(url) = env::var("SLUICE_PERSISTENT_REDIS_URL") {
            config.redis.persistent_url = url;
        }
    }
}
