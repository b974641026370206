//! `tfstack.yaml`
//!
//! ```yaml
//! provisioner: tofu
//! max_depth: 5
//! provider_versions:
//!   azurerm: "~> 3.0"
//! ```
//!
//! Every field is optional.
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_FILE: &str = "tfstack.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Binary of the provisioner
    pub provisioner: String,
    /// Bound on nested dependency resolution
    pub max_depth: usize,
    /// Extension of descriptor files, without dot
    pub file_extension: String,
    /// Per unit working directory, created beside each descriptor
    pub working_dir: String,
    /// Hook script cache, `<working_dir>/cache` beside the first path argument when not set
    pub cache_dir: Option<PathBuf>,
    pub fetch_timeout_secs: u64,
    /// provider name -> version constraint for the data source shim
    pub provider_versions: IndexMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provisioner: "terraform".to_string(),
            max_depth: 10,
            file_extension: "hcl".to_string(),
            working_dir: ".tfstack".to_string(),
            cache_dir: None,
            fetch_timeout_secs: 60,
            provider_versions: IndexMap::new(),
        }
    }
}

impl Config {
    /// Read `path`, or `tfstack.yaml` in the current directory when no path is given
    ///
    /// A missing default file yields the defaults, a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_FILE), false),
        };

        if !explicit && !path.exists() {
            tracing::debug!("no configuration file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config = Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        config.validate(&path)?;

        tracing::debug!(path=%path.display(), ?config, "loaded configuration");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        // an empty document is null
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let invalid = |message: &str| ConfigError::Invalid {
            path: path.to_path_buf(),
            message: message.to_string(),
        };

        if self.provisioner.trim().is_empty() {
            return Err(invalid("provisioner must not be empty"));
        }
        if self.max_depth == 0 {
            return Err(invalid("max_depth must be at least 1"));
        }
        if self.file_extension.is_empty() || self.file_extension.starts_with('.') {
            return Err(invalid("file_extension must be given without leading dot"));
        }
        if self.working_dir.is_empty() {
            return Err(invalid("working_dir must not be empty"));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Hook script cache for a run over `paths`
    pub fn cache_dir_for(&self, paths: &[PathBuf]) -> PathBuf {
        if let Some(cache_dir) = &self.cache_dir {
            return cache_dir.clone();
        }

        let base = paths
            .first()
            .map(|path| {
                if path.is_dir() {
                    path.clone()
                } else {
                    path.parent().map(Path::to_path_buf).unwrap_or_default()
                }
            })
            .unwrap_or_default();
        base.join(&self.working_dir).join("cache")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{}: unable to read configuration", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: unable to parse configuration", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{}: {message}", .path.display())]
    Invalid { path: PathBuf, message: String },
}
