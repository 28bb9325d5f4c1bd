//! Configuration Loader
//!
//! Merges defaults, an optional configuration file and environment variables
//! through the `config` crate, then validates the result.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::BridgeConfig;

/// Prefix for environment overrides (`QUEUE_BRIDGE__EXCHANGE__NAME`)
pub const ENV_PREFIX: &str = "QUEUE_BRIDGE";

/// Searched without an extension, so any supported format matches
pub const DEFAULT_CONFIG_BASENAME: &str = "config/queue-bridge";

/// Builder for loading a [`BridgeConfig`]
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_prefix: String,
    overrides: Vec<(String, String)>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: ENV_PREFIX.to_string(),
            overrides: Vec::new(),
        }
    }

    /// Load this file (required) instead of searching the default location
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Highest-precedence value for a dotted key (`long_poll.batch_size`)
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    /// Merge every source, deserialize and validate
    pub fn load(&self) -> ConfigResult<BridgeConfig> {
        let mut builder = config::Config::builder();

        builder = match &self.file {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigurationError::load_error(
                        path.display().to_string(),
                        "file not found",
                    ));
                }
                builder.add_source(config::File::from(path.as_path()).required(true))
            }
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_BASENAME).required(false)),
        };

        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("addresses"),
        );

        for (key, value) in &self.overrides {
            builder = builder
                .set_override(key.as_str(), value.as_str())
                .map_err(|e| ConfigurationError::environment_override_error(key.as_str(), e))?;
        }

        let source_name = self.source_name();
        let merged = builder
            .build()
            .map_err(|e| ConfigurationError::load_error(source_name.as_str(), e))?;
        let bridge: BridgeConfig = merged
            .try_deserialize()
            .map_err(ConfigurationError::deserialize_error)?;

        bridge.validate()?;

        debug!(config = ?bridge, "Configuration merged");
        info!(
            source = %source_name,
            provider = %bridge.provider,
            addresses = bridge.addresses.len(),
            "✅ Configuration loaded"
        );
        Ok(bridge)
    }

    fn source_name(&self) -> String {
        match &self.file {
            Some(path) => display(path),
            None => format!("{DEFAULT_CONFIG_BASENAME}.* + {}__*", self.env_prefix),
        }
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

/// Load configuration from the default locations and environment
pub fn load_config() -> ConfigResult<BridgeConfig> {
    ConfigLoader::new().load()
}
