//! Layered server configuration.
//!
//! Values are merged in order: built-in defaults, the TOML config file,
//! `QSTREAM_*` environment variables, then command-line overrides.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/qstream/config.toml";
const ENV_PREFIX: &str = "QSTREAM_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Address the RPC listener binds to.
    pub bind: SocketAddr,
    /// Number of idle calls kept registered per procedure.
    pub acceptors: usize,
    /// Default number of rows per output block.
    pub max_block_size: usize,
    /// How long shutdown waits for in-flight calls before cancelling them.
    pub shutdown_grace_secs: u64,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 9001)),
            acceptors: 1,
            max_block_size: 65536,
            shutdown_grace_secs: 10,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Load the config from the default file location, the environment and
    /// the given overrides.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        Self::load(None, overrides)
    }

    /// Like [`AppConfig::new`], reading the TOML file from `path` instead of
    /// the default location. A missing file is not an error.
    pub fn load<T: Serialize>(path: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration ({})", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.acceptors == 0 {
            anyhow::bail!("acceptors must be at least 1");
        }
        if self.max_block_size == 0 {
            anyhow::bail!("max_block_size must be at least 1");
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
