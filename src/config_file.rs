//! Configuration file support
//!
//! Loads application configuration from TOML files.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::{
    AppConfig, DownloadConfig, LoggingConfig, PlayerConfig, ProxyConfig, ResolverConfig,
    ServerConfig, ToolsConfig, TransmuxConfig,
};
use crate::error::{Result, StreamError};

/// File name looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "streamweb.toml";

/// Configuration file format. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub server: Option<ServerConfig>,
    pub proxy: Option<ProxyConfig>,
    pub resolver: Option<ResolverConfig>,
    pub transmux: Option<TransmuxConfig>,
    pub tools: Option<ToolsConfig>,
    pub player: Option<PlayerConfig>,
    pub download: Option<DownloadConfig>,
    pub logging: Option<LoggingConfig>,
}

impl ConfigFile {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&content).map_err(|e| StreamError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| StreamError::Config(e.to_string()))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Every section filled with its defaults
    pub fn default_config() -> Self {
        let app = AppConfig::default();
        Self {
            server: Some(app.server),
            proxy: Some(app.proxy),
            resolver: Some(app.resolver),
            transmux: Some(app.transmux),
            tools: Some(app.tools),
            player: Some(app.player),
            download: Some(app.download),
            logging: Some(app.logging),
        }
    }

    /// Convert to AppConfig, defaulting missing sections
    pub fn into_app_config(self) -> AppConfig {
        AppConfig {
            server: self.server.unwrap_or_default(),
            proxy: self.proxy.unwrap_or_default(),
            resolver: self.resolver.unwrap_or_default(),
            transmux: self.transmux.unwrap_or_default(),
            tools: self.tools.unwrap_or_default(),
            player: self.player.unwrap_or_default(),
            download: self.download.unwrap_or_default(),
            logging: self.logging.unwrap_or_default(),
        }
    }
}

/// Load the configuration used by the binary.
///
/// An explicit path that fails to load is an error. The implicit
/// `streamweb.toml` falls back to defaults with a warning. Environment
/// overrides are applied last.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let mut config = match explicit {
        Some(path) => ConfigFile::from_file(path)?.into_app_config(),
        None => {
            let path = Path::new(DEFAULT_CONFIG_FILE);
            if path.exists() {
                match ConfigFile::from_file(path) {
                    Ok(cf) => cf.into_app_config(),
                    Err(e) => {
                        tracing::warn!(
                            "Failed to load config file {}: {}. Using defaults.",
                            path.display(),
                            e
                        );
                        AppConfig::default()
                    }
                }
            } else {
                AppConfig::default()
            }
        }
    };
    config.apply_env();
    Ok(config)
}
