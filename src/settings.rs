//! User settings persisted as `settings.json` next to the history.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StreamError};
use crate::history::write_json;

/// `<platform data dir>/streamweb`
pub fn data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join(crate::APP_NAME))
        .ok_or_else(|| StreamError::Persistence("no data directory on this platform".to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub autoplay_next: bool,
    pub skip_fillers: bool,
    pub auto_transcode: bool,
    /// Empty means the platform download directory
    pub download_path: String,
    pub page_size_default: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            autoplay_next: false,
            skip_fillers: false,
            auto_transcode: false,
            download_path: String::new(),
            page_size_default: 20,
        }
    }
}

impl Settings {
    pub fn default_path() -> Result<PathBuf> {
        data_dir().map(|dir| dir.join("settings.json"))
    }

    /// Load settings; a missing or unreadable file yields the defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable settings {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StreamError::Persistence(format!("{}: {}", parent.display(), e)))?;
        }
        write_json(path, self)
    }

    /// Set one setting by its JSON or snake_case name.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let invalid = || StreamError::InvalidInput(format!("invalid value for {key}: {value:?}"));
        match key {
            "autoplayNext" | "autoplay_next" => self.autoplay_next = parse_bool(value).ok_or_else(invalid)?,
            "skipFillers" | "skip_fillers" => self.skip_fillers = parse_bool(value).ok_or_else(invalid)?,
            "autoTranscode" | "auto_transcode" => {
                self.auto_transcode = parse_bool(value).ok_or_else(invalid)?
            }
            "downloadPath" | "download_path" => self.download_path = value.trim().to_string(),
            "pageSizeDefault" | "page_size_default" => {
                self.page_size_default = value
                    .trim()
                    .parse()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(invalid)?
            }
            _ => return Err(StreamError::InvalidInput(format!("unknown setting: {key}"))),
        }
        Ok(())
    }

    /// Download directory: the configured path, else the platform default.
    pub fn download_dir(&self) -> PathBuf {
        let configured = self.download_path.trim();
        if !configured.is_empty() {
            return PathBuf::from(configured);
        }
        dirs::download_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
            .unwrap_or_else(|| PathBuf::from("downloads"))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}
