//! Watch history
//!
//! A JSON array of entries, newest first, capped at [`MAX_ENTRIES`]. An
//! entry is identified by `url::season::episode`; recording it again moves
//! it to the front.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StreamError};

pub const MAX_ENTRIES: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub title: String,
    /// Catalog page URL of the item
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    /// Playback position in whole seconds
    #[serde(default)]
    pub position: u64,
    /// Milliseconds since the epoch, set when recorded
    #[serde(default)]
    pub ts: i64,
}

impl HistoryEntry {
    pub fn key(&self) -> String {
        let opt = |v: Option<u32>| v.map(|n| n.to_string()).unwrap_or_default();
        format!("{}::{}::{}", self.url, opt(self.season), opt(self.episode))
    }
}

#[derive(Debug, Clone)]
pub struct History {
    path: PathBuf,
}

impl History {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/streamweb/history.json`
    pub fn default_path() -> Result<PathBuf> {
        crate::settings::data_dir().map(|dir| dir.join("history.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries, newest first. A missing or unreadable file reads as empty.
    pub fn read(&self) -> Vec<HistoryEntry> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(_) => return Vec::new(),
        };
        serde_json::from_str(&text).unwrap_or_else(|e| {
            tracing::warn!("Ignoring unreadable history {}: {}", self.path.display(), e);
            Vec::new()
        })
    }

    /// Record `entry` at the front, replacing any entry with the same key.
    pub fn record(&self, mut entry: HistoryEntry) -> Result<()> {
        entry.ts = chrono::Utc::now().timestamp_millis();
        let key = entry.key();
        let mut entries: Vec<HistoryEntry> = self.read().into_iter().filter(|e| e.key() != key).collect();
        entries.insert(0, entry);
        entries.truncate(MAX_ENTRIES);
        self.write(&entries)
    }

    /// Latest entry per key, newest first.
    pub fn unique(&self) -> Vec<HistoryEntry> {
        let mut seen = std::collections::HashSet::new();
        let mut entries: Vec<HistoryEntry> = self.read();
        entries.sort_by(|a, b| b.ts.cmp(&a.ts));
        entries.retain(|e| seen.insert(e.key()));
        entries
    }

    pub fn export(&self, dest: &Path) -> Result<()> {
        write_json(dest, &self.read())
    }

    pub fn clear(&self) -> Result<()> {
        self.write(&[])
    }

    fn write(&self, entries: &[HistoryEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StreamError::Persistence(format!("{}: {}", parent.display(), e)))?;
        }
        write_json(&self.path, entries)
    }
}

pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path, text)
        .map_err(|e| StreamError::Persistence(format!("{}: {}", path.display(), e)))
}
