//! Server, history and settings commands.

use std::sync::Arc;

use crate::cli::{HistoryAction, SettingsAction};
use crate::error::Result;
use crate::history::{History, HistoryEntry};
use crate::http::spawn_server;
use crate::settings::Settings;
use crate::state::AppState;

/// `streamweb serve`: run the proxy/transmux server until the task ends.
pub async fn serve(state: Arc<AppState>, bind: Option<&str>) -> Result<()> {
    let addr = bind
        .map(str::to_string)
        .unwrap_or_else(|| state.config.server.socket_addr());
    let (local, handle) = spawn_server(state.clone(), &addr).await?;
    let cleanup = state.spawn_cleanup();
    tracing::info!("{} v{} listening on http://{}", crate::APP_NAME, crate::VERSION, local);
    tracing::info!("Transmux cache: {}", state.config.transmux.cache_root.display());

    let _ = handle.await;
    cleanup.abort();
    Ok(())
}

pub fn history(history: &History, action: &HistoryAction) -> Result<()> {
    match action {
        HistoryAction::List => {
            let entries = history.unique();
            if entries.is_empty() {
                println!("No recently watched entries.");
            }
            for (i, entry) in entries.iter().enumerate() {
                println!("{:>3}. {}", i + 1, history_line(entry));
            }
        }
        HistoryAction::Export { path } => {
            history.export(path)?;
            println!("History exported to {}", path.display());
        }
        HistoryAction::Clear => {
            history.clear()?;
            println!("History cleared.");
        }
    }
    Ok(())
}

/// One line of `history list`.
pub fn history_line(entry: &HistoryEntry) -> String {
    let mut parts = vec![entry.title.clone()];
    if let Some(label) = entry.label.as_deref().filter(|l| !l.is_empty()) {
        parts.push(label.to_string());
    } else if let Some(episode) = entry.episode {
        parts.push(format!("Episode {}", episode));
    }
    if entry.audio.is_some() || entry.resolution.is_some() {
        parts.push(format!(
            "{}/{}",
            entry.audio.as_deref().unwrap_or("-"),
            entry.resolution.as_deref().unwrap_or("-")
        ));
    }
    if let Some(when) = chrono::DateTime::from_timestamp_millis(entry.ts) {
        parts.push(
            when.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string(),
        );
    }
    parts.push(format!("pos {}s", entry.position));
    parts.join(" | ")
}

pub fn settings(path: &std::path::Path, action: &SettingsAction) -> Result<()> {
    let mut settings = Settings::load(path);
    match action {
        SettingsAction::Show => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            println!("Effective download directory: {}", settings.download_dir().display());
        }
        SettingsAction::Set { key, value } => {
            settings.set(key, value)?;
            settings.save(path)?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }
    Ok(())
}
