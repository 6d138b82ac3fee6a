//! Application state management
//!
//! AppState holds what the HTTP handlers share:
//! - Upstream HTTP client
//! - Proxy session tokens
//! - Transmux cache manager
//! - Application configuration

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::error::{Result, StreamError};
use crate::session::SessionRegistry;
use crate::transmux::TransmuxManager;

/// Application state shared across all handlers
pub struct AppState {
    pub config: AppConfig,
    pub http_client: reqwest::Client,
    pub sessions: SessionRegistry,
    pub transmux: Arc<TransmuxManager>,
}

impl AppState {
    /// Create a new AppState with the given configuration
    pub fn new(config: AppConfig) -> Result<Self> {
        let http_client = build_http_client(&config)?;
        Ok(Self::with_client(config, http_client))
    }

    pub fn with_client(config: AppConfig, http_client: reqwest::Client) -> Self {
        let transmux = Arc::new(TransmuxManager::new(
            config.transmux.clone(),
            config.tools.ffmpeg.clone(),
            config.proxy.user_agent.clone(),
        ));
        Self {
            sessions: SessionRegistry::new(config.transmux.ttl()),
            http_client,
            transmux,
            config,
        }
    }

    /// Evict idle cache keys and sessions.
    pub async fn cleanup_expired(&self) -> (usize, usize) {
        let keys = self.transmux.sweep().await;
        let sessions = self.sessions.sweep();
        (keys, sessions)
    }

    /// Spawn the periodic cleanup of cache keys and sessions.
    pub fn spawn_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(state.config.transmux.sweep_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let (keys, sessions) = state.cleanup_expired().await;
                if keys + sessions > 0 {
                    tracing::info!(
                        "Evicted {} cache key(s) and {} proxy session(s)",
                        keys,
                        sessions
                    );
                }
            }
        })
    }
}

/// Client used for catalog scraping and upstream proxying.
pub fn build_http_client(config: &AppConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(config.proxy.user_agent.clone())
        .connect_timeout(Duration::from_secs(15))
        .read_timeout(Duration::from_secs(config.proxy.request_timeout_secs.max(1)))
        .build()
        .map_err(|e| StreamError::Config(format!("HTTP client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cleanup_on_empty_state() {
        let state = AppState::new(AppConfig::default()).unwrap();
        assert_eq!(state.cleanup_expired().await, (0, 0));
    }
}
