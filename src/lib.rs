//! streamweb
//!
//! Resolves catalog episodes to HLS streams, proxies them with playlist
//! rewriting, transmuxes them into a local cache, and drives an external
//! player or downloader.

// helper.
macro_rules! regex {
    ($re:literal $(,)?) => {{
        static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
        RE.get_or_init(|| regex::Regex::new($re).unwrap())
    }};
}

pub mod catalog;
pub mod cli;
pub mod commands;
pub mod config;
pub mod config_file;
pub mod download;
pub mod error;
pub mod history;
pub mod http;
pub mod player;
pub mod playlist;
pub mod resolver;
pub mod session;
pub mod settings;
pub mod state;
pub mod transmux;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "streamweb";
