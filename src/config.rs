//! Application configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Browser user agent sent to catalog sites and CDNs.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Enable CORS
    pub cors_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            cors_enabled: true,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Upstream request settings shared by the proxy and the scrapers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub user_agent: String,

    /// Upstream request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Catalog and stream resolution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Anime catalog origin
    pub anime_base_url: String,

    /// Movie/TV catalog origin
    pub flix_base_url: String,

    /// Wall-clock limit for one sandboxed script evaluation
    pub sandbox_timeout_ms: u64,

    /// Host substrings identifying the embed CDN family
    pub cdn_patterns: Vec<String>,

    /// Referer sent for media hosted on a matching CDN
    pub cdn_referer: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            anime_base_url: "https://animepahe.si".to_string(),
            flix_base_url: "https://flixhq.to".to_string(),
            sandbox_timeout_ms: 2000,
            cdn_patterns: ["kwik", "owocdn", "vidcloud", "vault", "vidcdn", "vidstream"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            cdn_referer: "https://kwik.cx".to_string(),
        }
    }
}

impl ResolverConfig {
    pub fn sandbox_timeout(&self) -> Duration {
        Duration::from_millis(self.sandbox_timeout_ms)
    }
}

/// Transmux cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmuxConfig {
    /// Directory holding one sub-directory per cache key
    pub cache_root: PathBuf,

    /// Idle time after which an unreferenced key is evicted
    pub ttl_secs: u64,

    /// Interval between eviction sweeps
    pub sweep_interval_secs: u64,

    /// Segments to wait for before playback starts
    pub min_segments: usize,

    pub segment_wait_timeout_ms: u64,
    pub segment_poll_interval_ms: u64,

    /// AAC bitrate passed to ffmpeg
    pub audio_bitrate: String,

    /// Segment length for growing (event) outputs
    pub event_segment_secs: u32,

    /// Segment length for complete (vod) outputs
    pub vod_segment_secs: u32,
}

impl Default for TransmuxConfig {
    fn default() -> Self {
        Self {
            cache_root: std::env::temp_dir().join("streamweb-transmux"),
            ttl_secs: 15 * 60,
            sweep_interval_secs: 5 * 60,
            min_segments: 6,
            segment_wait_timeout_ms: 20_000,
            segment_poll_interval_ms: 400,
            audio_bitrate: "128k".to_string(),
            event_segment_secs: 3,
            vod_segment_secs: 4,
        }
    }
}

impl TransmuxConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// External programs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg: String,
    pub ytdlp: String,
    pub mpv: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ytdlp: "yt-dlp".to_string(),
            mpv: "mpv".to_string(),
        }
    }
}

/// Local player settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub fullscreen: bool,

    /// How long to keep retrying the IPC socket connection
    pub ipc_connect_timeout_ms: u64,

    /// Interval between playback position queries
    pub position_poll_ms: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            fullscreen: true,
            ipc_connect_timeout_ms: 5000,
            position_poll_ms: 2000,
        }
    }
}

/// Download settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub concurrent_fragments: u32,
    pub retries: u32,
    pub socket_timeout_secs: u32,

    /// Bitrate used when re-encoding audio after download
    pub recode_audio_bitrate: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrent_fragments: 64,
            retries: 10,
            socket_timeout_secs: 60,
            recode_audio_bitrate: "192k".to_string(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Output format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub resolver: ResolverConfig,
    pub transmux: TransmuxConfig,
    pub tools: ToolsConfig,
    pub player: PlayerConfig,
    pub download: DownloadConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(ffmpeg) = var("FFMPEG_PATH").filter(|v| !v.is_empty()) {
            self.tools.ffmpeg = ffmpeg;
        }
        if let Some(ua) = var("STREAMWEB_UA").filter(|v| !v.is_empty()) {
            self.proxy.user_agent = ua;
        }
        if let Some(n) = var("PREPARE_MIN_SEGMENTS").and_then(|v| v.parse().ok()) {
            self.transmux.min_segments = n;
        }
        if let Some(ms) = var("CACHE_TTL_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.transmux.ttl_secs = ms.div_ceil(1000);
        }
        if let Some(ms) = var("CLEAN_INTERVAL_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.transmux.sweep_interval_secs = ms.div_ceil(1000);
        }
    }
}
