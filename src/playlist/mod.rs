//! Playlist handling module
//!
//! This module handles HLS playlists passing through the proxy:
//! - Rewriting every URI to a same-origin proxy URL
//! - Dropping AV1 and image-stream variants
//! - Segment counting and duration estimates for media playlists

pub mod proxy_url;
pub mod rewrite;

pub use proxy_url::{absolutize, is_playlist_url, proxy_url, ProxyKind};
pub use rewrite::{rewrite_playlist, PlaylistRewriteContext};

/// HLS playlist MIME type
pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Number of media segments (`#EXTINF:` lines) in a playlist.
pub fn count_segments(content: &str) -> usize {
    content
        .lines()
        .filter(|l| l.trim_start().starts_with("#EXTINF:"))
        .count()
}

/// Sum of `#EXTINF` durations in seconds.
pub fn total_duration(content: &str) -> f64 {
    let extinf_re = regex!(r"^#EXTINF:\s*([0-9]+(?:\.[0-9]+)?)");
    content
        .lines()
        .filter_map(|l| extinf_re.captures(l.trim()))
        .filter_map(|caps| caps[1].parse::<f64>().ok())
        .sum()
}
