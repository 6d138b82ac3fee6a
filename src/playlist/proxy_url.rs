//! Same-origin proxy URLs embedded into rewritten playlists.

use url::Url;

/// Which proxy endpoint serves a rewritten URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Playlist,
    Segment,
    Key,
}

impl ProxyKind {
    pub fn path(self) -> &'static str {
        match self {
            ProxyKind::Playlist => "/proxy/playlist",
            ProxyKind::Segment => "/proxy/segment",
            ProxyKind::Key => "/proxy/key",
        }
    }
}

/// `<path>?token=..&url=..&ref=..`, each value percent-encoded.
pub fn proxy_url(kind: ProxyKind, token: &str, target: &str, referer: &str) -> String {
    format!(
        "{}?token={}&url={}&ref={}",
        kind.path(),
        urlencoding::encode(token),
        urlencoding::encode(target),
        urlencoding::encode(referer)
    )
}

/// Resolve a playlist URI against the playlist's own URL.
///
/// Absolute `http(s)` URIs are returned verbatim and protocol-relative ones
/// get `https:`.
pub fn absolutize(uri: &str, base: &Url) -> String {
    let uri = uri.trim();
    let lower = uri.get(..8).unwrap_or(uri).to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return uri.to_string();
    }
    if uri.starts_with("//") {
        return format!("https:{uri}");
    }
    base.join(uri)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| uri.to_string())
}

/// `.m3u8` path, optionally followed by a query string.
pub fn is_playlist_url(url: &str) -> bool {
    regex!(r"(?i)\.m3u8(\?|$)").is_match(url)
}
