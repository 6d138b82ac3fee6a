//! HLS playlist rewriting.
//!
//! Every URI in a multivariant or media playlist is resolved against the
//! playlist's URL and replaced with a proxy URL carrying the session token,
//! so the player only ever talks to this server. AV1 variants and image
//! (trick-play thumbnail) streams are removed.

use url::Url;

use super::proxy_url::{absolutize, is_playlist_url, proxy_url, ProxyKind};

/// Where a playlist came from and which token to embed.
#[derive(Debug, Clone)]
pub struct PlaylistRewriteContext {
    pub base_url: Url,
    pub proxy_token: String,
}

impl PlaylistRewriteContext {
    pub fn new(base_url: Url, proxy_token: impl Into<String>) -> Self {
        Self {
            base_url,
            proxy_token: proxy_token.into(),
        }
    }

    fn proxy(&self, kind: ProxyKind, uri: &str) -> String {
        let absolute = absolutize(uri, &self.base_url);
        proxy_url(kind, &self.proxy_token, &absolute, self.base_url.as_str())
    }

    /// Playlist proxy for `.m3u8` targets, segment proxy otherwise.
    fn proxy_by_suffix(&self, uri: &str) -> String {
        let absolute = absolutize(uri, &self.base_url);
        let kind = if is_playlist_url(&absolute) {
            ProxyKind::Playlist
        } else {
            ProxyKind::Segment
        };
        proxy_url(kind, &self.proxy_token, &absolute, self.base_url.as_str())
    }
}

/// What the next URI line is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    /// URI of an emitted `#EXT-X-STREAM-INF`
    Variant,
    /// URI of a dropped tag
    Skip,
}

/// Rewrite `content`. Line order is preserved; dropped tags take exactly one
/// following URI line with them.
pub fn rewrite_playlist(content: &str, ctx: &PlaylistRewriteContext) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut pending = Pending::None;

    for raw in content.split('\n') {
        let line = raw.trim_end_matches('\r');
        let trimmed = line.trim();
        // every emitted line keeps the input's terminator
        let eol = &raw[line.len()..];
        let mut out_push = |emitted: String| out.push(emitted + eol);

        if trimmed.is_empty() {
            out_push(line.to_string());
            continue;
        }

        if !trimmed.starts_with('#') {
            match std::mem::replace(&mut pending, Pending::None) {
                Pending::Skip => {}
                Pending::Variant => out_push(ctx.proxy(ProxyKind::Playlist, trimmed)),
                Pending::None => out_push(ctx.proxy_by_suffix(trimmed)),
            }
            continue;
        }

        match tag_name(trimmed) {
            "#EXT-X-STREAM-INF" => {
                if is_av1_variant(trimmed) {
                    tracing::debug!("Dropping AV1 variant: {}", trimmed);
                    pending = Pending::Skip;
                } else {
                    out_push(line.to_string());
                    pending = Pending::Variant;
                }
            }
            "#EXT-X-IMAGE-STREAM-INF" => {
                pending = Pending::Skip;
            }
            "#EXT-X-I-FRAME-STREAM-INF" | "#EXT-X-RENDITION-REPORT" => {
                out_push(rewrite_uri_attribute(line, |uri| ctx.proxy(ProxyKind::Playlist, uri)));
            }
            "#EXT-X-MAP" | "#EXT-X-PART" | "#EXT-X-PRELOAD-HINT" => {
                out_push(rewrite_uri_attribute(line, |uri| ctx.proxy(ProxyKind::Segment, uri)));
            }
            "#EXT-X-KEY" | "#EXT-X-SESSION-KEY" => {
                out_push(rewrite_uri_attribute(line, |uri| ctx.proxy(ProxyKind::Key, uri)));
            }
            "#EXT-X-MEDIA" => {
                out_push(rewrite_uri_attribute(line, |uri| ctx.proxy_by_suffix(uri)));
            }
            _ => out_push(line.to_string()),
        }
    }

    out.join("\n")
}

/// `#EXT-X-KEY:METHOD=...` -> `#EXT-X-KEY`
fn tag_name(line: &str) -> &str {
    line.split_once(':').map_or(line, |(name, _)| name)
}

/// Replace the value of the `URI="..."` attribute, if present.
fn rewrite_uri_attribute(line: &str, rewrite: impl Fn(&str) -> String) -> String {
    let uri_re = regex!(r#"URI="([^"]*)""#);
    match uri_re.captures(line) {
        Some(caps) => {
            let whole = caps.get(0).map_or(0..0, |m| m.range());
            let replaced = format!("URI=\"{}\"", rewrite(&caps[1]));
            format!("{}{}{}", &line[..whole.start], replaced, &line[whole.end..])
        }
        None => line.to_string(),
    }
}

/// Whether a `#EXT-X-STREAM-INF` line advertises an AV1 codec.
pub fn is_av1_variant(line: &str) -> bool {
    let codecs_re = regex!(r#"(?i)CODECS\s*=\s*"([^"]*)""#);
    codecs_re.captures(line).is_some_and(|caps| {
        caps[1].split(',').any(|codec| {
            let codec = codec.trim().to_ascii_lowercase();
            codec.starts_with("av01") || codec.starts_with("av1")
        })
    })
}
