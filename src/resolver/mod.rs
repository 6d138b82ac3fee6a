//! Stream resolution
//!
//! Turns a play page into a playable media URL:
//! - variant buttons are scraped into [`VariantDescriptor`]s
//! - a [`VariantSelector`] orders the attempts
//! - each attempt fetches the embed page, neutralizes its player script and
//!   runs it in the [`ScriptSandbox`]
//! - the first `.m3u8` URL in the captured output wins

pub mod extract;
pub mod sandbox;
pub mod selector;
pub mod variant;

pub use sandbox::ScriptSandbox;
pub use selector::{VariantPreference, VariantSelector};
pub use variant::{collect_variants, VariantDescriptor};

use reqwest::header::{COOKIE, REFERER};
use url::Url;

use crate::config::ResolverConfig;
use crate::error::{Result, StreamError};

/// A playable stream and the referer downstream fetches must send.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStream {
    pub media_url: String,
    pub referer: String,
    /// Variant the URL was resolved from, when the page offered a choice
    pub variant: Option<VariantDescriptor>,
    /// Subtitle track URLs supplied alongside the stream
    pub subtitles: Vec<String>,
}

/// Resolves play pages and embed pages to media URLs.
#[derive(Clone)]
pub struct StreamResolver {
    client: reqwest::Client,
    config: ResolverConfig,
    sandbox: ScriptSandbox,
}

impl StreamResolver {
    pub fn new(client: reqwest::Client, config: ResolverConfig, user_agent: &str) -> Self {
        let sandbox = ScriptSandbox::new(config.sandbox_timeout(), user_agent);
        Self {
            client,
            config,
            sandbox,
        }
    }

    /// `<site>/play/<slug>/<session>`
    pub fn play_page_url(base: &str, slug: &str, session: &str) -> String {
        format!(
            "{}/play/{}/{}",
            base.trim_end_matches('/'),
            urlencoding::encode(slug),
            session
        )
    }

    /// Resolve a play page with fallback across its variants.
    ///
    /// `Ok(None)` means the page has no usable stream; the caller skips it.
    pub async fn resolve(
        &self,
        play_url: &str,
        cookie: &str,
        pref: &VariantPreference,
    ) -> Result<Option<ResolvedStream>> {
        let variants = self.fetch_variants(play_url, cookie).await?;
        if variants.is_empty() {
            tracing::info!("No stream variants on {}", play_url);
            return Ok(None);
        }

        let selector = VariantSelector::new(&variants);
        let resolved = selector
            .resolve_with_fallback(pref, |variant| self.resolve_variant(variant, cookie))
            .await;

        Ok(resolved.map(|(variant, media_url)| {
            tracing::info!(
                audio = %variant.audio,
                resolution = %variant.resolution,
                "Resolved {}",
                media_url
            );
            ResolvedStream {
                referer: self.referer_for(&media_url),
                media_url,
                variant: Some(variant.clone()),
                subtitles: Vec::new(),
            }
        }))
    }

    /// Fetch a play page and return its variants in presentation order.
    pub async fn fetch_variants(&self, play_url: &str, cookie: &str) -> Result<Vec<VariantDescriptor>> {
        let html = self.fetch_page(play_url, cookie, &self.config.anime_base_url).await?;
        Ok(collect_variants(&html))
    }

    /// Resolve one variant's embed page. The page is fetched every time;
    /// embed tokens expire.
    pub async fn resolve_variant(
        &self,
        variant: &VariantDescriptor,
        cookie: &str,
    ) -> Result<Option<String>> {
        let html = self
            .fetch_page(&variant.source, cookie, &self.config.anime_base_url)
            .await?;
        self.extract_media_url(&html).await
    }

    /// Run the embed page's player script and read the media URL it prints.
    pub async fn extract_media_url(&self, embed_html: &str) -> Result<Option<String>> {
        let Some(script) = extract::find_player_script(embed_html) else {
            tracing::debug!("No player script in embed page");
            return Ok(None);
        };
        let output = self
            .sandbox
            .evaluate(extract::neutralize_script(script))
            .await?;
        Ok(extract::parse_source(&output))
    }

    /// Referer to send when fetching `media_url`.
    pub fn referer_for(&self, media_url: &str) -> String {
        referer_for(&self.config, media_url, &self.config.anime_base_url)
    }

    async fn fetch_page(&self, url: &str, cookie: &str, referer: &str) -> Result<String> {
        let mut request = self.client.get(url).header(REFERER, referer);
        if !cookie.is_empty() {
            request = request.header(COOKIE, cookie);
        }
        let response = request
            .send()
            .await
            .map_err(|e| StreamError::fetch(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::UpstreamStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(|e| StreamError::fetch(url, e))
    }
}

/// Known embed CDNs get their player origin as referer, everything else
/// `catalog_base`.
pub fn referer_for(config: &ResolverConfig, media_url: &str, catalog_base: &str) -> String {
    let host = Url::parse(media_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| media_url.to_lowercase());
    let known_cdn = config
        .cdn_patterns
        .iter()
        .any(|p| host.contains(&p.to_lowercase()));
    if known_cdn {
        config.cdn_referer.clone()
    } else {
        catalog_base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_page_url() {
        assert_eq!(
            StreamResolver::play_page_url("https://animepahe.si/", "a b-c", "ab12"),
            "https://animepahe.si/play/a%20b-c/ab12"
        );
    }

    #[test]
    fn test_referer_rule() {
        let config = ResolverConfig::default();
        let base = config.anime_base_url.as_str();
        assert_eq!(
            referer_for(&config, "https://vault-12.owocdn.top/stream/uwu.m3u8", base),
            "https://kwik.cx"
        );
        assert_eq!(
            referer_for(&config, "https://CDN.VidCloud.example/x.m3u8", base),
            "https://kwik.cx"
        );
        assert_eq!(
            referer_for(&config, "https://media.example.net/vault/x.m3u8", base),
            "https://animepahe.si"
        );
    }

    #[tokio::test]
    async fn test_extract_media_url_from_embed() {
        let resolver = StreamResolver::new(
            reqwest::Client::new(),
            ResolverConfig::default(),
            crate::config::DEFAULT_USER_AGENT,
        );
        let html = r#"<html><script>
            eval(function(p,a,c,k,e,d){return p}("const source='https://eu-11.owocdn.top/stream/aa/uwu.m3u8';",0,0,[],0,{}))
        </script></html>"#;
        assert_eq!(
            resolver.extract_media_url(html).await.unwrap().as_deref(),
            Some("https://eu-11.owocdn.top/stream/aa/uwu.m3u8")
        );
        assert!(resolver
            .extract_media_url("<html>nothing</html>")
            .await
            .unwrap()
            .is_none());
    }
}
