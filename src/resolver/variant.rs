//! Stream variant descriptors scraped from a play page.
//!
//! A play page offers one `<button>` per (audio, resolution) combination:
//!
//! ```html
//! <button data-src="https://kwik.cx/e/abc" data-audio="jpn" data-resolution="1080" data-av1="0">
//! ```
//!
//! Buttons are turned into [`VariantDescriptor`]s here, de-duplicated on
//! `(audio, resolution)` with the first occurrence kept, and put into
//! presentation order: non-AV1 before AV1, then resolution descending.

use std::cmp::Reverse;
use std::collections::HashSet;

/// One selectable (audio, resolution) stream of an episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantDescriptor {
    /// Lowercased audio track label, e.g. `jpn` or `eng`
    pub audio: String,
    /// Resolution label as shown by the site, normally numeric
    pub resolution: String,
    /// Embed page locator
    pub source: String,
    pub is_av1: bool,
}

impl VariantDescriptor {
    pub fn new(
        audio: impl Into<String>,
        resolution: impl Into<String>,
        source: impl Into<String>,
        is_av1: bool,
    ) -> Self {
        Self {
            audio: audio.into().trim().to_lowercase(),
            resolution: resolution.into().trim().to_string(),
            source: source.into(),
            is_av1,
        }
    }

    /// Numeric resolution; missing or non-numeric labels count as 0.
    pub fn resolution_value(&self) -> u32 {
        parse_resolution(&self.resolution)
    }

    /// Uniqueness key
    pub fn key(&self) -> (&str, &str) {
        (&self.audio, &self.resolution)
    }
}

pub(crate) fn parse_resolution(label: &str) -> u32 {
    let label = label.trim();
    let label = label.strip_suffix(['p', 'P']).unwrap_or(label);
    label.parse().unwrap_or(0)
}

/// Parse, de-duplicate and order the variant buttons of a play page.
pub fn collect_variants(html: &str) -> Vec<VariantDescriptor> {
    let mut variants = dedupe_variants(parse_buttons(html));
    sort_variants(&mut variants);
    variants
}

/// Extract every `<button>` carrying a non-empty `data-src`.
pub fn parse_buttons(html: &str) -> Vec<VariantDescriptor> {
    let tag_re = regex!(r"(?is)<button\b([^>]*)>");
    tag_re
        .captures_iter(html)
        .filter_map(|caps| {
            let attrs = caps.get(1)?.as_str();
            let source = attribute(attrs, "data-src")?;
            if source.trim().is_empty() {
                return None;
            }
            let audio = attribute(attrs, "data-audio").unwrap_or_default();
            let resolution = attribute(attrs, "data-resolution").unwrap_or_default();
            // Only an explicit "0" marks a non-AV1 encode.
            let is_av1 = attribute(attrs, "data-av1").map_or(true, |v| v.trim() != "0");
            Some(VariantDescriptor::new(
                audio,
                resolution,
                source.trim(),
                is_av1,
            ))
        })
        .collect()
}

/// Keep the first entry per `(audio, resolution)`, preserving order.
pub fn dedupe_variants(variants: Vec<VariantDescriptor>) -> Vec<VariantDescriptor> {
    let mut seen = HashSet::new();
    variants
        .into_iter()
        .filter(|v| seen.insert((v.audio.clone(), v.resolution.clone())))
        .collect()
}

/// Stable sort: non-AV1 first, then resolution descending.
pub fn sort_variants(variants: &mut [VariantDescriptor]) {
    variants.sort_by_key(|v| (v.is_av1, Reverse(v.resolution_value())));
}

/// Value of a single HTML attribute, entity-decoded.
pub(crate) fn attribute(attrs: &str, name: &str) -> Option<String> {
    let attr_re = regex!(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#);
    attr_re.captures_iter(attrs).find_map(|caps| {
        if !caps[1].eq_ignore_ascii_case(name) {
            return None;
        }
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .or_else(|| caps.get(4))
            .map_or("", |m| m.as_str());
        Some(decode_entities(value))
    })
}

pub(crate) fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <div id="resolutionMenu">
          <button class="dropdown-item" data-src="https://kwik.cx/e/a1" data-fansub="SubsPlease" data-resolution="360" data-audio="jpn" data-av1="0">SubsPlease · 360p</button>
          <button class="dropdown-item" data-src="https://kwik.cx/e/a2" data-resolution="1080" data-audio="JPN" data-av1="0">SubsPlease · 1080p</button>
          <button class="dropdown-item" data-src="https://kwik.cx/e/a3" data-resolution="1080" data-audio="jpn" data-av1="1">AV1 · 1080p</button>
          <button class="dropdown-item" data-src="https://kwik.cx/e/a4" data-resolution="720" data-audio="eng" data-av1="0">Dub · 720p</button>
          <button class="dropdown-item" data-src="" data-resolution="480" data-audio="jpn">empty</button>
          <button class="dropdown-item">no source</button>
        </div>"#;

    #[test]
    fn test_parse_buttons_rejects_missing_source() {
        let buttons = parse_buttons(PAGE);
        assert_eq!(buttons.len(), 4);
        assert_eq!(buttons[1].audio, "jpn");
        assert_eq!(buttons[1].resolution, "1080");
        assert!(!buttons[1].is_av1);
        assert!(buttons[2].is_av1);
    }

    #[test]
    fn test_dedupe_keeps_first_seen() {
        let variants = vec![
            VariantDescriptor::new("jpn", "720", "first", false),
            VariantDescriptor::new("eng", "720", "other", false),
            VariantDescriptor::new("jpn", "720", "second", true),
        ];
        let deduped = dedupe_variants(variants);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].source, "first");
        assert!(!deduped[0].is_av1);
    }

    #[test]
    fn test_sort_order() {
        let mut variants = vec![
            VariantDescriptor::new("jpn", "1080", "av1-1080", true),
            VariantDescriptor::new("jpn", "360", "h264-360", false),
            VariantDescriptor::new("jpn", "", "h264-unknown", false),
            VariantDescriptor::new("eng", "1080", "h264-1080", false),
            VariantDescriptor::new("jpn", "2160", "av1-2160", true),
        ];
        sort_variants(&mut variants);
        let order: Vec<&str> = variants.iter().map(|v| v.source.as_str()).collect();
        assert_eq!(
            order,
            vec!["h264-1080", "h264-360", "h264-unknown", "av1-2160", "av1-1080"]
        );
    }

    #[test]
    fn test_collect_variants() {
        let variants = collect_variants(PAGE);
        let keys: Vec<(&str, &str, bool)> = variants
            .iter()
            .map(|v| (v.audio.as_str(), v.resolution.as_str(), v.is_av1))
            .collect();
        // The AV1 1080 collides with the earlier h264 1080 and is dropped.
        assert_eq!(
            keys,
            vec![("jpn", "1080", false), ("eng", "720", false), ("jpn", "360", false)]
        );
    }

    #[test]
    fn test_resolution_value() {
        assert_eq!(parse_resolution("1080"), 1080);
        assert_eq!(parse_resolution("720p"), 720);
        assert_eq!(parse_resolution("HD"), 0);
        assert_eq!(parse_resolution(""), 0);
    }

    #[test]
    fn test_entity_decoded_source() {
        let html = r#"<button data-src="https://kwik.cx/e/x?a=1&amp;b=2" data-audio="jpn" data-resolution="720" data-av1="0">"#;
        let buttons = parse_buttons(html);
        assert_eq!(buttons[0].source, "https://kwik.cx/e/x?a=1&b=2");
    }
}
