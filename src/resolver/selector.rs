//! Variant selection with fallback.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::future::Future;

use super::variant::{parse_resolution, VariantDescriptor};
use crate::error::Result;

/// Requested audio track and resolution. Either may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantPreference {
    pub audio: Option<String>,
    pub resolution: Option<String>,
}

impl VariantPreference {
    pub fn new(audio: Option<&str>, resolution: Option<&str>) -> Self {
        let clean = |s: Option<&str>| {
            s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        };
        Self {
            audio: clean(audio).map(|a| a.to_lowercase()),
            resolution: clean(resolution),
        }
    }

    fn matches_audio(&self, v: &VariantDescriptor) -> bool {
        self.audio.as_deref().map_or(true, |a| v.audio == a)
    }

    fn matches_resolution(&self, v: &VariantDescriptor) -> bool {
        self.resolution.as_deref().map_or(true, |r| {
            let wanted = parse_resolution(r);
            v.resolution == r || (wanted != 0 && v.resolution_value() == wanted)
        })
    }
}

/// Chooses among the variants of one episode.
///
/// Variants are expected in presentation order (see
/// [`collect_variants`](super::variant::collect_variants)).
pub struct VariantSelector<'a> {
    variants: &'a [VariantDescriptor],
}

impl<'a> VariantSelector<'a> {
    pub fn new(variants: &'a [VariantDescriptor]) -> Self {
        Self { variants }
    }

    /// Soft pick: narrow by audio, then by resolution, ignoring a filter that
    /// would leave nothing. `None` only when there are no variants at all.
    pub fn pick(&self, pref: &VariantPreference) -> Option<&'a VariantDescriptor> {
        let mut pool: Vec<&VariantDescriptor> = self.variants.iter().collect();
        if pref.audio.is_some() {
            let by_audio: Vec<_> = pool.iter().copied().filter(|v| pref.matches_audio(v)).collect();
            if !by_audio.is_empty() {
                pool = by_audio;
            }
        }
        if pref.resolution.is_some() {
            let by_res: Vec<_> = pool
                .iter()
                .copied()
                .filter(|v| pref.matches_resolution(v))
                .collect();
            if !by_res.is_empty() {
                pool = by_res;
            }
        }
        pool.first().copied()
    }

    /// Every variant in the order it should be attempted, each at most once:
    ///
    /// 1. the exact requested pair (or the first match of a partial
    ///    preference, or the first variant with no preference),
    /// 2. the requested audio at lower resolutions, descending,
    /// 3. everything else by resolution descending.
    pub fn attempt_order(&self, pref: &VariantPreference) -> Vec<&'a VariantDescriptor> {
        let mut order: Vec<&VariantDescriptor> = Vec::with_capacity(self.variants.len());
        let mut tried: HashSet<(&str, &str)> = HashSet::new();
        let mut push = |v: &'a VariantDescriptor, order: &mut Vec<&'a VariantDescriptor>| {
            if tried.insert(v.key()) {
                order.push(v);
            }
        };

        if let Some(first) = self
            .variants
            .iter()
            .find(|v| pref.matches_audio(v) && pref.matches_resolution(v))
        {
            push(first, &mut order);
        }

        if let (Some(audio), Some(res)) = (pref.audio.as_deref(), pref.resolution.as_deref()) {
            let ceiling = parse_resolution(res);
            let mut lower: Vec<&VariantDescriptor> = self
                .variants
                .iter()
                .filter(|v| v.audio == audio && v.resolution_value() < ceiling)
                .collect();
            lower.sort_by_key(|v| Reverse(v.resolution_value()));
            for v in lower {
                push(v, &mut order);
            }
        }

        let mut rest: Vec<&VariantDescriptor> = self.variants.iter().collect();
        rest.sort_by_key(|v| Reverse(v.resolution_value()));
        for v in rest {
            push(v, &mut order);
        }

        order
    }

    /// Run `attempt` over [`attempt_order`](Self::attempt_order) until one
    /// yields a value. Errors are logged and count as a failed attempt.
    pub async fn resolve_with_fallback<T, F, Fut>(
        &self,
        pref: &VariantPreference,
        mut attempt: F,
    ) -> Option<(&'a VariantDescriptor, T)>
    where
        F: FnMut(&'a VariantDescriptor) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        for variant in self.attempt_order(pref) {
            match attempt(variant).await {
                Ok(Some(value)) => return Some((variant, value)),
                Ok(None) => {
                    tracing::debug!(
                        audio = %variant.audio,
                        resolution = %variant.resolution,
                        "variant yielded no stream"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        audio = %variant.audio,
                        resolution = %variant.resolution,
                        "variant attempt failed: {}",
                        e
                    );
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use std::sync::Mutex;

    fn v(audio: &str, res: &str) -> VariantDescriptor {
        VariantDescriptor::new(audio, res, format!("https://kwik.cx/e/{audio}-{res}"), false)
    }

    fn keys(order: &[&VariantDescriptor]) -> Vec<(String, String)> {
        order
            .iter()
            .map(|v| (v.audio.clone(), v.resolution.clone()))
            .collect()
    }

    fn pair(a: &str, r: &str) -> (String, String) {
        (a.to_string(), r.to_string())
    }

    #[test]
    fn test_same_audio_lower_resolution_before_other_audio() {
        let variants = vec![v("eng", "1080"), v("jpn", "720")];
        let selector = VariantSelector::new(&variants);
        let order = selector.attempt_order(&VariantPreference::new(Some("jpn"), Some("1080")));
        assert_eq!(keys(&order), vec![pair("jpn", "720"), pair("eng", "1080")]);
    }

    #[test]
    fn test_exact_match_first() {
        let variants = vec![v("jpn", "1080"), v("eng", "1080"), v("jpn", "720"), v("jpn", "360")];
        let selector = VariantSelector::new(&variants);
        let order = selector.attempt_order(&VariantPreference::new(Some("eng"), Some("1080")));
        assert_eq!(
            keys(&order),
            vec![
                pair("eng", "1080"),
                pair("jpn", "1080"),
                pair("jpn", "720"),
                pair("jpn", "360"),
            ]
        );
    }

    #[test]
    fn test_lower_resolutions_descending() {
        let variants = vec![v("jpn", "360"), v("jpn", "1080"), v("jpn", "720"), v("eng", "480")];
        let selector = VariantSelector::new(&variants);
        let order = selector.attempt_order(&VariantPreference::new(Some("jpn"), Some("900")));
        assert_eq!(
            keys(&order),
            vec![
                pair("jpn", "720"),
                pair("jpn", "360"),
                pair("jpn", "1080"),
                pair("eng", "480"),
            ]
        );
    }

    #[test]
    fn test_no_preference_uses_presentation_order() {
        let variants = vec![v("jpn", "720"), v("eng", "1080")];
        let selector = VariantSelector::new(&variants);
        let order = selector.attempt_order(&VariantPreference::default());
        assert_eq!(keys(&order), vec![pair("jpn", "720"), pair("eng", "1080")]);
    }

    #[test]
    fn test_every_variant_attempted_once() {
        let variants = vec![v("jpn", "1080"), v("jpn", "720"), v("eng", "720")];
        let selector = VariantSelector::new(&variants);
        let order = selector.attempt_order(&VariantPreference::new(Some("jpn"), Some("1080")));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn test_soft_pick() {
        let variants = vec![v("jpn", "1080"), v("jpn", "720"), v("eng", "720")];
        let selector = VariantSelector::new(&variants);
        let pick = |a: Option<&str>, r: Option<&str>| {
            selector
                .pick(&VariantPreference::new(a, r))
                .map(|v| (v.audio.clone(), v.resolution.clone()))
        };
        assert_eq!(pick(Some("eng"), Some("1080")), Some(pair("eng", "720")));
        assert_eq!(pick(Some("ger"), Some("720")), Some(pair("jpn", "720")));
        assert_eq!(pick(None, None), Some(pair("jpn", "1080")));
        assert!(VariantSelector::new(&[]).pick(&VariantPreference::default()).is_none());
    }

    #[tokio::test]
    async fn test_resolve_with_fallback_skips_failures() {
        let variants = vec![v("jpn", "1080"), v("jpn", "720"), v("eng", "1080")];
        let selector = VariantSelector::new(&variants);
        let attempted = Mutex::new(Vec::new());

        let result = selector
            .resolve_with_fallback(&VariantPreference::new(Some("jpn"), Some("1080")), |variant| {
                attempted.lock().unwrap().push(variant.resolution.clone());
                let outcome = match variant.resolution.as_str() {
                    "1080" if variant.audio == "jpn" => Err(StreamError::NotFound("gone".into())),
                    "720" => Ok(None),
                    _ => Ok(Some(format!("{}.m3u8", variant.audio))),
                };
                async move { outcome }
            })
            .await;

        let (variant, url) = result.unwrap();
        assert_eq!(variant.audio, "eng");
        assert_eq!(url, "eng.m3u8");
        assert_eq!(*attempted.lock().unwrap(), vec!["1080", "720", "1080"]);
    }

    #[tokio::test]
    async fn test_resolve_with_fallback_exhausted() {
        let variants = vec![v("jpn", "720")];
        let selector = VariantSelector::new(&variants);
        let result = selector
            .resolve_with_fallback(&VariantPreference::default(), |_| async {
                Ok::<Option<String>, StreamError>(None)
            })
            .await;
        assert!(result.is_none());
    }
}
