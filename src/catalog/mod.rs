//! Catalog providers
//!
//! A provider turns a search query into catalog items, lists their seasons
//! and episodes, and hands back where an episode's stream can be resolved.

pub mod anime;
pub mod flix;

pub use anime::AnimeCatalog;
pub use flix::FlixCatalog;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Anime,
    Movie,
    Series,
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    /// Provider-specific identifier (anime slug, numeric media id)
    pub id: String,
    pub title: String,
    /// Canonical page URL, used as the history key
    pub url: String,
    pub kind: ItemKind,
    /// Extra display info (year, type)
    pub info: Option<String>,
}

impl CatalogItem {
    pub fn display(&self) -> String {
        match &self.info {
            Some(info) if !info.is_empty() => format!("{} ({})", self.title, info),
            _ => self.title.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonEntry {
    pub id: String,
    /// 1-based position in the season list
    pub number: u32,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeEntry {
    pub id: String,
    pub number: u32,
    pub title: Option<String>,
    pub season: Option<u32>,
    #[serde(default)]
    pub filler: bool,
}

impl EpisodeEntry {
    /// `S1E3 - Title`, `Episode 3 (filler)` or `Episode 3`.
    pub fn label(&self) -> String {
        let mut label = match self.season {
            Some(season) => format!("S{}E{}", season, self.number),
            None => format!("Episode {}", self.number),
        };
        if let Some(title) = self.title.as_deref().filter(|t| !t.is_empty()) {
            label.push_str(" - ");
            label.push_str(title);
        }
        if self.filler {
            label.push_str(" (filler)");
        }
        label
    }
}

/// Where an episode's stream is resolved from.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDescriptor {
    /// A play page listing variant buttons
    PlayPage(String),
    /// An embed player URL decoded through its sources API
    Embed(String),
}

/// Per-run provider state.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// Cookie sent with every catalog request
    pub cookie: String,
    pub selected: Option<CatalogItem>,
}

impl SessionContext {
    pub fn new(cookie: impl Into<String>) -> Self {
        Self {
            cookie: cookie.into(),
            selected: None,
        }
    }
}

#[async_trait]
pub trait CatalogProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(&self, ctx: &SessionContext, query: &str) -> Result<Vec<CatalogItem>>;

    /// Seasons of an item. Items without seasons return an empty list.
    async fn seasons(&self, ctx: &SessionContext, item: &CatalogItem) -> Result<Vec<SeasonEntry>>;

    async fn episodes(
        &self,
        ctx: &SessionContext,
        item: &CatalogItem,
        season: Option<&SeasonEntry>,
    ) -> Result<Vec<EpisodeEntry>>;

    /// Stream location of an episode, or of the item itself for movies.
    async fn stream(
        &self,
        ctx: &SessionContext,
        item: &CatalogItem,
        episode: Option<&EpisodeEntry>,
    ) -> Result<StreamDescriptor>;
}

/// Widest range accepted by [`parse_episode_range`].
pub const MAX_EPISODE_SPAN: u32 = 10_000;

/// Parse `"5"` or `"5-7"` into episode numbers.
pub fn parse_episode_range(input: &str) -> Result<Vec<u32>> {
    let input = input.trim();
    let invalid = || StreamError::InvalidInput(format!("invalid episode range: {input:?}"));

    match input.split_once('-') {
        Some((start, end)) => {
            let start: u32 = start.trim().parse().map_err(|_| invalid())?;
            let end: u32 = end.trim().parse().map_err(|_| invalid())?;
            if start > end {
                return Err(invalid());
            }
            if end - start >= MAX_EPISODE_SPAN {
                return Err(StreamError::InvalidInput(format!(
                    "episode range {input:?} spans more than {MAX_EPISODE_SPAN} episodes"
                )));
            }
            Ok((start..=end).collect())
        }
        None => input.parse().map(|n| vec![n]).map_err(|_| invalid()),
    }
}

/// Episodes in `episodes` whose number is in `numbers`, in the order asked.
pub fn select_episodes<'a>(episodes: &'a [EpisodeEntry], numbers: &[u32]) -> Result<Vec<&'a EpisodeEntry>> {
    numbers
        .iter()
        .map(|n| {
            episodes
                .iter()
                .find(|e| e.number == *n)
                .ok_or_else(|| {
                    StreamError::NotFound(format!(
                        "episode {} (only {} available)",
                        n,
                        episodes.len()
                    ))
                })
        })
        .collect()
}

/// Absolute URL of `href` against a site base.
pub(crate) fn join_url(base: &str, href: &str) -> String {
    url::Url::parse(base)
        .and_then(|b| b.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}
