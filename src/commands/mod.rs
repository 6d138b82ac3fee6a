//! Command implementations
//!
//! Every CLI subcommand is a thin adapter over the same pieces: a catalog
//! provider, the stream resolver, and either the player or the downloader.
//! [`Context`] owns those pieces for one run.

pub mod fetch;
pub mod manage;
pub mod play;

use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::catalog::{
    parse_episode_range, AnimeCatalog, CatalogItem, CatalogProvider, EpisodeEntry, FlixCatalog,
    ItemKind, SeasonEntry, SessionContext, StreamDescriptor,
};
use crate::cli::SearchArgs;
use crate::config::AppConfig;
use crate::download::{DownloadRegistry, Downloader};
use crate::error::{Result, StreamError};
use crate::history::History;
use crate::http::spawn_server;
use crate::player::Player;
use crate::resolver::{ResolvedStream, StreamResolver, VariantPreference};
use crate::settings::Settings;
use crate::state::AppState;
use crate::transmux::{wait_for_segments, CacheLease, TransmuxRequest};

/// Everything one CLI invocation works with.
pub struct Context {
    pub config: AppConfig,
    /// Shared with the local server when one is started
    pub state: Arc<AppState>,
    pub anime: AnimeCatalog,
    pub flix: FlixCatalog,
    pub resolver: StreamResolver,
    pub downloads: DownloadRegistry,
    pub history: History,
    settings_path: PathBuf,
    settings: Mutex<Settings>,
    local_server: OnceCell<SocketAddr>,
}

impl Context {
    /// Context using the per-user history and settings files.
    pub fn new(config: AppConfig) -> Result<Self> {
        Self::with_paths(config, History::default_path()?, Settings::default_path()?)
    }

    pub fn with_paths(config: AppConfig, history_path: PathBuf, settings_path: PathBuf) -> Result<Self> {
        let state = Arc::new(AppState::new(config.clone())?);
        let client = state.http_client.clone();
        let settings = Settings::load(&settings_path);
        Ok(Self {
            anime: AnimeCatalog::new(client.clone(), config.resolver.anime_base_url.clone()),
            flix: FlixCatalog::new(client.clone(), &config.resolver),
            resolver: StreamResolver::new(client, config.resolver.clone(), &config.proxy.user_agent),
            downloads: DownloadRegistry::new(),
            history: History::new(history_path),
            settings_path,
            settings: Mutex::new(settings),
            local_server: OnceCell::new(),
            state,
            config,
        })
    }

    pub fn settings(&self) -> Settings {
        self.settings.lock().clone()
    }

    /// Change the settings in memory and persist them.
    pub fn update_settings(&self, change: impl FnOnce(&mut Settings) -> Result<()>) -> Result<Settings> {
        let mut settings = self.settings.lock();
        change(&mut settings)?;
        settings.save(&self.settings_path)?;
        Ok(settings.clone())
    }

    pub fn player(&self) -> Player {
        Player::new(self.config.tools.mpv.clone(), self.config.player.clone())
    }

    pub fn downloader(&self) -> Downloader {
        Downloader::new(
            self.state.http_client.clone(),
            self.config.tools.clone(),
            self.config.download.clone(),
            self.config.proxy.user_agent.clone(),
            self.downloads.clone(),
        )
    }

    /// Turn a provider's stream descriptor into a playable stream.
    ///
    /// `Ok(None)` means no variant of the episode could be resolved.
    pub async fn resolve(
        &self,
        descriptor: &StreamDescriptor,
        cookie: &str,
        pref: &VariantPreference,
    ) -> Result<Option<ResolvedStream>> {
        match descriptor {
            StreamDescriptor::PlayPage(url) => self.resolver.resolve(url, cookie, pref).await,
            StreamDescriptor::Embed(url) => self.flix.decode_embed(url).await.map(Some),
        }
    }

    /// Address of the in-process proxy/transmux server, started on first use.
    pub async fn local_server(&self) -> Result<SocketAddr> {
        let addr = self
            .local_server
            .get_or_try_init(|| async {
                let (addr, _handle) = spawn_server(self.state.clone(), "127.0.0.1:0").await?;
                self.state.spawn_cleanup();
                tracing::info!("Local stream server on http://{}", addr);
                Ok::<_, StreamError>(addr)
            })
            .await?;
        Ok(*addr)
    }

    /// Start an event-mode transmux of `stream` and return a local URL for
    /// it once the first segments exist.
    pub async fn transmux_url(&self, stream: &ResolvedStream) -> Result<(String, Option<CacheLease>)> {
        let addr = self.local_server().await?;
        let request = TransmuxRequest {
            source_url: stream.media_url.clone(),
            referer: Some(stream.referer.clone()),
            audio: stream.variant.as_ref().map(|v| v.audio.clone()),
            resolution: stream.variant.as_ref().map(|v| v.resolution.clone()),
        };
        let output = self.state.transmux.ensure_start(&request)?;
        let lease = self.state.transmux.acquire(&output.key);

        let config = self.state.transmux.config();
        let ready = wait_for_segments(
            &output.media_path,
            config.min_segments,
            Duration::from_millis(config.segment_wait_timeout_ms),
            Duration::from_millis(config.segment_poll_interval_ms),
        )
        .await;
        if !ready {
            tracing::warn!("Transmux is slow to start, playing anyway");
        }
        Ok((format!("http://{}{}", addr, output.url), lease))
    }

    /// Remove partial downloads and stop transcoders.
    pub async fn shutdown(&self) {
        let removed = self.downloads.cleanup_all();
        if removed > 0 {
            tracing::info!("Cleaned up {} partial download(s)", removed);
        }
        self.state.transmux.shutdown().await;
    }
}

/// The 1-based `pick` among search results.
pub fn pick_result(items: &[CatalogItem], pick: usize) -> Result<&CatalogItem> {
    if items.is_empty() {
        return Err(StreamError::NotFound("no search results".to_string()));
    }
    pick.checked_sub(1)
        .and_then(|i| items.get(i))
        .ok_or_else(|| {
            StreamError::InvalidInput(format!(
                "--pick {} is out of range (1-{})",
                pick,
                items.len()
            ))
        })
}

pub fn print_results(items: &[CatalogItem], picked: usize) {
    for (i, item) in items.iter().enumerate() {
        let marker = if i + 1 == picked { '>' } else { ' ' };
        println!("{} {:>2}. {}", marker, i + 1, item.display());
    }
}

/// Title without a trailing season marker like `(SS 2)`.
pub fn clean_title(title: &str) -> String {
    regex!(r"(?i)\(SS\s*\d+\)").replace_all(title, "").trim().to_string()
}

/// Search `provider`, print the results and select the picked one.
pub(crate) async fn search_and_pick(
    provider: &dyn CatalogProvider,
    session: &mut SessionContext,
    search: &SearchArgs,
    kind: Option<ItemKind>,
) -> Result<CatalogItem> {
    let query = search.query();
    let mut items = provider.search(session, &query).await?;
    if let Some(kind) = kind {
        items.retain(|item| item.kind == kind);
    }
    tracing::debug!("{} result(s) for {:?} on {}", items.len(), query, provider.name());
    let item = pick_result(&items, search.pick)?.clone();
    print_results(&items, search.pick);
    session.selected = Some(item.clone());
    Ok(item)
}

/// Episode numbers from repeated `--episode` values.
pub fn requested_episodes(values: &[String]) -> Result<Vec<u32>> {
    let mut seen = HashSet::new();
    let mut numbers = Vec::new();
    for value in values {
        for n in parse_episode_range(value)? {
            if seen.insert(n) {
                numbers.push(n);
            }
        }
    }
    Ok(numbers)
}

/// Episodes of season `number` (1-based, default 1).
pub(crate) async fn season_episodes(
    ctx: &Context,
    session: &SessionContext,
    item: &CatalogItem,
    number: Option<u32>,
) -> Result<(SeasonEntry, Vec<EpisodeEntry>)> {
    let seasons = ctx.flix.seasons(session, item).await?;
    let number = number.unwrap_or(1);
    let season = seasons
        .iter()
        .find(|s| s.number == number)
        .cloned()
        .ok_or_else(|| {
            StreamError::NotFound(format!(
                "season {} (only {} available)",
                number,
                seasons.len()
            ))
        })?;
    let episodes = ctx.flix.episodes(session, item, Some(&season)).await?;
    Ok((season, episodes))
}
