//! Download commands.

use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::catalog::{CatalogItem, CatalogProvider, EpisodeEntry, SessionContext};
use crate::cli::{AnimeArgs, DownloadArgs, MovieArgs, SeriesArgs};
use crate::download::{DownloadEvent, DownloadJob, Downloader};
use crate::error::{Result, StreamError};
use crate::resolver::{ResolvedStream, VariantPreference};

use super::{clean_title, requested_episodes, Context};

/// Where and how the files of one command are saved.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPlan {
    pub dest: PathBuf,
    /// `E05-Title.mp4` names inside a per-title folder
    pub folder: bool,
    pub recode_audio: bool,
    pub subtitles: bool,
}

impl FetchPlan {
    pub fn new(ctx: &Context, args: &DownloadArgs, title: &str, subtitles: bool) -> Self {
        let settings = ctx.settings();
        let base = args.out.clone().unwrap_or_else(|| settings.download_dir());
        Self::with_base(base, args, settings.auto_transcode, title, subtitles)
    }

    fn with_base(base: PathBuf, args: &DownloadArgs, auto_transcode: bool, title: &str, subtitles: bool) -> Self {
        let dest = if args.folder {
            base.join(folder_name(title))
        } else {
            base
        };
        Self {
            dest,
            folder: args.folder,
            recode_audio: args.transcode || auto_transcode,
            subtitles,
        }
    }
}

/// Folder named after a title, minus characters file systems reject.
pub fn folder_name(title: &str) -> String {
    let cleaned = clean_title(title);
    let name = regex!(r#"[/\\:*?"<>|]"#).replace_all(&cleaned, "");
    let name = name.trim().trim_matches('.');
    if name.is_empty() {
        "download".to_string()
    } else {
        name.to_string()
    }
}

/// File stem for an episode: `E05-Title` inside a folder, otherwise
/// `Show_E05` or `Show_S01E05`.
pub fn episode_file_name(title: &str, episode: &EpisodeEntry, folder: bool) -> String {
    let n = episode.number;
    if folder {
        return match episode.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            Some(ep_title) => format!("E{:02}-{}", n, ep_title),
            None => format!("E{:02}", n),
        };
    }
    let title = clean_title(title);
    match episode.season {
        Some(season) => format!("{}_S{:02}E{:02}", title, season, n),
        None => format!("{}_E{:02}", title, n),
    }
}

/// Download anime episodes: `--whole-show`, or the `--episode` list.
pub(crate) async fn anime(
    ctx: &Context,
    session: &SessionContext,
    item: &CatalogItem,
    episodes: &[EpisodeEntry],
    args: &AnimeArgs,
    pref: &VariantPreference,
) -> Result<()> {
    let targets: Vec<&EpisodeEntry> = if args.whole_show {
        println!("Queueing whole show: {}", item.title);
        episodes.iter().collect()
    } else {
        let requested = requested_episodes(&args.episodes)?;
        if requested.is_empty() {
            return Err(StreamError::InvalidInput(
                "pass --episode or --whole-show to download".to_string(),
            ));
        }
        crate::catalog::select_episodes(episodes, &requested)?
    };
    let plan = FetchPlan::new(ctx, &args.output, &item.title, false);
    download_episodes(ctx, &ctx.anime, session, item, &targets, &plan, pref).await
}

/// Download series episodes: the `--episode` list, else the whole season.
pub(crate) async fn series(
    ctx: &Context,
    session: &SessionContext,
    item: &CatalogItem,
    episodes: &[EpisodeEntry],
    args: &SeriesArgs,
) -> Result<()> {
    let requested = requested_episodes(&args.episodes)?;
    let targets: Vec<&EpisodeEntry> = if requested.is_empty() {
        episodes.iter().collect()
    } else {
        crate::catalog::select_episodes(episodes, &requested)?
    };
    let plan = FetchPlan::new(ctx, &args.output, &item.title, args.subs);
    let pref = VariantPreference::default();
    download_episodes(ctx, &ctx.flix, session, item, &targets, &plan, &pref).await
}

pub(crate) async fn movie(
    ctx: &Context,
    session: &SessionContext,
    item: &CatalogItem,
    args: &MovieArgs,
) -> Result<()> {
    let plan = FetchPlan::new(ctx, &args.output, &item.title, args.subs);
    let descriptor = ctx.flix.stream(session, item, None).await?;
    let stream = ctx
        .resolve(&descriptor, &session.cookie, &VariantPreference::default())
        .await?
        .ok_or_else(|| StreamError::NotFound(format!("no stream available for {}", item.title)))?;
    let name = clean_title(&item.title);
    download_stream(&ctx.downloader(), &plan, &name, &stream).await?;
    Ok(())
}

/// Download episodes one at a time in catalog order. With more than one
/// episode, skippable failures are logged and the batch goes on.
async fn download_episodes(
    ctx: &Context,
    provider: &dyn CatalogProvider,
    session: &SessionContext,
    item: &CatalogItem,
    targets: &[&EpisodeEntry],
    plan: &FetchPlan,
    pref: &VariantPreference,
) -> Result<()> {
    let downloader = ctx.downloader();
    let batch = targets.len() > 1;
    let mut saved = 0;

    for &episode in targets {
        let result = async {
            let descriptor = provider.stream(session, item, Some(episode)).await?;
            let stream = ctx
                .resolve(&descriptor, &session.cookie, pref)
                .await?
                .ok_or_else(|| {
                    StreamError::NotFound(format!("no stream available for {}", episode.label()))
                })?;
            let name = episode_file_name(&item.title, episode, plan.folder);
            download_stream(&downloader, plan, &name, &stream).await
        }
        .await;

        match result {
            Ok(_) => saved += 1,
            Err(e) if batch && e.is_skippable() => {
                tracing::warn!("Unable to download {}: {}", episode.label(), e);
            }
            Err(e) => return Err(e),
        }
    }

    if batch {
        println!("Downloaded {} of {} episode(s) to {}", saved, targets.len(), plan.dest.display());
    }
    Ok(())
}

async fn download_stream(
    downloader: &Downloader,
    plan: &FetchPlan,
    name: &str,
    stream: &ResolvedStream,
) -> Result<PathBuf> {
    let job = DownloadJob {
        dest_dir: plan.dest.clone(),
        name: name.to_string(),
        url: stream.media_url.clone(),
        referer: Some(stream.referer.clone()),
        recode_audio: plan.recode_audio,
        subtitles: if plan.subtitles {
            stream.subtitles.clone()
        } else {
            Vec::new()
        },
    };
    let (tx, rx) = mpsc::unbounded_channel();
    let render = tokio::spawn(render_progress(rx, name.to_string()));
    let result = downloader.download(&job, Some(tx)).await;
    let _ = render.await;

    if let Ok(path) = &result {
        println!("Saved: {}", path.display());
        if !job.subtitles.is_empty() {
            println!("Subtitle tracks: {}", job.subtitles.len());
        }
    }
    result
}

/// Draw download events as a progress bar, or a spinner when the backend
/// cannot report percentages.
async fn render_progress(mut rx: mpsc::UnboundedReceiver<DownloadEvent>, label: String) {
    let bar = ProgressBar::new(1000);
    bar.set_style(
        ProgressStyle::with_template("{msg:30!} [{bar:40.cyan/blue}] {percent:>3}%")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.set_message(label.clone());

    while let Some(event) = rx.recv().await {
        match event {
            DownloadEvent::Started { measurable: false, .. } => {
                bar.set_style(
                    ProgressStyle::with_template("{spinner:.blue} {msg} {elapsed}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                bar.enable_steady_tick(Duration::from_millis(120));
            }
            DownloadEvent::Started { .. } => {}
            DownloadEvent::Progress(pct) => bar.set_position((pct * 10.0).round() as u64),
            DownloadEvent::PostProcessing(what) => bar.set_message(format!("{label} ({what})")),
            DownloadEvent::Finished(_) => {
                bar.set_position(1000);
                bar.finish_with_message(label.clone());
            }
        }
    }
    if !bar.is_finished() {
        bar.abandon();
    }
}
