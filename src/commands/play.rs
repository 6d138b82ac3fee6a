//! Playback commands.

use crate::catalog::anime::new_cookie;
use crate::catalog::{CatalogItem, CatalogProvider, EpisodeEntry, ItemKind, SessionContext};
use crate::cli::{AnimeArgs, MovieArgs, SeriesArgs};
use crate::error::{Result, StreamError};
use crate::history::HistoryEntry;
use crate::player::{PlayRequest, PlaybackOutcome, StopMode};
use crate::resolver::{ResolvedStream, VariantPreference};

use super::{fetch, requested_episodes, search_and_pick, season_episodes, Context};

/// `streamweb anime`
pub async fn anime(ctx: &Context, args: &AnimeArgs) -> Result<()> {
    let mut session = SessionContext::new(new_cookie());
    let item = search_and_pick(&ctx.anime, &mut session, &args.search, None).await?;
    let episodes = ctx.anime.episodes(&session, &item, None).await?;
    println!("{}: {} episode(s)", item.title, episodes.len());
    let pref = VariantPreference::new(args.audio.as_deref(), args.resolution.as_deref());

    if args.output.download || args.whole_show {
        return fetch::anime(ctx, &session, &item, &episodes, args, &pref).await;
    }

    let settings = ctx.settings();
    let requested = requested_episodes(&args.episodes)?;
    let autoplay = args.autoplay || settings.autoplay_next;
    let queue = play_queue(&episodes, &requested, autoplay, settings.skip_fillers)?;
    let queued: Vec<&EpisodeEntry> = queue.iter().map(|&i| &episodes[i]).collect();
    play_episodes(ctx, &ctx.anime, &session, &item, &queued, &pref, args.transmux).await
}

/// `streamweb series`
pub async fn series(ctx: &Context, args: &SeriesArgs) -> Result<()> {
    let mut session = SessionContext::default();
    let item = search_and_pick(&ctx.flix, &mut session, &args.search, Some(ItemKind::Series)).await?;
    let (season, episodes) = season_episodes(ctx, &session, &item, args.season).await?;
    println!("{} {}: {} episode(s)", item.title, season.title, episodes.len());

    if args.output.download {
        return fetch::series(ctx, &session, &item, &episodes, args).await;
    }

    let settings = ctx.settings();
    let requested = requested_episodes(&args.episodes)?;
    let queue = play_queue(&episodes, &requested, settings.autoplay_next, false)?;
    let queued: Vec<&EpisodeEntry> = queue.iter().map(|&i| &episodes[i]).collect();
    play_episodes(ctx, &ctx.flix, &session, &item, &queued, &VariantPreference::default(), false).await
}

/// `streamweb movie`
pub async fn movie(ctx: &Context, args: &MovieArgs) -> Result<()> {
    let mut session = SessionContext::default();
    let item = search_and_pick(&ctx.flix, &mut session, &args.search, Some(ItemKind::Movie)).await?;

    if args.output.download {
        return fetch::movie(ctx, &session, &item, args).await;
    }

    let descriptor = ctx.flix.stream(&session, &item, None).await?;
    let stream = ctx
        .resolve(&descriptor, &session.cookie, &VariantPreference::default())
        .await?
        .ok_or_else(|| StreamError::NotFound(format!("no stream available for {}", item.title)))?;
    play_stream(ctx, &item, None, &stream, false).await?;
    Ok(())
}

/// Indices of the episodes to play, in order.
///
/// The requested episodes (or the first one when none are given), then with
/// `autoplay` every later episode. Fillers among the later episodes are
/// left out when `skip_fillers` is set.
pub fn play_queue(
    episodes: &[EpisodeEntry],
    requested: &[u32],
    autoplay: bool,
    skip_fillers: bool,
) -> Result<Vec<usize>> {
    if episodes.is_empty() {
        return Err(StreamError::NotFound("no episodes".to_string()));
    }
    let mut queue = Vec::new();
    if requested.is_empty() {
        queue.push(0);
    }
    for n in requested {
        let idx = episodes.iter().position(|e| e.number == *n).ok_or_else(|| {
            StreamError::NotFound(format!("episode {} (only {} available)", n, episodes.len()))
        })?;
        queue.push(idx);
    }
    if autoplay {
        let last = queue.iter().copied().max().unwrap_or(0);
        queue.extend(
            (last + 1..episodes.len()).filter(|&i| !(skip_fillers && episodes[i].filler)),
        );
    }
    Ok(queue)
}

async fn play_episodes(
    ctx: &Context,
    provider: &dyn CatalogProvider,
    session: &SessionContext,
    item: &CatalogItem,
    queue: &[&EpisodeEntry],
    pref: &VariantPreference,
    transmux: bool,
) -> Result<()> {
    let batch = queue.len() > 1;
    for (i, &episode) in queue.iter().enumerate() {
        if i > 0 {
            println!("Autoplaying next: {}", episode.label());
        }
        let resolved = match provider.stream(session, item, Some(episode)).await {
            Ok(descriptor) => ctx.resolve(&descriptor, &session.cookie, pref).await,
            Err(e) => Err(e),
        };
        let stream = match resolved {
            Ok(Some(stream)) => stream,
            Ok(None) => {
                let err = StreamError::NotFound(format!("no stream available for {}", episode.label()));
                if !batch {
                    return Err(err);
                }
                tracing::warn!("Skipping: {}", err);
                continue;
            }
            Err(e) if batch && e.is_skippable() => {
                tracing::warn!("Skipping {}: {}", episode.label(), e);
                continue;
            }
            Err(e) => return Err(e),
        };

        let outcome = play_stream(ctx, item, Some(episode), &stream, transmux).await?;
        match outcome.stop_mode {
            Some(StopMode::Quit) => {
                if ctx.settings().autoplay_next {
                    if let Err(e) = ctx.update_settings(|s| {
                        s.autoplay_next = false;
                        Ok(())
                    }) {
                        tracing::warn!("Could not save settings: {}", e);
                    }
                }
                println!("Autoplay stopped.");
                break;
            }
            Some(StopMode::StopOnly) => {
                println!("Autoplay stopped.");
                break;
            }
            None => {}
        }
    }
    Ok(())
}

/// Play one resolved stream, resuming from history, and record where
/// playback ended.
pub(crate) async fn play_stream(
    ctx: &Context,
    item: &CatalogItem,
    episode: Option<&EpisodeEntry>,
    stream: &ResolvedStream,
    transmux: bool,
) -> Result<PlaybackOutcome> {
    let mut entry = HistoryEntry {
        title: item.title.clone(),
        url: item.url.clone(),
        season: episode.and_then(|e| e.season),
        episode: episode.map(|e| e.number),
        label: episode.map(EpisodeEntry::label),
        audio: stream.variant.as_ref().map(|v| v.audio.clone()),
        resolution: stream.variant.as_ref().map(|v| v.resolution.clone()),
        position: 0,
        ts: 0,
    };
    let key = entry.key();
    let start_at = ctx
        .history
        .read()
        .into_iter()
        .find(|e| e.key() == key)
        .map(|e| e.position)
        .unwrap_or(0);
    if start_at > 0 {
        println!("Resuming at {}s", start_at);
    }

    let title = match episode {
        Some(ep) => format!("{} - {}", item.title, ep.label()),
        None => item.title.clone(),
    };
    let (url, referer, _lease) = if transmux {
        let (url, lease) = ctx.transmux_url(stream).await?;
        (url, None, lease)
    } else {
        (stream.media_url.clone(), Some(stream.referer.clone()), None)
    };

    let request = PlayRequest {
        url,
        title,
        referer,
        subtitles: stream.subtitles.clone(),
        start_at,
    };
    let outcome = ctx.player().play(&request).await?;

    entry.position = outcome.position;
    if let Err(e) = ctx.history.record(entry) {
        tracing::warn!("Could not save history: {}", e);
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn episodes() -> Vec<EpisodeEntry> {
        (1..=6)
            .map(|n| EpisodeEntry {
                id: format!("s{n}"),
                number: n,
                title: None,
                season: None,
                filler: n == 4,
            })
            .collect()
    }

    #[test]
    fn test_queue_defaults_to_first_episode() {
        assert_eq!(play_queue(&episodes(), &[], false, false).unwrap(), vec![0]);
        assert!(play_queue(&[], &[], false, false).is_err());
    }

    #[test]
    fn test_queue_requested() {
        assert_eq!(play_queue(&episodes(), &[2, 3], false, false).unwrap(), vec![1, 2]);
        assert!(matches!(
            play_queue(&episodes(), &[9], false, false),
            Err(StreamError::NotFound(_))
        ));
    }

    #[test]
    fn test_queue_autoplay_skips_fillers() {
        assert_eq!(play_queue(&episodes(), &[3], true, false).unwrap(), vec![2, 3, 4, 5]);
        assert_eq!(play_queue(&episodes(), &[3], true, true).unwrap(), vec![2, 4, 5]);
        assert_eq!(play_queue(&episodes(), &[6], true, true).unwrap(), vec![5]);
    }
}
