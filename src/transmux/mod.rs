//! Transmux cache
//!
//! Repackaged HLS outputs live under `<cache_root>/<key>/`, where the key is
//! the MD5 of `(source, audio, resolution, mode)`. Two modes:
//!
//! - **event**: ffmpeg is started in the background and the growing playlist
//!   is served while it runs. One process per key.
//! - **vod**: the requester waits for ffmpeg to finish. Concurrent requests
//!   for a key share one run.
//!
//! Entries are leased by consumers and evicted by [`TransmuxManager::sweep`]
//! once unleased and idle for longer than the TTL.

pub mod ffmpeg;

use dashmap::DashMap;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::{oneshot, OnceCell};
use tokio::task::JoinHandle;

use self::ffmpeg::{TransmuxArgs, MASTER_PLAYLIST, MEDIA_PLAYLIST};
use crate::config::TransmuxConfig;
use crate::error::{Result, StreamError};
use crate::playlist::count_segments;

/// Growing or complete output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmuxMode {
    Event,
    Vod,
}

impl TransmuxMode {
    fn key_suffix(self) -> &'static str {
        match self {
            TransmuxMode::Event => "event",
            TransmuxMode::Vod => "full",
        }
    }
}

/// Source to repackage.
#[derive(Debug, Clone, Default)]
pub struct TransmuxRequest {
    pub source_url: String,
    /// Referer for ffmpeg's upstream fetches; the source URL when absent
    pub referer: Option<String>,
    pub audio: Option<String>,
    pub resolution: Option<String>,
}

impl TransmuxRequest {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            ..Default::default()
        }
    }

    /// Deterministic cache key for this request in `mode`.
    pub fn cache_key(&self, mode: TransmuxMode) -> String {
        let material = format!(
            "{}|{}|{}|{}",
            self.source_url,
            self.audio.as_deref().unwrap_or(""),
            self.resolution.as_deref().unwrap_or(""),
            mode.key_suffix()
        );
        format!("{:x}", Md5::digest(material.as_bytes()))
    }
}

/// Where a transmux output can be found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransmuxOutput {
    pub key: String,
    /// Server-relative URL of the master playlist
    pub url: String,
    pub master_path: PathBuf,
    pub media_path: PathBuf,
}

struct RunningProcess {
    id: u64,
    kill: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
}

struct CacheEntry {
    mode: TransmuxMode,
    refs: AtomicUsize,
    last_seen: Mutex<Instant>,
    process: Mutex<Option<RunningProcess>>,
    vod_run: Arc<OnceCell<()>>,
}

impl CacheEntry {
    fn new(mode: TransmuxMode) -> Self {
        Self {
            mode,
            refs: AtomicUsize::new(0),
            last_seen: Mutex::new(Instant::now()),
            process: Mutex::new(None),
            vod_run: Arc::new(OnceCell::new()),
        }
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Ask the running process to stop; returns its watcher to await.
    fn signal_kill(&self) -> Option<JoinHandle<()>> {
        let mut slot = self.process.lock();
        let process = slot.as_mut()?;
        if let Some(kill) = process.kill.take() {
            let _ = kill.send(());
        }
        process.watcher.take()
    }
}

/// Holds a cache key alive while a consumer uses it.
pub struct CacheLease {
    entry: Arc<CacheEntry>,
    key: String,
}

impl CacheLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        self.entry.refs.fetch_sub(1, Ordering::SeqCst);
        self.entry.touch();
    }
}

/// Snapshot of one cache key for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryStats {
    pub key: String,
    pub mode: TransmuxMode,
    pub consumers: usize,
    pub idle_secs: u64,
    pub running: bool,
}

/// On-disk transmux cache and ffmpeg process registry.
pub struct TransmuxManager {
    config: TransmuxConfig,
    ffmpeg: String,
    user_agent: String,
    entries: DashMap<String, Arc<CacheEntry>>,
    next_process_id: AtomicU64,
    spawned: AtomicU64,
}

impl TransmuxManager {
    pub fn new(config: TransmuxConfig, ffmpeg: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            config,
            ffmpeg: ffmpeg.into(),
            user_agent: user_agent.into(),
            entries: DashMap::new(),
            next_process_id: AtomicU64::new(1),
            spawned: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TransmuxConfig {
        &self.config
    }

    pub fn key_dir(&self, key: &str) -> PathBuf {
        self.config.cache_root.join(key)
    }

    /// Number of ffmpeg processes started since creation.
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    fn output(&self, key: &str) -> TransmuxOutput {
        let dir = self.key_dir(key);
        TransmuxOutput {
            key: key.to_string(),
            url: format!("/cache/{}/{}", key, MASTER_PLAYLIST),
            master_path: dir.join(MASTER_PLAYLIST),
            media_path: dir.join(MEDIA_PLAYLIST),
        }
    }

    /// Look up or create the entry for `key` and touch it while the map
    /// slot is held, so a concurrent sweep sees either nothing or a fresh entry.
    fn entry(&self, key: &str, mode: TransmuxMode) -> Arc<CacheEntry> {
        let slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CacheEntry::new(mode)));
        slot.touch();
        slot.clone()
    }

    /// Like [`entry`](Self::entry), also taking a lease under the same guard.
    fn lease(&self, key: &str, mode: TransmuxMode) -> CacheLease {
        let slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CacheEntry::new(mode)));
        slot.refs.fetch_add(1, Ordering::SeqCst);
        slot.touch();
        CacheLease {
            entry: slot.clone(),
            key: key.to_string(),
        }
    }

    /// Start (or reuse) a background event-mode transmux and return at once.
    pub fn ensure_start(&self, request: &TransmuxRequest) -> Result<TransmuxOutput> {
        let key = request.cache_key(TransmuxMode::Event);
        let output = self.output(&key);
        let entry = self.entry(&key, TransmuxMode::Event);

        let mut process = entry.process.lock();
        if process.is_some() {
            tracing::debug!(key = %key, "Transmux already running");
            return Ok(output);
        }
        if output.master_path.exists() {
            tracing::debug!(key = %key, "Transmux output already present");
            return Ok(output);
        }

        let dir = self.key_dir(&key);
        std::fs::create_dir_all(&dir)?;
        let referer = request.referer.as_deref().unwrap_or(&request.source_url);
        let args = ffmpeg::transmux_args(
            &TransmuxArgs {
                input: &request.source_url,
                referer,
                user_agent: &self.user_agent,
                output_dir: &dir,
                mode: TransmuxMode::Event,
            },
            &self.config,
        );

        let mut child = ffmpeg::command(&self.ffmpeg, &args)
            .spawn()
            .map_err(|source| StreamError::Spawn {
                program: self.ffmpeg.clone(),
                source,
            })?;
        self.spawned.fetch_add(1, Ordering::SeqCst);
        if let Some(stderr) = child.stderr.take() {
            ffmpeg::forward_stderr(stderr, key.clone());
        }

        let id = self.next_process_id.fetch_add(1, Ordering::SeqCst);
        let (kill_tx, kill_rx) = oneshot::channel();
        let watched = entry.clone();
        let watch_key = key.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => tracing::info!(key = %watch_key, "Transmux exited: {}", status),
                    Err(e) => tracing::warn!(key = %watch_key, "Transmux wait failed: {}", e),
                },
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(key = %watch_key, "Failed to kill transmux: {}", e);
                    }
                    tracing::info!(key = %watch_key, "Transmux terminated");
                }
            }
            let mut slot = watched.process.lock();
            if slot.as_ref().is_some_and(|p| p.id == id) {
                *slot = None;
            }
        });

        *process = Some(RunningProcess {
            id,
            kill: Some(kill_tx),
            watcher: Some(watcher),
        });
        tracing::info!(key = %key, "Transmux started for {}", request.source_url);
        Ok(output)
    }

    /// Produce a complete vod-mode output, waiting for ffmpeg to finish.
    pub async fn ensure_full(&self, request: &TransmuxRequest) -> Result<TransmuxOutput> {
        let key = request.cache_key(TransmuxMode::Vod);
        let output = self.output(&key);
        // the waiting requester is a consumer until ffmpeg is done
        let lease = self.lease(&key, TransmuxMode::Vod);

        if output.master_path.exists() {
            return Ok(output);
        }

        let run = lease.entry.vod_run.clone();
        run.get_or_try_init(|| self.run_full(request, &key)).await?;
        Ok(output)
    }

    async fn run_full(&self, request: &TransmuxRequest, key: &str) -> Result<()> {
        let dir = self.key_dir(key);
        tokio::fs::create_dir_all(&dir).await?;
        let referer = request.referer.as_deref().unwrap_or(&request.source_url);
        let args = ffmpeg::transmux_args(
            &TransmuxArgs {
                input: &request.source_url,
                referer,
                user_agent: &self.user_agent,
                output_dir: &dir,
                mode: TransmuxMode::Vod,
            },
            &self.config,
        );

        tracing::info!(key = %key, "Full transmux of {}", request.source_url);
        let mut child = ffmpeg::command(&self.ffmpeg, &args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StreamError::Spawn {
                program: self.ffmpeg.clone(),
                source,
            })?;
        self.spawned.fetch_add(1, Ordering::SeqCst);

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_string(&mut stderr).await?;
        }
        let status = child.wait().await?;

        let master = dir.join(MASTER_PLAYLIST);
        if status.success() && tokio::fs::try_exists(&master).await.unwrap_or(false) {
            tracing::info!(key = %key, "Full transmux complete");
            Ok(())
        } else {
            Err(StreamError::ExternalProcess {
                program: self.ffmpeg.clone(),
                code: status.code(),
                stderr: stderr.trim().to_string(),
            })
        }
    }

    /// Lease `key` for the lifetime of the returned guard.
    pub fn acquire(&self, key: &str) -> Option<CacheLease> {
        let entry = self.entries.get(key)?.clone();
        entry.refs.fetch_add(1, Ordering::SeqCst);
        entry.touch();
        Some(CacheLease {
            entry,
            key: key.to_string(),
        })
    }

    /// Mark `key` as used now.
    pub fn touch(&self, key: &str) {
        if let Some(entry) = self.entries.get(key) {
            entry.touch();
        }
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.process.lock().is_some())
    }

    /// Evict every unleased key idle for longer than the TTL.
    pub async fn sweep(&self) -> usize {
        let ttl = self.config.ttl();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.refs.load(Ordering::SeqCst) == 0 && e.idle() > ttl)
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for key in expired {
            let removed = self
                .entries
                .remove_if(&key, |_, e| e.refs.load(Ordering::SeqCst) == 0 && e.idle() > ttl);
            if let Some((_, entry)) = removed {
                self.evict(&key, &entry).await;
                evicted += 1;
            }
        }
        evicted
    }

    async fn evict(&self, key: &str, entry: &CacheEntry) {
        if let Some(watcher) = entry.signal_kill() {
            let _ = tokio::time::timeout(Duration::from_secs(5), watcher).await;
        }
        match tokio::fs::remove_dir_all(self.key_dir(key)).await {
            Ok(()) => tracing::info!(key = %key, "Evicted transmux cache entry"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(key = %key, "Failed to remove cache directory: {}", e),
        }
    }

    /// Terminate every running ffmpeg process. Outputs stay on disk.
    pub async fn shutdown(&self) {
        let watchers: Vec<JoinHandle<()>> = self
            .entries
            .iter()
            .filter_map(|e| e.signal_kill())
            .collect();
        for watcher in watchers {
            let _ = tokio::time::timeout(Duration::from_secs(2), watcher).await;
        }
    }

    pub fn stats(&self) -> Vec<CacheEntryStats> {
        self.entries
            .iter()
            .map(|e| CacheEntryStats {
                key: e.key().clone(),
                mode: e.mode,
                consumers: e.refs.load(Ordering::SeqCst),
                idle_secs: e.idle().as_secs(),
                running: e.process.lock().is_some(),
            })
            .collect()
    }
}

/// Poll a media playlist until it lists `min_segments` segments.
///
/// Returns `false` on timeout; callers may start playback anyway.
pub async fn wait_for_segments(
    playlist: &Path,
    min_segments: usize,
    timeout: Duration,
    interval: Duration,
) -> bool {
    let started = Instant::now();
    loop {
        if let Ok(content) = tokio::fs::read_to_string(playlist).await {
            if count_segments(&content) >= min_segments {
                return true;
            }
        }
        if started.elapsed() >= timeout {
            tracing::debug!("Timed out waiting for segments in {}", playlist.display());
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}
