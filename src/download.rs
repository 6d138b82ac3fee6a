//! Download orchestration
//!
//! Streams are saved as `<dest>/<sanitized name>.mp4` with yt-dlp when it is
//! installed, else with ffmpeg stream copy. Optional post passes re-encode
//! the audio to AAC and mux subtitle tracks in. Every in-flight output is
//! registered so an interrupt can delete partial files.

use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::header::{REFERER, USER_AGENT};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, OnceCell};

use crate::config::{DownloadConfig, ToolsConfig};
use crate::error::{Result, StreamError};
use crate::http::proxy::origin_of;
use crate::playlist::total_duration;

const RECODE_SUFFIX: &str = ".recode.tmp.mp4";
const SUBS_SUFFIX: &str = ".subs.tmp.mp4";
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    YtDlp,
    Ffmpeg,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Started {
        backend: Backend,
        output: PathBuf,
        /// Whether percentages will follow
        measurable: bool,
    },
    Progress(f64),
    PostProcessing(&'static str),
    Finished(PathBuf),
}

pub type ProgressSender = mpsc::UnboundedSender<DownloadEvent>;

#[derive(Debug, Clone, Default)]
pub struct DownloadJob {
    pub dest_dir: PathBuf,
    /// File stem before sanitizing
    pub name: String,
    pub url: String,
    pub referer: Option<String>,
    pub recode_audio: bool,
    /// Subtitle URLs to mux as `mov_text` tracks
    pub subtitles: Vec<String>,
}

impl DownloadJob {
    pub fn output_path(&self) -> PathBuf {
        self.dest_dir
            .join(format!("{}.mp4", sanitize_filename(&self.name)))
    }
}

/// `\s+` to `-`, quotes dropped, anything outside `[A-Za-z0-9-_.]` removed.
pub fn sanitize_filename(name: &str) -> String {
    let dashed = regex!(r"\s+").replace_all(name, "-");
    let safe: String = dashed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    if safe.is_empty() {
        "download".to_string()
    } else {
        safe
    }
}

/// Temp files a download of `output` may leave behind.
fn is_temp_sibling(output_name: &str, candidate: &str) -> bool {
    candidate.starts_with(output_name)
        && candidate != output_name
        && (candidate.ends_with(".part")
            || candidate.ends_with(".tmp")
            || candidate.ends_with(".ytdl")
            || candidate.ends_with(RECODE_SUFFIX)
            || candidate.ends_with(SUBS_SUFFIX)
            || candidate.contains(".part-Frag"))
}

/// Remove the temp siblings of `output`. Returns how many were removed.
pub fn clean_temp_files(output: &Path) -> usize {
    let (Some(dir), Some(name)) = (output.parent(), output.file_name().and_then(|n| n.to_str()))
    else {
        return 0;
    };
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|candidate| is_temp_sibling(name, candidate))
        })
        .filter(|entry| std::fs::remove_file(entry.path()).is_ok())
        .count()
}

/// Outputs of downloads in progress.
#[derive(Debug, Clone, Default)]
pub struct DownloadRegistry {
    outputs: Arc<DashMap<u64, PathBuf>>,
    next_id: Arc<AtomicU64>,
}

/// Unregisters its output when dropped. A guard dropped before
/// [`complete`](DownloadGuard::complete) deletes the output and its temp
/// files, which covers downloads cancelled mid-flight.
#[derive(Debug)]
pub struct DownloadGuard {
    registry: DownloadRegistry,
    id: u64,
    completed: bool,
}

impl DownloadGuard {
    /// Keep the output.
    pub fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        if let Some((_, output)) = self.registry.outputs.remove(&self.id) {
            if !self.completed {
                remove_partial(&output);
            }
        }
    }
}

fn remove_partial(output: &Path) {
    let _ = std::fs::remove_file(output);
    clean_temp_files(output);
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, output: PathBuf) -> DownloadGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.outputs.insert(id, output);
        DownloadGuard {
            registry: self.clone(),
            id,
            completed: false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.outputs.len()
    }

    /// Delete the partial and final files of every registered download.
    pub fn cleanup_all(&self) -> usize {
        let outputs: Vec<PathBuf> = self.outputs.iter().map(|e| e.value().clone()).collect();
        self.outputs.clear();
        for output in &outputs {
            remove_partial(output);
            tracing::info!("Removed partial download {}", output.display());
        }
        outputs.len()
    }
}

/// Emits a percentage only when it moved by at least `step`.
struct ProgressThrottle {
    last: Mutex<f64>,
    step: f64,
    tx: Option<ProgressSender>,
}

impl ProgressThrottle {
    fn new(step: f64, tx: Option<ProgressSender>) -> Self {
        Self {
            last: Mutex::new(0.0),
            step,
            tx,
        }
    }

    fn update(&self, percent: f64) {
        let percent = percent.clamp(0.0, 100.0);
        let mut last = self.last.lock();
        if (percent - *last).abs() >= self.step {
            *last = percent;
            self.send(DownloadEvent::Progress(percent));
        }
    }

    fn send(&self, event: DownloadEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Percentage from a yt-dlp output line: the last `NN.N%` token, else a
/// `frag X/Y` counter.
pub fn parse_ytdlp_progress(line: &str) -> Option<f64> {
    let pct = regex!(r"(\d{1,3}(?:\.\d+)?)%")
        .captures_iter(line)
        .last()
        .and_then(|caps| caps[1].parse::<f64>().ok());
    if pct.is_some() {
        return pct;
    }
    let caps = regex!(r"(?i)frag\D*(\d+)\D*(\d+)").captures(line)?;
    let current: f64 = caps[1].parse().ok()?;
    let total: f64 = caps[2].parse().ok()?;
    (total > 0.0).then(|| current / total * 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FfmpegProgress {
    /// Output timestamp in seconds
    OutTime(f64),
    End,
}

/// One `key=value` line of `ffmpeg -progress`.
///
/// `out_time_ms` is in microseconds, like `out_time_us`.
pub fn parse_ffmpeg_progress(line: &str) -> Option<FfmpegProgress> {
    let (key, value) = line.split_once('=')?;
    match (key.trim(), value.trim()) {
        ("out_time_us" | "out_time_ms", v) => v
            .parse::<i64>()
            .ok()
            .filter(|us| *us >= 0)
            .map(|us| FfmpegProgress::OutTime(us as f64 / 1_000_000.0)),
        ("progress", "end") => Some(FfmpegProgress::End),
        _ => None,
    }
}

pub struct Downloader {
    client: reqwest::Client,
    tools: ToolsConfig,
    config: DownloadConfig,
    user_agent: String,
    registry: DownloadRegistry,
    backend: OnceCell<Backend>,
}

impl Downloader {
    pub fn new(
        client: reqwest::Client,
        tools: ToolsConfig,
        config: DownloadConfig,
        user_agent: impl Into<String>,
        registry: DownloadRegistry,
    ) -> Self {
        Self {
            client,
            tools,
            config,
            user_agent: user_agent.into(),
            registry,
            backend: OnceCell::new(),
        }
    }

    pub fn registry(&self) -> &DownloadRegistry {
        &self.registry
    }

    /// yt-dlp when `yt-dlp --version` succeeds, else ffmpeg.
    pub async fn backend(&self) -> Backend {
        *self
            .backend
            .get_or_init(|| async {
                let available = Command::new(&self.tools.ytdlp)
                    .arg("--version")
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await
                    .map(|s| s.success())
                    .unwrap_or(false);
                let backend = if available { Backend::YtDlp } else { Backend::Ffmpeg };
                tracing::debug!("Download backend: {:?}", backend);
                backend
            })
            .await
    }

    fn origin_for(referer: Option<&str>) -> Option<String> {
        referer.and_then(origin_of)
    }

    pub fn ytdlp_args(&self, job: &DownloadJob, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-o".into(),
            output.to_string_lossy().into_owned(),
            job.url.clone(),
            "--no-part".into(),
            "--newline".into(),
            "--concurrent-fragments".into(),
            self.config.concurrent_fragments.to_string(),
            "--fragment-retries".into(),
            self.config.retries.to_string(),
            "--retries".into(),
            self.config.retries.to_string(),
            "--socket-timeout".into(),
            self.config.socket_timeout_secs.to_string(),
        ];
        if let Some(referer) = job.referer.as_deref().filter(|r| !r.is_empty()) {
            args.extend([
                "--add-header".into(),
                format!("Referer: {referer}"),
                "--referer".into(),
                referer.to_string(),
            ]);
            if let Some(origin) = Self::origin_for(Some(referer)) {
                args.extend(["--add-header".into(), format!("Origin: {origin}")]);
            }
        }
        args.extend(["--add-header".into(), format!("User-Agent: {}", self.user_agent)]);
        args
    }

    pub fn ffmpeg_args(&self, job: &DownloadJob, output: &Path) -> Vec<String> {
        let referer = job.referer.as_deref().filter(|r| !r.is_empty());
        let mut headers = String::new();
        if let Some(referer) = referer {
            headers.push_str(&format!("Referer: {referer}\r\n"));
        }
        headers.push_str(&format!("User-Agent: {}\r\n", self.user_agent));
        if let Some(origin) = Self::origin_for(referer) {
            headers.push_str(&format!("Origin: {origin}\r\n"));
        }

        let mut args: Vec<String> = vec![
            "-y".into(),
            "-loglevel".into(),
            "error".into(),
            "-headers".into(),
            headers,
        ];
        if let Some(referer) = referer {
            args.extend(["-referer".into(), referer.to_string()]);
        }
        args.extend([
            "-i".into(),
            job.url.clone(),
            "-c".into(),
            "copy".into(),
            "-threads".into(),
            "4".into(),
            "-progress".into(),
            "pipe:1".into(),
            output.to_string_lossy().into_owned(),
        ]);
        args
    }

    pub fn recode_args(&self, input: &Path, tmp: &Path) -> Vec<String> {
        vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            input.to_string_lossy().into_owned(),
            "-c:v".into(),
            "copy".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            self.config.recode_audio_bitrate.clone(),
            tmp.to_string_lossy().into_owned(),
        ]
    }

    pub fn subtitle_args(&self, input: &Path, subtitles: &[String], tmp: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            input.to_string_lossy().into_owned(),
        ];
        for sub in subtitles {
            args.extend(["-i".into(), sub.clone()]);
        }
        args.extend(["-map".into(), "0:v?".into(), "-map".into(), "0:a?".into()]);
        for i in 1..=subtitles.len() {
            args.extend(["-map".into(), format!("{i}:s?")]);
        }
        args.extend([
            "-c".into(),
            "copy".into(),
            "-c:s".into(),
            "mov_text".into(),
            tmp.to_string_lossy().into_owned(),
        ]);
        args
    }

    /// Total media duration from the playlist's `#EXTINF` entries.
    pub async fn estimate_duration(&self, url: &str, referer: Option<&str>) -> Option<f64> {
        let mut request = self.client.get(url).header(USER_AGENT, self.user_agent.as_str());
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }
        let text = request.send().await.ok()?.error_for_status().ok()?.text().await.ok()?;
        Some(total_duration(&text)).filter(|d| *d >= 1.0)
    }

    /// Download `job` and return the output path.
    pub async fn download(&self, job: &DownloadJob, progress: Option<ProgressSender>) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&job.dest_dir).await?;
        let output = job.output_path();
        let guard = self.registry.register(output.clone());
        let backend = self.backend().await;

        let result = match backend {
            Backend::YtDlp => self.fetch_with_ytdlp(job, &output, progress.clone()).await,
            Backend::Ffmpeg => self.fetch_with_ffmpeg(job, &output, progress.clone()).await,
        };
        // a failed download is removed by the guard
        result?;

        let notify = |event| {
            if let Some(tx) = &progress {
                let _ = tx.send(event);
            }
        };
        if job.recode_audio {
            notify(DownloadEvent::PostProcessing("re-encoding audio"));
            self.post_process(&output, RECODE_SUFFIX, |tmp| self.recode_args(&output, tmp))
                .await;
        }
        if !job.subtitles.is_empty() {
            notify(DownloadEvent::PostProcessing("embedding subtitles"));
            self.post_process(&output, SUBS_SUFFIX, |tmp| {
                self.subtitle_args(&output, &job.subtitles, tmp)
            })
            .await;
        }
        clean_temp_files(&output);
        guard.complete();

        notify(DownloadEvent::Finished(output.clone()));
        tracing::info!("Downloaded {}", output.display());
        Ok(output)
    }

    async fn fetch_with_ytdlp(
        &self,
        job: &DownloadJob,
        output: &Path,
        progress: Option<ProgressSender>,
    ) -> Result<()> {
        let throttle = ProgressThrottle::new(1.0, progress);
        throttle.send(DownloadEvent::Started {
            backend: Backend::YtDlp,
            output: output.to_path_buf(),
            measurable: true,
        });
        let args = self.ytdlp_args(job, output);
        run_tool(&self.tools.ytdlp, &args, |line| {
            if let Some(pct) = parse_ytdlp_progress(line) {
                throttle.update(pct);
            }
        })
        .await?;
        throttle.update(100.0);
        Ok(())
    }

    async fn fetch_with_ffmpeg(
        &self,
        job: &DownloadJob,
        output: &Path,
        progress: Option<ProgressSender>,
    ) -> Result<()> {
        let duration = self.estimate_duration(&job.url, job.referer.as_deref()).await;
        let throttle = ProgressThrottle::new(0.1, progress);
        throttle.send(DownloadEvent::Started {
            backend: Backend::Ffmpeg,
            output: output.to_path_buf(),
            measurable: duration.is_some(),
        });
        let args = self.ffmpeg_args(job, output);
        run_tool(&self.tools.ffmpeg, &args, |line| match parse_ffmpeg_progress(line) {
            Some(FfmpegProgress::OutTime(secs)) => {
                if let Some(total) = duration {
                    throttle.update(secs / total * 100.0);
                }
            }
            Some(FfmpegProgress::End) => throttle.update(100.0),
            None => {}
        })
        .await
    }

    /// Run an ffmpeg pass from `output` into `<output><suffix>` and move the
    /// result over `output`. A failed pass keeps the original.
    async fn post_process(&self, output: &Path, suffix: &str, args: impl FnOnce(&Path) -> Vec<String>) {
        let mut tmp = output.as_os_str().to_owned();
        tmp.push(suffix);
        let tmp = PathBuf::from(tmp);

        let result = run_tool(&self.tools.ffmpeg, &args(&tmp), |_| {}).await;
        match result {
            Ok(()) => {
                if let Err(e) = tokio::fs::rename(&tmp, output).await {
                    tracing::warn!("Could not replace {}: {}", output.display(), e);
                }
            }
            Err(e) => tracing::warn!("Post-processing {} failed: {}", output.display(), e),
        }
        let _ = tokio::fs::remove_file(&tmp).await;
    }
}

/// Run a tool to completion, feeding every stdout and stderr line to
/// `on_line`. A non-zero exit carries the tail of stderr.
async fn run_tool(program: &str, args: &[String], on_line: impl Fn(&str)) -> Result<()> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| StreamError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let tail = Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES));

    let (_, _, status) = tokio::join!(
        read_lines(stdout, |line| on_line(line)),
        read_lines(stderr, |line| {
            on_line(line);
            let mut tail = tail.lock();
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        }),
        child.wait(),
    );

    let status = status?;
    if status.success() {
        return Ok(());
    }
    let stderr = tail.into_inner().into_iter().collect::<Vec<_>>().join("\n");
    Err(StreamError::ExternalProcess {
        program: program.to_string(),
        code: status.code(),
        stderr,
    })
}

async fn read_lines<R>(stream: Option<R>, mut on_line: impl FnMut(&str))
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else { return };
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end_matches('\r');
        if !line.is_empty() {
            on_line(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn downloader(tools: ToolsConfig) -> Downloader {
        Downloader::new(
            reqwest::Client::new(),
            tools,
            DownloadConfig::default(),
            "UA",
            DownloadRegistry::new(),
        )
    }

    fn job(dir: &Path) -> DownloadJob {
        DownloadJob {
            dest_dir: dir.to_path_buf(),
            name: "My Show_E01".into(),
            url: "http://127.0.0.1:9/index.m3u8".into(),
            referer: Some("https://kwik.cx".into()),
            recode_audio: false,
            subtitles: Vec::new(),
        }
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("Attack on \"Titan\"  S01E02"), "Attack-on-Titan-S01E02");
        assert_eq!(sanitize_filename("a/b:c?d.e"), "abcd.e");
        assert_eq!(sanitize_filename("***"), "download");
    }

    #[test]
    fn test_ytdlp_args() {
        let d = downloader(ToolsConfig::default());
        let args = d.ytdlp_args(&job(Path::new("/dl")), Path::new("/dl/x.mp4"));
        assert_eq!(&args[..4], &["-o", "/dl/x.mp4", "http://127.0.0.1:9/index.m3u8", "--no-part"]);
        assert!(args.windows(2).any(|w| w == ["--concurrent-fragments", "64"]));
        assert!(args.windows(2).any(|w| w == ["--add-header", "Referer: https://kwik.cx"]));
        assert!(args.windows(2).any(|w| w == ["--referer", "https://kwik.cx"]));
        assert!(args.windows(2).any(|w| w == ["--add-header", "Origin: https://kwik.cx"]));
        assert_eq!(args.last().unwrap(), "User-Agent: UA");
    }

    #[test]
    fn test_ffmpeg_args() {
        let d = downloader(ToolsConfig::default());
        let args = d.ffmpeg_args(&job(Path::new("/dl")), Path::new("/dl/x.mp4"));
        let headers = &args[args.iter().position(|a| a == "-headers").unwrap() + 1];
        assert_eq!(
            headers,
            "Referer: https://kwik.cx\r\nUser-Agent: UA\r\nOrigin: https://kwik.cx\r\n"
        );
        assert!(args.windows(2).any(|w| w == ["-progress", "pipe:1"]));
        assert!(args.windows(2).any(|w| w == ["-c", "copy"]));
        assert_eq!(args.last().unwrap(), "/dl/x.mp4");

        let recode = d.recode_args(Path::new("/dl/x.mp4"), Path::new("/dl/x.mp4.recode.tmp.mp4"));
        assert!(recode.windows(2).any(|w| w == ["-b:a", "192k"]));
        assert!(recode.windows(2).any(|w| w == ["-c:a", "aac"]));

        let subs = d.subtitle_args(
            Path::new("/dl/x.mp4"),
            &["en.vtt".to_string(), "fr.vtt".to_string()],
            Path::new("/dl/t.mp4"),
        );
        assert!(subs.windows(2).any(|w| w == ["-map", "2:s?"]));
        assert!(subs.windows(2).any(|w| w == ["-c:s", "mov_text"]));
    }

    #[test]
    fn test_progress_parsers() {
        assert_eq!(
            parse_ytdlp_progress("[download]  42.5% of ~ 300.00MiB at 5.00MiB/s ETA 00:30 (frag 17/40)"),
            Some(42.5)
        );
        assert_eq!(parse_ytdlp_progress("[download] Downloading frag 10 of 40"), Some(25.0));
        assert_eq!(parse_ytdlp_progress("[hlsnative] Total fragments: 0"), None);

        assert_eq!(
            parse_ffmpeg_progress("out_time_us=12500000"),
            Some(FfmpegProgress::OutTime(12.5))
        );
        assert_eq!(
            parse_ffmpeg_progress("out_time_ms=1000000"),
            Some(FfmpegProgress::OutTime(1.0))
        );
        assert_eq!(parse_ffmpeg_progress("progress=end"), Some(FfmpegProgress::End));
        assert_eq!(parse_ffmpeg_progress("progress=continue"), None);
        assert_eq!(parse_ffmpeg_progress("out_time_us=N/A"), None);
    }

    #[test]
    fn test_registry_cleanup() {
        let dir = TempDir::new().unwrap();
        let registry = DownloadRegistry::new();
        let output = dir.path().join("a.mp4");
        std::fs::write(&output, "x").unwrap();
        std::fs::write(dir.path().join("a.mp4.part"), "x").unwrap();
        std::fs::write(dir.path().join("b.mp4"), "x").unwrap();

        let done_path = dir.path().join("done.mp4");
        std::fs::write(&done_path, "x").unwrap();
        registry.register(done_path.clone()).complete();
        assert!(done_path.exists());

        let cancelled = dir.path().join("c.mp4");
        std::fs::write(&cancelled, "x").unwrap();
        drop(registry.register(cancelled.clone()));
        assert!(!cancelled.exists());

        let _guard = registry.register(output.clone());
        assert_eq!(registry.in_flight(), 1);

        assert_eq!(registry.cleanup_all(), 1);
        assert!(!output.exists());
        assert!(!dir.path().join("a.mp4.part").exists());
        assert!(dir.path().join("b.mp4").exists());
        assert_eq!(registry.in_flight(), 0);
    }

    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path) -> String {
        script(
            dir,
            "ffmpeg",
            "for last; do :; done\nprintf data > \"$last\"\necho out_time_us=1000000\necho progress=end",
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ytdlp_download_with_recode() {
        let tools_dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let ytdlp = script(
            tools_dir.path(),
            "yt-dlp",
            "if [ \"$1\" = \"--version\" ]; then exit 0; fi\n\
             printf partial > \"$2.part\"\n\
             echo '[download]  50.0% of ~10MiB'\n\
             echo '[download] 100% of 10MiB'\n\
             printf video > \"$2\"",
        );
        let d = downloader(ToolsConfig {
            ffmpeg: fake_ffmpeg(tools_dir.path()),
            ytdlp,
            mpv: "mpv".into(),
        });
        let mut job = job(out_dir.path());
        job.recode_audio = true;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = d.download(&job, Some(tx)).await.unwrap();
        assert_eq!(output, out_dir.path().join("My-Show_E01.mp4"));
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "data");
        assert!(!out_dir.path().join("My-Show_E01.mp4.part").exists());
        assert!(!out_dir.path().join("My-Show_E01.mp4.recode.tmp.mp4").exists());
        assert_eq!(d.registry().in_flight(), 0);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events[0], DownloadEvent::Started { backend: Backend::YtDlp, .. }));
        assert!(events.contains(&DownloadEvent::Progress(50.0)));
        assert!(events.contains(&DownloadEvent::Progress(100.0)));
        assert_eq!(events.last(), Some(&DownloadEvent::Finished(output)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ffmpeg_fallback() {
        let tools_dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let d = downloader(ToolsConfig {
            ffmpeg: fake_ffmpeg(tools_dir.path()),
            ytdlp: tools_dir.path().join("missing-yt-dlp").to_string_lossy().into_owned(),
            mpv: "mpv".into(),
        });
        assert_eq!(d.backend().await, Backend::Ffmpeg);

        let output = d.download(&job(out_dir.path()), None).await.unwrap();
        assert_eq!(std::fs::read_to_string(output).unwrap(), "data");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_download_reports_stderr_and_removes_output() {
        let tools_dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let ytdlp = script(
            tools_dir.path(),
            "yt-dlp",
            "if [ \"$1\" = \"--version\" ]; then exit 0; fi\n\
             printf half > \"$2\"\n\
             echo 'ERROR: HTTP Error 403: Forbidden' >&2\n\
             exit 1",
        );
        let d = downloader(ToolsConfig {
            ffmpeg: "ffmpeg".into(),
            ytdlp,
            mpv: "mpv".into(),
        });
        let job = job(out_dir.path());

        let err = d.download(&job, None).await.unwrap_err();
        match err {
            StreamError::ExternalProcess { code, stderr, .. } => {
                assert_eq!(code, Some(1));
                assert!(stderr.contains("403"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!job.output_path().exists());
        assert_eq!(d.registry().in_flight(), 0);
    }
}
