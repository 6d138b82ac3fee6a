//! External player
//!
//! Launches mpv with an IPC server and an input config that binds two keys
//! to printed markers. While mpv runs, the playback position is polled over
//! IPC and the markers are watched on its stdout/stderr:
//! - Ctrl+W stops autoplay and quits the player
//! - Ctrl+O stops autoplay only
//!
//! When mpv is missing or exits with an error the URL is handed to the
//! system opener instead.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::config::PlayerConfig;
use crate::error::{Result, StreamError};

pub const QUIT_MARKER: &str = "STREAMWEB:STOP_AUTOPLAY_AND_QUIT";
pub const STOP_ONLY_MARKER: &str = "STREAMWEB:STOP_AUTOPLAY_ONLY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// Stop autoplay and return to the caller
    Quit,
    /// Stop autoplay, keep watching
    StopOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackOutcome {
    /// Last known position in whole seconds
    pub position: u64,
    pub stop_mode: Option<StopMode>,
}

#[derive(Debug, Clone, Default)]
pub struct PlayRequest {
    pub url: String,
    pub title: String,
    pub referer: Option<String>,
    pub subtitles: Vec<String>,
    /// Resume position in seconds
    pub start_at: u64,
}

pub fn parse_marker(line: &str) -> Option<StopMode> {
    if line.contains(QUIT_MARKER) {
        Some(StopMode::Quit)
    } else if line.contains(STOP_ONLY_MARKER) {
        Some(StopMode::StopOnly)
    } else {
        None
    }
}

#[derive(Deserialize)]
struct IpcReply {
    error: Option<String>,
    data: Option<serde_json::Value>,
}

/// Position from a successful `get_property time-pos` reply.
pub fn parse_position_reply(line: &str) -> Option<f64> {
    let reply: IpcReply = serde_json::from_str(line).ok()?;
    if reply.error.as_deref() != Some("success") {
        return None;
    }
    reply.data?.as_f64()
}

fn input_conf() -> String {
    format!("Ctrl+w print-text {QUIT_MARKER}\nCtrl+o print-text {STOP_ONLY_MARKER}\n")
}

#[cfg(unix)]
type IpcStream = tokio::net::UnixStream;
#[cfg(windows)]
type IpcStream = tokio::net::windows::named_pipe::NamedPipeClient;

#[cfg(unix)]
fn ipc_path(id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("streamweb-mpv-{id}.sock"))
}

#[cfg(windows)]
fn ipc_path(id: &str) -> PathBuf {
    PathBuf::from(format!(r"\\.\pipe\streamweb-mpv-{id}"))
}

#[cfg(unix)]
async fn open_ipc(path: &std::path::Path) -> std::io::Result<IpcStream> {
    tokio::net::UnixStream::connect(path).await
}

#[cfg(windows)]
async fn open_ipc(path: &std::path::Path) -> std::io::Result<IpcStream> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(path)
}

/// Files that live for one playback.
struct PlaybackFiles {
    ipc: PathBuf,
    input_conf: PathBuf,
}

impl PlaybackFiles {
    fn create() -> Result<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let input_conf = std::env::temp_dir().join(format!("streamweb-inputconf-{id}.conf"));
        std::fs::write(&input_conf, self::input_conf())?;
        Ok(Self {
            ipc: ipc_path(&id),
            input_conf,
        })
    }
}

impl Drop for PlaybackFiles {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.input_conf);
        #[cfg(unix)]
        let _ = std::fs::remove_file(&self.ipc);
    }
}

#[derive(Debug, Clone)]
pub struct Player {
    program: String,
    config: PlayerConfig,
}

impl Player {
    pub fn new(program: impl Into<String>, config: PlayerConfig) -> Self {
        Self {
            program: program.into(),
            config,
        }
    }

    pub fn args(&self, req: &PlayRequest, ipc: &std::path::Path, input_conf: &std::path::Path) -> Vec<String> {
        let mut args = vec![
            req.url.clone(),
            format!("--input-ipc-server={}", ipc.display()),
            format!("--input-conf={}", input_conf.display()),
        ];
        if let Some(referer) = req.referer.as_deref().filter(|r| !r.is_empty()) {
            args.push(format!("--http-header-fields=Referer: {referer}"));
        }
        if !req.title.is_empty() {
            args.push(format!("--force-media-title={}", req.title));
        }
        if self.config.fullscreen {
            args.push("--fullscreen".to_string());
        }
        if req.start_at > 0 {
            args.push(format!("--start={}", req.start_at));
        }
        for sub in &req.subtitles {
            args.push(format!("--sub-file={sub}"));
        }
        args
    }

    /// Play one stream and wait for the player to exit.
    pub async fn play(&self, req: &PlayRequest) -> Result<PlaybackOutcome> {
        tracing::info!("Opening {} -> {}", req.title, req.url);
        let files = PlaybackFiles::create()?;
        let args = self.args(req, &files.ipc, &files.input_conf);

        let mut child = match Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("{} not found, falling back to system opener", self.program);
                open_external(&req.url).await?;
                return Ok(PlaybackOutcome {
                    position: req.start_at,
                    stop_mode: None,
                });
            }
            Err(source) => {
                return Err(StreamError::Spawn {
                    program: self.program.clone(),
                    source,
                })
            }
        };

        let (marker_tx, markers) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            watch_markers(stdout, marker_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            watch_markers(stderr, marker_tx);
        }

        let position = Arc::new(Mutex::new(req.start_at as f64));
        let ipc = self.connect_ipc(&files.ipc, &mut child).await;
        let (status, stop_mode) = self
            .supervise(&mut child, ipc, markers, Arc::clone(&position))
            .await?;
        drop(files);

        if !status.success() && stop_mode.is_none() {
            tracing::warn!(
                "{} exited with {}, falling back to system opener",
                self.program,
                status
            );
            open_external(&req.url).await?;
        }

        let position = position.lock().max(0.0).round() as u64;
        Ok(PlaybackOutcome {
            position,
            stop_mode,
        })
    }

    /// Retry the IPC connection until it succeeds, mpv exits, or the
    /// connect timeout passes.
    async fn connect_ipc(&self, path: &std::path::Path, child: &mut Child) -> Option<IpcStream> {
        let deadline = Instant::now() + Duration::from_millis(self.config.ipc_connect_timeout_ms);
        loop {
            match open_ipc(path).await {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    if Instant::now() >= deadline || matches!(child.try_wait(), Ok(Some(_))) {
                        tracing::debug!("No IPC connection to player: {}", e);
                        return None;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn supervise(
        &self,
        child: &mut Child,
        ipc: Option<IpcStream>,
        mut markers: mpsc::UnboundedReceiver<StopMode>,
        position: Arc<Mutex<f64>>,
    ) -> Result<(ExitStatus, Option<StopMode>)> {
        let mut writer = ipc.map(|stream| {
            let (reader, writer) = tokio::io::split(stream);
            track_position(reader, position);
            writer
        });

        let mut poll = tokio::time::interval(Duration::from_millis(self.config.position_poll_ms.max(100)));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut request_id: u64 = 1;
        let mut stop_mode = None;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                Some(mode) = markers.recv() => {
                    tracing::info!("Stop autoplay requested ({:?})", mode);
                    stop_mode = Some(mode);
                    if mode == StopMode::Quit {
                        let sent = match writer.as_mut() {
                            Some(w) => w.write_all(b"{\"command\":[\"quit\"]}\n").await.is_ok(),
                            None => false,
                        };
                        if !sent {
                            let _ = child.start_kill();
                        }
                    }
                }
                _ = poll.tick(), if writer.is_some() => {
                    if let Some(w) = writer.as_mut() {
                        let cmd = ipc_command(&["get_property", "time-pos"], request_id);
                        request_id += 1;
                        if w.write_all(cmd.as_bytes()).await.is_err() {
                            writer = None;
                        }
                    }
                }
            }
        };
        Ok((status, stop_mode))
    }
}

/// One line of mpv's JSON IPC protocol. mpv deprecates non-integer
/// `request_id` values, so the id goes out as a number.
pub fn ipc_command(command: &[&str], request_id: u64) -> String {
    let cmd = serde_json::json!({
        "command": command,
        "request_id": request_id,
    });
    format!("{cmd}\n")
}

fn watch_markers<R>(stream: R, tx: mpsc::UnboundedSender<StopMode>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(mode) = parse_marker(&line) {
                if tx.send(mode).is_err() {
                    break;
                }
            }
        }
    });
}

fn track_position<R>(reader: R, position: Arc<Mutex<f64>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(pos) = parse_position_reply(&line) {
                *position.lock() = pos;
            }
        }
    });
}

/// Hand `url` to the platform's default handler.
pub async fn open_external(url: &str) -> Result<()> {
    let (program, args): (&str, Vec<&str>) = if cfg!(target_os = "windows") {
        ("cmd", vec!["/C", "start", "", url])
    } else if cfg!(target_os = "macos") {
        ("open", vec![url])
    } else {
        ("xdg-open", vec![url])
    };
    let status = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|source| StreamError::Spawn {
            program: program.to_string(),
            source,
        })?;
    if !status.success() {
        return Err(StreamError::ExternalProcess {
            program: program.to_string(),
            code: status.code(),
            stderr: String::new(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn request() -> PlayRequest {
        PlayRequest {
            url: "https://cdn.example/master.m3u8".into(),
            title: "Show - Episode 3".into(),
            referer: Some("https://kwik.cx/".into()),
            subtitles: vec!["https://cdn.example/en.vtt".into()],
            start_at: 0,
        }
    }

    #[test]
    fn test_args() {
        let player = Player::new("mpv", PlayerConfig::default());
        let mut req = request();
        req.start_at = 95;
        let args = player.args(&req, Path::new("/tmp/s.sock"), Path::new("/tmp/in.conf"));
        assert_eq!(
            args,
            vec![
                "https://cdn.example/master.m3u8",
                "--input-ipc-server=/tmp/s.sock",
                "--input-conf=/tmp/in.conf",
                "--http-header-fields=Referer: https://kwik.cx/",
                "--force-media-title=Show - Episode 3",
                "--fullscreen",
                "--start=95",
                "--sub-file=https://cdn.example/en.vtt",
            ]
        );

        let windowed = Player::new(
            "mpv",
            PlayerConfig {
                fullscreen: false,
                ..PlayerConfig::default()
            },
        );
        let args = windowed.args(&request(), Path::new("s"), Path::new("c"));
        assert!(!args.iter().any(|a| a == "--fullscreen" || a.starts_with("--start")));
    }

    #[test]
    fn test_markers() {
        assert_eq!(parse_marker(&format!("[cplayer] {QUIT_MARKER}")), Some(StopMode::Quit));
        assert_eq!(parse_marker(STOP_ONLY_MARKER), Some(StopMode::StopOnly));
        assert_eq!(parse_marker("AV: 00:01:02"), None);
        assert!(input_conf().contains(&format!("Ctrl+w print-text {QUIT_MARKER}")));
    }

    #[test]
    fn test_ipc_command() {
        let line = ipc_command(&["get_property", "time-pos"], 7);
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["command"], serde_json::json!(["get_property", "time-pos"]));
        assert_eq!(value["request_id"], serde_json::json!(7));
    }

    #[test]
    fn test_position_reply() {
        assert_eq!(
            parse_position_reply(r#"{"data":12.5,"request_id":3,"error":"success"}"#),
            Some(12.5)
        );
        assert_eq!(
            parse_position_reply(r#"{"data":null,"error":"property unavailable"}"#),
            None
        );
        assert_eq!(parse_position_reply(r#"{"event":"pause"}"#), None);
        assert_eq!(parse_position_reply("garbage"), None);
    }

    #[cfg(unix)]
    fn fake_player(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("mpv");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_marker_from_player_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let program = fake_player(dir.path(), &format!("echo {STOP_ONLY_MARKER}\nsleep 0.2\nexit 0"));
        let player = Player::new(
            program,
            PlayerConfig {
                ipc_connect_timeout_ms: 100,
                ..PlayerConfig::default()
            },
        );
        let mut req = request();
        req.start_at = 30;

        let outcome = player.play(&req).await.unwrap();
        assert_eq!(outcome.stop_mode, Some(StopMode::StopOnly));
        assert_eq!(outcome.position, 30);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_quit_marker_without_ipc_kills_player() {
        let dir = tempfile::TempDir::new().unwrap();
        let program = fake_player(dir.path(), &format!("echo {QUIT_MARKER} >&2\nsleep 30"));
        let player = Player::new(
            program,
            PlayerConfig {
                ipc_connect_timeout_ms: 100,
                ..PlayerConfig::default()
            },
        );

        let outcome = tokio::time::timeout(Duration::from_secs(10), player.play(&request()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.stop_mode, Some(StopMode::Quit));
    }
}
