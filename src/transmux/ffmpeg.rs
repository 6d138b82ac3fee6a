//! ffmpeg command lines for HLS repackaging.

use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use super::TransmuxMode;
use crate::config::TransmuxConfig;

pub const MASTER_PLAYLIST: &str = "master.m3u8";
pub const MEDIA_PLAYLIST: &str = "stream.m3u8";
pub const SEGMENT_PATTERN: &str = "seg-%04d.m4s";

/// Inputs of one transmux run.
pub struct TransmuxArgs<'a> {
    pub input: &'a str,
    pub referer: &'a str,
    pub user_agent: &'a str,
    pub output_dir: &'a Path,
    pub mode: TransmuxMode,
}

/// Video copied, first audio track re-encoded to stereo AAC-LC, fMP4 HLS out.
pub fn transmux_args(args: &TransmuxArgs<'_>, config: &TransmuxConfig) -> Vec<String> {
    let (segment_secs, flags, playlist_type) = match args.mode {
        TransmuxMode::Event => (
            config.event_segment_secs,
            "append_list+independent_segments+omit_endlist+temp_file+delete_segments",
            "event",
        ),
        TransmuxMode::Vod => (config.vod_segment_secs, "independent_segments", "vod"),
    };

    let mut out: Vec<String> = vec![
        "-loglevel".into(),
        "error".into(),
        "-user_agent".into(),
        args.user_agent.into(),
        "-headers".into(),
        format!("Referer: {}\r\n", args.referer),
        "-i".into(),
        args.input.into(),
        "-map".into(),
        "v:0".into(),
        "-c:v".into(),
        "copy".into(),
        "-map".into(),
        "a:0".into(),
        "-c:a".into(),
        "aac".into(),
        "-profile:a".into(),
        "aac_low".into(),
        "-ac".into(),
        "2".into(),
        "-b:a".into(),
        config.audio_bitrate.clone(),
        "-hls_time".into(),
        segment_secs.to_string(),
        "-hls_list_size".into(),
        "0".into(),
        "-hls_segment_type".into(),
        "fmp4".into(),
        "-hls_flags".into(),
        flags.into(),
    ];
    if args.mode == TransmuxMode::Event {
        out.extend(["-hls_delete_threshold".into(), "1".into()]);
    }
    out.extend([
        "-hls_playlist_type".into(),
        playlist_type.into(),
        "-hls_segment_filename".into(),
        args.output_dir.join(SEGMENT_PATTERN).to_string_lossy().into_owned(),
        "-master_pl_name".into(),
        MASTER_PLAYLIST.into(),
        args.output_dir.join(MEDIA_PLAYLIST).to_string_lossy().into_owned(),
    ]);
    out
}

/// ffmpeg command with stdin/stdout detached and stderr piped.
pub fn command(program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    cmd
}

/// Forward a child's stderr to the log, one line per event.
pub fn forward_stderr<R>(stderr: R, key: String)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                tracing::warn!(key = %key, "ffmpeg: {}", line);
            }
        }
    });
}
