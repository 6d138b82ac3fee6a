//! Command line definition.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Browse, play and download from anime and movie/TV catalogs.
#[derive(Parser, Debug, Clone)]
#[command(name = "streamweb")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file (default: ./streamweb.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the proxy and transmux HTTP server
    Serve {
        /// Address to bind, overriding the configuration
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Search the anime catalog, then play or download episodes
    Anime(AnimeArgs),

    /// Search the movie/TV catalog for a series
    Series(SeriesArgs),

    /// Search the movie/TV catalog for a movie
    Movie(MovieArgs),

    /// Watch history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// User settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

/// Options shared by every catalog command.
#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// Search query
    #[arg(required = true, num_args = 1..)]
    pub query: Vec<String>,

    /// Search result to use (1-based)
    #[arg(short, long, default_value_t = 1)]
    pub pick: usize,
}

impl SearchArgs {
    pub fn query(&self) -> String {
        self.query.join(" ")
    }
}

/// Options for saving files.
#[derive(Args, Debug, Clone, Default)]
pub struct DownloadArgs {
    /// Download instead of playing
    #[arg(short, long)]
    pub download: bool,

    /// Output directory (default: settings, then the platform download dir)
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Put files in a folder named after the title
    #[arg(short, long)]
    pub folder: bool,

    /// Re-encode audio to AAC after downloading
    #[arg(short, long)]
    pub transcode: bool,
}

#[derive(Args, Debug, Clone)]
pub struct AnimeArgs {
    #[command(flatten)]
    pub search: SearchArgs,

    /// Episode number or range like 5-7; repeatable
    #[arg(short, long = "episode")]
    pub episodes: Vec<String>,

    /// Preferred audio track, e.g. jpn or eng
    #[arg(short, long)]
    pub audio: Option<String>,

    /// Preferred resolution, e.g. 1080
    #[arg(short, long)]
    pub resolution: Option<String>,

    #[command(flatten)]
    pub output: DownloadArgs,

    /// Download every episode
    #[arg(short, long)]
    pub whole_show: bool,

    /// Keep playing the following episodes
    #[arg(long)]
    pub autoplay: bool,

    /// Play through a local transmux of the stream
    #[arg(long)]
    pub transmux: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SeriesArgs {
    #[command(flatten)]
    pub search: SearchArgs,

    /// Season number (1-based, default 1)
    #[arg(short, long)]
    pub season: Option<u32>,

    /// Episode number or range like 5-7; repeatable
    #[arg(short, long = "episode")]
    pub episodes: Vec<String>,

    #[command(flatten)]
    pub output: DownloadArgs,

    /// Embed subtitles into downloads
    #[arg(long)]
    pub subs: bool,
}

#[derive(Args, Debug, Clone)]
pub struct MovieArgs {
    #[command(flatten)]
    pub search: SearchArgs,

    #[command(flatten)]
    pub output: DownloadArgs,

    /// Embed subtitles into downloads
    #[arg(long)]
    pub subs: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum HistoryAction {
    /// Latest entry per episode, newest first
    List,
    /// Write the history to a JSON file
    Export { path: PathBuf },
    /// Delete all entries
    Clear,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SettingsAction {
    Show,
    Set { key: String, value: String },
}
