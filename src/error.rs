use thiserror::Error;

/// Main error type for streamweb
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request to {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Upstream returned {status} for {url}")]
    UpstreamStatus { url: String, status: u16 },

    #[error("Script sandbox failed: {0}")]
    Sandbox(String),

    #[error("{program} exited with code {code:?}: {stderr}")]
    ExternalProcess {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid or expired proxy token")]
    InvalidToken,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StreamError {
    pub fn fetch(url: impl Into<String>, source: reqwest::Error) -> Self {
        StreamError::Fetch {
            url: url.into(),
            source,
        }
    }

    /// Failures that skip one unit of work (an episode, a variant) without
    /// aborting a batch.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            StreamError::NotFound(_)
                | StreamError::Fetch { .. }
                | StreamError::UpstreamStatus { .. }
                | StreamError::Sandbox(_)
                | StreamError::ExternalProcess { .. }
        )
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, StreamError>;
