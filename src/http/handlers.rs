//! HTTP request handlers
//!
//! Health, diagnostics, proxy sessions, transmux control and cached output.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::StreamError;
use crate::playlist::{proxy_url, ProxyKind, PLAYLIST_CONTENT_TYPE};
use crate::state::AppState;
use crate::transmux::{wait_for_segments, TransmuxOutput, TransmuxRequest};

/// HTTP error type
#[derive(Debug)]
pub enum HttpError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    BadGateway(String),
    InternalError(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            HttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            HttpError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            HttpError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            HttpError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            HttpError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, body).into_response()
    }
}

impl From<StreamError> for HttpError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::InvalidUrl(_) | StreamError::InvalidInput(_) => {
                HttpError::BadRequest(err.to_string())
            }
            StreamError::InvalidToken => HttpError::Forbidden(err.to_string()),
            StreamError::NotFound(_) => HttpError::NotFound(err.to_string()),
            StreamError::Fetch { .. }
            | StreamError::UpstreamStatus { .. }
            | StreamError::ExternalProcess { .. } => HttpError::BadGateway(err.to_string()),
            _ => HttpError::InternalError(err.to_string()),
        }
    }
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "OK"
}

/// Version endpoint
pub async fn version_check() -> &'static str {
    concat!("streamweb v", env!("CARGO_PKG_VERSION"))
}

/// Transmux cache entries
/// GET /debug/cache
pub async fn cache_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.transmux.stats())
}

#[derive(Serialize)]
pub struct SessionStats {
    pub active: usize,
}

/// GET /debug/sessions
pub async fn session_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(SessionStats {
        active: state.sessions.len(),
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    /// Entry playlist URL
    pub url: String,
    pub referer: Option<String>,
    pub cookie: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub token: String,
    /// Proxied entry playlist
    pub playlist: String,
}

/// POST /session
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<CreateSessionResponse>, HttpError> {
    validate_http_url(&body.url)?;
    let referer = body
        .referer
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| body.url.clone());
    let session = state.sessions.create(body.cookie, referer.clone());
    let playlist = proxy_url(ProxyKind::Playlist, &session.token, &body.url, &referer);
    Ok(Json(CreateSessionResponse {
        token: session.token,
        playlist,
    }))
}

/// DELETE /session/{token}
pub async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> StatusCode {
    if state.sessions.end(&token) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Debug, Deserialize)]
pub struct TransmuxBody {
    pub url: String,
    pub referer: Option<String>,
    pub audio: Option<String>,
    pub resolution: Option<String>,
    /// Wait for the first segments before answering (event mode)
    #[serde(default)]
    pub wait: bool,
}

impl TransmuxBody {
    fn into_request(self) -> Result<TransmuxRequest, HttpError> {
        validate_http_url(&self.url)?;
        Ok(TransmuxRequest {
            source_url: self.url,
            referer: self.referer,
            audio: self.audio,
            resolution: self.resolution,
        })
    }
}

/// POST /transmux/start
pub async fn transmux_start(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TransmuxBody>,
) -> Result<Json<TransmuxOutput>, HttpError> {
    let wait = body.wait;
    let request = body.into_request()?;
    let output = state.transmux.ensure_start(&request)?;

    if wait {
        let config = state.transmux.config();
        let ready = wait_for_segments(
            &output.media_path,
            config.min_segments,
            Duration::from_millis(config.segment_wait_timeout_ms),
            Duration::from_millis(config.segment_poll_interval_ms),
        )
        .await;
        if !ready {
            tracing::warn!(key = %output.key, "Starting before {} segments were ready", config.min_segments);
        }
    }
    Ok(Json(output))
}

/// POST /transmux/full
pub async fn transmux_full(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TransmuxBody>,
) -> Result<Json<TransmuxOutput>, HttpError> {
    let request = body.into_request()?;
    let output = state.transmux.ensure_full(&request).await?;
    Ok(Json(output))
}

/// Transmux output files
/// GET /cache/{key}/{file}
pub async fn cache_file(
    State(state): State<Arc<AppState>>,
    Path((key, file)): Path<(String, String)>,
) -> Result<Response, HttpError> {
    if !is_cache_key(&key) || !is_cache_file_name(&file) {
        return Err(HttpError::NotFound(format!("{key}/{file}")));
    }

    let _lease = state.transmux.acquire(&key);
    let path = state.transmux.key_dir(&key).join(&file);
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(HttpError::NotFound(format!("{key}/{file}")));
        }
        Err(e) => return Err(HttpError::InternalError(e.to_string())),
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type_for(&file)));
    let cache_control = if file.ends_with(".m3u8") {
        "no-cache"
    } else {
        "public, max-age=3600"
    };
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));

    Ok((headers, Body::from(data)).into_response())
}

fn validate_http_url(raw: &str) -> Result<(), HttpError> {
    match url::Url::parse(raw) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => Ok(()),
        _ => Err(HttpError::BadRequest(format!("invalid url: {raw}"))),
    }
}

fn is_cache_key(key: &str) -> bool {
    key.len() == 32 && key.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_cache_file_name(file: &str) -> bool {
    !file.is_empty()
        && !file.starts_with('.')
        && file
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

fn content_type_for(file: &str) -> &'static str {
    match file.rsplit('.').next() {
        Some("m3u8") => PLAYLIST_CONTENT_TYPE,
        Some("m4s") => "video/iso.segment",
        Some("mp4") => "video/mp4",
        Some("ts") => "video/mp2t",
        Some("vtt") => "text/vtt",
        _ => "application/octet-stream",
    }
}
