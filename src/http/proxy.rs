//! Upstream proxy endpoints.
//!
//! `GET /proxy/{playlist,segment,key}?token=..&url=..&ref=..`
//!
//! The token is checked against the session registry, the upstream request
//! is built with the session cookie and the referer chain, and the response
//! is streamed back. Successful playlist responses are rewritten so nested
//! URIs point back here.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use url::Url;

use super::handlers::HttpError;
use crate::playlist::{rewrite_playlist, PlaylistRewriteContext, ProxyKind, PLAYLIST_CONTENT_TYPE};
use crate::session::ProxySession;
use crate::state::AppState;

/// Request headers passed through to the upstream.
const FORWARDED_REQUEST_HEADERS: [HeaderName; 6] = [
    header::RANGE,
    header::IF_RANGE,
    header::IF_MODIFIED_SINCE,
    header::IF_NONE_MATCH,
    header::ACCEPT,
    header::ACCEPT_LANGUAGE,
];

/// Upstream response headers copied to the client.
const FORWARDED_RESPONSE_HEADERS: [HeaderName; 8] = [
    header::CONTENT_TYPE,
    header::ACCEPT_RANGES,
    header::CONTENT_RANGE,
    header::ETAG,
    header::LAST_MODIFIED,
    header::CACHE_CONTROL,
    header::CONTENT_ENCODING,
    header::CONTENT_LENGTH,
];

pub const UPSTREAM_STATUS_HEADER: &str = "x-upstream-status";
pub const UPSTREAM_URL_HEADER: &str = "x-upstream-url";

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    pub token: String,
    pub url: String,
    #[serde(rename = "ref")]
    pub referer: Option<String>,
}

/// GET /proxy/playlist
pub async fn proxy_playlist(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    forward(&state, query, &headers, ProxyKind::Playlist).await
}

/// GET /proxy/segment
pub async fn proxy_segment(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    forward(&state, query, &headers, ProxyKind::Segment).await
}

/// GET /proxy/key
pub async fn proxy_key(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    forward(&state, query, &headers, ProxyKind::Key).await
}

async fn forward(
    state: &AppState,
    query: ProxyQuery,
    incoming: &HeaderMap,
    kind: ProxyKind,
) -> Result<Response, HttpError> {
    let session = state
        .sessions
        .validate(&query.token)
        .ok_or_else(|| HttpError::Forbidden("invalid or expired token".to_string()))?;

    let target = parse_upstream_url(&query.url)?;
    let referer = query
        .referer
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| session.referer.clone());

    let request = build_upstream_request(state, &session, &target, &referer, incoming);
    let res = request.send().await.map_err(|e| {
        tracing::error!("Proxy error for {}: {}", target, e);
        HttpError::BadGateway(format!("upstream request failed: {e}"))
    })?;
    tracing::debug!("Upstream {} for {}", res.status(), target);

    if kind == ProxyKind::Playlist && res.status().is_success() {
        return rewrite_response(res, &session.token).await;
    }

    let mut builder = Response::builder().status(res.status());
    if let Some(out) = builder.headers_mut() {
        copy_response_headers(res.headers(), out);
        add_debug_headers(out, res.status(), res.url());
    }
    let body = Body::from_stream(res.bytes_stream());
    builder.body(body).map_err(|e| {
        tracing::error!("Response building error in proxy: {}", e);
        HttpError::InternalError(e.to_string())
    })
}

async fn rewrite_response(res: reqwest::Response, token: &str) -> Result<Response, HttpError> {
    let status = res.status();
    let final_url = res.url().clone();
    let body = res
        .text()
        .await
        .map_err(|e| HttpError::BadGateway(format!("reading playlist failed: {e}")))?;

    let ctx = PlaylistRewriteContext::new(final_url.clone(), token);
    let rewritten = Bytes::from(rewrite_playlist(&body, &ctx));

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)
        .header(header::CONTENT_LENGTH, rewritten.len())
        .header(header::CACHE_CONTROL, "no-cache");
    if let Some(out) = builder.headers_mut() {
        add_debug_headers(out, status, &final_url);
    }
    builder
        .body(Body::from(rewritten))
        .map_err(|e| HttpError::InternalError(e.to_string()))
}

fn parse_upstream_url(raw: &str) -> Result<Url, HttpError> {
    let url = Url::parse(raw).map_err(|_| HttpError::BadRequest(format!("invalid url: {raw}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(HttpError::BadRequest(format!("unsupported scheme: {other}"))),
    }
}

fn build_upstream_request(
    state: &AppState,
    session: &ProxySession,
    target: &Url,
    referer: &str,
    incoming: &HeaderMap,
) -> reqwest::RequestBuilder {
    let mut request = state
        .http_client
        .get(target.clone())
        .header(header::USER_AGENT, state.config.proxy.user_agent.as_str());

    if let Ok(value) = HeaderValue::from_str(referer) {
        request = request.header(header::REFERER, value);
    }
    if let Some(origin) = origin_of(referer) {
        if let Ok(value) = HeaderValue::from_str(&origin) {
            request = request.header(header::ORIGIN, value);
        }
    }
    if let Some(cookie) = session.cookie.as_deref() {
        if let Ok(value) = HeaderValue::from_str(cookie) {
            request = request.header(header::COOKIE, value);
        }
    }
    for name in FORWARDED_REQUEST_HEADERS.iter() {
        if let Some(value) = incoming.get(name) {
            request = request.header(name.clone(), value.clone());
        }
    }
    request
}

/// `scheme://host[:port]` of a URL.
pub fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let origin = parsed.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

fn copy_response_headers(upstream: &HeaderMap, out: &mut HeaderMap) {
    for name in FORWARDED_RESPONSE_HEADERS.iter() {
        if let Some(value) = upstream.get(name) {
            out.insert(name.clone(), value.clone());
        }
    }
}

fn add_debug_headers(out: &mut HeaderMap, status: StatusCode, url: &Url) {
    out.insert(
        HeaderName::from_static(UPSTREAM_STATUS_HEADER),
        HeaderValue::from(status.as_u16()),
    );
    if let Ok(value) = HeaderValue::from_str(url.as_str()) {
        out.insert(HeaderName::from_static(UPSTREAM_URL_HEADER), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_of() {
        assert_eq!(
            origin_of("https://cdn.example:8443/video/index.m3u8?x=1").as_deref(),
            Some("https://cdn.example:8443")
        );
        assert_eq!(origin_of("https://kwik.cx").as_deref(), Some("https://kwik.cx"));
        assert!(origin_of("not a url").is_none());
    }

    #[test]
    fn test_parse_upstream_url() {
        assert!(parse_upstream_url("https://cdn.example/a.ts").is_ok());
        assert!(matches!(
            parse_upstream_url("file:///etc/passwd"),
            Err(HttpError::BadRequest(_))
        ));
        assert!(matches!(parse_upstream_url("::"), Err(HttpError::BadRequest(_))));
    }

    #[test]
    fn test_copy_response_headers_allow_list() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp2t"));
        upstream.insert(header::CONTENT_RANGE, HeaderValue::from_static("bytes 0-9/100"));
        upstream.insert(header::SET_COOKIE, HeaderValue::from_static("a=b"));
        upstream.insert(header::SERVER, HeaderValue::from_static("cdn"));

        let mut out = HeaderMap::new();
        copy_response_headers(&upstream, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out.get(header::CONTENT_TYPE).unwrap(), "video/mp2t");
        assert!(out.get(header::SET_COOKIE).is_none());
    }
}
