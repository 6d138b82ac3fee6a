//! Anime catalog backed by the site's JSON API.
//!
//! `GET {base}/api?m=search&q=..` and
//! `GET {base}/api?m=release&id=..&sort=episode_asc&page=N`.

use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, COOKIE, PRAGMA};
use serde::Deserialize;
use serde_json::Value;

use super::{CatalogItem, CatalogProvider, EpisodeEntry, ItemKind, SeasonEntry, SessionContext, StreamDescriptor};
use crate::error::{Result, StreamError};
use crate::resolver::StreamResolver;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    year: Option<Value>,
}

impl SearchHit {
    fn slug(&self) -> Option<String> {
        self.session
            .clone()
            .or_else(|| self.id.as_ref().map(value_string))
            .or_else(|| self.slug.clone())
            .filter(|s| !s.is_empty())
    }

    fn info(&self) -> Option<String> {
        let parts: Vec<String> = [self.kind.clone(), self.year.as_ref().map(value_string)]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join(", "))
    }
}

#[derive(Debug, Deserialize)]
struct ReleasePage {
    #[serde(default)]
    data: Vec<ReleaseEpisode>,
    #[serde(default)]
    last_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ReleaseEpisode {
    episode: Value,
    session: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    filler: Value,
}

impl ReleaseEpisode {
    fn number(&self) -> Option<f64> {
        match &self.episode {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn is_filler(&self) -> bool {
        match &self.filler {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
            Value::String(s) => !matches!(s.as_str(), "" | "0" | "false"),
            _ => false,
        }
    }
}

fn value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fresh anti-bot cookie, `__ddg2_=<24 hex chars>`.
pub fn new_cookie() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("__ddg2_={}", &hex[..24])
}

#[derive(Clone)]
pub struct AnimeCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl AnimeCatalog {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_url(&self) -> String {
        format!("{}/api", self.base_url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        ctx: &SessionContext,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = self.api_url();
        let mut request = self
            .client
            .get(&url)
            .query(query)
            .header(ACCEPT, "*/*")
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache");
        if !ctx.cookie.is_empty() {
            request = request.header(COOKIE, ctx.cookie.as_str());
        }
        let response = request.send().await.map_err(|e| StreamError::fetch(&url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::UpstreamStatus {
                url: response.url().to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.text().await.map_err(|e| StreamError::fetch(&url, e))?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn release_page(&self, ctx: &SessionContext, slug: &str, page: u32) -> Result<ReleasePage> {
        self.get_json(
            ctx,
            &[
                ("m", "release".to_string()),
                ("id", slug.to_string()),
                ("sort", "episode_asc".to_string()),
                ("page", page.to_string()),
            ],
        )
        .await
    }

    /// Every episode of `slug`, in ascending episode order.
    ///
    /// Page 1 tells how many pages there are; the rest are fetched
    /// concurrently.
    pub async fn all_episodes(&self, ctx: &SessionContext, slug: &str) -> Result<Vec<EpisodeEntry>> {
        let first = self.release_page(ctx, slug, 1).await?;
        let last = first.last_page.unwrap_or(1);
        let mut raw = first.data;

        if last > 1 {
            let pages = join_all((2..=last).map(|page| self.release_page(ctx, slug, page))).await;
            for page in pages {
                raw.extend(page?.data);
            }
        }

        let mut numbered: Vec<(f64, ReleaseEpisode)> = raw
            .into_iter()
            .filter_map(|ep| ep.number().map(|n| (n, ep)))
            .collect();
        numbered.sort_by(|a, b| a.0.total_cmp(&b.0));

        Ok(numbered
            .into_iter()
            .map(|(number, ep)| EpisodeEntry {
                filler: ep.is_filler(),
                id: ep.session,
                number: number as u32,
                title: ep.title.filter(|t| !t.is_empty()),
                season: None,
            })
            .collect())
    }
}

#[async_trait]
impl CatalogProvider for AnimeCatalog {
    fn name(&self) -> &'static str {
        "anime"
    }

    async fn search(&self, ctx: &SessionContext, query: &str) -> Result<Vec<CatalogItem>> {
        let response: SearchResponse = self
            .get_json(ctx, &[("m", "search".to_string()), ("q", query.to_string())])
            .await?;

        Ok(response
            .data
            .into_iter()
            .filter_map(|hit| {
                let slug = hit.slug()?;
                Some(CatalogItem {
                    url: format!("{}/anime/{}", self.base_url, slug),
                    info: hit.info(),
                    title: hit.title,
                    id: slug,
                    kind: ItemKind::Anime,
                })
            })
            .collect())
    }

    async fn seasons(&self, _ctx: &SessionContext, item: &CatalogItem) -> Result<Vec<SeasonEntry>> {
        Ok(vec![SeasonEntry {
            id: item.id.clone(),
            number: 1,
            title: item.title.clone(),
        }])
    }

    async fn episodes(
        &self,
        ctx: &SessionContext,
        item: &CatalogItem,
        _season: Option<&SeasonEntry>,
    ) -> Result<Vec<EpisodeEntry>> {
        self.all_episodes(ctx, &item.id).await
    }

    async fn stream(
        &self,
        _ctx: &SessionContext,
        item: &CatalogItem,
        episode: Option<&EpisodeEntry>,
    ) -> Result<StreamDescriptor> {
        let episode = episode
            .ok_or_else(|| StreamError::InvalidInput(format!("{} needs an episode", item.title)))?;
        Ok(StreamDescriptor::PlayPage(StreamResolver::play_page_url(
            &self.base_url,
            &item.id,
            &episode.id,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Query, routing::get, Json, Router};
    use std::collections::HashMap;

    #[test]
    fn test_new_cookie() {
        let cookie = new_cookie();
        let hex = cookie.strip_prefix("__ddg2_=").unwrap();
        assert_eq!(hex.len(), 24);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(cookie, new_cookie());
    }

    #[test]
    fn test_search_hit_slug_fallbacks() {
        let hits: SearchResponse = serde_json::from_str(
            r#"{"data":[
                {"session":"abc-123","title":"A","type":"TV","year":2020},
                {"id":42,"title":"B"},
                {"slug":"c","title":"C"},
                {"title":"D"}
            ]}"#,
        )
        .unwrap();
        let slugs: Vec<_> = hits.data.iter().map(|h| h.slug()).collect();
        assert_eq!(
            slugs,
            vec![Some("abc-123".into()), Some("42".into()), Some("c".into()), None]
        );
        assert_eq!(hits.data[0].info().as_deref(), Some("TV, 2020"));
        assert_eq!(hits.data[1].info(), None);
    }

    #[test]
    fn test_release_episode_fields() {
        let page: ReleasePage = serde_json::from_str(
            r#"{"last_page":1,"data":[
                {"episode":3,"session":"s3","filler":1},
                {"episode":"4","session":"s4","filler":0,"title":"Four"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(page.data[0].number(), Some(3.0));
        assert!(page.data[0].is_filler());
        assert_eq!(page.data[1].number(), Some(4.0));
        assert!(!page.data[1].is_filler());
    }

    async fn api(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
        match q.get("m").map(String::as_str) {
            Some("search") => Json(serde_json::json!({
                "data": [{"session": "slug-1", "title": format!("Result for {}", q["q"])}]
            })),
            _ => {
                let page: u32 = q["page"].parse().unwrap();
                // page 1 is unsorted
                let data = match page {
                    1 => serde_json::json!([{"episode": 2, "session": "e2"}, {"episode": 1, "session": "e1"}]),
                    2 => serde_json::json!([{"episode": 5, "session": "e5", "filler": 1}]),
                    _ => serde_json::json!([{"episode": 3, "session": "e3"}, {"episode": 4, "session": "e4"}]),
                };
                Json(serde_json::json!({"last_page": 3, "data": data}))
            }
        }
    }

    async fn spawn_api() -> String {
        let app = Router::new().route("/api", get(api));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_search_and_paged_episodes() {
        let base = spawn_api().await;
        let catalog = AnimeCatalog::new(reqwest::Client::new(), format!("{base}/"));
        let ctx = SessionContext::new(new_cookie());

        let items = catalog.search(&ctx, "frieren").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "slug-1");
        assert_eq!(items[0].title, "Result for frieren");
        assert_eq!(items[0].kind, ItemKind::Anime);

        let episodes = catalog.episodes(&ctx, &items[0], None).await.unwrap();
        let numbers: Vec<u32> = episodes.iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert!(episodes[4].filler);

        let stream = catalog.stream(&ctx, &items[0], Some(&episodes[0])).await.unwrap();
        assert_eq!(stream, StreamDescriptor::PlayPage(format!("{base}/play/slug-1/e1")));
    }
}
