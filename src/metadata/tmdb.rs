//! TMDB v3 client
//!
//! Requests share a small semaphore so only a few are in flight at once.
//! 429 responses are retried after the server's `Retry-After`; once retries
//! run out the lookup degrades to an empty result.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::MetadataConfig;
use crate::metadata::cache::{MetadataCache, details_key, season_key};
use crate::metadata::{
    ExternalSource, FindResults, MediaType, MetadataProvider, SearchResults, SeasonDetails,
    TitleDetails,
};

const DEFAULT_BACKOFF_SECS: u64 = 1;

const MOVIE_APPEND: &str = "credits,videos,images,translations,release_dates,external_ids";
const TV_APPEND: &str = "credits,videos,images,translations,content_ratings,external_ids";

#[derive(Debug, Clone)]
struct Locale {
    language: String,
    region: String,
}

pub struct TmdbClient {
    client: Client,
    base_url: String,
    api_key: String,
    locale: RwLock<Locale>,
    permits: Semaphore,
    max_retries: u32,
    cache: Arc<MetadataCache>,
}

impl TmdbClient {
    pub fn new(config: &MetadataConfig, cache: Arc<MetadataCache>) -> Self {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            locale: RwLock::new(Locale {
                language: config.language.clone(),
                region: config.region.clone(),
            }),
            permits: Semaphore::new(config.max_concurrent_requests.max(1)),
            max_retries: config.max_retries,
            cache,
        }
    }

    fn locale(&self) -> Locale {
        self.locale
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Switch language/region. Cached responses are language specific, so
    /// the whole cache is dropped when anything changes.
    pub fn set_locale(&self, language: &str, region: &str) {
        let mut locale = self.locale.write().unwrap_or_else(PoisonError::into_inner);
        if locale.language == language && locale.region == region {
            return;
        }
        locale.language = language.to_string();
        locale.region = region.to_string();
        drop(locale);
        self.cache.clear();
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    /// GET a JSON payload, retrying rate limits and transport errors
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        extra: &[(&str, &str)],
    ) -> Option<T> {
        let _permit = self.permits.acquire().await.ok()?;

        let locale = self.locale();
        let url = format!("{}{}", self.base_url, path);
        let mut params: Vec<(&str, &str)> = vec![
            ("api_key", self.api_key.as_str()),
            ("language", locale.language.as_str()),
            ("region", locale.region.as_str()),
        ];
        params.extend_from_slice(extra);

        let mut retries = 0u32;
        loop {
            let response = match self.client.get(&url).query(&params).send().await {
                Ok(response) => response,
                Err(e) if retries < self.max_retries => {
                    retries += 1;
                    warn!(path, retry = retries, error = %e, "TMDB request failed, retrying");
                    tokio::time::sleep(Duration::from_secs(DEFAULT_BACKOFF_SECS)).await;
                    continue;
                }
                Err(e) => {
                    warn!(path, error = %e, "TMDB request failed");
                    return None;
                }
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                if retries >= self.max_retries {
                    warn!(path, "TMDB rate limit retries exhausted");
                    return None;
                }
                retries += 1;
                let wait = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .unwrap_or(DEFAULT_BACKOFF_SECS);
                warn!(path, retry = retries, wait_secs = wait, "TMDB returned 429, backing off");
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }

            if !status.is_success() {
                debug!(path, %status, "TMDB returned error status");
                return None;
            }

            return match response.json::<T>().await {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(path, error = %e, "Failed to decode TMDB response");
                    None
                }
            };
        }
    }

    /// Serve from cache or fetch and cache the raw payload
    async fn cached<T: DeserializeOwned>(
        &self,
        key: String,
        path: &str,
        extra: &[(&str, &str)],
    ) -> Option<T> {
        let now = chrono::Utc::now().timestamp_millis();
        if let Some(value) = self.cache.get(&key, now) {
            match serde_json::from_value(value) {
                Ok(parsed) => return Some(parsed),
                Err(e) => debug!(key = %key, error = %e, "Ignoring undecodable cache entry"),
            }
        }

        let value: serde_json::Value = self.get_json(path, extra).await?;
        let parsed = serde_json::from_value(value.clone()).ok()?;
        self.cache.insert(key, value, now);
        Some(parsed)
    }
}

#[async_trait::async_trait]
impl MetadataProvider for TmdbClient {
    async fn details(&self, id: u64, media_type: MediaType) -> Option<TitleDetails> {
        let language = self.locale().language;
        let append = match media_type {
            MediaType::Movie => MOVIE_APPEND,
            MediaType::Tv => TV_APPEND,
        };
        self.cached(
            details_key(media_type, id, &language),
            &format!("/{}/{}", media_type, id),
            &[("append_to_response", append)],
        )
        .await
    }

    async fn season_details(&self, series_id: u64, season_number: u32) -> Option<SeasonDetails> {
        let language = self.locale().language;
        self.cached(
            season_key(series_id, season_number, &language),
            &format!("/tv/{}/season/{}", series_id, season_number),
            &[],
        )
        .await
    }

    async fn find(&self, external_id: &str, source: ExternalSource) -> FindResults {
        self.get_json(
            &format!("/find/{}", external_id),
            &[("external_source", source.as_query_param())],
        )
        .await
        .unwrap_or_default()
    }

    async fn search(&self, query: &str, media_type: Option<MediaType>) -> SearchResults {
        let path = match media_type {
            Some(media_type) => format!("/search/{}", media_type),
            None => "/search/multi".to_string(),
        };
        self.get_json(&path, &[("query", query)])
            .await
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::storage::RecordStore;

    fn client_with(config: MetadataConfig) -> TmdbClient {
        let store = RecordStore::in_memory();
        let cache = MetadataCache::open(&store, Duration::from_secs(3600), Duration::from_secs(60));
        TmdbClient::new(&config, cache)
    }

    fn client() -> TmdbClient {
        client_with(MetadataConfig::default())
    }

    fn server_client(server: &MockServer, max_retries: u32) -> TmdbClient {
        client_with(MetadataConfig {
            base_url: server.uri(),
            max_retries,
            ..MetadataConfig::default()
        })
    }

    fn rate_limited() -> ResponseTemplate {
        ResponseTemplate::new(429).insert_header("retry-after", "0")
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/movie/550"))
            .respond_with(rate_limited())
            .up_to_n_times(1)
            .expect(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/movie/550"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"id": 550, "title": "Fight Club"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = server_client(&server, 2);
        let details = client.details(550, MediaType::Movie).await.unwrap();
        assert_eq!(details.display_title(), "Fight Club");
        assert_eq!(client.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_rate_limit_degrades_to_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/movie/550"))
            .respond_with(rate_limited())
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search/tv"))
            .respond_with(rate_limited())
            .expect(3)
            .mount(&server)
            .await;

        let client = server_client(&server, 2);
        assert!(client.details(550, MediaType::Movie).await.is_none());
        assert!(
            client
                .search("Dark", Some(MediaType::Tv))
                .await
                .results
                .is_empty()
        );
        assert!(client.cache().is_empty());
    }

    #[tokio::test]
    async fn test_error_status_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tv/1399"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let client = server_client(&server, 2);
        assert!(client.details(1399, MediaType::Tv).await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_host_degrades_to_empty() {
        let client = client_with(MetadataConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            max_retries: 0,
            ..MetadataConfig::default()
        });
        let found = client.find("tt0903747", ExternalSource::Imdb).await;
        assert!(found.movie_results.is_empty());
        assert!(found.tv_results.is_empty());
    }

    #[tokio::test]
    async fn test_cached_details_skip_network() {
        let client = client();
        let now = chrono::Utc::now().timestamp_millis();
        client.cache().insert(
            details_key(MediaType::Tv, 1399, "en-US"),
            serde_json::json!({
                "id": 1399,
                "name": "Game of Thrones",
                "seasons": [
                    {"season_number": 0, "episode_count": 3},
                    {"season_number": 1, "episode_count": 10}
                ]
            }),
            now,
        );

        let details = client.details(1399, MediaType::Tv).await.unwrap();
        assert_eq!(details.display_title(), "Game of Thrones");
        assert_eq!(details.seasons.len(), 2);
        assert_eq!(details.seasons[1].episode_count, 10);
    }

    #[tokio::test]
    async fn test_locale_change_clears_cache() {
        let client = client();
        client.cache().insert(
            details_key(MediaType::Movie, 550, "en-US"),
            serde_json::json!({"id": 550}),
            chrono::Utc::now().timestamp_millis(),
        );

        client.set_locale("en-US", "US");
        assert_eq!(client.cache().len(), 1);

        client.set_locale("pt-BR", "BR");
        assert!(client.cache().is_empty());
    }
}
