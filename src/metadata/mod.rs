use std::fmt;

use serde::{Deserialize, Serialize};

pub mod cache;
pub mod tmdb;

pub use cache::MetadataCache;
pub use tmdb::TmdbClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Tv,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Movie => "movie",
            MediaType::Tv => "tv",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External id namespaces accepted by the find endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalSource {
    Imdb,
    Tvdb,
}

impl ExternalSource {
    pub fn as_query_param(&self) -> &'static str {
        match self {
            ExternalSource::Imdb => "imdb_id",
            ExternalSource::Tvdb => "tvdb_id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonSummary {
    pub season_number: u32,
    #[serde(default)]
    pub episode_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalIds {
    #[serde(default)]
    pub imdb_id: Option<String>,
    #[serde(default)]
    pub tvdb_id: Option<u64>,
}

/// Movie or series detail payload. Enrichments are kept as raw JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TitleDetails {
    pub id: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub seasons: Vec<SeasonSummary>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub first_air_date: Option<String>,
    #[serde(default)]
    pub runtime: Option<u32>,
    #[serde(default)]
    pub external_ids: Option<ExternalIds>,
    #[serde(default)]
    pub credits: Option<serde_json::Value>,
    #[serde(default)]
    pub videos: Option<serde_json::Value>,
    #[serde(default)]
    pub images: Option<serde_json::Value>,
    #[serde(default)]
    pub translations: Option<serde_json::Value>,
    #[serde(default)]
    pub release_dates: Option<serde_json::Value>,
}

impl TitleDetails {
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub episode_number: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub air_date: Option<String>,
    #[serde(default)]
    pub still_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeasonDetails {
    #[serde(default)]
    pub season_number: u32,
    #[serde(default)]
    pub episodes: Vec<EpisodeSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchItem {
    pub id: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Only present on multi-search results
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub first_air_date: Option<String>,
}

impl SearchItem {
    pub fn parsed_media_type(&self) -> Option<MediaType> {
        match self.media_type.as_deref() {
            Some("movie") => Some(MediaType::Movie),
            Some("tv") => Some(MediaType::Tv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResults {
    #[serde(default)]
    pub results: Vec<SearchItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindResults {
    #[serde(default)]
    pub movie_results: Vec<SearchItem>,
    #[serde(default)]
    pub tv_results: Vec<SearchItem>,
}

/// Remote metadata lookups.
///
/// Implementations never fail outright: exhausted retries and transport
/// errors come back as `None` or an empty result.
#[async_trait::async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn details(&self, id: u64, media_type: MediaType) -> Option<TitleDetails>;

    async fn season_details(&self, series_id: u64, season_number: u32) -> Option<SeasonDetails>;

    async fn find(&self, external_id: &str, source: ExternalSource) -> FindResults;

    /// `None` searches movies and series together
    async fn search(&self, query: &str, media_type: Option<MediaType>) -> SearchResults;
}
