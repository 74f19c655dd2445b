//! Header-driven column lookup for loosely specified CSV exports

use csv::StringRecord;

use crate::import::parse_timestamp;
use crate::metadata::MediaType;

const TMDB_ID: &[&str] = &["tmdb_id", "id"];
const TITLE: &[&str] = &["title"];
const TYPE: &[&str] = &["type"];
const SEASON: &[&str] = &["season"];
const EPISODE: &[&str] = &["episode"];
const STATUS: &[&str] = &["status", "series_status"];
const WATCHED_AT: &[&str] = &["watched_at", "watched at"];
const IMDB: &[&str] = &["imdb_id", "imdb"];
const TVDB: &[&str] = &["tvdb_id", "tvdb"];
const WATCHLISTED: &[&str] = &["is_watchlisted", "watchlisted"];
const WATCHED: &[&str] = &["is_watched", "watched"];

/// Media kind as written in the file, before disambiguation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowKind {
    Movie,
    Tv,
    /// Missing or unrecognized type column
    Multi,
}

impl RowKind {
    /// `show`, `series`, `episode` (or exactly `tv`) mean tv; `movie`,
    /// `film` mean movie
    pub fn classify(raw: &str) -> Self {
        let raw = raw.trim().to_lowercase();
        if raw == "tv" || ["show", "series", "episode"].iter().any(|t| raw.contains(t)) {
            RowKind::Tv
        } else if ["movie", "film"].iter().any(|t| raw.contains(t)) {
            RowKind::Movie
        } else {
            RowKind::Multi
        }
    }

    /// Explicit type wins, then a non-zero season implies tv, otherwise movie
    pub fn resolve(self, season: Option<u32>) -> MediaType {
        match self {
            RowKind::Movie => MediaType::Movie,
            RowKind::Tv => MediaType::Tv,
            RowKind::Multi if season.is_some_and(|s| s > 0) => MediaType::Tv,
            RowKind::Multi => MediaType::Movie,
        }
    }

    pub fn media_type(self) -> Option<MediaType> {
        match self {
            RowKind::Movie => Some(MediaType::Movie),
            RowKind::Tv => Some(MediaType::Tv),
            RowKind::Multi => None,
        }
    }
}

/// Position of each logical column, `None` when the header lacks it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Columns {
    pub tmdb_id: Option<usize>,
    pub title: Option<usize>,
    pub kind: Option<usize>,
    pub season: Option<usize>,
    pub episode: Option<usize>,
    pub status: Option<usize>,
    pub watched_at: Option<usize>,
    pub imdb: Option<usize>,
    pub tvdb: Option<usize>,
    pub watchlisted: Option<usize>,
    pub watched: Option<usize>,
}

/// One parsed data row
#[derive(Debug, Clone, PartialEq)]
pub struct CsvRow {
    pub tmdb_id: Option<u64>,
    pub title: Option<String>,
    pub kind: RowKind,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub status: Option<String>,
    pub watched_at: Option<i64>,
    pub imdb: Option<String>,
    pub tvdb: Option<String>,
    pub watchlisted: bool,
    pub watched: bool,
}

/// Normalize header cells for lookup
pub fn normalize_headers(record: &StringRecord) -> Vec<String> {
    record
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_lowercase())
        .collect()
}

/// First header matching any alias, aliases tried in order
pub fn find_column(headers: &[String], aliases: &[&str]) -> Option<usize> {
    aliases
        .iter()
        .find_map(|alias| headers.iter().position(|h| h == alias))
}

/// Only `true` and `1` count as set
fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "true" | "1")
}

fn non_empty(raw: &str) -> Option<String> {
    let raw = raw.trim();
    (!raw.is_empty()).then(|| raw.to_string())
}

impl Columns {
    pub fn resolve(headers: &[String]) -> Self {
        Self {
            tmdb_id: find_column(headers, TMDB_ID),
            title: find_column(headers, TITLE),
            kind: find_column(headers, TYPE),
            season: find_column(headers, SEASON),
            episode: find_column(headers, EPISODE),
            status: find_column(headers, STATUS),
            watched_at: find_column(headers, WATCHED_AT),
            imdb: find_column(headers, IMDB),
            tvdb: find_column(headers, TVDB),
            watchlisted: find_column(headers, WATCHLISTED),
            watched: find_column(headers, WATCHED),
        }
    }

    fn cell<'r>(&self, record: &'r StringRecord, index: Option<usize>) -> &'r str {
        index.and_then(|i| record.get(i)).unwrap_or("").trim()
    }

    pub fn read(&self, record: &StringRecord) -> CsvRow {
        CsvRow {
            tmdb_id: self
                .cell(record, self.tmdb_id)
                .parse::<u64>()
                .ok()
                .filter(|id| *id > 0),
            title: non_empty(self.cell(record, self.title)),
            kind: RowKind::classify(self.cell(record, self.kind)),
            season: self.cell(record, self.season).parse().ok(),
            episode: self.cell(record, self.episode).parse().ok(),
            status: non_empty(self.cell(record, self.status)).map(|s| s.to_lowercase()),
            watched_at: parse_timestamp(self.cell(record, self.watched_at)),
            imdb: non_empty(self.cell(record, self.imdb)),
            tvdb: non_empty(self.cell(record, self.tvdb)),
            watchlisted: parse_flag(self.cell(record, self.watchlisted)),
            watched: parse_flag(self.cell(record, self.watched)),
        }
    }
}
