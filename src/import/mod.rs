//! Bulk reconciliation of external watch history into the tracker
//!
//! Both importers build a single [`Delta`] and merge it at the end, so each
//! affected record is written once per import.

pub mod columns;
pub mod csv_file;
pub mod trakt;

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use tracing::info;

pub use csv_file::{export_csv, import_csv};
pub use trakt::import_trakt_zip;

use crate::config::ImportConfig;
use crate::tracking::{Delta, Tracker, WatchKey};

static YEAR_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*\(\d{4}\)\s*$").unwrap());

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub movies: usize,
    pub episodes: usize,
    pub watchlist: usize,
    pub statuses: usize,
    pub skipped_rows: usize,
}

/// Result of an import that ran to completion. A ZIP without any known
/// export file is reported as [`crate::error::Error::MissingArchiveFiles`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Changed(ImportSummary),
    Unchanged,
}

impl ImportOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, ImportOutcome::Changed(_))
    }
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Concurrent id lookups per batch
    pub batch_size: usize,
    /// Pause between title searches for hidden shows
    pub title_search_delay: Duration,
    /// Series untouched for longer than this are marked stopped after a ZIP import
    pub auto_stop_after: Duration,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self::from(&ImportConfig::default())
    }
}

impl From<&ImportConfig> for ImportOptions {
    fn from(config: &ImportConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            title_search_delay: Duration::from_millis(config.title_search_delay_ms),
            auto_stop_after: Duration::from_secs(u64::from(config.auto_stop_days) * 24 * 60 * 60),
        }
    }
}

/// Progress callback wrapper that never reports a smaller value
pub(crate) struct Progress<'a> {
    sink: &'a mut dyn FnMut(f32),
    last: f32,
}

impl<'a> Progress<'a> {
    pub(crate) fn new(sink: &'a mut dyn FnMut(f32)) -> Self {
        Self { sink, last: 0.0 }
    }

    pub(crate) fn report(&mut self, value: f32) {
        let value = value.clamp(0.0, 1.0);
        if value > self.last {
            self.last = value;
            (self.sink)(value);
        }
    }
}

/// Parse an export timestamp into Unix milliseconds
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc().timestamp_millis());
    }

    raw.parse::<i64>().ok()
}

pub fn format_timestamp(ms: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}

/// "Heat (1995)" -> "Heat"
pub fn strip_year_suffix(title: &str) -> &str {
    match YEAR_SUFFIX.find(title) {
        Some(m) => title[..m.start()].trim(),
        None => title.trim(),
    }
}

/// Merge the accumulated delta and report what it did
pub(crate) fn commit(tracker: &mut Tracker, delta: Delta, skipped_rows: usize) -> ImportOutcome {
    if delta.is_empty() {
        return ImportOutcome::Unchanged;
    }

    let summary = ImportSummary {
        movies: delta
            .watched
            .iter()
            .filter(|k| matches!(k, WatchKey::Movie { .. }))
            .count(),
        episodes: delta
            .watched
            .iter()
            .filter(|k| matches!(k, WatchKey::Episode { .. }))
            .count(),
        watchlist: delta.watchlist.len(),
        statuses: delta.statuses.len(),
        skipped_rows,
    };

    let dirty = tracker.merge(delta);
    if !dirty.any() {
        return ImportOutcome::Unchanged;
    }

    info!(
        movies = summary.movies,
        episodes = summary.episodes,
        watchlist = summary.watchlist,
        statuses = summary.statuses,
        skipped = summary.skipped_rows,
        "Import merged"
    );
    ImportOutcome::Changed(summary)
}
