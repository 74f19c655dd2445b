//! Trakt export archive import
//!
//! The archive layout varies between export versions, so entries are
//! matched by path and each recognized file is processed on its own. All of
//! them feed one [`Delta`].

use std::collections::BTreeSet;
use std::io::{Cursor, Read};

use csv::{ReaderBuilder, StringRecord, Trim};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::error::{Error, Result};
use crate::import::columns::{find_column, normalize_headers};
use crate::import::{
    ImportOptions, ImportOutcome, Progress, commit, parse_timestamp, strip_year_suffix,
};
use crate::metadata::{MediaType, MetadataProvider};
use crate::tracking::{Delta, EntityRef, TrackingState, Tracker, WatchKey, status};

const MOVIE_TMDB_ID: &[&str] = &["tmdb_id", "tmdb id"];
const SHOW_TMDB_ID: &[&str] = &["show_tmdb_id", "show tmdb id"];
const SEASON_NUMBER: &[&str] = &["season_number", "season number"];
const EPISODE_NUMBER: &[&str] = &["episode_number", "episode number"];
const LAST_WATCHED_AT: &[&str] = &["last_watched_at", "last watched at"];

const HIDDEN_FILES: &[&str] = &[
    "hidden/hidden-progress-watched.json",
    "hidden/hidden-progress-collected.json",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Movies,
    Episodes,
    History,
    Watchlist,
    Hidden,
}

/// Recognized entries, by archive path
#[derive(Debug, Default)]
struct ArchiveLayout {
    movies_csv: Option<String>,
    episodes_csv: Option<String>,
    history: Vec<String>,
    watchlist: Option<String>,
    hidden: Vec<String>,
}

impl ArchiveLayout {
    fn scan<'a>(names: impl Iterator<Item = &'a str>) -> Self {
        let mut layout = Self::default();
        for name in names {
            if name.ends_with('/') {
                continue;
            }
            let lower = name.to_lowercase();
            let file = lower.rsplit('/').next().unwrap_or(&lower);

            if lower.ends_with("movies.csv") {
                keep_longest(&mut layout.movies_csv, name);
            } else if lower.ends_with("episodes.csv") {
                keep_longest(&mut layout.episodes_csv, name);
            } else if file.starts_with("history-")
                && file.ends_with(".json")
                && has_path_suffix(&lower, &format!("watched/{file}"))
            {
                layout.history.push(name.to_string());
            } else if has_path_suffix(&lower, "lists/watchlist.json") {
                layout.watchlist = Some(name.to_string());
            } else if HIDDEN_FILES.iter().any(|h| has_path_suffix(&lower, h))
                || file == "shows.json"
            {
                layout.hidden.push(name.to_string());
            }
        }
        layout.history.sort();
        layout.hidden.sort();
        layout
    }

    fn is_empty(&self) -> bool {
        self.movies_csv.is_none()
            && self.episodes_csv.is_none()
            && self.history.is_empty()
            && self.watchlist.is_none()
            && self.hidden.is_empty()
    }

    /// Entries in processing order
    fn entries(&self) -> Vec<(&str, EntryKind)> {
        let mut entries = Vec::new();
        if let Some(name) = &self.movies_csv {
            entries.push((name.as_str(), EntryKind::Movies));
        }
        if let Some(name) = &self.episodes_csv {
            entries.push((name.as_str(), EntryKind::Episodes));
        }
        entries.extend(self.history.iter().map(|n| (n.as_str(), EntryKind::History)));
        if let Some(name) = &self.watchlist {
            entries.push((name.as_str(), EntryKind::Watchlist));
        }
        entries.extend(self.hidden.iter().map(|n| (n.as_str(), EntryKind::Hidden)));
        entries
    }
}

/// Deepest path wins when several entries match
fn keep_longest(slot: &mut Option<String>, name: &str) {
    if slot.as_ref().is_none_or(|current| name.len() > current.len()) {
        *slot = Some(name.to_string());
    }
}

fn has_path_suffix(path: &str, suffix: &str) -> bool {
    path == suffix || path.ends_with(&format!("/{suffix}"))
}

fn read_entry<R: Read + std::io::Seek>(archive: &mut ZipArchive<R>, name: &str) -> Option<String> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(e) => {
            warn!(entry = name, error = %e, "Failed to open archive entry");
            return None;
        }
    };
    let mut text = String::new();
    match file.read_to_string(&mut text) {
        Ok(_) => Some(text.trim_start_matches('\u{feff}').to_string()),
        Err(e) => {
            warn!(entry = name, error = %e, "Failed to read archive entry");
            None
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Ids {
    /// Number in most exports, string in some
    #[serde(default)]
    tmdb: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct MediaRef {
    #[serde(default)]
    ids: Ids,
    #[serde(default)]
    title: Option<String>,
}

impl MediaRef {
    fn tmdb_id(&self) -> Option<u64> {
        let id = match self.ids.tmdb.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        id.filter(|id| *id > 0)
    }
}

#[derive(Debug, Deserialize)]
struct EpisodeNumber {
    #[serde(default)]
    season: Option<u32>,
    #[serde(default)]
    number: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    movie: Option<MediaRef>,
    #[serde(default)]
    show: Option<MediaRef>,
    #[serde(default)]
    episode: Option<EpisodeNumber>,
    #[serde(default)]
    watched_at: Option<String>,
}

/// Parse a JSON array entry by entry, dropping entries of the wrong shape
fn parse_entries<T: for<'de> Deserialize<'de>>(name: &str, text: &str) -> Vec<T> {
    let values: Vec<Value> = match serde_json::from_str(text) {
        Ok(values) => values,
        Err(e) => {
            warn!(entry = name, error = %e, "Archive entry is not a JSON array");
            return Vec::new();
        }
    };
    values
        .into_iter()
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect()
}

fn read_csv(name: &str, text: &str) -> Option<(Vec<String>, Vec<StringRecord>)> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());
    let headers = match reader.headers() {
        Ok(headers) => normalize_headers(headers),
        Err(e) => {
            warn!(entry = name, error = %e, "Unreadable CSV header");
            return None;
        }
    };
    let records = reader.records().filter_map(|r| r.ok()).collect();
    Some((headers, records))
}

fn cell(record: &StringRecord, index: Option<usize>) -> &str {
    index.and_then(|i| record.get(i)).unwrap_or("").trim()
}

fn apply_movies_csv(delta: &mut Delta, name: &str, text: &str) -> usize {
    let Some((headers, records)) = read_csv(name, text) else {
        return 0;
    };
    let id_col = find_column(&headers, MOVIE_TMDB_ID);
    let ts_col = find_column(&headers, LAST_WATCHED_AT);

    let mut skipped = 0;
    for record in &records {
        match cell(record, id_col).parse::<u64>().ok().filter(|id| *id > 0) {
            Some(id) => {
                delta.mark_watched(WatchKey::Movie { id });
                if let Some(ts) = parse_timestamp(cell(record, ts_col)) {
                    delta.touch(EntityRef::movie(id), ts);
                }
            }
            None => skipped += 1,
        }
    }
    debug!(entry = name, rows = records.len(), skipped, "Processed movies CSV");
    skipped
}

fn apply_episodes_csv(delta: &mut Delta, name: &str, text: &str) -> usize {
    let Some((headers, records)) = read_csv(name, text) else {
        return 0;
    };
    let id_col = find_column(&headers, SHOW_TMDB_ID);
    let season_col = find_column(&headers, SEASON_NUMBER);
    let episode_col = find_column(&headers, EPISODE_NUMBER);
    let ts_col = find_column(&headers, LAST_WATCHED_AT);

    let mut skipped = 0;
    for record in &records {
        let id = cell(record, id_col).parse::<u64>().ok().filter(|id| *id > 0);
        let season = cell(record, season_col).parse::<u32>().ok();
        let episode = cell(record, episode_col).parse::<u32>().ok();
        let (Some(id), Some(season), Some(episode)) = (id, season, episode) else {
            skipped += 1;
            continue;
        };

        delta.mark_watched(WatchKey::episode(id, season, episode));
        if let Some(ts) = parse_timestamp(cell(record, ts_col)) {
            delta.touch(EntityRef::tv(id), ts);
        }
    }
    debug!(entry = name, rows = records.len(), skipped, "Processed episodes CSV");
    skipped
}

fn apply_history(delta: &mut Delta, name: &str, text: &str) -> usize {
    let mut skipped = 0;
    for entry in parse_entries::<ListEntry>(name, text) {
        let ts = entry.watched_at.as_deref().and_then(parse_timestamp);
        match entry.kind.as_str() {
            "movie" => {
                let Some(id) = entry.movie.as_ref().and_then(MediaRef::tmdb_id) else {
                    skipped += 1;
                    continue;
                };
                delta.mark_watched(WatchKey::Movie { id });
                if let Some(ts) = ts {
                    delta.touch(EntityRef::movie(id), ts);
                }
            }
            "episode" => {
                let id = entry.show.as_ref().and_then(MediaRef::tmdb_id);
                let numbers = entry.episode.as_ref().and_then(|e| e.season.zip(e.number));
                let (Some(id), Some((season, episode))) = (id, numbers) else {
                    skipped += 1;
                    continue;
                };
                delta.mark_watched(WatchKey::episode(id, season, episode));
                if let Some(ts) = ts {
                    delta.touch(EntityRef::tv(id), ts);
                }
            }
            other => {
                debug!(kind = other, "Skipping history entry");
                skipped += 1;
            }
        }
    }
    skipped
}

fn apply_watchlist(delta: &mut Delta, name: &str, text: &str) -> usize {
    let mut skipped = 0;
    for entry in parse_entries::<ListEntry>(name, text) {
        let target = match entry.kind.as_str() {
            "movie" => entry
                .movie
                .as_ref()
                .and_then(MediaRef::tmdb_id)
                .map(EntityRef::movie),
            "show" | "season" | "episode" => entry
                .show
                .as_ref()
                .and_then(MediaRef::tmdb_id)
                .map(EntityRef::tv),
            _ => None,
        };
        match target {
            Some(entity) => delta.add_to_watchlist(entity),
            None => skipped += 1,
        }
    }
    skipped
}

/// Hidden entries wrap the show in `show`, `shows.json` lists shows directly
fn hidden_shows(name: &str, text: &str) -> Vec<MediaRef> {
    parse_entries::<Value>(name, text)
        .into_iter()
        .filter_map(|value| {
            let show = value.get("show").cloned().unwrap_or(value);
            serde_json::from_value::<MediaRef>(show).ok()
        })
        .collect()
}

async fn apply_hidden<P: MetadataProvider + ?Sized>(
    delta: &mut Delta,
    provider: &P,
    shows: Vec<MediaRef>,
    options: &ImportOptions,
) -> usize {
    let mut skipped = 0;
    let mut searched = false;
    for show in shows {
        let id = match show.tmdb_id() {
            Some(id) => Some(id),
            None => match show.title.as_deref().map(strip_year_suffix) {
                Some(title) if !title.is_empty() => {
                    if searched {
                        tokio::time::sleep(options.title_search_delay).await;
                    }
                    searched = true;
                    provider
                        .search(title, Some(MediaType::Tv))
                        .await
                        .results
                        .first()
                        .map(|item| item.id)
                }
                _ => None,
            },
        };
        match id {
            Some(id) => delta.set_status(id, status::STOPPED),
            None => {
                debug!(title = ?show.title, "Hidden show could not be resolved");
                skipped += 1;
            }
        }
    }
    skipped
}

/// Stop every series last watched before `cutoff_ms` that is not stopped yet
fn auto_stop(snapshot: &TrackingState, delta: &mut Delta, cutoff_ms: i64) {
    let mut candidates: BTreeSet<u64> = snapshot.tracked_series_ids();
    candidates.extend(snapshot.series_with_last_watched());
    candidates.extend(delta.watched.iter().filter_map(WatchKey::series_id));
    candidates.extend(delta.statuses.keys().copied());
    candidates.extend(
        delta
            .last_watched
            .keys()
            .filter(|e| e.kind == MediaType::Tv)
            .map(|e| e.id),
    );

    let mut stopped = 0;
    for series_id in candidates {
        let pending = delta.last_watched.get(&EntityRef::tv(series_id)).copied();
        let last = snapshot.series_last_watched(series_id).max(pending);
        let Some(last) = last else {
            continue;
        };
        let already_stopped = match delta.statuses.get(&series_id) {
            Some(value) => status::is_stopped(value),
            None => snapshot.is_stopped(series_id),
        };
        if last < cutoff_ms && !already_stopped {
            delta.set_status(series_id, status::STOPPED);
            stopped += 1;
        }
    }
    if stopped > 0 {
        info!(count = stopped, "Auto-stopped inactive series");
    }
}

/// Import a Trakt export archive.
///
/// Fails with [`Error::MissingArchiveFiles`] when the archive holds none of
/// the known export files.
pub async fn import_trakt_zip<P: MetadataProvider + ?Sized>(
    tracker: &mut Tracker,
    provider: &P,
    bytes: &[u8],
    options: &ImportOptions,
    progress: &mut dyn FnMut(f32),
) -> Result<ImportOutcome> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    let layout = ArchiveLayout::scan(names.iter().map(String::as_str));
    if layout.is_empty() {
        warn!(entries = names.len(), "Archive has no recognizable export files");
        return Err(Error::MissingArchiveFiles);
    }
    info!(?layout, "Importing Trakt archive");

    let mut progress = Progress::new(progress);
    let entries = layout.entries();
    let steps = (entries.len() + 1) as f32;

    let mut delta = Delta::default();
    let mut skipped = 0;
    for (done, (name, kind)) in entries.into_iter().enumerate() {
        if let Some(text) = read_entry(&mut archive, name) {
            skipped += match kind {
                EntryKind::Movies => apply_movies_csv(&mut delta, name, &text),
                EntryKind::Episodes => apply_episodes_csv(&mut delta, name, &text),
                EntryKind::History => apply_history(&mut delta, name, &text),
                EntryKind::Watchlist => apply_watchlist(&mut delta, name, &text),
                EntryKind::Hidden => {
                    let shows = hidden_shows(name, &text);
                    apply_hidden(&mut delta, provider, shows, options).await
                }
            };
        }
        progress.report((done + 1) as f32 / steps);
    }

    let now = chrono::Utc::now().timestamp_millis();
    let cutoff = now.saturating_sub(options.auto_stop_after.as_millis() as i64);
    auto_stop(&tracker.snapshot(), &mut delta, cutoff);

    let outcome = commit(tracker, delta, skipped);
    progress.report(1.0);
    Ok(outcome)
}
