//! CSV backup import and export
//!
//! Import runs in two phases. Rows without a usable TMDB id are resolved
//! first, in small concurrent batches. Only then are rows merged, since the
//! merge reads the resolution map.

use std::collections::{BTreeMap, HashMap, HashSet};

use csv::{QuoteStyle, ReaderBuilder, Trim, WriterBuilder};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::import::columns::{Columns, CsvRow, RowKind, normalize_headers};
use crate::import::{
    ImportOptions, ImportOutcome, Progress, commit, format_timestamp, strip_year_suffix,
};
use crate::metadata::{ExternalSource, FindResults, MediaType, MetadataProvider, SeasonSummary};
use crate::tracking::{Delta, EntityRef, TrackingState, Tracker, WatchKey, status};

const EXPORT_HEADER: [&str; 6] = ["tmdb_id", "type", "season", "episode", "status", "watched_at"];

/// Status values that mean a movie row was watched
const WATCHED_STATUSES: &[&str] = &["visto", "watched", "completed", "vido"];

const RESOLVE_SHARE: f32 = 0.3;
const ROWS_SHARE: f32 = 0.4;

/// Rows sharing a lookup key are resolved once
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LookupKey {
    title: String,
    kind: RowKind,
    imdb: Option<String>,
    tvdb: Option<String>,
}

#[derive(Debug, Clone)]
struct LookupRequest {
    title: Option<String>,
    kind: RowKind,
    imdb: Option<String>,
    tvdb: Option<String>,
}

impl LookupKey {
    fn for_row(row: &CsvRow) -> Option<Self> {
        if row.tmdb_id.is_some() {
            return None;
        }
        if row.title.is_none() && row.imdb.is_none() && row.tvdb.is_none() {
            return None;
        }
        Some(Self {
            title: row.title.as_deref().unwrap_or_default().to_lowercase(),
            kind: lookup_kind(row),
            imdb: row.imdb.clone(),
            tvdb: row.tvdb.clone(),
        })
    }
}

/// An untyped row with a season is looked up as a series
fn lookup_kind(row: &CsvRow) -> RowKind {
    match row.kind {
        RowKind::Multi if row.season.is_some_and(|s| s > 0) => RowKind::Tv,
        kind => kind,
    }
}

#[derive(Debug, Default)]
struct SeriesProgress {
    furthest: Option<(u32, u32)>,
    statuses: Vec<String>,
    last_watched: Option<i64>,
    watchlisted: bool,
}

fn pick_find(results: FindResults, kind: RowKind) -> Option<(u64, MediaType)> {
    let movie = results.movie_results.first().map(|m| (m.id, MediaType::Movie));
    let tv = results.tv_results.first().map(|t| (t.id, MediaType::Tv));
    match kind {
        RowKind::Movie => movie,
        RowKind::Tv => tv,
        RowKind::Multi => movie.or(tv),
    }
}

/// IMDB id, then TVDB id for series, then a title search
async fn resolve<P: MetadataProvider + ?Sized>(
    provider: &P,
    request: &LookupRequest,
) -> Option<(u64, MediaType)> {
    if let Some(imdb) = &request.imdb {
        let found = provider.find(imdb, ExternalSource::Imdb).await;
        if let Some(hit) = pick_find(found, request.kind) {
            return Some(hit);
        }
    }

    if request.kind == RowKind::Tv {
        if let Some(tvdb) = &request.tvdb {
            let found = provider.find(tvdb, ExternalSource::Tvdb).await;
            if let Some(hit) = pick_find(found, RowKind::Tv) {
                return Some(hit);
            }
        }
    }

    let title = request.title.as_deref()?;
    let query = strip_year_suffix(title);
    if query.is_empty() {
        return None;
    }

    let wanted = request.kind.media_type();
    let results = provider.search(query, wanted).await;
    results.results.into_iter().find_map(|item| {
        let media_type = wanted.or_else(|| item.parsed_media_type())?;
        Some((item.id, media_type))
    })
}

fn parse_rows(text: &str) -> Option<Vec<CsvRow>> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let headers = match reader.headers() {
        Ok(headers) => normalize_headers(headers),
        Err(e) => {
            warn!(error = %e, "Unreadable CSV header");
            return None;
        }
    };
    let columns = Columns::resolve(&headers);
    debug!(?columns, "Resolved CSV columns");

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        match record {
            Ok(record) => rows.push(columns.read(&record)),
            Err(e) => debug!(line = line + 2, error = %e, "Skipping unreadable CSV row"),
        }
    }
    Some(rows)
}

/// True if every regular episode is watched in the state or the pending delta
fn is_complete(
    state: &TrackingState,
    delta: &Delta,
    series_id: u64,
    seasons: &[SeasonSummary],
) -> bool {
    let mut regular = seasons.iter().filter(|s| s.season_number > 0).peekable();
    if regular.peek().is_none() {
        return false;
    }
    regular.all(|s| {
        (1..=s.episode_count).all(|e| {
            let key = WatchKey::episode(series_id, s.season_number, e);
            state.is_watched(&key) || delta.watched.contains(&key)
        })
    })
}

/// Import a CSV backup. Returns [`ImportOutcome::Unchanged`] for input
/// without data rows.
pub async fn import_csv<P: MetadataProvider + ?Sized>(
    tracker: &mut Tracker,
    provider: &P,
    text: &str,
    options: &ImportOptions,
    progress: &mut dyn FnMut(f32),
) -> Result<ImportOutcome> {
    let text = text.trim_start_matches('\u{feff}');
    if text.lines().filter(|l| !l.trim().is_empty()).count() < 2 {
        return Ok(ImportOutcome::Unchanged);
    }

    let mut progress = Progress::new(progress);
    let Some(rows) = parse_rows(text) else {
        return Ok(ImportOutcome::Unchanged);
    };
    info!(rows = rows.len(), "Importing CSV");

    // Phase A: resolve rows lacking a TMDB id
    let mut seen = HashSet::new();
    let mut pending: Vec<(LookupKey, LookupRequest)> = Vec::new();
    for row in &rows {
        if let Some(key) = LookupKey::for_row(row) {
            if seen.insert(key.clone()) {
                let request = LookupRequest {
                    title: row.title.clone(),
                    kind: key.kind,
                    imdb: row.imdb.clone(),
                    tvdb: row.tvdb.clone(),
                };
                pending.push((key, request));
            }
        }
    }

    let mut resolved: HashMap<LookupKey, (u64, MediaType)> = HashMap::new();
    let total_lookups = pending.len();
    let mut done = 0;
    for batch in pending.chunks(options.batch_size.max(1)) {
        let hits = join_all(batch.iter().map(|(_, request)| resolve(provider, request))).await;
        for ((key, _), hit) in batch.iter().zip(hits) {
            match hit {
                Some(hit) => {
                    resolved.insert(key.clone(), hit);
                }
                None => debug!(title = %key.title, "No metadata match for CSV row"),
            }
        }
        done += batch.len();
        progress.report(RESOLVE_SHARE * done as f32 / total_lookups as f32);
    }
    progress.report(RESOLVE_SHARE);
    if total_lookups > 0 {
        info!(lookups = total_lookups, resolved = resolved.len(), "Resolved CSV titles");
    }

    // Phase B: merge
    let snapshot = tracker.snapshot();
    let mut delta = Delta::default();
    let mut series: BTreeMap<u64, SeriesProgress> = BTreeMap::new();
    let mut skipped = 0;

    let total_rows = rows.len().max(1);
    for (index, row) in rows.iter().enumerate() {
        let target = match row.tmdb_id {
            Some(id) => Some((id, row.kind.resolve(row.season))),
            None => LookupKey::for_row(row).and_then(|key| resolved.get(&key).copied()),
        };
        let Some((id, media_type)) = target else {
            skipped += 1;
            continue;
        };

        match media_type {
            MediaType::Movie => {
                let status_watched = row
                    .status
                    .as_deref()
                    .is_some_and(|s| WATCHED_STATUSES.contains(&s));
                if row.watched || row.watched_at.is_some() || status_watched {
                    delta.mark_watched(WatchKey::Movie { id });
                    if let Some(ts) = row.watched_at {
                        delta.touch(EntityRef::movie(id), ts);
                    }
                } else if row.watchlisted {
                    delta.add_to_watchlist(EntityRef::movie(id));
                }
            }
            MediaType::Tv => {
                let entry = series.entry(id).or_default();
                if let (Some(season), Some(episode)) = (row.season, row.episode) {
                    if episode > 0 && entry.furthest.is_none_or(|f| (season, episode) > f) {
                        entry.furthest = Some((season, episode));
                    }
                }
                if let Some(token) = &row.status {
                    entry.statuses.push(status::normalize(token));
                }
                if let Some(ts) = row.watched_at {
                    entry.last_watched = Some(entry.last_watched.map_or(ts, |l| l.max(ts)));
                }
                entry.watchlisted |= row.watchlisted;
            }
        }

        if index % 25 == 0 {
            progress.report(RESOLVE_SHARE + ROWS_SHARE * index as f32 / total_rows as f32);
        }
    }
    progress.report(RESOLVE_SHARE + ROWS_SHARE);

    let series_share = 1.0 - RESOLVE_SHARE - ROWS_SHARE;
    let total_series = series.len().max(1);
    for (done, (series_id, entry)) in series.into_iter().enumerate() {
        let stopped_token = entry.statuses.iter().any(|s| status::is_stopped(s));
        if stopped_token {
            delta.set_status(series_id, status::STOPPED);
        } else if let Some(last) = entry.statuses.last() {
            delta.set_status(series_id, last);
        }
        let stopped = match delta.statuses.get(&series_id) {
            Some(value) => status::is_stopped(value),
            None => snapshot.is_stopped(series_id),
        };

        if let Some(ts) = entry.last_watched {
            delta.touch(EntityRef::tv(series_id), ts);
        }

        let complete = match entry.furthest {
            Some((season, episode)) => {
                let seasons = provider
                    .details(series_id, MediaType::Tv)
                    .await
                    .map(|d| d.seasons)
                    .unwrap_or_default();
                if seasons.is_empty() {
                    debug!(series_id, "No season metadata, marking only the given season");
                }
                delta.mark_through(series_id, &seasons, season, episode);
                is_complete(&snapshot, &delta, series_id, &seasons)
            }
            None => !entry.watchlisted,
        };

        if !complete && !stopped {
            delta.add_to_watchlist(EntityRef::tv(series_id));
        }

        progress.report(
            RESOLVE_SHARE + ROWS_SHARE + series_share * (done + 1) as f32 / total_series as f32,
        );
    }

    let outcome = commit(tracker, delta, skipped);
    progress.report(1.0);
    Ok(outcome)
}

/// Render watched movies and each tracked series' furthest episode as a
/// UTF-8 CSV with BOM, every field quoted
pub fn export_csv(state: &TrackingState) -> Result<Vec<u8>> {
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Always)
        .from_writer(b"\xEF\xBB\xBF".to_vec());

    writer.write_record(EXPORT_HEADER)?;

    for id in state.tracked_movie_ids() {
        let watched_at = state
            .last_watched(EntityRef::movie(id))
            .and_then(format_timestamp)
            .unwrap_or_default();
        writer.write_record([
            id.to_string().as_str(),
            "movie",
            "",
            "",
            "watched",
            watched_at.as_str(),
        ])?;
    }

    for id in state.tracked_series_ids() {
        let (season, episode) = state
            .furthest_watched(id)
            .map(|f| (f.season.to_string(), f.episode.to_string()))
            .unwrap_or_default();
        let status = state.series_statuses().get(&id).cloned().unwrap_or_default();
        let watched_at = state
            .series_last_watched(id)
            .and_then(format_timestamp)
            .unwrap_or_default();
        writer.write_record([
            id.to_string().as_str(),
            "tv",
            season.as_str(),
            episode.as_str(),
            status.as_str(),
            watched_at.as_str(),
        ])?;
    }

    writer
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::fake::FakeProvider;
    use crate::storage::RecordStore;
    use crate::tracking::{Command, EpisodeDetails};

    fn tracker() -> Tracker {
        Tracker::load(RecordStore::in_memory())
    }

    fn no_progress() -> impl FnMut(f32) {
        |_| {}
    }

    async fn run(tracker: &mut Tracker, provider: &FakeProvider, text: &str) -> ImportOutcome {
        let mut sink = no_progress();
        import_csv(tracker, provider, text, &ImportOptions::default(), &mut sink)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_movie_row_with_timestamp() {
        let mut tracker = tracker();
        let outcome = run(
            &mut tracker,
            &FakeProvider::default(),
            "tmdb_id,type,watched_at\n550,movie,2023-05-01T00:00:00Z\n",
        )
        .await;

        assert!(outcome.changed());
        let state = tracker.snapshot();
        assert!(state.is_movie_watched(550));
        assert_eq!(state.last_watched(EntityRef::movie(550)), Some(1_682_899_200_000));
        assert_eq!(state.watched_record().get("movie_550"), Some(&true));
        assert_eq!(
            state.last_watched_record().get("movie_550"),
            Some(&1_682_899_200_000)
        );
    }

    #[tokio::test]
    async fn test_header_only_is_unchanged() {
        let mut tracker = tracker();
        let provider = FakeProvider::default();
        assert_eq!(
            run(&mut tracker, &provider, "tmdb_id,type\n").await,
            ImportOutcome::Unchanged
        );
        assert_eq!(run(&mut tracker, &provider, "").await, ImportOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_missing_status_and_date_columns() {
        let mut tracker = tracker();
        let outcome = run(
            &mut tracker,
            &FakeProvider::default(),
            "tmdb_id,type,is_watched,is_watchlisted\n550,movie,true,\n603,movie,false,1\n13,film,0,0\n",
        )
        .await;

        assert!(outcome.changed());
        let state = tracker.snapshot();
        assert!(state.is_movie_watched(550));
        assert!(!state.is_movie_watched(603));
        assert!(state.is_in_watchlist(EntityRef::movie(603)));
        assert!(!state.is_movie_watched(13));
        assert!(!state.is_in_watchlist(EntityRef::movie(13)));
    }

    #[tokio::test]
    async fn test_movie_status_words_mark_watched() {
        let mut tracker = tracker();
        run(
            &mut tracker,
            &FakeProvider::default(),
            "id,type,status\n1,movie,Visto\n2,movie,completed\n3,movie,plan to watch\n",
        )
        .await;

        let state = tracker.snapshot();
        assert!(state.is_movie_watched(1));
        assert!(state.is_movie_watched(2));
        assert!(!state.is_movie_watched(3));
    }

    #[tokio::test]
    async fn test_series_cascades_to_furthest_episode() {
        let provider = FakeProvider::default().with_series(10, &[(1, 3), (2, 4)]);
        let mut tracker = tracker();
        run(
            &mut tracker,
            &provider,
            "tmdb_id,type,season,episode,watched_at\n\
             10,show,1,2,2024-01-01\n\
             10,show,2,1,2024-02-01\n\
             10,show,1,3,2024-01-05\n",
        )
        .await;

        let state = tracker.snapshot();
        for e in 1..=3 {
            assert!(state.is_episode_watched(10, 1, e));
        }
        assert!(state.is_episode_watched(10, 2, 1));
        assert!(!state.is_episode_watched(10, 2, 2));
        assert!(state.is_in_watchlist(EntityRef::tv(10)));
        assert_eq!(
            state.series_last_watched(10),
            crate::import::parse_timestamp("2024-02-01")
        );
    }

    #[tokio::test]
    async fn test_completed_series_not_added_to_watchlist() {
        let provider = FakeProvider::default().with_series(10, &[(1, 2)]);
        let mut tracker = tracker();
        run(&mut tracker, &provider, "tmdb_id,type,season,episode\n10,tv,1,2\n").await;

        let state = tracker.snapshot();
        assert!(state.is_episode_watched(10, 1, 1));
        assert!(!state.is_in_watchlist(EntityRef::tv(10)));
    }

    #[tokio::test]
    async fn test_stopped_token_overrides_continuing() {
        let provider = FakeProvider::default().with_series(20, &[(1, 5)]);
        let mut tracker = tracker();
        run(
            &mut tracker,
            &provider,
            "tmdb_id,type,season,episode,status\n\
             20,series,1,1,continuing\n\
             20,series,1,2,Dropped\n\
             20,series,1,3,continuing\n",
        )
        .await;

        let state = tracker.snapshot();
        assert_eq!(state.series_status(20), "stopped");
        assert!(!state.is_in_watchlist(EntityRef::tv(20)));
    }

    #[tokio::test]
    async fn test_multi_type_uses_season_column() {
        let provider = FakeProvider::default().with_series(30, &[(1, 10)]);
        let mut tracker = tracker();
        run(
            &mut tracker,
            &provider,
            "tmdb_id,season,episode\n30,1,4\n40,,\n",
        )
        .await;

        let state = tracker.snapshot();
        assert!(state.is_episode_watched(30, 1, 4));
        assert!(!state.is_movie_watched(30));
        // No watched signal for the movie row
        assert!(!state.is_movie_watched(40));
    }

    #[tokio::test]
    async fn test_title_lookups_are_deduplicated() {
        let provider = FakeProvider::default()
            .with_search("Heat", 949, MediaType::Movie)
            .with_search("Dark", 70523, MediaType::Tv)
            .with_series(70523, &[(1, 10)]);
        let mut tracker = tracker();
        let mut seen = Vec::new();
        let mut sink = |v: f32| seen.push(v);
        let outcome = import_csv(
            &mut tracker,
            &provider,
            "title,type,season,episode,watched\n\
             Heat (1995),movie,,,true\n\
             heat (1995),movie,,,true\n\
             Dark,show,1,3,\n\
             Dark,show,1,5,\n\
             Nothing Matches,movie,,,true\n",
            &ImportOptions::default(),
            &mut sink,
        )
        .await
        .unwrap();

        assert_eq!(provider.search_count(), 3);
        match outcome {
            ImportOutcome::Changed(summary) => assert_eq!(summary.skipped_rows, 1),
            ImportOutcome::Unchanged => panic!("expected changes"),
        }
        let state = tracker.snapshot();
        assert!(state.is_movie_watched(949));
        assert!(state.is_episode_watched(70523, 1, 5));
        assert!(!state.is_episode_watched(70523, 1, 6));

        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&1.0));
    }

    #[tokio::test]
    async fn test_imdb_then_tvdb_resolution() {
        let provider = FakeProvider::default()
            .with_external("tt0137523", ExternalSource::Imdb, 550, MediaType::Movie)
            .with_external("121361", ExternalSource::Tvdb, 1399, MediaType::Tv)
            .with_series(1399, &[(1, 10)]);
        let mut tracker = tracker();
        run(
            &mut tracker,
            &provider,
            "imdb_id,tvdb_id,type,season,episode,watched\n\
             tt0137523,,movie,,,1\n\
             ,121361,show,1,2,\n",
        )
        .await;

        let state = tracker.snapshot();
        assert!(state.is_movie_watched(550));
        assert!(state.is_episode_watched(1399, 1, 2));
        assert_eq!(provider.search_count(), 0);
    }

    #[tokio::test]
    async fn test_tvdb_only_rows_resolve_separately() {
        let provider = FakeProvider::default()
            .with_external("111", ExternalSource::Tvdb, 1, MediaType::Tv)
            .with_external("222", ExternalSource::Tvdb, 2, MediaType::Tv)
            .with_series(1, &[(1, 5)])
            .with_series(2, &[(1, 5)]);
        let mut tracker = tracker();
        run(
            &mut tracker,
            &provider,
            "tvdb_id,type,season,episode\n111,show,1,1\n222,show,1,3\n",
        )
        .await;

        let state = tracker.snapshot();
        assert!(state.is_episode_watched(1, 1, 1));
        assert!(!state.is_episode_watched(1, 1, 2));
        assert!(state.is_episode_watched(2, 1, 3));
        assert_eq!(provider.find_log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_untyped_row_with_season_searches_series() {
        let provider = FakeProvider::default()
            .with_search("Dark", 1, MediaType::Movie)
            .with_search("Dark", 70523, MediaType::Tv)
            .with_series(70523, &[(1, 10)]);
        let mut tracker = tracker();
        run(&mut tracker, &provider, "title,season,episode\nDark,1,3\n").await;

        let state = tracker.snapshot();
        assert!(state.is_episode_watched(70523, 1, 3));
        assert!(!state.is_movie_watched(1));
    }

    #[tokio::test]
    async fn test_import_drops_stale_episode_details() {
        let provider = FakeProvider::default().with_series(10, &[(1, 5)]);
        let mut tracker = tracker();
        tracker.dispatch(Command::SetEpisodeDetails {
            series_id: 10,
            details: EpisodeDetails {
                name: Some("Pilot".to_string()),
                air_date: None,
                season: 1,
                episode: 1,
            },
        });

        run(&mut tracker, &provider, "tmdb_id,type,season,episode\n10,tv,1,3\n").await;

        assert!(tracker.snapshot().episode_details(10).is_none());
    }

    #[tokio::test]
    async fn test_reimport_is_unchanged() {
        let provider = FakeProvider::default().with_series(10, &[(1, 2)]);
        let text = "tmdb_id,type,season,episode\n10,tv,1,1\n550,movie,,\n";
        let mut tracker = tracker();
        run(&mut tracker, &provider, "tmdb_id,type,watched\n550,movie,1\n").await;
        assert!(run(&mut tracker, &provider, text).await.changed());
        assert_eq!(run(&mut tracker, &provider, text).await, ImportOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_export_then_import_round_trip() {
        let meta = [(1, 3), (2, 4)];
        let provider = FakeProvider::default()
            .with_series(10, &meta)
            .with_series(11, &[(1, 2)]);
        let seasons: Vec<SeasonSummary> = provider.details[&(MediaType::Tv, 10)].seasons.clone();

        let mut source = tracker();
        source.dispatch_at(Command::ToggleMovieWatched { id: 550 }, 1_682_899_200_000);
        source.dispatch_at(
            Command::ToggleEpisodeWatched {
                series_id: 10,
                season: 2,
                episode: 2,
                seasons,
            },
            1_700_000_000_000,
        );
        source.toggle_dropped(10);
        source.update_series_status(11, "continuing");

        let bytes = export_csv(&source.snapshot()).unwrap();
        assert!(bytes.starts_with(b"\xEF\xBB\xBF"));
        let text = String::from_utf8(bytes).unwrap();
        assert!(
            text.contains("\"tmdb_id\",\"type\",\"season\",\"episode\",\"status\",\"watched_at\"")
        );

        let mut target = tracker();
        let outcome = run(&mut target, &provider, &text).await;
        assert!(outcome.changed());

        let before = source.snapshot();
        let after = target.snapshot();
        assert_eq!(after.tracked_movie_ids(), before.tracked_movie_ids());
        assert_eq!(after.furthest_watched(10), before.furthest_watched(10));
        for season in 1..=2 {
            for episode in 1..=4 {
                assert_eq!(
                    after.is_episode_watched(10, season, episode),
                    before.is_episode_watched(10, season, episode)
                );
            }
        }
        assert_eq!(after.series_statuses(), before.series_statuses());
        assert_eq!(
            after.last_watched(EntityRef::movie(550)),
            Some(1_682_899_200_000)
        );
        assert_eq!(after.series_last_watched(10), Some(1_700_000_000_000));
    }
}
