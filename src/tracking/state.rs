//! Tracking snapshot and its reducer
//!
//! [`TrackingState`] is never mutated in place by callers. Every change goes
//! through [`TrackingState::apply`], which returns the next snapshot and a
//! [`Dirty`] set naming the persisted records that changed.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::metadata::{MediaType, SeasonSummary};
use crate::tracking::keys::{EntityRef, WatchKey};
use crate::tracking::status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NextEpisode {
    pub season: u32,
    pub episode: u32,
}

/// Cached metadata for a series' next unwatched episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeDetails {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub air_date: Option<String>,
    pub season: u32,
    pub episode: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesCategory {
    NotStarted,
    Watching,
    /// Everything aired is watched, more may come
    UpToDate,
    /// Everything watched and the series has ended
    Completed,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchlistBuckets {
    pub movies: Vec<u64>,
    pub series_in_progress: Vec<u64>,
    pub series_not_started: Vec<u64>,
}

/// Which persisted records a command touched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dirty {
    pub watched: bool,
    pub watchlist: bool,
    pub favorites: bool,
    pub series_statuses: bool,
    pub last_watched: bool,
    pub episode_details: bool,
}

impl Dirty {
    pub fn any(&self) -> bool {
        self.watched
            || self.watchlist
            || self.favorites
            || self.series_statuses
            || self.last_watched
            || self.episode_details
    }
}

/// Last watch times. Old records keyed entries by bare numeric id, those
/// are kept apart since the id alone does not say movie or series.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastWatched {
    pub entities: BTreeMap<EntityRef, i64>,
    pub legacy: BTreeMap<u64, i64>,
}

impl LastWatched {
    pub fn from_record(raw: BTreeMap<String, i64>) -> Self {
        let mut last_watched = Self::default();
        for (key, ts) in raw {
            if let Some(entity) = EntityRef::parse(&key) {
                last_watched.entities.insert(entity, ts);
            } else if let Ok(id) = key.parse::<u64>() {
                last_watched.legacy.insert(id, ts);
            } else {
                debug!(key = %key, "Skipping unrecognized last-watched key");
            }
        }
        last_watched
    }

    pub fn to_record(&self) -> BTreeMap<String, i64> {
        let mut raw: BTreeMap<String, i64> = self
            .legacy
            .iter()
            .map(|(id, ts)| (id.to_string(), *ts))
            .collect();
        raw.extend(self.entities.iter().map(|(e, ts)| (e.to_string(), *ts)));
        raw
    }

    /// Keep the later of the stored and given time
    fn touch(&mut self, entity: EntityRef, ts: i64) -> bool {
        match self.entities.get(&entity) {
            Some(&existing) if existing >= ts => false,
            _ => {
                self.entities.insert(entity, ts);
                true
            }
        }
    }
}

/// Bulk changes produced by an import, merged in a single step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub watched: BTreeSet<WatchKey>,
    pub watchlist: Vec<EntityRef>,
    pub statuses: BTreeMap<u64, String>,
    pub last_watched: BTreeMap<EntityRef, i64>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
            && self.watchlist.is_empty()
            && self.statuses.is_empty()
            && self.last_watched.is_empty()
    }

    pub fn mark_watched(&mut self, key: WatchKey) {
        self.watched.insert(key);
    }

    /// Mark (season, episode) and everything before it
    pub fn mark_through(
        &mut self,
        series_id: u64,
        seasons: &[SeasonSummary],
        season: u32,
        episode: u32,
    ) {
        self.watched
            .extend(cascade_keys(series_id, seasons, season, episode));
    }

    pub fn add_to_watchlist(&mut self, entity: EntityRef) {
        if !self.watchlist.contains(&entity) {
            self.watchlist.push(entity);
        }
    }

    pub fn set_status(&mut self, series_id: u64, value: &str) {
        self.statuses.insert(series_id, status::normalize(value));
    }

    pub fn touch(&mut self, entity: EntityRef, ts: i64) {
        let slot = self.last_watched.entry(entity).or_insert(ts);
        if ts > *slot {
            *slot = ts;
        }
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    ToggleEpisodeWatched {
        series_id: u64,
        season: u32,
        episode: u32,
        seasons: Vec<SeasonSummary>,
    },
    ToggleSeriesFullyWatched {
        series_id: u64,
        seasons: Vec<SeasonSummary>,
    },
    ToggleMovieWatched {
        id: u64,
    },
    ToggleWatchlist(EntityRef),
    ToggleFavorite(EntityRef),
    ToggleDropped {
        series_id: u64,
    },
    UpdateSeriesStatus {
        series_id: u64,
        status: String,
    },
    SetEpisodeDetails {
        series_id: u64,
        details: EpisodeDetails,
    },
    Merge(Delta),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackingState {
    pub(crate) watched: BTreeMap<WatchKey, bool>,
    pub(crate) watchlist: Vec<EntityRef>,
    pub(crate) favorites: Vec<EntityRef>,
    pub(crate) series_statuses: BTreeMap<u64, String>,
    pub(crate) last_watched: LastWatched,
    pub(crate) episode_details: BTreeMap<u64, EpisodeDetails>,
}

/// Regular seasons in airing order, specials excluded
fn regular_seasons(seasons: &[SeasonSummary]) -> Vec<SeasonSummary> {
    let mut regular: Vec<SeasonSummary> = seasons
        .iter()
        .filter(|s| s.season_number > 0)
        .copied()
        .collect();
    regular.sort_by_key(|s| s.season_number);
    regular
}

/// Every episode key up to and including (season, episode)
fn cascade_keys(
    series_id: u64,
    seasons: &[SeasonSummary],
    season: u32,
    episode: u32,
) -> Vec<WatchKey> {
    let mut keys = vec![WatchKey::episode(series_id, season, episode)];
    if season == 0 {
        return keys;
    }

    for s in regular_seasons(seasons) {
        if s.season_number < season {
            keys.extend(
                (1..=s.episode_count).map(|e| WatchKey::episode(series_id, s.season_number, e)),
            );
        }
    }
    keys.extend((1..episode).map(|e| WatchKey::episode(series_id, season, e)));
    keys
}

fn all_episode_keys(series_id: u64, seasons: &[SeasonSummary]) -> Vec<WatchKey> {
    regular_seasons(seasons)
        .into_iter()
        .flat_map(|s| {
            (1..=s.episode_count).map(move |e| WatchKey::episode(series_id, s.season_number, e))
        })
        .collect()
}

impl TrackingState {
    pub fn new(
        watched: BTreeMap<WatchKey, bool>,
        watchlist: Vec<EntityRef>,
        favorites: Vec<EntityRef>,
        series_statuses: BTreeMap<u64, String>,
        last_watched: LastWatched,
        episode_details: BTreeMap<u64, EpisodeDetails>,
    ) -> Self {
        Self {
            watched,
            watchlist,
            favorites,
            series_statuses,
            last_watched,
            episode_details,
        }
    }

    /// Reduce a command into the next snapshot
    pub fn apply(&self, command: Command, now_ms: i64) -> (TrackingState, Dirty) {
        let mut next = self.clone();
        let dirty = next.apply_in_place(command, now_ms);
        (next, dirty)
    }

    fn apply_in_place(&mut self, command: Command, now_ms: i64) -> Dirty {
        let mut dirty = Dirty::default();
        match command {
            Command::ToggleEpisodeWatched {
                series_id,
                season,
                episode,
                seasons,
            } => {
                let before = self.next_episode(series_id, &seasons);
                if self.is_episode_watched(series_id, season, episode) {
                    self.watched
                        .insert(WatchKey::episode(series_id, season, episode), false);
                } else {
                    for key in cascade_keys(series_id, &seasons, season, episode) {
                        self.watched.insert(key, true);
                    }
                    self.last_watched.touch(EntityRef::tv(series_id), now_ms);
                    dirty.last_watched = true;
                }
                dirty.watched = true;
                dirty.episode_details = self.invalidate_details(series_id, &seasons, before);
            }
            Command::ToggleSeriesFullyWatched { series_id, seasons } => {
                let before = self.next_episode(series_id, &seasons);
                let mark = before.is_some();
                for key in all_episode_keys(series_id, &seasons) {
                    self.watched.insert(key, mark);
                }
                if mark {
                    self.last_watched.touch(EntityRef::tv(series_id), now_ms);
                    dirty.last_watched = true;
                }
                dirty.watched = true;
                dirty.episode_details = self.invalidate_details(series_id, &seasons, before);
            }
            Command::ToggleMovieWatched { id } => {
                let watched = !self.is_movie_watched(id);
                self.watched.insert(WatchKey::Movie { id }, watched);
                if watched {
                    self.last_watched.touch(EntityRef::movie(id), now_ms);
                    dirty.last_watched = true;
                }
                dirty.watched = true;
            }
            Command::ToggleWatchlist(entity) => {
                if let Some(pos) = self.watchlist.iter().position(|e| *e == entity) {
                    self.watchlist.remove(pos);
                } else {
                    self.watchlist.push(entity);
                    // Re-adding a stopped series means picking it back up
                    if entity.kind == MediaType::Tv && self.is_stopped(entity.id) {
                        self.series_statuses
                            .insert(entity.id, status::CONTINUING.to_string());
                        dirty.series_statuses = true;
                    }
                }
                dirty.watchlist = true;
            }
            Command::ToggleFavorite(entity) => {
                if let Some(pos) = self.favorites.iter().position(|e| *e == entity) {
                    self.favorites.remove(pos);
                } else {
                    self.favorites.push(entity);
                }
                dirty.favorites = true;
            }
            Command::ToggleDropped { series_id } => {
                let next = if self.is_stopped(series_id) {
                    status::CONTINUING
                } else {
                    status::STOPPED
                };
                self.series_statuses.insert(series_id, next.to_string());
                dirty.series_statuses = true;
            }
            Command::UpdateSeriesStatus {
                series_id,
                status: value,
            } => {
                self.series_statuses
                    .insert(series_id, status::normalize(&value));
                dirty.series_statuses = true;
            }
            Command::SetEpisodeDetails { series_id, details } => {
                if self.episode_details.get(&series_id) != Some(&details) {
                    self.episode_details.insert(series_id, details);
                    dirty.episode_details = true;
                }
            }
            Command::Merge(delta) => dirty = self.merge(delta),
        }
        dirty
    }

    fn merge(&mut self, delta: Delta) -> Dirty {
        let mut dirty = Dirty::default();

        let mut advanced = BTreeSet::new();
        for key in delta.watched {
            if self.watched.get(&key) != Some(&true) {
                advanced.extend(key.series_id());
                self.watched.insert(key, true);
                dirty.watched = true;
            }
        }
        // New watched episodes may move the next-episode pointer
        for series_id in advanced {
            dirty.episode_details |= self.episode_details.remove(&series_id).is_some();
        }
        for entity in delta.watchlist {
            if !self.watchlist.contains(&entity) {
                self.watchlist.push(entity);
                dirty.watchlist = true;
            }
        }
        for (series_id, value) in delta.statuses {
            let value = status::normalize(&value);
            if self.series_statuses.get(&series_id) != Some(&value) {
                self.series_statuses.insert(series_id, value);
                dirty.series_statuses = true;
            }
        }
        for (entity, ts) in delta.last_watched {
            dirty.last_watched |= self.last_watched.touch(entity, ts);
        }

        dirty
    }

    /// Drop the cached next-episode details if the pointer moved
    fn invalidate_details(
        &mut self,
        series_id: u64,
        seasons: &[SeasonSummary],
        before: Option<NextEpisode>,
    ) -> bool {
        let after = self.next_episode(series_id, seasons);
        let stale = match self.episode_details.get(&series_id) {
            Some(details) => {
                before != after
                    || after
                        != Some(NextEpisode {
                            season: details.season,
                            episode: details.episode,
                        })
            }
            None => false,
        };
        if stale {
            self.episode_details.remove(&series_id);
        }
        stale
    }

    pub fn is_watched(&self, key: &WatchKey) -> bool {
        self.watched.get(key).copied().unwrap_or(false)
    }

    pub fn is_episode_watched(&self, series_id: u64, season: u32, episode: u32) -> bool {
        self.is_watched(&WatchKey::episode(series_id, season, episode))
    }

    pub fn is_movie_watched(&self, id: u64) -> bool {
        self.is_watched(&WatchKey::Movie { id })
    }

    pub fn is_in_watchlist(&self, entity: EntityRef) -> bool {
        self.watchlist.contains(&entity)
    }

    pub fn is_favorite(&self, entity: EntityRef) -> bool {
        self.favorites.contains(&entity)
    }

    pub fn series_status(&self, series_id: u64) -> &str {
        self.series_statuses
            .get(&series_id)
            .map(String::as_str)
            .unwrap_or(status::CONTINUING)
    }

    pub fn has_explicit_status(&self, series_id: u64) -> bool {
        self.series_statuses.contains_key(&series_id)
    }

    pub fn is_stopped(&self, series_id: u64) -> bool {
        status::is_stopped(self.series_status(series_id))
    }

    /// First unwatched regular episode in airing order
    pub fn next_episode(&self, series_id: u64, seasons: &[SeasonSummary]) -> Option<NextEpisode> {
        regular_seasons(seasons).into_iter().find_map(|s| {
            (1..=s.episode_count)
                .find(|&e| !self.is_episode_watched(series_id, s.season_number, e))
                .map(|episode| NextEpisode {
                    season: s.season_number,
                    episode,
                })
        })
    }

    /// Latest watch time for a bare id: legacy key, then movie, then series
    pub fn last_watched_time(&self, id: u64) -> Option<i64> {
        self.last_watched
            .legacy
            .get(&id)
            .or_else(|| self.last_watched.entities.get(&EntityRef::movie(id)))
            .or_else(|| self.last_watched.entities.get(&EntityRef::tv(id)))
            .copied()
    }

    pub fn last_watched(&self, entity: EntityRef) -> Option<i64> {
        self.last_watched.entities.get(&entity).copied()
    }

    /// Series watch time, falling back to a legacy bare-id entry
    pub fn series_last_watched(&self, series_id: u64) -> Option<i64> {
        self.last_watched(EntityRef::tv(series_id))
            .or_else(|| self.last_watched.legacy.get(&series_id).copied())
    }

    pub fn tracked_series_ids(&self) -> BTreeSet<u64> {
        self.watched
            .keys()
            .filter_map(WatchKey::series_id)
            .chain(self.series_statuses.keys().copied())
            .collect()
    }

    /// Series with a typed last-watched entry
    pub fn series_with_last_watched(&self) -> BTreeSet<u64> {
        self.last_watched
            .entities
            .keys()
            .filter(|e| e.kind == MediaType::Tv)
            .map(|e| e.id)
            .collect()
    }

    pub fn tracked_movie_ids(&self) -> BTreeSet<u64> {
        self.watched
            .iter()
            .filter_map(|(key, watched)| match key {
                WatchKey::Movie { id } if *watched => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn watchlist(&self) -> &[EntityRef] {
        &self.watchlist
    }

    pub fn favorites(&self) -> &[EntityRef] {
        &self.favorites
    }

    pub fn watchlist_by_type(&self, kind: MediaType) -> Vec<u64> {
        self.watchlist
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.id)
            .collect()
    }

    pub fn has_watched_episodes(&self, series_id: u64) -> bool {
        self.watched
            .range(
                WatchKey::episode(series_id, 0, 0)
                    ..=WatchKey::episode(series_id, u32::MAX, u32::MAX),
            )
            .any(|(_, watched)| *watched)
    }

    /// Furthest watched regular episode
    pub fn furthest_watched(&self, series_id: u64) -> Option<NextEpisode> {
        self.watched
            .range(
                WatchKey::episode(series_id, 1, 0)
                    ..=WatchKey::episode(series_id, u32::MAX, u32::MAX),
            )
            .filter(|(_, watched)| **watched)
            .filter_map(|(key, _)| match key {
                WatchKey::Episode {
                    season, episode, ..
                } => Some(NextEpisode {
                    season: *season,
                    episode: *episode,
                }),
                WatchKey::Movie { .. } => None,
            })
            .max()
    }

    pub fn series_category(
        &self,
        series_id: u64,
        seasons: &[SeasonSummary],
        remote_status: Option<&str>,
    ) -> SeriesCategory {
        if self.is_stopped(series_id) {
            return SeriesCategory::Stopped;
        }
        if !self.has_watched_episodes(series_id) {
            return SeriesCategory::NotStarted;
        }
        match self.next_episode(series_id, seasons) {
            Some(_) => SeriesCategory::Watching,
            None if remote_status.is_some_and(status::is_ended) => SeriesCategory::Completed,
            None => SeriesCategory::UpToDate,
        }
    }

    pub fn watchlist_buckets(&self) -> WatchlistBuckets {
        let mut buckets = WatchlistBuckets::default();
        for entity in &self.watchlist {
            match entity.kind {
                MediaType::Movie => buckets.movies.push(entity.id),
                MediaType::Tv if self.has_watched_episodes(entity.id) => {
                    buckets.series_in_progress.push(entity.id)
                }
                MediaType::Tv => buckets.series_not_started.push(entity.id),
            }
        }
        buckets
    }

    pub fn episode_details(&self, series_id: u64) -> Option<&EpisodeDetails> {
        self.episode_details.get(&series_id)
    }

    pub fn watched_record(&self) -> BTreeMap<String, bool> {
        self.watched
            .iter()
            .map(|(key, watched)| (key.to_string(), *watched))
            .collect()
    }

    pub fn series_statuses(&self) -> &BTreeMap<u64, String> {
        &self.series_statuses
    }

    pub fn last_watched_record(&self) -> BTreeMap<String, i64> {
        self.last_watched.to_record()
    }

    pub fn episode_details_record(&self) -> &BTreeMap<u64, EpisodeDetails> {
        &self.episode_details
    }
}
