pub mod keys;
pub mod state;
pub mod status;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};

pub use keys::{EntityRef, WatchKey};
pub use state::{
    Command, Delta, Dirty, EpisodeDetails, LastWatched, NextEpisode, SeriesCategory,
    TrackingState, WatchlistBuckets,
};

use crate::metadata::{MediaType, MetadataProvider, SeasonSummary};
use crate::storage::{RecordStore, records};

/// Owns the tracking snapshot and writes every change straight back to the
/// record store. UI code holds a [`watch::Receiver`] from [`Tracker::subscribe`].
pub struct Tracker {
    store: RecordStore,
    state: Arc<TrackingState>,
    tx: watch::Sender<Arc<TrackingState>>,
}

impl Tracker {
    /// Load every record; missing or unreadable ones start empty
    pub fn load(store: RecordStore) -> Self {
        let watched_raw: BTreeMap<String, bool> = store.load(records::WATCHED);
        let mut watched = BTreeMap::new();
        for (key, value) in watched_raw {
            match WatchKey::parse(&key) {
                Some(parsed) => {
                    watched.insert(parsed, value);
                }
                None => debug!(key = %key, "Skipping unrecognized watched key"),
            }
        }

        let state = TrackingState::new(
            watched,
            store.load(records::WATCHLIST),
            store.load(records::FAVORITES),
            store.load(records::SERIES_STATUSES),
            LastWatched::from_record(store.load(records::LAST_WATCHED)),
            store.load(records::EPISODE_DETAILS),
        );
        info!(
            series = state.tracked_series_ids().len(),
            movies = state.tracked_movie_ids().len(),
            watchlist = state.watchlist().len(),
            "Loaded tracking records"
        );

        let state = Arc::new(state);
        let (tx, _) = watch::channel(state.clone());
        Self { store, state, tx }
    }

    pub fn snapshot(&self) -> Arc<TrackingState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TrackingState>> {
        self.tx.subscribe()
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn dispatch(&mut self, command: Command) -> Dirty {
        self.dispatch_at(command, chrono::Utc::now().timestamp_millis())
    }

    /// Apply a command as of `now_ms`, persist what changed and publish
    pub fn dispatch_at(&mut self, command: Command, now_ms: i64) -> Dirty {
        let (next, dirty) = self.state.apply(command, now_ms);
        if !dirty.any() {
            return dirty;
        }

        self.persist(&next, dirty);
        self.state = Arc::new(next);
        self.tx.send_replace(self.state.clone());
        dirty
    }

    fn persist(&self, state: &TrackingState, dirty: Dirty) {
        if dirty.watched {
            self.save(records::WATCHED, &state.watched_record());
        }
        if dirty.watchlist {
            self.save(records::WATCHLIST, state.watchlist());
        }
        if dirty.favorites {
            self.save(records::FAVORITES, state.favorites());
        }
        if dirty.series_statuses {
            self.save(records::SERIES_STATUSES, state.series_statuses());
        }
        if dirty.last_watched {
            self.save(records::LAST_WATCHED, &state.last_watched_record());
        }
        if dirty.episode_details {
            self.save(records::EPISODE_DETAILS, state.episode_details_record());
        }
    }

    fn save<T: serde::Serialize + ?Sized>(&self, name: &str, value: &T) {
        if let Err(e) = self.store.save(name, value) {
            error!(record = name, error = %e, "Failed to persist record");
        }
    }

    pub fn toggle_episode_watched(
        &mut self,
        series_id: u64,
        season: u32,
        episode: u32,
        seasons: &[SeasonSummary],
    ) {
        self.dispatch(Command::ToggleEpisodeWatched {
            series_id,
            season,
            episode,
            seasons: seasons.to_vec(),
        });
    }

    pub fn toggle_series_fully_watched(&mut self, series_id: u64, seasons: &[SeasonSummary]) {
        self.dispatch(Command::ToggleSeriesFullyWatched {
            series_id,
            seasons: seasons.to_vec(),
        });
    }

    pub fn toggle_movie_watched(&mut self, id: u64) {
        self.dispatch(Command::ToggleMovieWatched { id });
    }

    pub fn toggle_watchlist(&mut self, id: u64, kind: MediaType) {
        self.dispatch(Command::ToggleWatchlist(EntityRef { id, kind }));
    }

    pub fn toggle_favorite(&mut self, id: u64, kind: MediaType) {
        self.dispatch(Command::ToggleFavorite(EntityRef { id, kind }));
    }

    pub fn toggle_dropped(&mut self, series_id: u64) {
        self.dispatch(Command::ToggleDropped { series_id });
    }

    pub fn update_series_status(&mut self, series_id: u64, status: &str) {
        self.dispatch(Command::UpdateSeriesStatus {
            series_id,
            status: status.to_string(),
        });
    }

    pub fn merge(&mut self, delta: Delta) -> Dirty {
        self.dispatch(Command::Merge(delta))
    }

    /// Resolve name and air date of the next unwatched episode, reusing the
    /// cached entry while the next-episode pointer has not moved
    pub async fn refresh_next_episode_details<P: MetadataProvider + ?Sized>(
        &mut self,
        series_id: u64,
        provider: &P,
    ) -> Option<EpisodeDetails> {
        let details = provider.details(series_id, MediaType::Tv).await?;
        let next = self.state.next_episode(series_id, &details.seasons)?;

        if let Some(cached) = self.state.episode_details(series_id) {
            if cached.season == next.season && cached.episode == next.episode {
                return Some(cached.clone());
            }
        }

        let season = provider.season_details(series_id, next.season).await;
        let episode = season
            .as_ref()
            .and_then(|s| s.episodes.iter().find(|e| e.episode_number == next.episode));

        let fresh = EpisodeDetails {
            name: episode.and_then(|e| e.name.clone()),
            air_date: episode.and_then(|e| e.air_date.clone()),
            season: next.season,
            episode: next.episode,
        };
        self.dispatch(Command::SetEpisodeDetails {
            series_id,
            details: fresh.clone(),
        });
        Some(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::fake::FakeProvider;
    use crate::metadata::{EpisodeSummary, SeasonDetails};
    use crate::storage::MemoryBackend;

    fn meta(layout: &[(u32, u32)]) -> Vec<SeasonSummary> {
        layout
            .iter()
            .map(|&(season_number, episode_count)| SeasonSummary {
                season_number,
                episode_count,
            })
            .collect()
    }

    #[test]
    fn test_mutations_persist_immediately() {
        let store = RecordStore::in_memory();
        let mut tracker = Tracker::load(store.clone());

        tracker.toggle_episode_watched(10, 1, 2, &meta(&[(1, 3)]));
        tracker.toggle_watchlist(550, MediaType::Movie);
        tracker.toggle_favorite(10, MediaType::Tv);
        tracker.update_series_status(10, "Dropped");

        let watched: BTreeMap<String, bool> = store.load(records::WATCHED);
        assert_eq!(watched.get("tv_10_s1_e1"), Some(&true));
        assert_eq!(watched.get("tv_10_s1_e2"), Some(&true));

        let watchlist: Vec<EntityRef> = store.load(records::WATCHLIST);
        assert_eq!(watchlist, vec![EntityRef::movie(550)]);

        let statuses: BTreeMap<u64, String> = store.load(records::SERIES_STATUSES);
        assert_eq!(statuses.get(&10).map(String::as_str), Some("dropped"));

        let reloaded = Tracker::load(store);
        let state = reloaded.snapshot();
        assert!(state.is_episode_watched(10, 1, 1));
        assert!(state.is_favorite(EntityRef::tv(10)));
        assert!(state.is_stopped(10));
        assert!(state.series_last_watched(10).is_some());
    }

    #[test]
    fn test_unknown_keys_are_ignored_on_load() {
        let store = RecordStore::in_memory();
        store
            .save_raw(
                records::WATCHED,
                r#"{"movie_1":true,"weird":true,"tv_2_s1_e1":false}"#,
            )
            .unwrap();

        let tracker = Tracker::load(store);
        let state = tracker.snapshot();
        assert!(state.is_movie_watched(1));
        assert!(!state.is_episode_watched(2, 1, 1));
        assert_eq!(state.watched_record().len(), 2);
    }

    #[test]
    fn test_dropped_write_keeps_memory_state() {
        let store = RecordStore::new(MemoryBackend::with_quota(4));
        let mut tracker = Tracker::load(store);

        tracker.toggle_movie_watched(550);
        assert!(tracker.snapshot().is_movie_watched(550));
    }

    #[tokio::test]
    async fn test_subscribers_see_new_snapshots() {
        let mut tracker = Tracker::load(RecordStore::in_memory());
        let mut rx = tracker.subscribe();

        tracker.toggle_movie_watched(7);
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_movie_watched(7));
    }

    #[tokio::test]
    async fn test_refresh_next_episode_details() {
        let mut provider = FakeProvider::default().with_series(10, &[(1, 3)]);
        provider.seasons.insert(
            (10, 1),
            SeasonDetails {
                season_number: 1,
                episodes: vec![
                    EpisodeSummary {
                        episode_number: 2,
                        name: Some("Second".to_string()),
                        air_date: Some("2024-01-08".to_string()),
                        still_path: None,
                    },
                    EpisodeSummary {
                        episode_number: 3,
                        name: Some("Third".to_string()),
                        air_date: None,
                        still_path: None,
                    },
                ],
            },
        );

        let store = RecordStore::in_memory();
        let mut tracker = Tracker::load(store.clone());
        tracker.toggle_episode_watched(10, 1, 1, &meta(&[(1, 3)]));

        let details = tracker
            .refresh_next_episode_details(10, &provider)
            .await
            .unwrap();
        assert_eq!(details.name.as_deref(), Some("Second"));
        assert_eq!(details.episode, 2);

        let persisted: BTreeMap<u64, EpisodeDetails> = store.load(records::EPISODE_DETAILS);
        assert_eq!(persisted.get(&10), Some(&details));

        tracker.toggle_episode_watched(10, 1, 2, &meta(&[(1, 3)]));
        assert!(tracker.snapshot().episode_details(10).is_none());

        let details = tracker
            .refresh_next_episode_details(10, &provider)
            .await
            .unwrap();
        assert_eq!(details.name.as_deref(), Some("Third"));
    }
}
