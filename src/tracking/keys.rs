use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::metadata::MediaType;

static EPISODE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^tv_(\d+)_s(\d+)_e(\d+)$").unwrap());

static ENTITY_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(movie|tv)_(\d+)$").unwrap());

/// A title the user can watchlist, favorite or have watched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: MediaType,
}

impl EntityRef {
    pub fn movie(id: u64) -> Self {
        Self {
            id,
            kind: MediaType::Movie,
        }
    }

    pub fn tv(id: u64) -> Self {
        Self {
            id,
            kind: MediaType::Tv,
        }
    }

    /// Parse `movie_<id>` / `tv_<id>`
    pub fn parse(key: &str) -> Option<Self> {
        let caps = ENTITY_KEY.captures(key)?;
        let id = caps[2].parse().ok()?;
        match &caps[1] {
            "movie" => Some(Self::movie(id)),
            _ => Some(Self::tv(id)),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind, self.id)
    }
}

/// Key of a single watched flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WatchKey {
    Movie {
        id: u64,
    },
    Episode {
        series_id: u64,
        season: u32,
        episode: u32,
    },
}

impl WatchKey {
    pub fn episode(series_id: u64, season: u32, episode: u32) -> Self {
        WatchKey::Episode {
            series_id,
            season,
            episode,
        }
    }

    /// Parse `movie_<id>` / `tv_<id>_s<season>_e<episode>`
    pub fn parse(key: &str) -> Option<Self> {
        if let Some(caps) = EPISODE_KEY.captures(key) {
            return Some(WatchKey::Episode {
                series_id: caps[1].parse().ok()?,
                season: caps[2].parse().ok()?,
                episode: caps[3].parse().ok()?,
            });
        }
        match EntityRef::parse(key)? {
            EntityRef {
                id,
                kind: MediaType::Movie,
            } => Some(WatchKey::Movie { id }),
            _ => None,
        }
    }

    pub fn series_id(&self) -> Option<u64> {
        match self {
            WatchKey::Episode { series_id, .. } => Some(*series_id),
            WatchKey::Movie { .. } => None,
        }
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchKey::Movie { id } => write!(f, "movie_{}", id),
            WatchKey::Episode {
                series_id,
                season,
                episode,
            } => write!(f, "tv_{}_s{}_e{}", series_id, season, episode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_key_formats() {
        assert_eq!(WatchKey::Movie { id: 550 }.to_string(), "movie_550");
        assert_eq!(WatchKey::episode(10, 1, 2).to_string(), "tv_10_s1_e2");
        assert_eq!(EntityRef::tv(10).to_string(), "tv_10");
    }

    #[test]
    fn test_watch_key_parse() {
        assert_eq!(WatchKey::parse("movie_550"), Some(WatchKey::Movie { id: 550 }));
        assert_eq!(
            WatchKey::parse("tv_1399_s0_e12"),
            Some(WatchKey::episode(1399, 0, 12))
        );
        assert_eq!(WatchKey::parse("tv_10"), None);
        assert_eq!(WatchKey::parse("movie_abc"), None);
        assert_eq!(WatchKey::parse("tv_10_s1"), None);
    }

    #[test]
    fn test_entity_ref_parse() {
        assert_eq!(EntityRef::parse("tv_10"), Some(EntityRef::tv(10)));
        assert_eq!(EntityRef::parse("movie_7"), Some(EntityRef::movie(7)));
        assert_eq!(EntityRef::parse("42"), None);
    }

    #[test]
    fn test_entity_ref_json_shape() {
        let json = serde_json::to_string(&EntityRef::tv(10)).unwrap();
        assert_eq!(json, r#"{"id":10,"type":"tv"}"#);
    }
}
