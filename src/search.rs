//! Query resolution: rich multi-category search first, direct load as fallback.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serenity::async_trait;
use tracing::{debug, warn};

use crate::error::SearchError;
use crate::metrics::METRICS;
use crate::track::TrackReference;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchProvider {
    #[default]
    YouTube,
    YouTubeMusic,
    Spotify,
    SoundCloud,
    AppleMusic,
    Deezer,
    YandexMusic,
}

impl SearchProvider {
    pub const ALL: [SearchProvider; 7] = [
        Self::YouTube,
        Self::YouTubeMusic,
        Self::Spotify,
        Self::SoundCloud,
        Self::AppleMusic,
        Self::Deezer,
        Self::YandexMusic,
    ];

    /// Search prefix understood by the node (`ytsearch:query`, ...).
    pub fn token(self) -> &'static str {
        match self {
            Self::YouTube => "ytsearch",
            Self::YouTubeMusic => "ytmsearch",
            Self::Spotify => "spsearch",
            Self::SoundCloud => "scsearch",
            Self::AppleMusic => "amsearch",
            Self::Deezer => "dzsearch",
            Self::YandexMusic => "ymsearch",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::YouTube => "YouTube",
            Self::YouTubeMusic => "YouTube Music",
            Self::Spotify => "Spotify",
            Self::SoundCloud => "SoundCloud",
            Self::AppleMusic => "Apple Music",
            Self::Deezer => "Deezer",
            Self::YandexMusic => "Yandex Music",
        }
    }

    /// Integer stored in the settings table.
    pub fn repr(self) -> i32 {
        self as i32
    }

    pub fn from_repr(value: i32) -> Option<Self> {
        usize::try_from(value)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }
}

impl std::str::FromStr for SearchProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match norm.as_str() {
            "youtube" | "yt" => Ok(Self::YouTube),
            "youtubemusic" | "ytm" => Ok(Self::YouTubeMusic),
            "spotify" | "sp" => Ok(Self::Spotify),
            "soundcloud" | "sc" => Ok(Self::SoundCloud),
            "applemusic" | "am" => Ok(Self::AppleMusic),
            "deezer" | "dz" => Ok(Self::Deezer),
            "yandexmusic" | "yandex" | "ym" => Ok(Self::YandexMusic),
            _ => Err(format!("unknown search provider: {s}")),
        }
    }
}

/// How a query is handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Load the query verbatim (URLs).
    Direct,
    Provider(SearchProvider),
}

impl SearchMode {
    /// The identifier a node expects, e.g. `ytsearch:never gonna`.
    pub fn identifier(self, query: &str) -> String {
        match self {
            Self::Direct => query.to_string(),
            Self::Provider(p) => format!("{}:{}", p.token(), query),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadResult {
    pub tracks: Vec<TrackReference>,
    /// The backend resolved the query as a playlist/album.
    pub playlist: bool,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Multi-category search. `Err(SearchError::Unsupported)` when the backend has none.
    async fn search_rich(
        &self,
        query: &str,
        mode: SearchMode,
    ) -> Result<Vec<TrackReference>, SearchError>;

    async fn load(&self, query: &str, mode: SearchMode) -> Result<LoadResult, SearchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchPath {
    Rich,
    Fallback,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub tracks: Vec<TrackReference>,
    pub path: SearchPath,
}

impl SearchResult {
    pub fn empty() -> Self {
        Self {
            tracks: Vec::new(),
            path: SearchPath::None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

pub fn is_url(query: &str) -> bool {
    url::Url::parse(query)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Queries naming a playlist or album want every returned track.
pub fn wants_all_tracks(query: &str) -> bool {
    let lower = query.to_lowercase();
    lower.contains("playlist") || lower.contains("album")
}

#[derive(Clone)]
pub struct SearchOrchestrator {
    backend: Arc<dyn SearchBackend>,
    timeout: Duration,
}

impl SearchOrchestrator {
    pub fn new(backend: Arc<dyn SearchBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, SearchError>>,
    ) -> Result<T, SearchError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| SearchError::Timeout)?
    }

    pub async fn resolve(
        &self,
        query: &str,
        hint: SearchProvider,
    ) -> Result<SearchResult, SearchError> {
        self.search(query, hint, wants_all_tracks(query)).await
    }

    /// Like [`resolve`](Self::resolve) but always keeps every candidate.
    pub async fn candidates(
        &self,
        query: &str,
        hint: SearchProvider,
    ) -> Result<SearchResult, SearchError> {
        self.search(query, hint, true).await
    }

    async fn search(
        &self,
        query: &str,
        hint: SearchProvider,
        want_all: bool,
    ) -> Result<SearchResult, SearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(SearchResult::empty());
        }

        let mode = if is_url(query) {
            SearchMode::Direct
        } else {
            SearchMode::Provider(hint)
        };
        METRICS.inc_searches();

        if let SearchMode::Provider(_) = mode {
            match self.bounded(self.backend.search_rich(query, mode)).await {
                Ok(tracks) if !tracks.is_empty() => {
                    debug!(backend = self.backend.name(), "rich search hit for {query:?}");
                    return Ok(SearchResult {
                        tracks: select(tracks, want_all),
                        path: SearchPath::Rich,
                    });
                }
                Ok(_) | Err(SearchError::Unsupported) => {}
                Err(e) => warn!(
                    backend = self.backend.name(),
                    "rich search failed for {query:?}, falling back: {e}"
                ),
            }
        }

        METRICS.inc_search_fallbacks();
        let loaded = self.bounded(self.backend.load(query, mode)).await?;
        if loaded.tracks.is_empty() {
            return Ok(SearchResult::empty());
        }
        let want_all = want_all || loaded.playlist;
        Ok(SearchResult {
            tracks: select(loaded.tracks, want_all),
            path: SearchPath::Fallback,
        })
    }
}

fn select(mut tracks: Vec<TrackReference>, all: bool) -> Vec<TrackReference> {
    if !all {
        tracks.truncate(1);
    }
    tracks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeSearch, track};

    fn orchestrator(backend: Arc<FakeSearch>) -> SearchOrchestrator {
        SearchOrchestrator::new(backend, Duration::from_millis(500))
    }

    #[tokio::test]
    async fn rich_hit_skips_fallback() {
        let backend = Arc::new(FakeSearch::default());
        backend.set_rich(vec![track("a", 10), track("b", 10)]);
        let res = orchestrator(backend.clone())
            .resolve("song a", SearchProvider::YouTube)
            .await
            .unwrap();
        assert_eq!(res.path, SearchPath::Rich);
        assert_eq!(res.tracks.len(), 1);
        assert_eq!(backend.load_calls(), 0);
    }

    #[tokio::test]
    async fn empty_rich_result_falls_back_to_load() {
        let backend = Arc::new(FakeSearch::default());
        backend.set_load(vec![track("x", 10)], false);
        let res = orchestrator(backend.clone())
            .resolve("song x", SearchProvider::Deezer)
            .await
            .unwrap();
        assert_eq!(res.path, SearchPath::Fallback);
        assert_eq!(res.tracks[0].identifier, "x");
        assert_eq!(backend.rich_calls(), 1);
        assert_eq!(backend.load_calls(), 1);
        assert_eq!(
            backend.last_mode(),
            Some(SearchMode::Provider(SearchProvider::Deezer))
        );
    }

    #[tokio::test]
    async fn rich_failure_falls_back_to_load() {
        let backend = Arc::new(FakeSearch::default());
        backend.fail_rich();
        backend.set_load(vec![track("x", 10)], false);
        let res = orchestrator(backend.clone())
            .resolve("song x", SearchProvider::YouTube)
            .await
            .unwrap();
        assert_eq!(res.path, SearchPath::Fallback);
    }

    #[tokio::test]
    async fn url_ignores_provider_hint() {
        let backend = Arc::new(FakeSearch::default());
        backend.set_rich(vec![track("rich", 10)]);
        backend.set_load(vec![track("direct", 10)], false);
        let res = orchestrator(backend.clone())
            .resolve("https://example.com/watch?v=1", SearchProvider::Spotify)
            .await
            .unwrap();
        assert_eq!(res.tracks[0].identifier, "direct");
        assert_eq!(backend.rich_calls(), 0);
        assert_eq!(backend.last_mode(), Some(SearchMode::Direct));
    }

    #[tokio::test]
    async fn playlist_keyword_returns_all_tracks() {
        let backend = Arc::new(FakeSearch::default());
        backend.set_load(vec![track("1", 10), track("2", 10), track("3", 10)], false);
        let orch = orchestrator(backend);
        let res = orch.resolve("chill Playlist", SearchProvider::YouTube).await.unwrap();
        assert_eq!(res.tracks.len(), 3);
        let res = orch.resolve("chill songs", SearchProvider::YouTube).await.unwrap();
        assert_eq!(res.tracks.len(), 1);
    }

    #[tokio::test]
    async fn nothing_found_is_empty_not_error() {
        let backend = Arc::new(FakeSearch::default());
        let res = orchestrator(backend)
            .resolve("nothing", SearchProvider::YouTube)
            .await
            .unwrap();
        assert!(res.is_empty());
        assert_eq!(res.path, SearchPath::None);
    }

    #[tokio::test]
    async fn load_failure_is_an_error() {
        let backend = Arc::new(FakeSearch::default());
        backend.fail_load();
        let res = orchestrator(backend)
            .resolve("anything", SearchProvider::YouTube)
            .await;
        assert!(matches!(res, Err(SearchError::Backend(_))));
    }

    #[test]
    fn provider_round_trips_through_repr() {
        for p in SearchProvider::ALL {
            assert_eq!(SearchProvider::from_repr(p.repr()), Some(p));
        }
        assert_eq!(SearchProvider::from_repr(99), None);
        assert_eq!(
            "YouTube Music".parse::<SearchProvider>().unwrap(),
            SearchProvider::YouTubeMusic
        );
        assert_eq!(SearchMode::Provider(SearchProvider::SoundCloud).identifier("x"), "scsearch:x");
    }

    #[test]
    fn detects_urls() {
        assert!(is_url("https://youtu.be/abc"));
        assert!(!is_url("never gonna give you up"));
        assert!(!is_url("ytsearch:foo"));
    }
}
