//! Search against a Lavalink v4 node over its REST API.
//!
//! `load` maps to `/v4/loadtracks`; `search_rich` maps to the LavaSearch
//! plugin's `/v4/loadsearch`, which answers 404 when the plugin is missing.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde::de::IgnoredAny;
use serenity::async_trait;
use tracing::debug;

use crate::error::SearchError;
use crate::search::{LoadResult, SearchBackend, SearchMode};
use crate::track::TrackReference;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackInfo {
    identifier: String,
    author: String,
    length: u64,
    is_stream: bool,
    title: String,
    uri: Option<String>,
    source_name: String,
}

#[derive(Debug, Deserialize)]
struct LavalinkTrack {
    encoded: String,
    info: TrackInfo,
}

impl From<LavalinkTrack> for TrackReference {
    fn from(t: LavalinkTrack) -> Self {
        let mut track = TrackReference::new(t.encoded, t.info.title);
        track.author = t.info.author;
        track.uri = t
            .info
            .uri
            .or_else(|| Some(t.info.identifier).filter(|id| id.starts_with("http")));
        track.duration_ms = if t.info.is_stream { 0 } else { t.info.length };
        track.is_stream = t.info.is_stream;
        track.source = t.info.source_name;
        track
    }
}

#[derive(Debug, Deserialize)]
struct PlaylistData {
    #[serde(default)]
    tracks: Vec<LavalinkTrack>,
}

#[derive(Debug, Deserialize)]
struct LoadException {
    message: Option<String>,
    severity: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "loadType", content = "data", rename_all = "lowercase")]
enum LoadTracks {
    Track(LavalinkTrack),
    Playlist(PlaylistData),
    Search(Vec<LavalinkTrack>),
    Empty(IgnoredAny),
    Error(LoadException),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RichSearch {
    tracks: Vec<LavalinkTrack>,
    albums: Vec<PlaylistData>,
    playlists: Vec<PlaylistData>,
}

impl RichSearch {
    /// Direct track hits first, then album and playlist contents.
    fn into_tracks(self) -> Vec<TrackReference> {
        self.tracks
            .into_iter()
            .chain(self.albums.into_iter().flat_map(|a| a.tracks))
            .chain(self.playlists.into_iter().flat_map(|p| p.tracks))
            .map(TrackReference::from)
            .collect()
    }
}

pub struct LavalinkSearch {
    client: reqwest::Client,
    base: String,
    password: String,
    timeout: Duration,
}

impl LavalinkSearch {
    pub fn new(client: reqwest::Client, base: &str, password: &str, timeout: Duration) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            password: password.to_string(),
            timeout,
        }
    }

    async fn get(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response, SearchError> {
        self.client
            .get(format!("{}{}", self.base, path))
            .header(AUTHORIZATION, &self.password)
            .query(query)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| if e.is_timeout() { SearchError::Timeout } else { e.into() })
    }
}

#[async_trait]
impl SearchBackend for LavalinkSearch {
    fn name(&self) -> &str {
        "lavalink"
    }

    async fn search_rich(
        &self,
        query: &str,
        mode: SearchMode,
    ) -> Result<Vec<TrackReference>, SearchError> {
        let identifier = mode.identifier(query);
        let resp = self
            .get(
                "/v4/loadsearch",
                &[("query", identifier.as_str()), ("types", "track,album,playlist")],
            )
            .await?;
        match resp.status() {
            StatusCode::NO_CONTENT => Ok(Vec::new()),
            StatusCode::NOT_FOUND => Err(SearchError::Unsupported),
            s if s.is_success() => Ok(resp.json::<RichSearch>().await?.into_tracks()),
            s => Err(SearchError::Backend(format!("loadsearch returned {s}"))),
        }
    }

    async fn load(&self, query: &str, mode: SearchMode) -> Result<LoadResult, SearchError> {
        let identifier = mode.identifier(query);
        let resp = self
            .get("/v4/loadtracks", &[("identifier", identifier.as_str())])
            .await?;
        if !resp.status().is_success() {
            return Err(SearchError::Backend(format!(
                "loadtracks returned {}",
                resp.status()
            )));
        }
        let loaded: LoadTracks = resp.json().await?;
        into_load_result(loaded)
    }
}

fn into_load_result(loaded: LoadTracks) -> Result<LoadResult, SearchError> {
    let result = match loaded {
        LoadTracks::Track(t) => LoadResult {
            tracks: vec![t.into()],
            playlist: false,
        },
        LoadTracks::Playlist(p) => LoadResult {
            tracks: p.tracks.into_iter().map(Into::into).collect(),
            playlist: true,
        },
        LoadTracks::Search(ts) => LoadResult {
            tracks: ts.into_iter().map(Into::into).collect(),
            playlist: false,
        },
        LoadTracks::Empty(_) => LoadResult::default(),
        LoadTracks::Error(e) => {
            debug!(severity = %e.severity, "lavalink load failed");
            return Err(SearchError::Backend(
                e.message.unwrap_or_else(|| format!("{} load failure", e.severity)),
            ));
        }
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACK: &str = r#"{"encoded":"QAAA","info":{"identifier":"dQw","isSeekable":true,"author":"Rick","length":212000,"isStream":false,"position":0,"title":"Never","uri":"https://www.youtube.com/watch?v=dQw","sourceName":"youtube"},"pluginInfo":{}}"#;

    fn parse(json: &str) -> Result<LoadResult, SearchError> {
        into_load_result(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn decodes_every_load_type() {
        let single = parse(&format!(r#"{{"loadType":"track","data":{TRACK}}}"#)).unwrap();
        assert_eq!(single.tracks.len(), 1);
        assert_eq!(single.tracks[0].identifier, "QAAA");
        assert_eq!(single.tracks[0].playable_source(), "https://www.youtube.com/watch?v=dQw");
        assert_eq!(single.tracks[0].duration_ms, 212_000);
        assert!(!single.playlist);

        let list = parse(&format!(
            r#"{{"loadType":"playlist","data":{{"info":{{"name":"x","selectedTrack":-1}},"pluginInfo":{{}},"tracks":[{TRACK},{TRACK}]}}}}"#
        ))
        .unwrap();
        assert!(list.playlist);
        assert_eq!(list.tracks.len(), 2);

        let search = parse(&format!(r#"{{"loadType":"search","data":[{TRACK}]}}"#)).unwrap();
        assert_eq!(search.tracks.len(), 1);

        let empty = parse(r#"{"loadType":"empty","data":{}}"#).unwrap();
        assert!(empty.tracks.is_empty());

        let err = parse(r#"{"loadType":"error","data":{"message":"blocked","severity":"common","cause":"x"}}"#);
        assert!(matches!(err, Err(SearchError::Backend(m)) if m == "blocked"));
    }

    #[test]
    fn rich_search_flattens_categories() {
        let json = format!(
            r#"{{"tracks":[{TRACK}],"albums":[{{"info":{{"name":"a"}},"tracks":[{TRACK},{TRACK}]}}],"playlists":[],"artists":[],"texts":[]}}"#
        );
        let rich: RichSearch = serde_json::from_str(&json).unwrap();
        assert_eq!(rich.into_tracks().len(), 3);
    }
}
