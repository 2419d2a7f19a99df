//! Lyrics lookup for the current track.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serenity::async_trait;
use tracing::debug;

use crate::error::LyricsError;
use crate::track::TrackReference;

const LRCLIB_GET: &str = "https://lrclib.net/api/get";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lyrics {
    pub title: String,
    pub artist: String,
    pub text: String,
    pub synced: bool,
}

#[async_trait]
pub trait LyricsProvider: Send + Sync {
    /// `Ok(None)` when the provider has nothing for this track.
    async fn lookup(&self, track: &TrackReference) -> Result<Option<Lyrics>, LyricsError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LrclibRecord {
    track_name: Option<String>,
    artist_name: Option<String>,
    plain_lyrics: Option<String>,
    synced_lyrics: Option<String>,
}

pub struct LrclibProvider {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl LrclibProvider {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: LRCLIB_GET.to_string(),
            timeout,
        }
    }

    fn query(track: &TrackReference) -> Vec<(&'static str, String)> {
        let mut qp = vec![("track_name", track.title.clone())];
        if !track.author.is_empty() {
            qp.push(("artist_name", track.author.clone()));
        }
        if track.duration_ms > 0 {
            qp.push(("duration", (track.duration_ms / 1000).to_string()));
        }
        qp
    }
}

#[async_trait]
impl LyricsProvider for LrclibProvider {
    async fn lookup(&self, track: &TrackReference) -> Result<Option<Lyrics>, LyricsError> {
        debug!(track = %track.title, "lyrics lookup");
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&Self::query(track))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| if e.is_timeout() { LyricsError::Timeout } else { e.into() })?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(LyricsError::Status(status.as_u16()));
        }
        let record: LrclibRecord = resp.json().await?;
        Ok(into_lyrics(record, track))
    }
}

/// Plain lyrics win; synced lyrics are stripped of their timestamps.
fn into_lyrics(record: LrclibRecord, track: &TrackReference) -> Option<Lyrics> {
    let plain = record
        .plain_lyrics
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let (text, synced) = match plain {
        Some(p) => (p.to_string(), false),
        None => {
            let synced = record
                .synced_lyrics
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())?;
            (strip_timestamps(synced), true)
        }
    };
    Some(Lyrics {
        title: record.track_name.unwrap_or_else(|| track.title.clone()),
        artist: record.artist_name.unwrap_or_else(|| track.author.clone()),
        text,
        synced,
    })
}

fn strip_timestamps(lrc: &str) -> String {
    lrc.lines()
        .map(|line| {
            let mut rest = line.trim();
            while rest.starts_with('[') {
                match rest.find(']') {
                    Some(end) => rest = rest[end + 1..].trim_start(),
                    None => break,
                }
            }
            rest
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Discord messages cap at 2000 characters.
pub fn truncate_for_message(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::track;

    #[test]
    fn prefers_plain_lyrics() {
        let rec = LrclibRecord {
            track_name: Some("Song".into()),
            artist_name: None,
            plain_lyrics: Some("  hello\nworld ".into()),
            synced_lyrics: Some("[00:01.00]hello".into()),
        };
        let lyr = into_lyrics(rec, &track("a", 60)).unwrap();
        assert_eq!(lyr.text, "hello\nworld");
        assert!(!lyr.synced);
        assert_eq!(lyr.artist, "Artist a");
    }

    #[test]
    fn synced_only_is_stripped() {
        let rec = LrclibRecord {
            track_name: None,
            artist_name: None,
            plain_lyrics: None,
            synced_lyrics: Some("[00:01.00]one\n[00:02.50][00:09.00]two".into()),
        };
        let lyr = into_lyrics(rec, &track("a", 60)).unwrap();
        assert_eq!(lyr.text, "one\ntwo");
        assert!(lyr.synced);
    }

    #[test]
    fn empty_record_is_none() {
        let rec = LrclibRecord {
            track_name: None,
            artist_name: None,
            plain_lyrics: Some("   ".into()),
            synced_lyrics: None,
        };
        assert!(into_lyrics(rec, &track("a", 60)).is_none());
    }

    #[test]
    fn query_carries_track_fields() {
        let pairs = LrclibProvider::query(&track("a", 185));
        assert!(pairs.contains(&("track_name", "Track a".to_string())));
        assert!(pairs.contains(&("duration", "185".to_string())));
    }

    #[test]
    fn truncates_long_text() {
        assert_eq!(truncate_for_message("abcdef", 4), "abc…");
        assert_eq!(truncate_for_message("abc", 4), "abc");
    }
}
