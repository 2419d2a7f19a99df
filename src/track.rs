use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;

/// Opaque handle to playable media as returned by a search backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackReference {
    /// Backend-specific handle (an encoded node track or a plain URL).
    pub identifier: String,
    pub title: String,
    pub author: String,
    pub uri: Option<String>,
    pub duration_ms: u64,
    pub is_stream: bool,
    pub source: String,
}

impl TrackReference {
    pub fn new(identifier: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            title: title.into(),
            author: String::new(),
            uri: None,
            duration_ms: 0,
            is_stream: false,
            source: String::new(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// What the player should actually open.
    pub fn playable_source(&self) -> &str {
        self.uri.as_deref().unwrap_or(&self.identifier)
    }

    pub fn display(&self) -> String {
        if self.author.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.author, self.title)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub track: TrackReference,
    pub requested_by: UserId,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(track: TrackReference, requested_by: UserId) -> Self {
        Self {
            track,
            requested_by,
            enqueued_at: Utc::now(),
        }
    }
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_short_and_long_durations() {
        assert_eq!(format_duration(Duration::from_secs(65)), "1:05");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }

    #[test]
    fn playable_source_prefers_uri() {
        let mut t = TrackReference::new("encoded", "song");
        assert_eq!(t.playable_source(), "encoded");
        t.uri = Some("https://example.com/song".into());
        assert_eq!(t.playable_source(), "https://example.com/song");
    }
}
