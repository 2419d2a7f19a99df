//! Per-session track queue.
//!
//! Entries stay in insertion order. Shuffle is applied lazily at dequeue time
//! by picking a random remaining entry, so inserts never need a re-shuffle and
//! turning shuffle off restores insertion order for whatever is left.

use std::collections::VecDeque;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::track::QueueEntry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    Off,
    /// Replay the current track when it finishes.
    Track,
    /// Re-append the current track to the tail when it finishes.
    Queue,
}

impl std::str::FromStr for RepeatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(Self::Off),
            "track" | "one" | "song" => Ok(Self::Track),
            "queue" | "all" => Ok(Self::Queue),
            other => Err(format!("unknown repeat mode: {other}")),
        }
    }
}

#[derive(Debug, Default)]
pub struct TrackQueue {
    entries: VecDeque<QueueEntry>,
    shuffle: bool,
    repeat: RepeatMode,
}

impl TrackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: QueueEntry) {
        self.entries.push_back(entry);
    }

    /// Put an entry back at the head, e.g. when handing it to the player failed.
    pub fn push_front(&mut self, entry: QueueEntry) {
        self.entries.push_front(entry);
    }

    /// Next entry: FIFO normally, uniform pick among the remaining entries in shuffle mode.
    pub fn dequeue(&mut self) -> Option<QueueEntry> {
        if self.shuffle && self.entries.len() > 1 {
            let idx = rand::thread_rng().gen_range(0..self.entries.len());
            self.entries.remove(idx)
        } else {
            self.entries.pop_front()
        }
    }

    /// Returns how many entries were removed.
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    pub fn toggle_shuffle(&mut self) -> bool {
        self.shuffle = !self.shuffle;
        self.shuffle
    }

    pub fn shuffle_enabled(&self) -> bool {
        self.shuffle
    }

    pub fn repeat(&self) -> RepeatMode {
        self.repeat
    }

    pub fn set_repeat(&mut self, mode: RepeatMode) {
        self.repeat = mode;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order (not the order shuffle will pick them).
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }
}
