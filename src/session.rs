//! A live playback session for one guild.
//!
//! The session wraps the node's player handle (composition, the player knows
//! nothing about queues) and owns the queue plus the playback state machine:
//!
//! ```text
//! Idle ──play──▶ Playing ──pause──▶ Paused
//!  ▲               │  ▲──resume──────┘
//!  └──skip/end/stop┘
//! any ──destroy──▶ Destroyed
//! ```
//!
//! Queue, current track and state live behind one async mutex so enqueue,
//! dequeue and "hand to player" are a single critical section. Volume has its
//! own lock so volume changes never wait on a skip.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use serenity::model::id::{ChannelId, GuildId};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{NodeError, PlaybackError};
use crate::node::{AudioPlayer, TrackEndReason};
use crate::queue::{RepeatMode, TrackQueue};
use crate::track::{QueueEntry, TrackReference};

pub const MAX_VOLUME: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    Idle,
    Playing,
    Paused,
    Destroyed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_queue: usize,
    pub node_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_queue: 500,
            node_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayOutcome {
    NowPlaying {
        track: TrackReference,
        queued: usize,
    },
    Queued {
        track: TrackReference,
        /// 1-based position of the first added entry.
        position: usize,
        count: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipOutcome {
    Advanced {
        skipped: TrackReference,
        now_playing: TrackReference,
    },
    Stopped {
        skipped: TrackReference,
    },
}

/// Result of applying a node-reported track end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Stale or non-advancing event.
    Ignored,
    Repeated(TrackReference),
    Next(TrackReference),
    /// Queue ran dry; the session is idle now.
    Drained { ended: QueueEntry },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub guild_id: GuildId,
    pub voice_channel_id: ChannelId,
    pub state: PlayerState,
    pub current: Option<TrackReference>,
    pub position_ms: u64,
    pub queue: Vec<TrackReference>,
    pub volume: u16,
    pub shuffle: bool,
    pub repeat: RepeatMode,
    pub autoplay: bool,
}

struct Playback {
    state: PlayerState,
    current: Option<QueueEntry>,
    position: Duration,
    queue: TrackQueue,
    idle_since: Option<Instant>,
}

impl Playback {
    fn ensure_live(&self) -> Result<(), PlaybackError> {
        if self.state == PlayerState::Destroyed {
            Err(PlaybackError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn start(&mut self, entry: QueueEntry) {
        self.current = Some(entry);
        self.position = Duration::ZERO;
        self.state = PlayerState::Playing;
        self.idle_since = None;
    }

    fn go_idle(&mut self) {
        self.current = None;
        self.position = Duration::ZERO;
        self.state = PlayerState::Idle;
        self.idle_since = Some(Instant::now());
    }
}

/// An entry taken off the queue that goes back to the head unless committed.
struct Pending<'a> {
    queue: &'a mut TrackQueue,
    entry: Option<QueueEntry>,
}

impl Pending<'_> {
    fn commit(mut self) -> Option<QueueEntry> {
        self.entry.take()
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.queue.push_front(entry);
        }
    }
}

/// A skip in flight: the replaced current entry and the entries skipped over
/// go back where they were unless committed.
struct Skipping<'a> {
    pb: &'a mut Playback,
    current: Option<QueueEntry>,
    dropped: Vec<QueueEntry>,
}

impl Skipping<'_> {
    fn commit(mut self) -> Option<QueueEntry> {
        self.dropped.clear();
        self.current.take()
    }
}

impl Drop for Skipping<'_> {
    fn drop(&mut self) {
        for entry in self.dropped.drain(..).rev() {
            self.pb.queue.push_front(entry);
        }
        if let Some(entry) = self.current.take() {
            self.pb.current = Some(entry);
        }
    }
}

pub struct Session {
    id: SessionId,
    guild_id: GuildId,
    voice_channel_id: ChannelId,
    text_channel_id: Option<ChannelId>,
    player: Arc<dyn AudioPlayer>,
    playback: Mutex<Playback>,
    volume: Mutex<u16>,
    autoplay: AtomicBool,
    limits: SessionLimits,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("guild_id", &self.guild_id)
            .field("voice_channel_id", &self.voice_channel_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        id: SessionId,
        guild_id: GuildId,
        voice_channel_id: ChannelId,
        text_channel_id: Option<ChannelId>,
        player: Arc<dyn AudioPlayer>,
        volume: u16,
        limits: SessionLimits,
    ) -> Self {
        Self {
            id,
            guild_id,
            voice_channel_id,
            text_channel_id,
            player,
            playback: Mutex::new(Playback {
                state: PlayerState::Idle,
                current: None,
                position: Duration::ZERO,
                queue: TrackQueue::new(),
                idle_since: Some(Instant::now()),
            }),
            volume: Mutex::new(volume.min(MAX_VOLUME)),
            autoplay: AtomicBool::new(false),
            limits,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn voice_channel_id(&self) -> ChannelId {
        self.voice_channel_id
    }

    pub fn text_channel_id(&self) -> Option<ChannelId> {
        self.text_channel_id
    }

    async fn call<F>(&self, fut: F) -> Result<(), NodeError>
    where
        F: Future<Output = Result<(), NodeError>>,
    {
        tokio::time::timeout(self.limits.node_timeout, fut)
            .await
            .map_err(|_| NodeError::Timeout)?
    }

    /// Start `first` if idle, otherwise queue it. `rest` is always queued behind it.
    pub async fn play(
        &self,
        first: QueueEntry,
        rest: Vec<QueueEntry>,
    ) -> Result<PlayOutcome, PlaybackError> {
        let mut pb = self.playback.lock().await;
        pb.ensure_live()?;

        let idle = pb.state == PlayerState::Idle;
        let incoming = rest.len() + usize::from(!idle);
        if pb.queue.len() + incoming > self.limits.max_queue {
            return Err(PlaybackError::QueueFull {
                max: self.limits.max_queue,
            });
        }

        if idle {
            self.call(self.player.play(&first.track)).await?;
            let track = first.track.clone();
            let queued = rest.len();
            pb.start(first);
            for entry in rest {
                pb.queue.push(entry);
            }
            debug!(guild = %self.guild_id, track = %track.title, "now playing");
            return Ok(PlayOutcome::NowPlaying { track, queued });
        }

        let position = pb.queue.len() + 1;
        let count = rest.len() + 1;
        let track = first.track.clone();
        pb.queue.push(first);
        for entry in rest {
            pb.queue.push(entry);
        }
        Ok(PlayOutcome::Queued {
            track,
            position,
            count,
        })
    }

    pub async fn pause(&self) -> Result<(), PlaybackError> {
        let mut pb = self.playback.lock().await;
        match pb.state {
            PlayerState::Playing => {
                self.call(self.player.pause()).await?;
                pb.state = PlayerState::Paused;
                Ok(())
            }
            PlayerState::Paused => Err(PlaybackError::AlreadyPaused),
            PlayerState::Destroyed => Err(PlaybackError::Destroyed),
            PlayerState::Idle => Err(PlaybackError::NotPlaying),
        }
    }

    pub async fn resume(&self) -> Result<(), PlaybackError> {
        let mut pb = self.playback.lock().await;
        match pb.state {
            PlayerState::Paused => {
                self.call(self.player.resume()).await?;
                pb.state = PlayerState::Playing;
                Ok(())
            }
            PlayerState::Destroyed => Err(PlaybackError::Destroyed),
            _ => Err(PlaybackError::NotPaused),
        }
    }

    /// Drop the current track plus `count - 1` queued entries and start the next one.
    pub async fn skip(&self, count: usize) -> Result<SkipOutcome, PlaybackError> {
        let mut pb = self.playback.lock().await;
        pb.ensure_live()?;
        if pb.state != PlayerState::Playing {
            return Err(PlaybackError::NotPlaying);
        }
        let Some(current) = pb.current.take() else {
            return Err(PlaybackError::NoCurrentTrack);
        };
        let mut skipping = Skipping {
            pb: &mut *pb,
            current: Some(current),
            dropped: Vec::new(),
        };
        for _ in 1..count.max(1) {
            match skipping.pb.queue.dequeue() {
                Some(entry) => skipping.dropped.push(entry),
                None => break,
            }
        }
        let started = self.start_next(&mut *skipping.pb).await;
        let Some(skipped) = skipping.commit() else {
            return Err(PlaybackError::NoCurrentTrack);
        };
        let skipped = skipped.track;
        match started? {
            Some(now_playing) => Ok(SkipOutcome::Advanced {
                skipped,
                now_playing,
            }),
            None => Ok(SkipOutcome::Stopped { skipped }),
        }
    }

    /// Hand the next queued entry to the player, or go idle when there is none.
    async fn start_next(&self, pb: &mut Playback) -> Result<Option<TrackReference>, PlaybackError> {
        let Some(next) = pb.queue.dequeue() else {
            pb.go_idle();
            if let Err(e) = self.call(self.player.stop()).await {
                warn!(guild = %self.guild_id, "failed to stop player after queue drained: {e}");
            }
            return Ok(None);
        };

        let track = next.track.clone();
        let pending = Pending {
            queue: &mut pb.queue,
            entry: Some(next),
        };
        match self.call(self.player.play(&track)).await {
            Ok(()) => {
                if let Some(entry) = pending.commit() {
                    pb.start(entry);
                }
                Ok(Some(track))
            }
            Err(e) => {
                drop(pending);
                pb.go_idle();
                Err(e.into())
            }
        }
    }

    /// Returns the clamped position actually applied.
    pub async fn seek(&self, position: Duration) -> Result<Duration, PlaybackError> {
        let mut pb = self.playback.lock().await;
        pb.ensure_live()?;
        let Some(current) = pb.current.as_ref() else {
            return Err(PlaybackError::NoCurrentTrack);
        };
        let duration = current.track.duration();
        let clamped = if duration.is_zero() {
            position
        } else {
            position.min(duration)
        };
        self.call(self.player.seek(clamped)).await?;
        pb.position = clamped;
        Ok(clamped)
    }

    /// Returns the clamped volume actually applied.
    pub async fn set_volume(&self, percent: u16) -> Result<u16, PlaybackError> {
        let percent = percent.min(MAX_VOLUME);
        let mut volume = self.volume.lock().await;
        self.call(self.player.set_volume(percent)).await?;
        *volume = percent;
        Ok(percent)
    }

    pub async fn volume(&self) -> u16 {
        *self.volume.lock().await
    }

    pub async fn toggle_shuffle(&self) -> bool {
        self.playback.lock().await.queue.toggle_shuffle()
    }

    pub async fn set_repeat(&self, mode: RepeatMode) {
        self.playback.lock().await.queue.set_repeat(mode);
    }

    pub fn toggle_autoplay(&self) -> bool {
        !self.autoplay.fetch_xor(true, Ordering::AcqRel)
    }

    pub fn autoplay_enabled(&self) -> bool {
        self.autoplay.load(Ordering::Acquire)
    }

    /// Empties the queue without touching the current track.
    pub async fn clear(&self) -> usize {
        self.playback.lock().await.queue.clear()
    }

    /// Stop playback and clear the queue.
    pub async fn stop(&self) -> Result<usize, PlaybackError> {
        let mut pb = self.playback.lock().await;
        pb.ensure_live()?;
        let removed = pb.queue.clear();
        pb.go_idle();
        self.call(self.player.stop()).await?;
        Ok(removed)
    }

    /// Apply a node-reported end of `identifier`, honoring the repeat mode on natural ends.
    pub async fn advance(
        &self,
        identifier: &str,
        reason: TrackEndReason,
    ) -> Result<Advance, PlaybackError> {
        let mut pb = self.playback.lock().await;
        if pb.state == PlayerState::Destroyed || !reason.may_start_next() {
            return Ok(Advance::Ignored);
        }
        let is_current = pb
            .current
            .as_ref()
            .is_some_and(|c| c.track.identifier == identifier);
        if !is_current {
            return Ok(Advance::Ignored);
        }
        let Some(ended) = pb.current.take() else {
            return Ok(Advance::Ignored);
        };

        if reason == TrackEndReason::Finished {
            match pb.queue.repeat() {
                RepeatMode::Track => {
                    let track = ended.track.clone();
                    return match self.call(self.player.play(&track)).await {
                        Ok(()) => {
                            pb.start(ended);
                            Ok(Advance::Repeated(track))
                        }
                        Err(e) => {
                            pb.go_idle();
                            Err(e.into())
                        }
                    };
                }
                RepeatMode::Queue => pb.queue.push(ended.clone()),
                RepeatMode::Off => {}
            }
        }

        match self.start_next(&mut pb).await? {
            Some(track) => Ok(Advance::Next(track)),
            None => Ok(Advance::Drained { ended }),
        }
    }

    /// Terminal: clears everything and refuses further commands.
    pub async fn mark_destroyed(&self) {
        let mut pb = self.playback.lock().await;
        if pb.state == PlayerState::Destroyed {
            return;
        }
        let was_active = pb.current.is_some();
        pb.queue.clear();
        pb.current = None;
        pb.state = PlayerState::Destroyed;
        pb.idle_since = None;
        if was_active {
            if let Err(e) = self.call(self.player.stop()).await {
                warn!(guild = %self.guild_id, "failed to stop player on destroy: {e}");
            }
        }
    }

    pub async fn state(&self) -> PlayerState {
        self.playback.lock().await.state
    }

    /// How long the session has been idle, if it is.
    pub async fn idle_for(&self) -> Option<Duration> {
        let pb = self.playback.lock().await;
        match pb.state {
            PlayerState::Idle => pb.idle_since.map(|t| t.elapsed()),
            _ => None,
        }
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let (state, current, stored_position, queue, shuffle, repeat) = {
            let pb = self.playback.lock().await;
            (
                pb.state,
                pb.current.as_ref().map(|c| c.track.clone()),
                pb.position,
                pb.queue.iter().map(|e| e.track.clone()).collect::<Vec<_>>(),
                pb.queue.shuffle_enabled(),
                pb.queue.repeat(),
            )
        };
        let position = if current.is_some() {
            self.player.position().await.unwrap_or(stored_position)
        } else {
            Duration::ZERO
        };
        SessionSnapshot {
            session_id: self.id,
            guild_id: self.guild_id,
            voice_channel_id: self.voice_channel_id,
            state,
            current,
            position_ms: position.as_millis() as u64,
            queue,
            volume: self.volume().await,
            shuffle,
            repeat,
            autoplay: self.autoplay_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serenity::model::id::UserId;

    use super::*;
    use crate::test_support::{FakePlayer, track};

    fn session(player: Arc<FakePlayer>) -> Session {
        Session::new(
            SessionId(1),
            GuildId::new(1),
            ChannelId::new(10),
            None,
            player,
            50,
            SessionLimits {
                max_queue: 3,
                node_timeout: Duration::from_millis(200),
            },
        )
    }

    fn entry(id: &str) -> QueueEntry {
        QueueEntry::new(track(id, 180), UserId::new(7))
    }

    #[tokio::test]
    async fn abandoned_skip_leaves_current_and_queue_untouched() {
        let player = Arc::new(FakePlayer::default());
        let s = session(player.clone());
        s.play(entry("a"), vec![entry("b"), entry("c")]).await.unwrap();

        player.hang_next_play();
        let abandoned = tokio::time::timeout(Duration::from_millis(20), s.skip(2)).await;
        assert!(abandoned.is_err());

        let snap = s.snapshot().await;
        assert_eq!(snap.state, PlayerState::Playing);
        assert_eq!(snap.current.map(|t| t.identifier), Some("a".to_string()));
        let queued: Vec<_> = snap.queue.into_iter().map(|t| t.identifier).collect();
        assert_eq!(queued, ["b", "c"]);

        let out = s.skip(2).await.unwrap();
        let SkipOutcome::Advanced { now_playing, .. } = out else {
            panic!("expected the skip to advance");
        };
        assert_eq!(now_playing.identifier, "c");
    }

    #[tokio::test]
    async fn play_then_queue_then_skip_to_idle() {
        let player = Arc::new(FakePlayer::default());
        let s = session(player.clone());

        let out = s.play(entry("a"), vec![]).await.unwrap();
        assert!(
            matches!(out, PlayOutcome::NowPlaying { ref track, .. } if track.identifier == "a")
        );
        let out = s.play(entry("b"), vec![]).await.unwrap();
        assert!(matches!(out, PlayOutcome::Queued { position: 1, .. }));

        let out = s.skip(1).await.unwrap();
        let SkipOutcome::Advanced { now_playing, .. } = out else {
            panic!("expected the skip to advance");
        };
        assert_eq!(now_playing.identifier, "b");
        let out = s.skip(1).await.unwrap();
        assert!(matches!(out, SkipOutcome::Stopped { .. }));

        let snap = s.snapshot().await;
        assert_eq!(snap.state, PlayerState::Idle);
        assert!(snap.current.is_none());
        assert_eq!(player.played(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn skip_many_discards_entries() {
        let s = session(Arc::new(FakePlayer::default()));
        s.play(entry("a"), vec![entry("b"), entry("c"), entry("d")])
            .await
            .unwrap();
        let out = s.skip(3).await.unwrap();
        let SkipOutcome::Advanced { now_playing, .. } = out else {
            panic!("expected the skip to advance");
        };
        assert_eq!(now_playing.identifier, "d");
        assert!(s.snapshot().await.queue.is_empty());
    }

    #[tokio::test]
    async fn pause_resume_transitions() {
        let s = session(Arc::new(FakePlayer::default()));
        assert!(matches!(s.pause().await, Err(PlaybackError::NotPlaying)));
        s.play(entry("a"), vec![]).await.unwrap();
        s.pause().await.unwrap();
        assert!(matches!(s.pause().await, Err(PlaybackError::AlreadyPaused)));
        assert!(matches!(s.skip(1).await, Err(PlaybackError::NotPlaying)));
        s.resume().await.unwrap();
        assert!(matches!(s.resume().await, Err(PlaybackError::NotPaused)));
        assert_eq!(s.state().await, PlayerState::Playing);
    }

    #[tokio::test]
    async fn seek_clamps_to_track_duration() {
        let s = session(Arc::new(FakePlayer::default()));
        assert!(matches!(
            s.seek(Duration::from_secs(5)).await,
            Err(PlaybackError::NoCurrentTrack)
        ));
        s.play(entry("a"), vec![]).await.unwrap();
        let applied = s.seek(Duration::from_secs(999)).await.unwrap();
        assert_eq!(applied, Duration::from_secs(180));
        assert_eq!(s.state().await, PlayerState::Playing);
    }

    #[tokio::test]
    async fn queue_capacity_is_enforced() {
        let s = session(Arc::new(FakePlayer::default()));
        s.play(entry("a"), vec![entry("b"), entry("c")]).await.unwrap();
        s.play(entry("d"), vec![]).await.unwrap();
        assert!(matches!(
            s.play(entry("e"), vec![]).await,
            Err(PlaybackError::QueueFull { max: 3 })
        ));
    }

    #[tokio::test]
    async fn failed_start_restores_entry_to_head() {
        let player = Arc::new(FakePlayer::default());
        let s = session(player.clone());
        s.play(entry("a"), vec![entry("b")]).await.unwrap();
        player.fail_next_play();
        assert!(matches!(s.skip(1).await, Err(PlaybackError::Node(_))));
        let snap = s.snapshot().await;
        assert_eq!(snap.state, PlayerState::Idle);
        assert_eq!(snap.queue.len(), 1);
        assert_eq!(snap.queue[0].identifier, "b");
    }

    #[tokio::test]
    async fn natural_end_honors_repeat_modes() {
        let s = session(Arc::new(FakePlayer::default()));
        s.play(entry("a"), vec![entry("b")]).await.unwrap();

        s.set_repeat(RepeatMode::Track).await;
        let adv = s.advance("a", TrackEndReason::Finished).await.unwrap();
        assert!(matches!(adv, Advance::Repeated(ref t) if t.identifier == "a"));

        s.set_repeat(RepeatMode::Queue).await;
        let adv = s.advance("a", TrackEndReason::Finished).await.unwrap();
        assert!(matches!(adv, Advance::Next(ref t) if t.identifier == "b"));
        let queued: Vec<_> = s.snapshot().await.queue.into_iter().map(|t| t.identifier).collect();
        assert_eq!(queued, vec!["a"]);
    }

    #[tokio::test]
    async fn stale_or_replaced_end_events_are_ignored() {
        let s = session(Arc::new(FakePlayer::default()));
        s.play(entry("a"), vec![entry("b")]).await.unwrap();
        assert_eq!(
            s.advance("zzz", TrackEndReason::Finished).await.unwrap(),
            Advance::Ignored
        );
        assert_eq!(
            s.advance("a", TrackEndReason::Replaced).await.unwrap(),
            Advance::Ignored
        );
        let adv = s.advance("a", TrackEndReason::Finished).await.unwrap();
        assert!(matches!(adv, Advance::Next(_)));
        let adv = s.advance("b", TrackEndReason::Finished).await.unwrap();
        assert!(matches!(adv, Advance::Drained { ref ended } if ended.track.identifier == "b"));
    }

    #[tokio::test]
    async fn clear_keeps_current_track() {
        let s = session(Arc::new(FakePlayer::default()));
        s.play(entry("a"), vec![entry("b"), entry("c")]).await.unwrap();
        assert_eq!(s.clear().await, 2);
        let snap = s.snapshot().await;
        assert_eq!(snap.current.map(|t| t.identifier).as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn destroyed_session_rejects_commands() {
        let s = session(Arc::new(FakePlayer::default()));
        s.play(entry("a"), vec![]).await.unwrap();
        s.mark_destroyed().await;
        assert!(matches!(
            s.play(entry("b"), vec![]).await,
            Err(PlaybackError::Destroyed)
        ));
        assert_eq!(s.state().await, PlayerState::Destroyed);
    }

    #[tokio::test]
    async fn volume_is_clamped_and_autoplay_toggles() {
        let player = Arc::new(FakePlayer::default());
        let s = session(player.clone());
        assert_eq!(s.set_volume(5000).await.unwrap(), MAX_VOLUME);
        assert_eq!(player.volume(), MAX_VOLUME);
        assert!(s.toggle_autoplay());
        assert!(!s.toggle_autoplay());
    }
}
