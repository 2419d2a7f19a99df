//! In-process fakes for the node and search backends.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId};

use crate::error::{NodeError, SearchError};
use crate::node::{AudioNode, AudioPlayer, PlayerOptions};
use crate::search::{LoadResult, SearchBackend, SearchMode};
use crate::track::TrackReference;

pub fn track(id: &str, secs: u64) -> TrackReference {
    TrackReference::new(id, format!("Track {id}"))
        .with_author(format!("Artist {id}"))
        .with_duration(Duration::from_secs(secs))
}

#[derive(Default)]
pub struct FakePlayer {
    played: Mutex<Vec<String>>,
    fail_next: AtomicBool,
    hang_next: AtomicBool,
    volume: AtomicU16,
    stops: AtomicUsize,
}

impl FakePlayer {
    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }

    pub fn fail_next_play(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// The next `play` never completes.
    pub fn hang_next_play(&self) {
        self.hang_next.store(true, Ordering::SeqCst);
    }

    pub fn volume(&self) -> u16 {
        self.volume.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioPlayer for FakePlayer {
    async fn play(&self, track: &TrackReference) -> Result<(), NodeError> {
        if self.hang_next.swap(false, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(NodeError::Player("load failed".into()));
        }
        self.played.lock().unwrap().push(track.identifier.clone());
        Ok(())
    }

    async fn pause(&self) -> Result<(), NodeError> {
        Ok(())
    }

    async fn resume(&self) -> Result<(), NodeError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), NodeError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn seek(&self, _position: Duration) -> Result<(), NodeError> {
        Ok(())
    }

    async fn set_volume(&self, percent: u16) -> Result<(), NodeError> {
        self.volume.store(percent, Ordering::SeqCst);
        Ok(())
    }

    async fn position(&self) -> Option<Duration> {
        None
    }
}

#[derive(Default)]
pub struct FakeNode {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    fail: AtomicBool,
    connected: AtomicBool,
    delay: Duration,
    disconnect_delay: Duration,
    players: Mutex<Vec<(GuildId, Arc<FakePlayer>)>>,
}

impl FakeNode {
    pub fn with_connect_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn with_disconnect_delay(disconnect_delay: Duration) -> Self {
        Self {
            disconnect_delay,
            ..Self::default()
        }
    }

    /// Whether the last connect has not been undone by a disconnect.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn fail_connects(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// The most recent player handed out for `guild`.
    pub fn player(&self, guild: GuildId) -> Option<Arc<FakePlayer>> {
        self.players
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(g, _)| *g == guild)
            .map(|(_, p)| p.clone())
    }
}

#[async_trait]
impl AudioNode for FakeNode {
    async fn connect(
        &self,
        guild: GuildId,
        _channel: ChannelId,
        options: PlayerOptions,
    ) -> Result<Arc<dyn AudioPlayer>, NodeError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(NodeError::Unavailable("node offline".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        let player = Arc::new(FakePlayer::default());
        player.volume.store(options.initial_volume, Ordering::SeqCst);
        self.players.lock().unwrap().push((guild, player.clone()));
        Ok(player)
    }

    async fn disconnect(&self, _guild: GuildId) -> Result<(), NodeError> {
        if !self.disconnect_delay.is_zero() {
            tokio::time::sleep(self.disconnect_delay).await;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSearch {
    rich: Mutex<Vec<TrackReference>>,
    load: Mutex<LoadResult>,
    rich_fails: AtomicBool,
    load_fails: AtomicBool,
    rich_calls: AtomicUsize,
    load_calls: AtomicUsize,
    last_mode: Mutex<Option<SearchMode>>,
}

impl FakeSearch {
    pub fn set_rich(&self, tracks: Vec<TrackReference>) {
        *self.rich.lock().unwrap() = tracks;
    }

    pub fn set_load(&self, tracks: Vec<TrackReference>, playlist: bool) {
        *self.load.lock().unwrap() = LoadResult { tracks, playlist };
    }

    pub fn fail_rich(&self) {
        self.rich_fails.store(true, Ordering::SeqCst);
    }

    pub fn fail_load(&self) {
        self.load_fails.store(true, Ordering::SeqCst);
    }

    pub fn rich_calls(&self) -> usize {
        self.rich_calls.load(Ordering::SeqCst)
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn last_mode(&self) -> Option<SearchMode> {
        *self.last_mode.lock().unwrap()
    }
}

#[async_trait]
impl SearchBackend for FakeSearch {
    fn name(&self) -> &str {
        "fake"
    }

    async fn search_rich(
        &self,
        _query: &str,
        mode: SearchMode,
    ) -> Result<Vec<TrackReference>, SearchError> {
        self.rich_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_mode.lock().unwrap() = Some(mode);
        if self.rich_fails.load(Ordering::SeqCst) {
            return Err(SearchError::Backend("rich search exploded".into()));
        }
        Ok(self.rich.lock().unwrap().clone())
    }

    async fn load(&self, _query: &str, mode: SearchMode) -> Result<LoadResult, SearchError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_mode.lock().unwrap() = Some(mode);
        if self.load_fails.load(Ordering::SeqCst) {
            return Err(SearchError::Backend("load exploded".into()));
        }
        Ok(self.load.lock().unwrap().clone())
    }
}
