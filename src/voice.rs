//! songbird-backed audio node.
//!
//! Each guild's player owns at most one live songbird track. Queueing is done
//! by the session layer, so tracks are started with `play_input` rather than
//! the builtin queue. Track end and error events are reported back as
//! [`NodeEvent`]s; an end for a handle that is no longer current is reported
//! as `Replaced` so the session never advances twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serenity::all::{ChannelId, GuildId};
use serenity::async_trait;
use songbird::driver::Bitrate;
use songbird::error::JoinError;
use songbird::input::{AudioStream, AudioStreamError, Compose, File, Input};
use songbird::tracks::{PlayMode, TrackHandle};
use songbird::{
    Call, CoreEvent, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use symphonia::core::io::MediaSource;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::node::{AudioNode, AudioPlayer, NodeEvent, PlayerOptions, TrackEndReason};
use crate::track::TrackReference;

const JOIN_ATTEMPTS: u32 = 5;

/// Lazily downloads the track through yt-dlp when songbird first reads it.
struct CachedDownload {
    url: String,
}

#[async_trait]
impl Compose for CachedDownload {
    fn create(&mut self) -> Result<AudioStream<Box<dyn MediaSource>>, AudioStreamError> {
        Err(AudioStreamError::Unsupported)
    }

    async fn create_async(
        &mut self,
    ) -> Result<AudioStream<Box<dyn MediaSource>>, AudioStreamError> {
        let path = crate::ytdlp::download_mp3(&self.url)
            .await
            .map_err(|e| AudioStreamError::Fail(e.into()))?;
        File::new(path).create_async().await
    }

    fn should_create_async(&self) -> bool {
        true
    }
}

type Current = Arc<Mutex<Option<TrackHandle>>>;

fn current_uuid(current: &Current) -> Option<uuid::Uuid> {
    current
        .lock()
        .ok()
        .and_then(|c| c.as_ref().map(|h| h.uuid()))
}

/// Reports the end of one track exactly once.
struct TrackNotifier {
    guild: GuildId,
    identifier: String,
    uuid: uuid::Uuid,
    current: Current,
    events: mpsc::UnboundedSender<NodeEvent>,
    reported: AtomicBool,
}

#[async_trait]
impl VoiceEventHandler for TrackNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let EventContext::Track(tracks) = ctx else {
            return None;
        };
        let (state, _) = tracks.first()?;

        if matches!(state.playing, PlayMode::Play) {
            let _ = self.events.send(NodeEvent::TrackStarted {
                guild: self.guild,
                identifier: self.identifier.clone(),
            });
            return None;
        }

        let reason = if current_uuid(&self.current) != Some(self.uuid) {
            TrackEndReason::Replaced
        } else {
            match &state.playing {
                PlayMode::End => TrackEndReason::Finished,
                PlayMode::Stop => TrackEndReason::Stopped,
                PlayMode::Errored(e) => {
                    warn!(guild = %self.guild, "track {} failed: {e}", self.identifier);
                    TrackEndReason::LoadFailed
                }
                _ => return None,
            }
        };
        if self.reported.swap(true, Ordering::AcqRel) {
            return Some(Event::Cancel);
        }
        let _ = self.events.send(NodeEvent::TrackEnded {
            guild: self.guild,
            identifier: self.identifier.clone(),
            reason,
        });
        Some(Event::Cancel)
    }
}

struct DisconnectNotifier {
    guild: GuildId,
    events: mpsc::UnboundedSender<NodeEvent>,
}

#[async_trait]
impl VoiceEventHandler for DisconnectNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::DriverDisconnect(data) = ctx {
            let _ = self.events.send(NodeEvent::WebSocketClosed {
                guild: self.guild,
                code: None,
                reason: format!("{:?}", data.reason),
            });
        }
        None
    }
}

pub struct SongbirdNode {
    manager: Arc<Songbird>,
    events: mpsc::UnboundedSender<NodeEvent>,
    bitrate: Option<i32>,
    /// Guilds whose call should stay joined when their player is destroyed.
    keep_joined: Mutex<HashMap<GuildId, bool>>,
}

impl SongbirdNode {
    pub fn new(
        manager: Arc<Songbird>,
        events: mpsc::UnboundedSender<NodeEvent>,
        bitrate: Option<u32>,
    ) -> Self {
        Self {
            manager,
            events,
            bitrate: bitrate.and_then(|b| i32::try_from(b).ok()),
            keep_joined: Mutex::new(HashMap::new()),
        }
    }

    async fn join(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> Result<Arc<AsyncMutex<Call>>, NodeError> {
        if let Some(call) = self.manager.get(guild) {
            let current = call.lock().await.current_channel();
            if current.is_some_and(|c| c.0.get() == channel.get()) {
                debug!(guild = %guild, "reusing existing voice connection");
                return Ok(call);
            }
        }

        let mut attempts = 0;
        loop {
            match self.manager.join(guild, channel).await {
                Ok(call) => {
                    info!(
                        guild = %guild,
                        channel = %channel,
                        "joined voice after {} attempt(s)",
                        attempts + 1
                    );
                    return Ok(call);
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= JOIN_ATTEMPTS {
                        return Err(NodeError::Unavailable(format!(
                            "failed to join voice channel after {JOIN_ATTEMPTS} attempts: {e}"
                        )));
                    }
                    let delay_ms = std::cmp::min(5000, 1000 * 2_u64.pow(attempts - 1));
                    warn!(
                        guild = %guild,
                        "voice join attempt {attempts} failed: {e}, retrying in {delay_ms}ms"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }
}

#[async_trait]
impl AudioNode for SongbirdNode {
    async fn connect(
        &self,
        guild: GuildId,
        channel: ChannelId,
        options: PlayerOptions,
    ) -> Result<Arc<dyn AudioPlayer>, NodeError> {
        let call = self.join(guild, channel).await?;
        if let Ok(mut keep) = self.keep_joined.lock() {
            keep.insert(guild, !options.disconnect_on_destroy);
        }
        {
            let mut call = call.lock().await;
            if let Some(br) = self.bitrate {
                call.set_bitrate(Bitrate::BitsPerSecond(br));
            }
            call.remove_all_global_events();
            call.add_global_event(
                Event::Core(CoreEvent::DriverDisconnect),
                DisconnectNotifier {
                    guild,
                    events: self.events.clone(),
                },
            );
            call.stop();
        }
        Ok(Arc::new(SongbirdPlayer {
            guild,
            call,
            current: Arc::new(Mutex::new(None)),
            events: self.events.clone(),
            volume: AtomicU16::new(options.initial_volume),
            clear_on_stop: options.clear_queue_on_stop,
        }))
    }

    async fn disconnect(&self, guild: GuildId) -> Result<(), NodeError> {
        let keep = self
            .keep_joined
            .lock()
            .ok()
            .and_then(|mut k| k.remove(&guild))
            .unwrap_or(false);
        if keep {
            if let Some(call) = self.manager.get(guild) {
                call.lock().await.stop();
            }
            return Ok(());
        }
        match self.manager.remove(guild).await {
            Ok(()) | Err(JoinError::NoCall) => Ok(()),
            Err(e) => Err(NodeError::Unavailable(e.to_string())),
        }
    }
}

pub struct SongbirdPlayer {
    guild: GuildId,
    call: Arc<AsyncMutex<Call>>,
    current: Current,
    events: mpsc::UnboundedSender<NodeEvent>,
    volume: AtomicU16,
    clear_on_stop: bool,
}

impl SongbirdPlayer {
    fn handle(&self) -> Result<TrackHandle, NodeError> {
        self.current
            .lock()
            .map_err(|_| NodeError::Player("player state poisoned".into()))?
            .clone()
            .ok_or_else(|| NodeError::Player("no track loaded".into()))
    }

    fn gain(&self) -> f32 {
        f32::from(self.volume.load(Ordering::Acquire)) / 100.0
    }
}

fn control<E: std::fmt::Display>(e: E) -> NodeError {
    NodeError::Player(e.to_string())
}

#[async_trait]
impl AudioPlayer for SongbirdPlayer {
    async fn play(&self, track: &TrackReference) -> Result<(), NodeError> {
        let input = Input::Lazy(Box::new(CachedDownload {
            url: track.playable_source().to_string(),
        }));
        let handle = self.call.lock().await.play_input(input);
        handle.set_volume(self.gain()).map_err(control)?;

        let previous = self
            .current
            .lock()
            .map_err(|_| NodeError::Player("player state poisoned".into()))?
            .replace(handle.clone());
        if let Some(prev) = previous {
            let _ = prev.stop();
        }

        let notifier = Arc::new(TrackNotifier {
            guild: self.guild,
            identifier: track.identifier.clone(),
            uuid: handle.uuid(),
            current: self.current.clone(),
            events: self.events.clone(),
            reported: AtomicBool::new(false),
        });
        for ev in [TrackEvent::Play, TrackEvent::End, TrackEvent::Error] {
            handle
                .add_event(Event::Track(ev), SharedNotifier(notifier.clone()))
                .map_err(control)?;
        }
        Ok(())
    }

    async fn pause(&self) -> Result<(), NodeError> {
        self.handle()?.pause().map_err(control)
    }

    async fn resume(&self) -> Result<(), NodeError> {
        self.handle()?.play().map_err(control)
    }

    async fn stop(&self) -> Result<(), NodeError> {
        let current = self
            .current
            .lock()
            .map_err(|_| NodeError::Player("player state poisoned".into()))?
            .take();
        if self.clear_on_stop {
            self.call.lock().await.stop();
            return Ok(());
        }
        match current {
            Some(h) => h.stop().map_err(control),
            None => Ok(()),
        }
    }

    async fn seek(&self, position: Duration) -> Result<(), NodeError> {
        self.handle()?
            .seek_async(position)
            .await
            .map(|_| ())
            .map_err(control)
    }

    async fn set_volume(&self, percent: u16) -> Result<(), NodeError> {
        self.volume.store(percent, Ordering::Release);
        match self.handle() {
            Ok(h) => h.set_volume(self.gain()).map_err(control),
            Err(_) => Ok(()),
        }
    }

    async fn position(&self) -> Option<Duration> {
        let handle = self.handle().ok()?;
        handle.get_info().await.ok().map(|s| s.position)
    }
}

/// One notifier shared by the play, end and error registrations of a track.
struct SharedNotifier(Arc<TrackNotifier>);

#[async_trait]
impl VoiceEventHandler for SharedNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        self.0.act(ctx).await
    }
}
