//! Guild → session registry.
//!
//! Each guild gets a slot holding a `tokio::sync::OnceCell`. Concurrent
//! `get_or_create` calls for the same guild all wait on that cell, so at most
//! one creation runs at a time and every successful caller gets the same
//! `Arc<Session>`. A failed or cancelled creation leaves the cell empty and
//! the next caller simply tries again. Destroying a session removes its slot.
//!
//! Creation and teardown of one guild also hold that guild's gate, so a new
//! session is never connected while the previous one is still disconnecting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::json;
use serenity::model::id::{ChannelId, GuildId};
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{FailureReason, NodeError, RetrieveError};
use crate::metrics::METRICS;
use crate::node::{AudioNode, NodeEvent, PlayerOptions, TrackEndReason};
use crate::notify::{EventType, NotificationHub};
use crate::session::{Advance, PlayerState, Session, SessionId, SessionLimits, SessionSnapshot};
use crate::settings::SettingsStore;

/// Predicate a session must satisfy before a command may act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Precondition {
    Playing,
    NotPlaying,
    Paused,
    NotPaused,
    QueueNotEmpty,
    QueueEmpty,
    HasCurrentTrack,
}

impl Precondition {
    pub fn check(self, snapshot: &SessionSnapshot) -> bool {
        match self {
            Self::Playing => snapshot.state == PlayerState::Playing,
            Self::NotPlaying => snapshot.state != PlayerState::Playing,
            Self::Paused => snapshot.state == PlayerState::Paused,
            Self::NotPaused => snapshot.state != PlayerState::Paused,
            Self::QueueNotEmpty => !snapshot.queue.is_empty(),
            Self::QueueEmpty => snapshot.queue.is_empty(),
            Self::HasCurrentTrack => snapshot.current.is_some(),
        }
    }

    pub fn failure_reason(self) -> FailureReason {
        match self {
            Self::Playing => FailureReason::NotPlaying,
            Self::NotPlaying => FailureReason::AlreadyPlaying,
            Self::Paused => FailureReason::NotPaused,
            Self::NotPaused => FailureReason::AlreadyPaused,
            Self::QueueNotEmpty => FailureReason::QueueEmpty,
            Self::QueueEmpty => FailureReason::QueueNotEmpty,
            Self::HasCurrentTrack => FailureReason::NoCurrentTrack,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Create and connect when no session exists.
    Join,
    /// Fail with `BotNotConnected` when no session exists.
    None,
}

#[derive(Debug, Clone)]
pub struct RetrieveRequest {
    pub guild_id: GuildId,
    /// Voice channel the requesting user is in, if any.
    pub voice_channel_id: Option<ChannelId>,
    pub text_channel_id: Option<ChannelId>,
    pub behavior: ConnectBehavior,
    pub preconditions: Vec<Precondition>,
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    /// Used when the guild has no settings row yet.
    pub default_volume: u16,
    pub limits: SessionLimits,
    pub idle_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            default_volume: 50,
            limits: SessionLimits::default(),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// What the manager did with a node event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// No live session, or nothing to do.
    Ignored,
    Advanced(Advance),
    Destroyed,
}

type Slot = Arc<OnceCell<Arc<Session>>>;
type Gate = Arc<AsyncMutex<()>>;

pub struct SessionManager {
    node: Arc<dyn AudioNode>,
    settings: SettingsStore,
    hub: NotificationHub,
    slots: Mutex<HashMap<GuildId, Slot>>,
    gates: Mutex<HashMap<GuildId, Gate>>,
    next_id: AtomicU64,
    options: ManagerOptions,
}

impl SessionManager {
    pub fn new(
        node: Arc<dyn AudioNode>,
        settings: SettingsStore,
        hub: NotificationHub,
        options: ManagerOptions,
    ) -> Self {
        Self {
            node,
            settings,
            hub,
            slots: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            options,
        }
    }

    fn with_slots<T>(&self, f: impl FnOnce(&mut HashMap<GuildId, Slot>) -> T) -> T {
        let mut slots = match self.slots.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut slots)
    }

    fn gate(&self, guild_id: GuildId) -> Gate {
        let mut gates = match self.gates.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        gates.entry(guild_id).or_default().clone()
    }

    /// Live session for `guild_id`, if any.
    pub fn get(&self, guild_id: GuildId) -> Option<Arc<Session>> {
        self.with_slots(|slots| slots.get(&guild_id).and_then(|cell| cell.get().cloned()))
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.with_slots(|slots| slots.values().filter_map(|cell| cell.get().cloned()).collect())
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn get_or_create(
        &self,
        request: RetrieveRequest,
        cancel: &CancellationToken,
    ) -> Result<Arc<Session>, RetrieveError> {
        let Some(requester_channel) = request.voice_channel_id else {
            return Err(RetrieveError::UserNotInVoiceChannel);
        };

        let session = match self.get(request.guild_id) {
            Some(session) => session,
            None if request.behavior == ConnectBehavior::None => {
                return Err(RetrieveError::BotNotConnected);
            }
            None => {
                let init = async {
                    let gate = self.gate(request.guild_id);
                    let _open = gate.lock().await;
                    let slot = self.with_slots(|slots| {
                        slots
                            .entry(request.guild_id)
                            .or_insert_with(|| Arc::new(OnceCell::new()))
                            .clone()
                    });
                    slot.get_or_try_init(|| {
                        self.create(request.guild_id, requester_channel, request.text_channel_id)
                    })
                    .await
                    .cloned()
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RetrieveError::Cancelled),
                    created = init => created?,
                }
            }
        };

        if session.voice_channel_id() != requester_channel {
            return Err(RetrieveError::VoiceChannelMismatch);
        }

        if !request.preconditions.is_empty() {
            let snapshot = session.snapshot().await;
            if let Some(failed) = request
                .preconditions
                .iter()
                .copied()
                .find(|p| !p.check(&snapshot))
            {
                return Err(RetrieveError::PreconditionFailed(failed));
            }
        }

        Ok(session)
    }

    /// Builds the session. The node connect is the last await, so a cancelled
    /// creation can never leave a half-built session behind.
    async fn create(
        &self,
        guild_id: GuildId,
        voice_channel_id: ChannelId,
        text_channel_id: Option<ChannelId>,
    ) -> Result<Arc<Session>, RetrieveError> {
        let volume = match self.settings.peek_volume(guild_id).await {
            Ok(Some(v)) => v.round().clamp(0.0, f32::from(crate::session::MAX_VOLUME)) as u16,
            Ok(None) => self.options.default_volume,
            Err(e) => {
                warn!(guild = %guild_id, "settings unavailable, using default volume: {e}");
                self.options.default_volume
            }
        };

        let options = PlayerOptions {
            disconnect_on_destroy: true,
            clear_queue_on_stop: true,
            initial_volume: volume,
        };
        let player = tokio::time::timeout(
            self.options.limits.node_timeout,
            self.node.connect(guild_id, voice_channel_id, options),
        )
        .await
        .map_err(|_| NodeError::Timeout)??;

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session::new(
            id,
            guild_id,
            voice_channel_id,
            text_channel_id,
            player,
            volume,
            self.options.limits,
        ));
        METRICS.inc_sessions();
        info!(guild = %guild_id, channel = %voice_channel_id, session = id.0, "session created");
        self.hub.notify(
            guild_id,
            EventType::PlayerCreated,
            &json!({ "session_id": id.0, "voice_channel_id": voice_channel_id, "volume": volume }),
        );
        Ok(session)
    }

    /// Unregister and tear down the guild's session. Returns whether one existed.
    /// Creation for the guild waits until the node has disconnected.
    pub async fn destroy(&self, guild_id: GuildId, reason: &str) -> bool {
        let gate = self.gate(guild_id);
        let _closed = gate.lock().await;
        let slot = self.with_slots(|slots| slots.remove(&guild_id));
        let Some(session) = slot.and_then(|cell| cell.get().cloned()) else {
            return false;
        };

        session.mark_destroyed().await;
        let disconnect = self.node.disconnect(guild_id);
        match tokio::time::timeout(self.options.limits.node_timeout, disconnect).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(guild = %guild_id, "node disconnect failed: {e}"),
            Err(_) => warn!(guild = %guild_id, "node disconnect timed out"),
        }
        METRICS.dec_sessions();
        info!(guild = %guild_id, session = session.id().0, reason, "session destroyed");
        self.hub.notify(
            guild_id,
            EventType::PlayerDestroyed,
            &json!({
                "session_id": session.id().0,
                "reason": reason,
                "text_channel_id": session.text_channel_id(),
            }),
        );
        true
    }

    pub async fn destroy_all(&self, reason: &str) {
        let guilds: Vec<GuildId> = self.with_slots(|slots| slots.keys().copied().collect());
        join_all(guilds.into_iter().map(|g| self.destroy(g, reason))).await;
    }

    /// Apply a node event to the matching session.
    pub async fn apply_event(&self, event: NodeEvent) -> EventOutcome {
        let guild_id = event.guild();
        let Some(session) = self.get(guild_id) else {
            debug!(guild = %guild_id, "node event for guild without session: {event:?}");
            return EventOutcome::Ignored;
        };

        let (identifier, reason) = match event {
            // Announced when the session handed the track over.
            NodeEvent::TrackStarted { identifier, .. } => {
                debug!(guild = %guild_id, "node started {identifier}");
                return EventOutcome::Ignored;
            }
            NodeEvent::TrackEnded {
                identifier, reason, ..
            } => (identifier, reason),
            NodeEvent::TrackStuck {
                identifier,
                threshold,
                ..
            } => {
                warn!(guild = %guild_id, "track {identifier} stuck for {threshold:?}, skipping");
                (identifier, TrackEndReason::LoadFailed)
            }
            NodeEvent::TrackException {
                identifier,
                message,
                ..
            } => {
                warn!(guild = %guild_id, "track {identifier} failed: {message}");
                (identifier, TrackEndReason::LoadFailed)
            }
            NodeEvent::WebSocketClosed { code, reason, .. } => {
                warn!(guild = %guild_id, ?code, "voice connection closed: {reason}");
                self.destroy(guild_id, "voice connection closed").await;
                return EventOutcome::Destroyed;
            }
        };

        match session.advance(&identifier, reason).await {
            Ok(Advance::Ignored) => EventOutcome::Ignored,
            Ok(advance) => {
                self.hub.notify(
                    guild_id,
                    EventType::TrackEnded,
                    &json!({ "identifier": identifier, "reason": format!("{reason:?}") }),
                );
                match &advance {
                    Advance::Next(track) | Advance::Repeated(track) => {
                        self.hub.notify(guild_id, EventType::TrackStarted, track);
                    }
                    Advance::Drained { .. } => {
                        self.hub.notify(guild_id, EventType::PlayerState, &PlayerState::Idle);
                    }
                    Advance::Ignored => {}
                }
                EventOutcome::Advanced(advance)
            }
            Err(e) => {
                error!(guild = %guild_id, "failed to advance queue after track end: {e}");
                EventOutcome::Ignored
            }
        }
    }

    /// Destroy sessions idle for longer than the configured timeout.
    pub async fn reap_idle(&self) -> Vec<GuildId> {
        let sessions = self.sessions();
        let idle = join_all(sessions.iter().map(|s| async move {
            let idle_for = s.idle_for().await;
            (s.guild_id(), idle_for)
        }))
        .await;

        let mut reaped = Vec::new();
        for (guild_id, idle_for) in idle {
            if idle_for.is_some_and(|d| d >= self.options.idle_timeout)
                && self.destroy(guild_id, "inactivity").await
            {
                reaped.push(guild_id);
            }
        }
        reaped
    }

    pub fn spawn_idle_reaper(
        self: Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let reaped = self.reap_idle().await;
                        if !reaped.is_empty() {
                            info!("disconnected {} idle session(s)", reaped.len());
                        }
                    }
                }
            }
        })
    }
}
