//! User-facing command surface.
//!
//! Every [`PlayerCommand`] resolves to exactly one [`CommandResult`]. Nothing
//! below this layer is allowed to surface as a panic or an `Err` to the
//! caller: precondition failures become a `FailureReason`, collaborator
//! failures are logged and reported as `Unavailable`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use serenity::model::id::{ChannelId, GuildId, UserId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{FailureReason, PlaybackError, RetrieveError};
use crate::lyrics::LyricsProvider;
use crate::manager::{ConnectBehavior, EventOutcome, Precondition, RetrieveRequest, SessionManager};
use crate::node::NodeEvent;
use crate::notify::{EventType, NotificationHub};
use crate::queue::RepeatMode;
use crate::search::{SearchOrchestrator, SearchProvider};
use crate::session::{
    Advance, MAX_VOLUME, PlayOutcome, PlayerState, Session, SessionSnapshot, SkipOutcome,
};
use crate::settings::SettingsStore;
use crate::track::{QueueEntry, TrackReference, format_duration};

/// Who issued a command and from where.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub guild_id: GuildId,
    pub user_id: UserId,
    /// The invoking user's current voice channel.
    pub voice_channel: Option<ChannelId>,
    pub text_channel_id: Option<ChannelId>,
    pub cancel: CancellationToken,
}

impl CommandContext {
    pub fn new(guild_id: GuildId, user_id: UserId, voice_channel: Option<ChannelId>) -> Self {
        Self {
            guild_id,
            user_id,
            voice_channel,
            text_channel_id: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_text_channel(mut self, channel: ChannelId) -> Self {
        self.text_channel_id = Some(channel);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerCommand {
    Play { query: String },
    Pause,
    Resume,
    Skip { count: usize },
    Seek { position: Duration },
    Volume { percent: u16 },
    Shuffle,
    Repeat { mode: RepeatMode },
    AutoPlay,
    Queue,
    NowPlaying,
    Clear,
    Lyrics,
    Stop,
    Leave,
    Provider { provider: SearchProvider },
    Prefix { prefix: String },
}

impl PlayerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Play { .. } => "play",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Skip { .. } => "skip",
            Self::Seek { .. } => "seek",
            Self::Volume { .. } => "volume",
            Self::Shuffle => "shuffle",
            Self::Repeat { .. } => "repeat",
            Self::AutoPlay => "autoplay",
            Self::Queue => "queue",
            Self::NowPlaying => "nowplaying",
            Self::Clear => "clear",
            Self::Lyrics => "lyrics",
            Self::Stop => "stop",
            Self::Leave => "leave",
            Self::Provider { .. } => "provider",
            Self::Prefix { .. } => "prefix",
        }
    }

    /// How the command obtains its session. `None` for commands that only touch settings.
    fn plan(&self) -> Option<(ConnectBehavior, Vec<Precondition>)> {
        use Precondition::*;
        let plan = match self {
            Self::Play { .. } => (ConnectBehavior::Join, vec![]),
            Self::Pause => (ConnectBehavior::None, vec![NotPaused, Playing]),
            Self::Resume => (ConnectBehavior::None, vec![Paused]),
            Self::Skip { .. } => (ConnectBehavior::None, vec![Playing]),
            Self::Seek { .. } | Self::NowPlaying | Self::Lyrics => {
                (ConnectBehavior::None, vec![HasCurrentTrack])
            }
            Self::Shuffle
            | Self::Repeat { .. }
            | Self::AutoPlay
            | Self::Queue
            | Self::Clear
            | Self::Stop
            | Self::Leave => (ConnectBehavior::None, vec![]),
            Self::Volume { .. } | Self::Provider { .. } | Self::Prefix { .. } => return None,
        };
        Some(plan)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SessionSnapshot>,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            failure: None,
            snapshot: None,
        }
    }

    pub fn fail(reason: FailureReason) -> Self {
        Self {
            success: false,
            message: Some(reason.user_message().to_string()),
            failure: Some(reason),
            snapshot: None,
        }
    }

    pub fn fail_with(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::fail(reason)
        }
    }

    pub fn with_snapshot(mut self, snapshot: SessionSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }
}

impl From<RetrieveError> for CommandResult {
    fn from(e: RetrieveError) -> Self {
        if let RetrieveError::Node(inner) = &e {
            error!("audio node failure while retrieving session: {inner}");
        }
        Self::fail(e.reason())
    }
}

impl From<PlaybackError> for CommandResult {
    fn from(e: PlaybackError) -> Self {
        if let PlaybackError::Node(inner) = &e {
            error!("audio node failure during playback command: {inner}");
        }
        Self::fail(e.reason())
    }
}

/// Lines shown by the queue command.
const QUEUE_PAGE: usize = 10;
const LYRICS_MAX_CHARS: usize = 1900;

pub struct PlaybackCommandService {
    manager: Arc<SessionManager>,
    search: SearchOrchestrator,
    settings: SettingsStore,
    hub: NotificationHub,
    lyrics: Option<Arc<dyn LyricsProvider>>,
}

impl PlaybackCommandService {
    pub fn new(
        manager: Arc<SessionManager>,
        search: SearchOrchestrator,
        settings: SettingsStore,
        hub: NotificationHub,
    ) -> Self {
        Self {
            manager,
            search,
            settings,
            hub,
            lyrics: None,
        }
    }

    pub fn with_lyrics(mut self, provider: Arc<dyn LyricsProvider>) -> Self {
        self.lyrics = Some(provider);
        self
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub async fn execute(&self, ctx: &CommandContext, command: PlayerCommand) -> CommandResult {
        debug!(guild = %ctx.guild_id, user = %ctx.user_id, command = command.name(), "executing");
        let result = match command.plan() {
            Some((behavior, preconditions)) => {
                let request = RetrieveRequest {
                    guild_id: ctx.guild_id,
                    voice_channel_id: ctx.voice_channel,
                    text_channel_id: ctx.text_channel_id,
                    behavior,
                    preconditions,
                };
                match self.manager.get_or_create(request, &ctx.cancel).await {
                    Ok(session) => self.run(ctx, &session, command).await,
                    Err(e) => e.into(),
                }
            }
            None => self.configure(ctx, command).await,
        };
        if !result.success {
            debug!(guild = %ctx.guild_id, failure = ?result.failure, "command rejected");
        }
        result
    }

    async fn run(
        &self,
        ctx: &CommandContext,
        session: &Arc<Session>,
        command: PlayerCommand,
    ) -> CommandResult {
        let guild = ctx.guild_id;
        match command {
            PlayerCommand::Play { query } => self.play(ctx, session, &query).await,
            PlayerCommand::Pause => match session.pause().await {
                Ok(()) => {
                    self.hub.notify(guild, EventType::PlayerState, &PlayerState::Paused);
                    CommandResult::ok("Paused.")
                }
                Err(e) => e.into(),
            },
            PlayerCommand::Resume => match session.resume().await {
                Ok(()) => {
                    self.hub.notify(guild, EventType::PlayerState, &PlayerState::Playing);
                    CommandResult::ok("Resumed.")
                }
                Err(e) => e.into(),
            },
            PlayerCommand::Skip { count } => match session.skip(count).await {
                Ok(SkipOutcome::Advanced {
                    skipped,
                    now_playing,
                }) => {
                    self.hub.notify(guild, EventType::TrackStarted, &now_playing);
                    CommandResult::ok(format!(
                        "Skipped **{}**, now playing **{}**.",
                        skipped.display(),
                        now_playing.display()
                    ))
                }
                Ok(SkipOutcome::Stopped { skipped }) => {
                    self.hub.notify(guild, EventType::PlayerState, &PlayerState::Idle);
                    CommandResult::ok(format!(
                        "Skipped **{}**, the queue is now empty.",
                        skipped.display()
                    ))
                }
                Err(e) => e.into(),
            },
            PlayerCommand::Seek { position } => match session.seek(position).await {
                Ok(applied) => {
                    CommandResult::ok(format!("Seeked to {}.", format_duration(applied)))
                }
                Err(e) => e.into(),
            },
            PlayerCommand::Shuffle => {
                let enabled = session.toggle_shuffle().await;
                self.hub.notify(guild, EventType::ShuffleToggled, &json!({ "enabled": enabled }));
                CommandResult::ok(if enabled {
                    "Shuffle enabled."
                } else {
                    "Shuffle disabled."
                })
            }
            PlayerCommand::Repeat { mode } => {
                session.set_repeat(mode).await;
                self.hub.notify(guild, EventType::RepeatChanged, &json!({ "mode": mode }));
                CommandResult::ok(match mode {
                    RepeatMode::Off => "Repeat disabled.",
                    RepeatMode::Track => "Repeating the current track.",
                    RepeatMode::Queue => "Repeating the queue.",
                })
            }
            PlayerCommand::AutoPlay => {
                let enabled = session.toggle_autoplay();
                CommandResult::ok(if enabled {
                    "AutoPlay enabled."
                } else {
                    "AutoPlay disabled."
                })
            }
            PlayerCommand::Queue => {
                let snapshot = session.snapshot().await;
                CommandResult::ok(render_queue(&snapshot)).with_snapshot(snapshot)
            }
            PlayerCommand::NowPlaying => {
                let snapshot = session.snapshot().await;
                let message = match &snapshot.current {
                    Some(track) => format!(
                        "Now playing **{}** [{} / {}]",
                        track.display(),
                        format_duration(Duration::from_millis(snapshot.position_ms)),
                        format_duration(track.duration())
                    ),
                    None => FailureReason::NoCurrentTrack.user_message().to_string(),
                };
                CommandResult::ok(message).with_snapshot(snapshot)
            }
            PlayerCommand::Clear => {
                let removed = session.clear().await;
                if removed == 0 {
                    return CommandResult::ok("The queue is already empty.");
                }
                self.hub.notify(guild, EventType::QueueCleared, &json!({ "removed": removed }));
                CommandResult::ok(format!("Removed {removed} track(s) from the queue."))
            }
            PlayerCommand::Lyrics => self.lyrics(session).await,
            PlayerCommand::Stop => match session.stop().await {
                Ok(removed) => {
                    self.hub.notify(guild, EventType::QueueCleared, &json!({ "removed": removed }));
                    self.hub.notify(guild, EventType::PlayerState, &PlayerState::Idle);
                    CommandResult::ok("Stopped playback and cleared the queue.")
                }
                Err(e) => e.into(),
            },
            PlayerCommand::Leave => {
                self.manager.destroy(guild, "left on request").await;
                CommandResult::ok("Left the voice channel.")
            }
            PlayerCommand::Volume { .. }
            | PlayerCommand::Provider { .. }
            | PlayerCommand::Prefix { .. } => {
                self.configure(ctx, command).await
            }
        }
    }

    async fn play(
        &self,
        ctx: &CommandContext,
        session: &Arc<Session>,
        query: &str,
    ) -> CommandResult {
        let guild = ctx.guild_id;
        let provider = match self.settings.search_provider(guild).await {
            Ok(p) => p,
            Err(e) => {
                warn!(guild = %guild, "settings unavailable, using default search provider: {e}");
                self.settings.defaults().search_provider
            }
        };

        let found = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return CommandResult::fail(FailureReason::Cancelled),
            found = self.search.resolve(query, provider) => found,
        };
        let tracks = match found {
            Ok(result) if result.is_empty() => {
                return CommandResult::ok(format!("No results for `{query}`."));
            }
            Ok(result) => result.tracks,
            Err(e) => {
                error!(guild = %guild, "search failed for {query:?}: {e}");
                return CommandResult::fail(FailureReason::Unavailable);
            }
        };

        let mut entries = tracks.into_iter().map(|t| QueueEntry::new(t, ctx.user_id));
        let Some(first) = entries.next() else {
            return CommandResult::ok(format!("No results for `{query}`."));
        };
        match session.play(first, entries.collect()).await {
            Ok(PlayOutcome::NowPlaying { track, queued }) => {
                self.hub.notify(guild, EventType::TrackStarted, &track);
                let mut message = format!("Now playing **{}**", track.display());
                if queued > 0 {
                    message.push_str(&format!(" (+{queued} queued)"));
                }
                CommandResult::ok(message)
            }
            Ok(PlayOutcome::Queued {
                track,
                position,
                count,
            }) => {
                self.hub.notify(
                    guild,
                    EventType::TrackQueued,
                    &json!({ "track": track, "position": position, "count": count }),
                );
                if count > 1 {
                    CommandResult::ok(format!(
                        "Queued {count} tracks starting at position {position}."
                    ))
                } else {
                    CommandResult::ok(format!(
                        "Queued **{}** at position {position}.",
                        track.display()
                    ))
                }
            }
            Err(e) => e.into(),
        }
    }

    async fn lyrics(&self, session: &Arc<Session>) -> CommandResult {
        let Some(provider) = &self.lyrics else {
            return CommandResult::fail_with(
                FailureReason::Unavailable,
                "Lyrics are not available.",
            );
        };
        let Some(track) = session.snapshot().await.current else {
            return CommandResult::fail(FailureReason::NoCurrentTrack);
        };
        match provider.lookup(&track).await {
            Ok(Some(lyrics)) => CommandResult::ok(format!(
                "**{} - {}**\n{}",
                lyrics.artist,
                lyrics.title,
                crate::lyrics::truncate_for_message(&lyrics.text, LYRICS_MAX_CHARS)
            )),
            Ok(None) => CommandResult::ok(format!("No lyrics found for **{}**.", track.display())),
            Err(e) => {
                warn!(guild = %session.guild_id(), "lyrics lookup failed: {e}");
                CommandResult::fail(FailureReason::Unavailable)
            }
        }
    }

    /// Settings-only commands. Volume also applies to a live session when there is one.
    async fn configure(&self, ctx: &CommandContext, command: PlayerCommand) -> CommandResult {
        let guild = ctx.guild_id;
        match command {
            PlayerCommand::Volume { percent } => {
                if percent > MAX_VOLUME {
                    return CommandResult::fail_with(
                        FailureReason::InvalidArgument,
                        format!("Volume must be between 0 and {MAX_VOLUME}."),
                    );
                }
                let live = match self.manager.get(guild) {
                    Some(_) => {
                        let request = RetrieveRequest {
                            guild_id: guild,
                            voice_channel_id: ctx.voice_channel,
                            text_channel_id: ctx.text_channel_id,
                            behavior: ConnectBehavior::None,
                            preconditions: vec![],
                        };
                        match self.manager.get_or_create(request, &ctx.cancel).await {
                            Ok(session) => Some(session),
                            Err(RetrieveError::BotNotConnected) => None,
                            Err(e) => return e.into(),
                        }
                    }
                    None => None,
                };
                if let Err(e) = self.settings.set_volume(guild, f32::from(percent)).await {
                    error!(guild = %guild, "failed to persist volume: {e}");
                    return CommandResult::fail(FailureReason::Unavailable);
                }
                if let Some(session) = live {
                    if let Err(e) = session.set_volume(percent).await {
                        return e.into();
                    }
                }
                self.hub.notify(guild, EventType::VolumeChanged, &json!({ "volume": percent }));
                CommandResult::ok(format!("Volume set to {percent}%."))
            }
            PlayerCommand::Provider { provider } => {
                match self.settings.set_search_provider(guild, provider).await {
                    Ok(p) => CommandResult::ok(format!("Search provider set to {}.", p.label())),
                    Err(e) => {
                        error!(guild = %guild, "failed to persist search provider: {e}");
                        CommandResult::fail(FailureReason::Unavailable)
                    }
                }
            }
            PlayerCommand::Prefix { prefix } => {
                match self.settings.set_prefix(guild, &prefix).await {
                    Ok(p) => CommandResult::ok(format!("Prefix set to `{p}`.")),
                    Err(crate::error::SettingsError::InvalidPrefix { max }) => {
                        CommandResult::fail_with(
                            FailureReason::InvalidArgument,
                            format!("The prefix must be 1 to {max} characters."),
                        )
                    }
                    Err(e) => {
                        error!(guild = %guild, "failed to persist prefix: {e}");
                        CommandResult::fail(FailureReason::Unavailable)
                    }
                }
            }
            other => {
                error!(
                    command = other.name(),
                    "command routed to settings without a settings plan"
                );
                CommandResult::fail(FailureReason::Unavailable)
            }
        }
    }

    /// Queue something by the same artist after the queue ran dry.
    pub async fn continue_autoplay(
        &self,
        guild_id: GuildId,
        ended: &QueueEntry,
    ) -> Option<TrackReference> {
        let session = self.manager.get(guild_id)?;
        if !session.autoplay_enabled() {
            return None;
        }
        let provider = self
            .settings
            .search_provider(guild_id)
            .await
            .unwrap_or(self.settings.defaults().search_provider);
        let query = if ended.track.author.is_empty() {
            ended.track.title.clone()
        } else {
            ended.track.author.clone()
        };
        let candidates = match self.search.candidates(&query, provider).await {
            Ok(result) => result.tracks,
            Err(e) => {
                warn!(guild = %guild_id, "autoplay search failed: {e}");
                return None;
            }
        };
        let next = candidates
            .into_iter()
            .find(|t| t.identifier != ended.track.identifier)?;
        match session
            .play(QueueEntry::new(next, ended.requested_by), vec![])
            .await
        {
            Ok(PlayOutcome::NowPlaying { track, .. }) => {
                info!(guild = %guild_id, track = %track.title, "autoplay continued");
                self.hub.notify(guild_id, EventType::TrackStarted, &track);
                Some(track)
            }
            Ok(PlayOutcome::Queued { track, .. }) => Some(track),
            Err(e) => {
                warn!(guild = %guild_id, "autoplay could not start: {e}");
                None
            }
        }
    }

    pub async fn handle_node_event(&self, event: NodeEvent) {
        let guild = event.guild();
        if let EventOutcome::Advanced(Advance::Drained { ended }) =
            self.manager.apply_event(event).await
        {
            self.continue_autoplay(guild, &ended).await;
        }
    }

    pub fn spawn_node_event_pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<NodeEvent>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(e) => e,
                        None => break,
                    },
                };
                self.handle_node_event(event).await;
            }
            debug!("node event pump stopped");
        })
    }
}

fn render_queue(snapshot: &SessionSnapshot) -> String {
    let mut out = String::new();
    match &snapshot.current {
        Some(t) => out.push_str(&format!(
            "Now playing: **{}** ({})\n",
            t.display(),
            format_duration(t.duration())
        )),
        None => out.push_str("Nothing is playing.\n"),
    }
    if snapshot.queue.is_empty() {
        out.push_str("The queue is empty.");
        return out;
    }
    for (i, t) in snapshot.queue.iter().take(QUEUE_PAGE).enumerate() {
        out.push_str(&format!("{}. {} ({})\n", i + 1, t.display(), format_duration(t.duration())));
    }
    if snapshot.queue.len() > QUEUE_PAGE {
        out.push_str(&format!("…and {} more", snapshot.queue.len() - QUEUE_PAGE));
    }
    let mut flags = Vec::new();
    if snapshot.shuffle {
        flags.push("shuffle");
    }
    match snapshot.repeat {
        RepeatMode::Track => flags.push("repeat track"),
        RepeatMode::Queue => flags.push("repeat queue"),
        RepeatMode::Off => {}
    }
    if !flags.is_empty() {
        out.push_str(&format!("\n[{}]", flags.join(", ")));
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::LyricsError;
    use crate::lyrics::Lyrics;
    use crate::manager::ManagerOptions;
    use crate::node::TrackEndReason;
    use crate::settings::{MemorySettingsRepository, SettingsDefaults};
    use crate::test_support::{FakeNode, FakeSearch, track};
    use serenity::async_trait;

    const G1: GuildId = GuildId::new(1);
    const VC1: ChannelId = ChannelId::new(10);

    struct Harness {
        service: PlaybackCommandService,
        node: Arc<FakeNode>,
        search: Arc<FakeSearch>,
        repo: Arc<MemorySettingsRepository>,
    }

    fn harness() -> Harness {
        let node = Arc::new(FakeNode::default());
        let search = Arc::new(FakeSearch::default());
        let repo = Arc::new(MemorySettingsRepository::new());
        let settings = SettingsStore::new(repo.clone(), SettingsDefaults::default());
        let hub = NotificationHub::new(None);
        let manager = Arc::new(SessionManager::new(
            node.clone(),
            settings.clone(),
            hub.clone(),
            ManagerOptions::default(),
        ));
        let service = PlaybackCommandService::new(
            manager,
            SearchOrchestrator::new(search.clone(), Duration::from_millis(500)),
            settings,
            hub,
        );
        Harness {
            service,
            node,
            search,
            repo,
        }
    }

    fn in_vc1() -> CommandContext {
        CommandContext::new(G1, UserId::new(7), Some(VC1))
    }

    fn play(query: &str) -> PlayerCommand {
        PlayerCommand::Play {
            query: query.to_string(),
        }
    }

    #[tokio::test]
    async fn play_queue_skip_scenario() {
        let h = harness();
        let ctx = in_vc1();

        h.search.set_rich(vec![track("song-a", 120)]);
        let res = h.service.execute(&ctx, play("song-a")).await;
        assert!(res.success, "{res:?}");
        let snap = h.service.manager().get(G1).unwrap().snapshot().await;
        assert_eq!(snap.state, PlayerState::Playing);
        assert_eq!(snap.current.unwrap().identifier, "song-a");
        assert!(snap.queue.is_empty());

        h.search.set_rich(vec![track("song-b", 120)]);
        let res = h.service.execute(&ctx, play("song-b")).await;
        assert!(res.success);
        assert!(res.message.unwrap().starts_with("Queued"));
        let snap = h.service.manager().get(G1).unwrap().snapshot().await;
        let queued: Vec<_> = snap.queue.iter().map(|t| t.identifier.as_str()).collect();
        assert_eq!(queued, vec!["song-b"]);

        assert!(h.service.execute(&ctx, PlayerCommand::Skip { count: 1 }).await.success);
        let snap = h.service.manager().get(G1).unwrap().snapshot().await;
        assert_eq!(snap.state, PlayerState::Playing);
        assert_eq!(snap.current.unwrap().identifier, "song-b");
        assert!(snap.queue.is_empty());

        assert!(h.service.execute(&ctx, PlayerCommand::Skip { count: 1 }).await.success);
        let snap = h.service.manager().get(G1).unwrap().snapshot().await;
        assert_eq!(snap.state, PlayerState::Idle);
        assert!(snap.current.is_none());

        assert_eq!(h.node.connects(), 1);
    }

    #[tokio::test]
    async fn volume_without_session_creates_settings_row() {
        let h = harness();
        assert_eq!(h.repo.inserts(), 0);
        let res = h
            .service
            .execute(&in_vc1(), PlayerCommand::Volume { percent: 150 })
            .await;
        assert!(res.success, "{res:?}");
        assert_eq!(h.repo.inserts(), 1);
        assert_eq!(h.service.settings().volume(G1).await.unwrap(), 150.0);
        assert!(h.service.manager().get(G1).is_none());
    }

    #[tokio::test]
    async fn volume_applies_to_live_session_and_new_sessions_start_there() {
        let h = harness();
        let ctx = in_vc1();
        h.search.set_rich(vec![track("a", 60)]);
        h.service.execute(&ctx, play("a")).await;
        assert!(h.service.execute(&ctx, PlayerCommand::Volume { percent: 80 }).await.success);
        assert_eq!(h.node.player(G1).unwrap().volume(), 80);

        let res = h.service.execute(&ctx, PlayerCommand::Volume { percent: 5000 }).await;
        assert_eq!(res.failure, Some(FailureReason::InvalidArgument));

        h.service.execute(&ctx, PlayerCommand::Leave).await;
        h.service.execute(&ctx, play("a")).await;
        assert_eq!(h.service.manager().get(G1).unwrap().volume().await, 80);
    }

    #[tokio::test]
    async fn requester_failures_are_reported_not_thrown() {
        let h = harness();
        let nowhere = CommandContext::new(G1, UserId::new(7), None);
        let res = h.service.execute(&nowhere, play("x")).await;
        assert_eq!(res.failure, Some(FailureReason::UserNotInVoiceChannel));

        let res = h.service.execute(&in_vc1(), PlayerCommand::Pause).await;
        assert_eq!(res.failure, Some(FailureReason::BotNotConnected));

        h.search.set_rich(vec![track("a", 60)]);
        h.service.execute(&in_vc1(), play("a")).await;
        let elsewhere = CommandContext::new(G1, UserId::new(8), Some(ChannelId::new(11)));
        let res = h.service.execute(&elsewhere, PlayerCommand::Skip { count: 1 }).await;
        assert_eq!(res.failure, Some(FailureReason::VoiceChannelMismatch));
        assert!(res.message.is_some());
    }

    #[tokio::test]
    async fn pause_and_resume_follow_the_state_machine() {
        let h = harness();
        let ctx = in_vc1();
        h.search.set_rich(vec![track("a", 60)]);
        h.service.execute(&ctx, play("a")).await;

        assert!(h.service.execute(&ctx, PlayerCommand::Pause).await.success);
        let res = h.service.execute(&ctx, PlayerCommand::Pause).await;
        assert_eq!(res.failure, Some(FailureReason::AlreadyPaused));
        let res = h.service.execute(&ctx, PlayerCommand::Skip { count: 1 }).await;
        assert_eq!(res.failure, Some(FailureReason::NotPlaying));
        assert!(h.service.execute(&ctx, PlayerCommand::Resume).await.success);
        let res = h.service.execute(&ctx, PlayerCommand::Resume).await;
        assert_eq!(res.failure, Some(FailureReason::NotPaused));
    }

    #[tokio::test]
    async fn no_results_is_success_and_search_failure_is_unavailable() {
        let h = harness();
        let ctx = in_vc1();
        let res = h.service.execute(&ctx, play("nothing here")).await;
        assert!(res.success);
        assert!(res.message.unwrap().starts_with("No results"));

        h.search.fail_load();
        let res = h.service.execute(&ctx, play("boom")).await;
        assert!(!res.success);
        assert_eq!(res.failure, Some(FailureReason::Unavailable));
    }

    #[tokio::test]
    async fn queue_and_clear_on_empty_queue_succeed() {
        let h = harness();
        let ctx = in_vc1();
        h.search.set_rich(vec![track("a", 60)]);
        h.service.execute(&ctx, play("a")).await;

        let res = h.service.execute(&ctx, PlayerCommand::Queue).await;
        assert!(res.success);
        assert!(res.message.unwrap().contains("The queue is empty."));
        assert!(res.snapshot.is_some());

        let res = h.service.execute(&ctx, PlayerCommand::Clear).await;
        assert!(res.success);
    }

    #[tokio::test]
    async fn playlist_query_queues_everything() {
        let h = harness();
        let ctx = in_vc1();
        h.search.set_load(vec![track("1", 60), track("2", 60), track("3", 60)], true);
        let res = h.service.execute(&ctx, play("https://example.com/list")).await;
        assert!(res.success);
        let snap = h.service.manager().get(G1).unwrap().snapshot().await;
        assert_eq!(snap.current.unwrap().identifier, "1");
        assert_eq!(snap.queue.len(), 2);
    }

    #[tokio::test]
    async fn natural_end_advances_through_event_handler() {
        let h = harness();
        let ctx = in_vc1();
        h.search.set_load(vec![track("1", 60), track("2", 60)], true);
        h.service.execute(&ctx, play("my playlist")).await;
        h.service
            .handle_node_event(NodeEvent::TrackEnded {
                guild: G1,
                identifier: "1".into(),
                reason: TrackEndReason::Finished,
            })
            .await;
        let snap = h.service.manager().get(G1).unwrap().snapshot().await;
        assert_eq!(snap.current.unwrap().identifier, "2");
    }

    #[tokio::test]
    async fn autoplay_picks_a_different_track_when_queue_drains() {
        let h = harness();
        let ctx = in_vc1();
        h.search.set_rich(vec![track("a", 60)]);
        h.service.execute(&ctx, play("a")).await;
        assert!(h.service.execute(&ctx, PlayerCommand::AutoPlay).await.success);

        h.search.set_rich(vec![track("a", 60), track("b", 60)]);
        h.service
            .handle_node_event(NodeEvent::TrackEnded {
                guild: G1,
                identifier: "a".into(),
                reason: TrackEndReason::Finished,
            })
            .await;
        let snap = h.service.manager().get(G1).unwrap().snapshot().await;
        assert_eq!(snap.state, PlayerState::Playing);
        assert_eq!(snap.current.unwrap().identifier, "b");
    }

    #[tokio::test]
    async fn cancelled_play_reports_cancellation() {
        let h = harness();
        let ctx = in_vc1();
        ctx.cancel.cancel();
        let res = h.service.execute(&ctx, play("a")).await;
        assert_eq!(res.failure, Some(FailureReason::Cancelled));
        assert!(h.service.manager().get(G1).is_none());
    }

    struct FixedLyrics(Option<Lyrics>);

    #[async_trait]
    impl LyricsProvider for FixedLyrics {
        async fn lookup(&self, _track: &TrackReference) -> Result<Option<Lyrics>, LyricsError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn lyrics_need_a_current_track_and_a_provider() {
        let h = harness();
        let ctx = in_vc1();
        h.search.set_rich(vec![track("a", 60)]);
        h.service.execute(&ctx, play("a")).await;
        let res = h.service.execute(&ctx, PlayerCommand::Lyrics).await;
        assert_eq!(res.failure, Some(FailureReason::Unavailable));

        let service = h.service.with_lyrics(Arc::new(FixedLyrics(Some(Lyrics {
            title: "Track a".into(),
            artist: "Artist a".into(),
            text: "la la".into(),
            synced: false,
        }))));
        let res = service.execute(&ctx, PlayerCommand::Lyrics).await;
        assert!(res.success);
        assert!(res.message.unwrap().contains("la la"));

        service.execute(&ctx, PlayerCommand::Stop).await;
        let res = service.execute(&ctx, PlayerCommand::Lyrics).await;
        assert_eq!(res.failure, Some(FailureReason::NoCurrentTrack));
    }

    #[tokio::test]
    async fn settings_commands_validate_input() {
        let h = harness();
        let ctx = in_vc1();
        let res = h
            .service
            .execute(&ctx, PlayerCommand::Prefix { prefix: "way-too-long-prefix".into() })
            .await;
        assert_eq!(res.failure, Some(FailureReason::InvalidArgument));
        let set = PlayerCommand::Prefix { prefix: "?".into() };
        assert!(h.service.execute(&ctx, set).await.success);
        assert!(
            h.service
                .execute(&ctx, PlayerCommand::Provider { provider: SearchProvider::SoundCloud })
                .await
                .success
        );
        assert_eq!(
            h.service.settings().search_provider(G1).await.unwrap(),
            SearchProvider::SoundCloud
        );
        assert_eq!(h.service.settings().prefix(G1).await.unwrap(), "?");
    }
}
