//! Contract with the audio node that actually streams media into voice.

use std::sync::Arc;
use std::time::Duration;

use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId};

use crate::error::NodeError;
use crate::track::TrackReference;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerOptions {
    pub disconnect_on_destroy: bool,
    pub clear_queue_on_stop: bool,
    /// Percent, 0..=1000.
    pub initial_volume: u16,
}

#[async_trait]
pub trait AudioNode: Send + Sync {
    /// Join `channel` in `guild` (or reuse an existing connection) and hand back a player.
    async fn connect(
        &self,
        guild: GuildId,
        channel: ChannelId,
        options: PlayerOptions,
    ) -> Result<Arc<dyn AudioPlayer>, NodeError>;

    async fn disconnect(&self, guild: GuildId) -> Result<(), NodeError>;
}

#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Replaces whatever is currently playing.
    async fn play(&self, track: &TrackReference) -> Result<(), NodeError>;
    async fn pause(&self) -> Result<(), NodeError>;
    async fn resume(&self) -> Result<(), NodeError>;
    async fn stop(&self) -> Result<(), NodeError>;
    async fn seek(&self, position: Duration) -> Result<(), NodeError>;
    async fn set_volume(&self, percent: u16) -> Result<(), NodeError>;
    async fn position(&self) -> Option<Duration>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Whether the queue should move on to the next entry.
    pub fn may_start_next(self) -> bool {
        matches!(self, Self::Finished | Self::LoadFailed)
    }
}

/// Events pushed by the node, keyed by guild.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    TrackStarted {
        guild: GuildId,
        identifier: String,
    },
    TrackEnded {
        guild: GuildId,
        identifier: String,
        reason: TrackEndReason,
    },
    TrackStuck {
        guild: GuildId,
        identifier: String,
        threshold: Duration,
    },
    TrackException {
        guild: GuildId,
        identifier: String,
        message: String,
    },
    WebSocketClosed {
        guild: GuildId,
        code: Option<u16>,
        reason: String,
    },
}

impl NodeEvent {
    pub fn guild(&self) -> GuildId {
        match self {
            Self::TrackStarted { guild, .. }
            | Self::TrackEnded { guild, .. }
            | Self::TrackStuck { guild, .. }
            | Self::TrackException { guild, .. }
            | Self::WebSocketClosed { guild, .. } => *guild,
        }
    }
}
