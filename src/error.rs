use serde::Serialize;
use thiserror::Error;

use crate::manager::Precondition;

/// User-facing reason attached to a failed [`crate::service::CommandResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UserNotInVoiceChannel,
    BotNotConnected,
    VoiceChannelMismatch,
    NotPlaying,
    AlreadyPlaying,
    NotPaused,
    AlreadyPaused,
    QueueEmpty,
    QueueNotEmpty,
    NoCurrentTrack,
    QueueFull,
    InvalidArgument,
    Unavailable,
    Cancelled,
}

impl FailureReason {
    pub fn user_message(self) -> &'static str {
        match self {
            Self::UserNotInVoiceChannel => "You need to be in a voice channel.",
            Self::BotNotConnected => "I'm not connected to a voice channel.",
            Self::VoiceChannelMismatch => "You need to be in the same voice channel as me.",
            Self::NotPlaying => "Nothing is playing right now.",
            Self::AlreadyPlaying => "Something is already playing.",
            Self::NotPaused => "Playback is not paused.",
            Self::AlreadyPaused => "Playback is already paused.",
            Self::QueueEmpty => "The queue is empty.",
            Self::QueueNotEmpty => "The queue is not empty.",
            Self::NoCurrentTrack => "There is no current track.",
            Self::QueueFull => "The queue is full.",
            Self::InvalidArgument => "That value is not valid.",
            Self::Unavailable => "Something went wrong on our side, try again later.",
            Self::Cancelled => "The request was cancelled.",
        }
    }
}

/// Failures reported by the audio node or one of its players.
#[derive(Debug, Clone, Error)]
pub enum NodeError {
    #[error("audio node unavailable: {0}")]
    Unavailable(String),
    #[error("audio node call timed out")]
    Timeout,
    #[error("player error: {0}")]
    Player(String),
}

/// Why a session could not be handed to the caller.
#[derive(Debug, Clone, Error)]
pub enum RetrieveError {
    #[error("requesting user is not in a voice channel")]
    UserNotInVoiceChannel,
    #[error("bot is not connected to voice in this guild")]
    BotNotConnected,
    #[error("requesting user is in a different voice channel than the bot")]
    VoiceChannelMismatch,
    #[error("precondition failed: {0:?}")]
    PreconditionFailed(Precondition),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error("session retrieval cancelled")]
    Cancelled,
}

impl RetrieveError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::UserNotInVoiceChannel => FailureReason::UserNotInVoiceChannel,
            Self::BotNotConnected => FailureReason::BotNotConnected,
            Self::VoiceChannelMismatch => FailureReason::VoiceChannelMismatch,
            Self::PreconditionFailed(p) => p.failure_reason(),
            Self::Node(_) => FailureReason::Unavailable,
            Self::Cancelled => FailureReason::Cancelled,
        }
    }
}

/// State-machine violations and player failures raised by a session.
#[derive(Debug, Clone, Error)]
pub enum PlaybackError {
    #[error("nothing is playing")]
    NotPlaying,
    #[error("already paused")]
    AlreadyPaused,
    #[error("not paused")]
    NotPaused,
    #[error("no current track")]
    NoCurrentTrack,
    #[error("queue is full (max {max})")]
    QueueFull { max: usize },
    #[error("session has been destroyed")]
    Destroyed,
    #[error(transparent)]
    Node(#[from] NodeError),
}

impl PlaybackError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::NotPlaying => FailureReason::NotPlaying,
            Self::AlreadyPaused => FailureReason::AlreadyPaused,
            Self::NotPaused => FailureReason::NotPaused,
            Self::NoCurrentTrack => FailureReason::NoCurrentTrack,
            Self::QueueFull { .. } => FailureReason::QueueFull,
            Self::Destroyed => FailureReason::BotNotConnected,
            Self::Node(_) => FailureReason::Unavailable,
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search backend does not support this request")]
    Unsupported,
    #[error("search timed out")]
    Timeout,
    #[error("search backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("prefix must be 1 to {max} characters")]
    InvalidPrefix { max: usize },
    #[error("settings store error: {0}")]
    Store(#[from] diesel::result::Error),
    #[error("settings store connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),
    #[error("settings task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("settings store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push channel is not connected")]
    NotConnected,
    #[error("push channel call timed out")]
    Timeout,
    #[error("push channel transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum LyricsError {
    #[error("lyrics lookup timed out")]
    Timeout,
    #[error("lyrics service returned status {0}")]
    Status(u16),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
