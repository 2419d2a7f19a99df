//! Posts session events to the text channel the session was started from.

use std::sync::{Arc, Weak};

use serenity::all::{ChannelId, CreateEmbed, CreateMessage, Http};
use tracing::warn;

use crate::commands::SUCCESS_COLOUR;
use crate::manager::SessionManager;
use crate::notify::{EventSubscriber, EventType, Notification};
use crate::track::TrackReference;

/// User-facing line for `message`, or `None` for events nobody needs to see.
pub fn announcement(message: &Notification) -> Option<String> {
    match message.event_type {
        EventType::TrackStarted => {
            let track: TrackReference = serde_json::from_value(message.payload.clone()).ok()?;
            Some(format!("Now playing **{}**", track.display()))
        }
        EventType::PlayerState if message.payload == "idle" => {
            Some("The queue has finished.".to_string())
        }
        EventType::PlayerDestroyed => {
            let reason = message.payload["reason"].as_str().unwrap_or("unknown");
            Some(format!("Left the voice channel ({reason})."))
        }
        _ => None,
    }
}

pub struct ChannelAnnouncer {
    http: Arc<Http>,
    manager: Weak<SessionManager>,
}

impl ChannelAnnouncer {
    pub fn new(http: Arc<Http>, manager: &Arc<SessionManager>) -> Self {
        Self {
            http,
            manager: Arc::downgrade(manager),
        }
    }

    /// The payload's channel wins; otherwise the live session's.
    fn target(&self, message: &Notification) -> Option<ChannelId> {
        if let Some(id) = message.payload["text_channel_id"]
            .as_str()
            .and_then(|s| s.parse::<u64>().ok())
            .or_else(|| message.payload["text_channel_id"].as_u64())
        {
            return Some(ChannelId::new(id));
        }
        self.manager
            .upgrade()?
            .get(message.guild_id)?
            .text_channel_id()
    }
}

impl EventSubscriber for ChannelAnnouncer {
    fn on_event(&self, message: &Notification) -> anyhow::Result<()> {
        let Some(text) = announcement(message) else {
            return Ok(());
        };
        let Some(channel) = self.target(message) else {
            return Ok(());
        };
        let http = self.http.clone();
        let guild = message.guild_id;
        tokio::spawn(async move {
            let embed = CreateEmbed::new().description(text).colour(SUCCESS_COLOUR);
            if let Err(e) = channel
                .send_message(&http, CreateMessage::new().embed(embed))
                .await
            {
                warn!(guild = %guild, channel = %channel, "could not announce: {e}");
            }
        });
        Ok(())
    }
}
