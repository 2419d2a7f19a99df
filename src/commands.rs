//! Discord surface: slash command definitions, prefix parsing and replies.
//!
//! Both entry points reduce to a command name plus one optional argument
//! string, parsed by [`parse_command`], so `/volume percent:80` and `!volume 80`
//! take the same path into [`PlaybackCommandService`].

use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use serenity::all::{
    CommandDataOptionValue, CommandInteraction, CommandOptionType, Context as SerenityContext,
    CreateCommand, CreateCommandOption, CreateEmbed, CreateInteractionResponse,
    CreateInteractionResponseMessage, CreateMessage, EditInteractionResponse, InteractionContext,
    Message,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::FailureReason;
use crate::gateway::user_voice_channel;
use crate::queue::RepeatMode;
use crate::search::SearchProvider;
use crate::service::{CommandContext, CommandResult, PlaybackCommandService, PlayerCommand};
use crate::session::MAX_VOLUME;

pub(crate) const SUCCESS_COLOUR: u32 = 0x00FF7F;
const FAILURE_COLOUR: u32 = 0xFF6B6B;

fn simple(name: &str, description: &str) -> CreateCommand {
    CreateCommand::new(name)
        .description(description)
        .contexts(vec![InteractionContext::Guild])
}

pub fn definitions() -> Vec<CreateCommand> {
    let repeat = CreateCommandOption::new(CommandOptionType::String, "mode", "What to repeat")
        .required(true)
        .add_string_choice("Off", "off")
        .add_string_choice("Track", "track")
        .add_string_choice("Queue", "queue");
    let provider = SearchProvider::ALL.iter().fold(
        CreateCommandOption::new(CommandOptionType::String, "provider", "Search provider")
            .required(true),
        |opt, p| opt.add_string_choice(p.label(), p.label()),
    );

    vec![
        simple("play", "Play or queue a track, playlist or search").add_option(
            CreateCommandOption::new(CommandOptionType::String, "query", "URL or search terms")
                .required(true),
        ),
        simple("pause", "Pause playback"),
        simple("resume", "Resume paused playback"),
        simple("skip", "Skip the current track").add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "count", "How many to skip")
                .min_int_value(1),
        ),
        simple("seek", "Jump to a position in the current track").add_option(
            CreateCommandOption::new(CommandOptionType::String, "position", "e.g. 1:30")
                .required(true),
        ),
        simple("volume", "Set the playback volume").add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "percent", "0 to 1000")
                .min_int_value(0)
                .max_int_value(u64::from(MAX_VOLUME))
                .required(true),
        ),
        simple("shuffle", "Toggle shuffle"),
        simple("repeat", "Set the repeat mode").add_option(repeat),
        simple("autoplay", "Toggle playing related tracks when the queue runs out"),
        simple("queue", "Show the queue"),
        simple("nowplaying", "Show the current track"),
        simple("clear", "Remove every queued track"),
        simple("lyrics", "Show lyrics for the current track"),
        simple("stop", "Stop playback and clear the queue"),
        simple("leave", "Leave the voice channel"),
        simple("provider", "Set the search provider for this server").add_option(provider),
        simple("prefix", "Set the text command prefix for this server").add_option(
            CreateCommandOption::new(CommandOptionType::String, "prefix", "1 to 10 characters")
                .required(true),
        ),
    ]
}

/// Parses `h:mm:ss`, `m:ss` or plain seconds.
pub fn parse_timestamp(input: &str) -> Option<Duration> {
    let parts: Vec<&str> = input.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let mut secs = 0u64;
    for (i, part) in parts.iter().enumerate() {
        let value: u64 = part.trim().parse().ok()?;
        if i > 0 && value >= 60 {
            return None;
        }
        secs = secs.checked_mul(60)?.checked_add(value)?;
    }
    Some(Duration::from_secs(secs))
}

pub fn parse_command(name: &str, arg: Option<&str>) -> Result<PlayerCommand> {
    let arg = arg.map(str::trim).filter(|a| !a.is_empty());
    let required = |what: &str| arg.ok_or_else(|| anyhow!("`{name}` needs a {what}"));

    let command = match name.to_ascii_lowercase().as_str() {
        "play" | "p" => PlayerCommand::Play {
            query: required("query")?.to_string(),
        },
        "pause" => PlayerCommand::Pause,
        "resume" | "unpause" => PlayerCommand::Resume,
        "skip" | "next" | "s" => {
            let count = match arg {
                Some(a) => a.parse().map_err(|_| anyhow!("`{a}` is not a number"))?,
                None => 1,
            };
            if count == 0 {
                bail!("skip count must be at least 1");
            }
            PlayerCommand::Skip { count }
        }
        "seek" => {
            let raw = required("position")?;
            let position =
                parse_timestamp(raw).ok_or_else(|| anyhow!("`{raw}` is not a timestamp"))?;
            PlayerCommand::Seek { position }
        }
        "volume" | "vol" => {
            let raw = required("volume")?;
            let percent: u16 = raw
                .trim_end_matches('%')
                .parse()
                .map_err(|_| anyhow!("`{raw}` is not a volume"))?;
            PlayerCommand::Volume { percent }
        }
        "shuffle" => PlayerCommand::Shuffle,
        "repeat" | "loop" => PlayerCommand::Repeat {
            mode: required("mode")?.parse::<RepeatMode>().map_err(|e| anyhow!(e))?,
        },
        "autoplay" => PlayerCommand::AutoPlay,
        "queue" | "q" => PlayerCommand::Queue,
        "nowplaying" | "np" => PlayerCommand::NowPlaying,
        "clear" => PlayerCommand::Clear,
        "lyrics" => PlayerCommand::Lyrics,
        "stop" => PlayerCommand::Stop,
        "leave" | "disconnect" | "dc" => PlayerCommand::Leave,
        "provider" => PlayerCommand::Provider {
            provider: required("provider")?.parse::<SearchProvider>().map_err(|e| anyhow!(e))?,
        },
        "prefix" => PlayerCommand::Prefix {
            prefix: required("prefix")?.to_string(),
        },
        other => bail!("unknown command `{other}`"),
    };
    Ok(command)
}

/// `None` when `content` is not addressed to the bot at all.
pub fn parse_prefixed(content: &str, prefix: &str) -> Option<Result<PlayerCommand>> {
    let rest = content.trim_start().strip_prefix(prefix)?;
    let mut parts = rest.trim_start().splitn(2, char::is_whitespace);
    let name = parts.next().filter(|n| !n.is_empty())?;
    Some(parse_command(name, parts.next()))
}

fn interaction_argument(cmd: &CommandInteraction) -> Option<String> {
    cmd.data.options.first().and_then(|o| match &o.value {
        CommandDataOptionValue::String(s) => Some(s.clone()),
        CommandDataOptionValue::Integer(i) => Some(i.to_string()),
        _ => None,
    })
}

pub fn render(command: &str, result: &CommandResult) -> CreateEmbed {
    let description = result
        .message
        .clone()
        .unwrap_or_else(|| if result.success { "Done.".to_string() } else { String::new() });
    CreateEmbed::new()
        .title(command)
        .description(description)
        .colour(if result.success { SUCCESS_COLOUR } else { FAILURE_COLOUR })
}

fn invalid(e: anyhow::Error) -> CommandResult {
    CommandResult::fail_with(FailureReason::InvalidArgument, e.to_string())
}

fn outside_guild() -> CommandResult {
    CommandResult::fail_with(
        FailureReason::InvalidArgument,
        "Music commands only work inside a server.",
    )
}

pub async fn handle(
    ctx: &SerenityContext,
    cmd: &CommandInteraction,
    service: &PlaybackCommandService,
    shutdown: &CancellationToken,
) -> Result<()> {
    let name = cmd.data.name.as_str();
    let Some(guild_id) = cmd.guild_id else {
        let reply = CreateInteractionResponseMessage::new()
            .embed(render(name, &outside_guild()))
            .ephemeral(true);
        cmd.create_response(&ctx.http, CreateInteractionResponse::Message(reply))
            .await?;
        return Ok(());
    };

    cmd.create_response(
        &ctx.http,
        CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
    )
    .await
    .ok();

    let result = match parse_command(name, interaction_argument(cmd).as_deref()) {
        Ok(command) => {
            let mut context = CommandContext::new(
                guild_id,
                cmd.user.id,
                user_voice_channel(ctx, guild_id, cmd.user.id),
            )
            .with_text_channel(cmd.channel_id);
            context.cancel = shutdown.child_token();
            service.execute(&context, command).await
        }
        Err(e) => invalid(e),
    };

    cmd.edit_response(
        &ctx.http,
        EditInteractionResponse::new().embeds(vec![render(name, &result)]),
    )
    .await?;
    Ok(())
}

pub async fn handle_message(
    ctx: &SerenityContext,
    msg: &Message,
    service: &PlaybackCommandService,
    shutdown: &CancellationToken,
) -> Result<()> {
    if msg.author.bot {
        return Ok(());
    }
    let Some(guild_id) = msg.guild_id else {
        return Ok(());
    };
    let prefix = match service.settings().prefix(guild_id).await {
        Ok(p) => p,
        Err(e) => {
            error!(guild = %guild_id, "could not read prefix: {e}");
            return Ok(());
        }
    };
    let Some(parsed) = parse_prefixed(&msg.content, &prefix) else {
        return Ok(());
    };
    debug!(guild = %guild_id, content = %msg.content, "prefix command");

    let (title, result) = match parsed {
        Ok(command) => {
            let mut context = CommandContext::new(
                guild_id,
                msg.author.id,
                user_voice_channel(ctx, guild_id, msg.author.id),
            )
            .with_text_channel(msg.channel_id);
            context.cancel = shutdown.child_token();
            (command.name(), service.execute(&context, command).await)
        }
        Err(e) => ("error", invalid(e)),
    };

    msg.channel_id
        .send_message(&ctx.http, CreateMessage::new().embed(render(title, &result)))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps() {
        assert_eq!(parse_timestamp("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_timestamp("1:30"), Some(Duration::from_secs(90)));
        assert_eq!(parse_timestamp("1:02:03"), Some(Duration::from_secs(3723)));
        assert_eq!(parse_timestamp("1:75"), None);
        assert_eq!(parse_timestamp("abc"), None);
        assert_eq!(parse_timestamp("1:2:3:4"), None);
    }

    #[test]
    fn prefixed_messages() {
        assert!(parse_prefixed("hello there", "!").is_none());
        assert!(parse_prefixed("!", "!").is_none());

        let cmd = parse_prefixed("!play never gonna give you up", "!").unwrap().unwrap();
        assert_eq!(
            cmd,
            PlayerCommand::Play {
                query: "never gonna give you up".into()
            }
        );
        assert_eq!(
            parse_prefixed("?? skip 3", "??").unwrap().unwrap(),
            PlayerCommand::Skip { count: 3 }
        );
        assert_eq!(parse_prefixed("!np", "!").unwrap().unwrap(), PlayerCommand::NowPlaying);
        assert!(parse_prefixed("!dance", "!").unwrap().is_err());
    }

    #[test]
    fn arguments_are_validated() {
        assert!(parse_command("play", None).is_err());
        assert!(parse_command("skip", Some("0")).is_err());
        assert_eq!(
            parse_command("volume", Some("80%")).unwrap(),
            PlayerCommand::Volume { percent: 80 }
        );
        assert_eq!(
            parse_command("repeat", Some("all")).unwrap(),
            PlayerCommand::Repeat {
                mode: RepeatMode::Queue
            }
        );
        assert_eq!(
            parse_command("provider", Some("YouTube Music")).unwrap(),
            PlayerCommand::Provider {
                provider: SearchProvider::YouTubeMusic
            }
        );
        assert_eq!(
            parse_command("seek", Some("2:05")).unwrap(),
            PlayerCommand::Seek {
                position: Duration::from_secs(125)
            }
        );
    }

    #[test]
    fn definitions_are_guild_only() {
        for def in definitions() {
            let json = serde_json::to_value(&def).unwrap();
            assert_eq!(json["contexts"], serde_json::json!([0]), "{}", json["name"]);
        }
    }

    #[test]
    fn direct_message_reply_is_a_failure_embed() {
        let result = outside_guild();
        assert!(!result.success);
        let embed = serde_json::to_value(render("play", &result)).unwrap();
        assert_eq!(embed["color"], serde_json::json!(FAILURE_COLOUR));
        assert_eq!(embed["description"], "Music commands only work inside a server.");
    }

    #[test]
    fn every_definition_parses_by_name() {
        for def in definitions() {
            let json = serde_json::to_value(&def).unwrap();
            let name = json["name"].as_str().unwrap().to_string();
            let needs_arg = json["options"]
                .as_array()
                .is_some_and(|opts| opts.iter().any(|o| o["required"] == true));
            let arg = match name.as_str() {
                "repeat" => Some("off"),
                "provider" => Some("youtube"),
                "seek" => Some("0:10"),
                "volume" => Some("50"),
                _ if needs_arg => Some("x"),
                _ => None,
            };
            let cmd = parse_command(&name, arg).unwrap();
            assert_eq!(cmd.name(), name);
        }
    }
}
