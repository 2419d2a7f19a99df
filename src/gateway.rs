//! Voice-state lookups against serenity's cache.

use serenity::all::{ChannelId, Context as SerenityContext, GuildId, UserId};

/// The voice channel `user` is currently connected to in `guild`, if any.
pub fn user_voice_channel(
    ctx: &SerenityContext,
    guild: GuildId,
    user: UserId,
) -> Option<ChannelId> {
    let guild = ctx.cache.guild(guild)?;
    guild.voice_states.get(&user).and_then(|vs| vs.channel_id)
}

/// Where the bot itself sits in `guild`, according to the gateway.
pub fn bot_voice_channel(ctx: &SerenityContext, guild: GuildId) -> Option<ChannelId> {
    let me = ctx.cache.current_user().id;
    user_voice_channel(ctx, guild, me)
}
