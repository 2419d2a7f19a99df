use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chorus::announce::ChannelAnnouncer;
use chorus::backends::{LavalinkSearch, YtDlpSearch};
use chorus::config::{Config, MixMode};
use chorus::gateway::bot_voice_channel;
use chorus::lyrics::LrclibProvider;
use chorus::manager::{ManagerOptions, SessionManager};
use chorus::metrics::METRICS;
use chorus::notify::{ExternalSink, ExternalSinkOptions, NotificationHub};
use chorus::search::{SearchBackend, SearchOrchestrator};
use chorus::service::PlaybackCommandService;
use chorus::session::SessionLimits;
use chorus::settings::{
    MemorySettingsRepository, SettingsDefaults, SettingsRepository, SettingsStore,
    SqliteSettingsRepository,
};
use chorus::voice::SongbirdNode;
use chorus::webhook::WebhookPushChannel;
use chorus::{commands, web, ytdlp};
use serenity::{
    all::{
        Command as AppCommand, Context as SerenityContext, GatewayIntents, Interaction, Message,
        Permissions, Ready, VoiceState,
    },
    async_trait,
};
use songbird::{Config as VoiceConfig, Songbird, driver, serenity::SerenityInit};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const REAP_EVERY: Duration = Duration::from_secs(30);

struct Handler {
    service: Arc<PlaybackCommandService>,
    shutdown: CancellationToken,
}

#[async_trait]
impl serenity::prelude::EventHandler for Handler {
    async fn ready(&self, ctx: SerenityContext, ready: Ready) {
        info!("Logged in as {}", ready.user.name);

        for def in commands::definitions() {
            if let Err(e) = AppCommand::create_global_command(&ctx.http, def).await {
                error!("failed to register global command: {e:?}");
            }
        }
        METRICS.set_ready(true);
    }

    async fn interaction_create(&self, ctx: SerenityContext, interaction: Interaction) {
        if let Interaction::Command(cmd) = interaction
            && let Err(why) = commands::handle(&ctx, &cmd, &self.service, &self.shutdown).await
        {
            error!("/{} failed: {why:?}", cmd.data.name);
        }
    }

    async fn message(&self, ctx: SerenityContext, msg: Message) {
        if let Err(why) =
            commands::handle_message(&ctx, &msg, &self.service, &self.shutdown).await
        {
            error!("prefix command failed: {why:?}");
        }
    }

    async fn voice_state_update(
        &self,
        ctx: SerenityContext,
        _old: Option<VoiceState>,
        new: VoiceState,
    ) {
        let Some(guild_id) = new.guild_id else {
            return;
        };
        if new.user_id != ctx.cache.current_user().id {
            return;
        }
        let Some(session) = self.service.manager().get(guild_id) else {
            return;
        };
        let reason = match bot_voice_channel(&ctx, guild_id) {
            None => "voice disconnected",
            Some(channel) if channel != session.voice_channel_id() => "moved to another channel",
            Some(_) => return,
        };
        self.service.manager().destroy(guild_id, reason).await;
    }
}

fn settings_store(config: &Config) -> Result<SettingsStore> {
    let repo: Arc<dyn SettingsRepository> = if config.database_url == ":memory:" {
        Arc::new(MemorySettingsRepository::new())
    } else {
        Arc::new(SqliteSettingsRepository::open(&config.database_url)?)
    };
    let defaults = SettingsDefaults {
        prefix: config.default_prefix.clone(),
        volume: f32::from(config.default_volume),
        search_provider: config.default_provider,
    };
    Ok(SettingsStore::new(repo, defaults))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let shutdown = CancellationToken::new();
    let http = reqwest::Client::builder()
        .user_agent(concat!("chorus/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let settings = settings_store(&config)?;
    let external = config.push_url.as_ref().map(|url| {
        info!("external notifications go to {url}");
        ExternalSink::start(
            Arc::new(WebhookPushChannel::new(http.clone(), url.clone())),
            ExternalSinkOptions {
                timeout: config.push_timeout,
                ..ExternalSinkOptions::default()
            },
            shutdown.clone(),
        )
    });
    let hub = NotificationHub::new(external);

    // Stereo unless asked otherwise; softclip off since gain is set per track.
    let voice_cfg = {
        let mix = match config.mix_mode {
            MixMode::Mono => driver::MixMode::Mono,
            MixMode::Stereo => driver::MixMode::Stereo,
        };
        VoiceConfig::default()
            .preallocated_tracks(2)
            .use_softclip(false)
            .mix_mode(mix)
    };
    let songbird = Songbird::serenity_from_config(voice_cfg);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let node = Arc::new(SongbirdNode::new(songbird.clone(), events_tx, Some(config.bitrate)));
    let manager = Arc::new(SessionManager::new(
        node,
        settings.clone(),
        hub.clone(),
        ManagerOptions {
            default_volume: config.default_volume,
            limits: SessionLimits {
                max_queue: config.max_queue,
                node_timeout: config.node_timeout,
            },
            idle_timeout: config.idle_disconnect,
        },
    ));

    let backend: Arc<dyn SearchBackend> = match &config.lavalink {
        Some(node) => {
            info!("searching through lavalink at {}", node.url);
            Arc::new(LavalinkSearch::new(
                http.clone(),
                &node.url,
                &node.password,
                config.search_timeout,
            ))
        }
        None => {
            if let Ok(dir) = ytdlp::download_dir() {
                info!("Download cache dir: {}", dir.display());
            }
            Arc::new(YtDlpSearch::default())
        }
    };
    let service = Arc::new(
        PlaybackCommandService::new(
            manager.clone(),
            SearchOrchestrator::new(backend, config.search_timeout),
            settings,
            hub.clone(),
        )
        .with_lyrics(Arc::new(LrclibProvider::new(http.clone(), config.search_timeout))),
    );

    service.clone().spawn_node_event_pump(events_rx, shutdown.clone());
    manager.clone().spawn_idle_reaper(REAP_EVERY, shutdown.clone());

    let bind = config.http_bind.clone();
    std::thread::spawn(move || {
        if let Err(e) = actix_web::rt::System::new().block_on(web::run_http(bind)) {
            error!("probe server stopped: {e}");
        }
    });

    let intents = GatewayIntents::non_privileged()
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::MESSAGE_CONTENT;
    let mut client = serenity::Client::builder(&config.discord_token, intents)
        .event_handler(Handler {
            service,
            shutdown: shutdown.clone(),
        })
        .register_songbird_with(songbird)
        .await?;

    hub.subscribe_local(ChannelAnnouncer::new(client.http.clone(), &manager));

    let app = client.http.get_current_application_info().await?;
    let perms = Permissions::CONNECT | Permissions::SPEAK | Permissions::SEND_MESSAGES;
    info!(
        "Invite this bot: https://discord.com/api/oauth2/authorize?client_id={}&permissions={}&scope=bot%20applications.commands",
        app.id,
        perms.bits()
    );

    let shard_manager = client.shard_manager.clone();
    let teardown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("could not listen for ctrl-c: {e}");
            return;
        }
        info!("shutting down");
        METRICS.set_ready(false);
        teardown.cancel();
        manager.destroy_all("shutdown").await;
        shard_manager.shutdown_all().await;
    });

    if let Err(why) = client.start_autosharded().await {
        error!("Client error: {why:?}");
    }
    Ok(())
}
