//! Process configuration from the environment (after `dotenvy`).

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::warn;

use crate::search::SearchProvider;
use crate::session::MAX_VOLUME;
use crate::settings::{DEFAULT_PREFIX, DEFAULT_VOLUME, MAX_PREFIX_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixMode {
    Mono,
    Stereo,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub discord_token: String,
    pub database_url: String,
    pub default_volume: u16,
    pub default_prefix: String,
    pub default_provider: SearchProvider,
    pub max_queue: usize,
    pub idle_disconnect: Duration,
    pub node_timeout: Duration,
    pub search_timeout: Duration,
    pub push_timeout: Duration,
    pub push_url: Option<String>,
    pub lavalink: Option<LavalinkConfig>,
    pub http_bind: String,
    pub mix_mode: MixMode,
    pub bitrate: u32,
}

#[derive(Debug, Clone)]
pub struct LavalinkConfig {
    pub url: String,
    pub password: String,
}

pub fn read_discord_token() -> Result<String> {
    const CANDIDATES: &[&str] = &["DISCORD_TOKEN", "DISCORD_BOT_TOKEN", "BOT_TOKEN"];
    for key in CANDIDATES {
        if let Ok(val) = std::env::var(key)
            && !val.is_empty()
        {
            return Ok(val);
        }
    }
    Err(anyhow!(
        "Set one of DISCORD_TOKEN, DISCORD_BOT_TOKEN or BOT_TOKEN in environment"
    ))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(read_discord_token()?, |key| std::env::var(key).ok())
    }

    /// Everything except the token, read through `get`.
    fn from_lookup(discord_token: String, get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| {
            get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let default_prefix = non_empty("CHORUS_DEFAULT_PREFIX")
            .filter(|p| p.chars().count() <= MAX_PREFIX_LEN)
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string());

        let lavalink = non_empty("LAVALINK_URL").map(|url| LavalinkConfig {
            url,
            password: non_empty("LAVALINK_PASSWORD")
                .unwrap_or_else(|| "youshallnotpass".to_string()),
        });

        let mix_mode = match non_empty("CHORUS_MIX_MODE").as_deref() {
            Some("mono") => MixMode::Mono,
            _ => MixMode::Stereo,
        };

        Ok(Self {
            discord_token,
            database_url: non_empty("DATABASE_URL").unwrap_or_else(|| "chorus.db".to_string()),
            default_volume: parse_or(&get, "CHORUS_DEFAULT_VOLUME", DEFAULT_VOLUME as u16)
                .min(MAX_VOLUME),
            default_prefix,
            default_provider: parse_or(&get, "CHORUS_DEFAULT_PROVIDER", SearchProvider::default()),
            max_queue: parse_or(&get, "CHORUS_MAX_QUEUE", 500usize).max(1),
            idle_disconnect: Duration::from_secs(parse_or(
                &get,
                "CHORUS_IDLE_DISCONNECT_SECS",
                300,
            )),
            node_timeout: Duration::from_millis(parse_or(&get, "CHORUS_NODE_TIMEOUT_MS", 10_000)),
            search_timeout: Duration::from_millis(parse_or(
                &get,
                "CHORUS_SEARCH_TIMEOUT_MS",
                15_000,
            )),
            push_timeout: Duration::from_millis(parse_or(&get, "CHORUS_PUSH_TIMEOUT_MS", 5_000)),
            push_url: non_empty("CHORUS_PUSH_URL"),
            lavalink,
            http_bind: non_empty("CHORUS_HTTP_BIND").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            mix_mode,
            bitrate: parse_or(&get, "CHORUS_BITRATE", 96_000u32).clamp(16_000, 192_000),
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) if !raw.trim().is_empty() => match raw.trim().parse() {
            Ok(v) => v,
            Err(e) => {
                warn!("invalid {key}={raw:?} ({e}), using default");
                default
            }
        },
        _ => default,
    }
}
