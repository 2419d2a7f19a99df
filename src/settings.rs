//! Per-guild settings with read-through lazy creation.
//!
//! Every read goes through `get_or_create`, so the first access for a guild
//! inserts a row with the configured defaults. Repositories make that insert
//! idempotent (insert-or-ignore, then read back) so concurrent first reads
//! still end up with exactly one row.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use diesel::sqlite::SqliteConnection;
use serde::Serialize;
use serenity::async_trait;
use serenity::model::id::GuildId;
use tracing::{debug, warn};

use crate::database::{
    establish_connection,
    models::{GuildSettingsRow, NewGuildSettingsRow},
};
use crate::error::SettingsError;
use crate::search::SearchProvider;
use crate::session::MAX_VOLUME;

pub const DEFAULT_PREFIX: &str = "!";
pub const DEFAULT_VOLUME: f32 = 50.0;
pub const MAX_PREFIX_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuildSettings {
    pub guild_id: GuildId,
    pub prefix: String,
    pub volume: f32,
    pub search_provider: SearchProvider,
}

#[derive(Debug, Clone)]
pub struct SettingsDefaults {
    pub prefix: String,
    pub volume: f32,
    pub search_provider: SearchProvider,
}

impl Default for SettingsDefaults {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            volume: DEFAULT_VOLUME,
            search_provider: SearchProvider::default(),
        }
    }
}

impl SettingsDefaults {
    fn for_guild(&self, guild_id: GuildId) -> GuildSettings {
        GuildSettings {
            guild_id,
            prefix: self.prefix.clone(),
            volume: self.volume,
            search_provider: self.search_provider,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettingsChange {
    Volume(f32),
    SearchProvider(SearchProvider),
    Prefix(String),
}

impl SettingsChange {
    fn apply(&self, settings: &mut GuildSettings) {
        match self {
            Self::Volume(v) => settings.volume = *v,
            Self::SearchProvider(p) => settings.search_provider = *p,
            Self::Prefix(p) => settings.prefix = p.clone(),
        }
    }
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn find(&self, guild_id: GuildId) -> Result<Option<GuildSettings>, SettingsError>;

    async fn get_or_create(
        &self,
        guild_id: GuildId,
        defaults: &SettingsDefaults,
    ) -> Result<GuildSettings, SettingsError>;

    /// Create the row if missing, then apply `change`, as one operation.
    async fn update(
        &self,
        guild_id: GuildId,
        defaults: &SettingsDefaults,
        change: SettingsChange,
    ) -> Result<GuildSettings, SettingsError>;
}

/// Process-local repository, used when no database is configured and in tests.
#[derive(Debug, Default)]
pub struct MemorySettingsRepository {
    rows: Mutex<HashMap<GuildId, GuildSettings>>,
    inserts: AtomicUsize,
}

impl MemorySettingsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows ever inserted.
    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::Acquire)
    }

    fn with_rows<T>(
        &self,
        f: impl FnOnce(&mut HashMap<GuildId, GuildSettings>) -> T,
    ) -> Result<T, SettingsError> {
        let mut rows = self.rows.lock().map_err(|_| SettingsError::Poisoned)?;
        Ok(f(&mut rows))
    }

    fn row<'a>(
        &self,
        rows: &'a mut HashMap<GuildId, GuildSettings>,
        guild_id: GuildId,
        defaults: &SettingsDefaults,
    ) -> &'a mut GuildSettings {
        rows.entry(guild_id).or_insert_with(|| {
            self.inserts.fetch_add(1, Ordering::AcqRel);
            defaults.for_guild(guild_id)
        })
    }
}

#[async_trait]
impl SettingsRepository for MemorySettingsRepository {
    async fn find(&self, guild_id: GuildId) -> Result<Option<GuildSettings>, SettingsError> {
        self.with_rows(|rows| rows.get(&guild_id).cloned())
    }

    async fn get_or_create(
        &self,
        guild_id: GuildId,
        defaults: &SettingsDefaults,
    ) -> Result<GuildSettings, SettingsError> {
        self.with_rows(|rows| self.row(rows, guild_id, defaults).clone())
    }

    async fn update(
        &self,
        guild_id: GuildId,
        defaults: &SettingsDefaults,
        change: SettingsChange,
    ) -> Result<GuildSettings, SettingsError> {
        self.with_rows(|rows| {
            let row = self.row(rows, guild_id, defaults);
            change.apply(row);
            row.clone()
        })
    }
}

/// SQLite-backed repository. Diesel is synchronous, so every call runs on the
/// blocking pool against one shared connection.
#[derive(Clone)]
pub struct SqliteSettingsRepository {
    conn: Arc<Mutex<SqliteConnection>>,
}

impl SqliteSettingsRepository {
    pub fn open(database_url: &str) -> Result<Self, SettingsError> {
        let conn = establish_connection(database_url)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, SettingsError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T, SettingsError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| SettingsError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }

    pub async fn row_count(&self) -> Result<i64, SettingsError> {
        self.with_conn(|conn| Ok(GuildSettingsRow::count(conn)?)).await
    }
}

fn row_to_settings(row: GuildSettingsRow, guild_id: GuildId) -> GuildSettings {
    let search_provider = SearchProvider::from_repr(row.search_provider).unwrap_or_else(|| {
        warn!(
            "guild {} has unknown search provider {}, using default",
            row.guild_id, row.search_provider
        );
        SearchProvider::default()
    });
    GuildSettings {
        guild_id,
        prefix: row.prefix,
        volume: row.volume,
        search_provider,
    }
}

fn create_row(
    conn: &mut SqliteConnection,
    guild_id: GuildId,
    defaults: &SettingsDefaults,
) -> Result<GuildSettingsRow, SettingsError> {
    let key = guild_id.to_string();
    let now = chrono::Utc::now().naive_utc();
    let new_row = NewGuildSettingsRow {
        guild_id: &key,
        prefix: &defaults.prefix,
        volume: defaults.volume,
        search_provider: defaults.search_provider.repr(),
        created_at: now,
        updated_at: now,
    };
    Ok(GuildSettingsRow::get_or_create(conn, &new_row)?)
}

#[async_trait]
impl SettingsRepository for SqliteSettingsRepository {
    async fn find(&self, guild_id: GuildId) -> Result<Option<GuildSettings>, SettingsError> {
        self.with_conn(move |conn| {
            let row = GuildSettingsRow::find_by_guild_id(conn, &guild_id.to_string())?;
            Ok(row.map(|r| row_to_settings(r, guild_id)))
        })
        .await
    }

    async fn get_or_create(
        &self,
        guild_id: GuildId,
        defaults: &SettingsDefaults,
    ) -> Result<GuildSettings, SettingsError> {
        let defaults = defaults.clone();
        self.with_conn(move |conn| {
            let row = create_row(conn, guild_id, &defaults)?;
            Ok(row_to_settings(row, guild_id))
        })
        .await
    }

    async fn update(
        &self,
        guild_id: GuildId,
        defaults: &SettingsDefaults,
        change: SettingsChange,
    ) -> Result<GuildSettings, SettingsError> {
        use diesel::Connection;

        let defaults = defaults.clone();
        self.with_conn(move |conn| {
            conn.transaction::<_, SettingsError, _>(|conn| {
                create_row(conn, guild_id, &defaults)?;
                let key = guild_id.to_string();
                match &change {
                    SettingsChange::Volume(v) => {
                        GuildSettingsRow::update_volume(conn, &key, *v)?;
                    }
                    SettingsChange::SearchProvider(p) => {
                        GuildSettingsRow::update_search_provider(conn, &key, p.repr())?;
                    }
                    SettingsChange::Prefix(p) => {
                        GuildSettingsRow::update_prefix(conn, &key, p)?;
                    }
                }
                let row = GuildSettingsRow::find_by_guild_id(conn, &key)?
                    .ok_or(diesel::result::Error::NotFound)?;
                Ok(row_to_settings(row, guild_id))
            })
        })
        .await
    }
}

/// Typed facade over a [`SettingsRepository`].
#[derive(Clone)]
pub struct SettingsStore {
    repo: Arc<dyn SettingsRepository>,
    defaults: Arc<SettingsDefaults>,
}

impl SettingsStore {
    pub fn new(repo: Arc<dyn SettingsRepository>, defaults: SettingsDefaults) -> Self {
        Self {
            repo,
            defaults: Arc::new(defaults),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemorySettingsRepository::new()),
            SettingsDefaults::default(),
        )
    }

    pub fn defaults(&self) -> &SettingsDefaults {
        &self.defaults
    }

    pub async fn get(&self, guild_id: GuildId) -> Result<GuildSettings, SettingsError> {
        self.repo.get_or_create(guild_id, &self.defaults).await
    }

    pub async fn volume(&self, guild_id: GuildId) -> Result<f32, SettingsError> {
        Ok(self.get(guild_id).await?.volume)
    }

    /// Persisted volume without creating a row.
    pub async fn peek_volume(&self, guild_id: GuildId) -> Result<Option<f32>, SettingsError> {
        Ok(self.repo.find(guild_id).await?.map(|s| s.volume))
    }

    pub async fn set_volume(&self, guild_id: GuildId, volume: f32) -> Result<f32, SettingsError> {
        let volume = volume.clamp(0.0, f32::from(MAX_VOLUME));
        let saved = self
            .repo
            .update(guild_id, &self.defaults, SettingsChange::Volume(volume))
            .await?;
        debug!(guild = %guild_id, volume, "volume saved");
        Ok(saved.volume)
    }

    pub async fn search_provider(
        &self,
        guild_id: GuildId,
    ) -> Result<SearchProvider, SettingsError> {
        Ok(self.get(guild_id).await?.search_provider)
    }

    pub async fn set_search_provider(
        &self,
        guild_id: GuildId,
        provider: SearchProvider,
    ) -> Result<SearchProvider, SettingsError> {
        let saved = self
            .repo
            .update(guild_id, &self.defaults, SettingsChange::SearchProvider(provider))
            .await?;
        Ok(saved.search_provider)
    }

    pub async fn prefix(&self, guild_id: GuildId) -> Result<String, SettingsError> {
        Ok(self.get(guild_id).await?.prefix)
    }

    pub async fn set_prefix(
        &self,
        guild_id: GuildId,
        prefix: &str,
    ) -> Result<String, SettingsError> {
        let prefix = prefix.trim();
        let len = prefix.chars().count();
        if len == 0 || len > MAX_PREFIX_LEN {
            return Err(SettingsError::InvalidPrefix {
                max: MAX_PREFIX_LEN,
            });
        }
        let saved = self
            .repo
            .update(guild_id, &self.defaults, SettingsChange::Prefix(prefix.to_string()))
            .await?;
        Ok(saved.prefix)
    }
}
