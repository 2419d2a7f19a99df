use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::database::schema::guild_settings;

#[derive(Queryable, Selectable, Serialize, Deserialize, Debug, Clone)]
#[diesel(table_name = guild_settings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct GuildSettingsRow {
    pub guild_id: String,
    pub prefix: String,
    pub volume: f32,
    pub search_provider: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = guild_settings)]
pub struct NewGuildSettingsRow<'a> {
    pub guild_id: &'a str,
    pub prefix: &'a str,
    pub volume: f32,
    pub search_provider: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl GuildSettingsRow {
    pub fn find_by_guild_id(
        conn: &mut SqliteConnection,
        guild_id: &str,
    ) -> QueryResult<Option<GuildSettingsRow>> {
        guild_settings::table
            .filter(guild_settings::guild_id.eq(guild_id))
            .select(GuildSettingsRow::as_select())
            .first::<GuildSettingsRow>(conn)
            .optional()
    }

    /// Insert the defaults unless a row already exists, then read the row back.
    pub fn get_or_create(
        conn: &mut SqliteConnection,
        defaults: &NewGuildSettingsRow<'_>,
    ) -> QueryResult<GuildSettingsRow> {
        diesel::insert_or_ignore_into(guild_settings::table)
            .values(defaults)
            .execute(conn)?;

        Self::find_by_guild_id(conn, defaults.guild_id)?.ok_or(diesel::result::Error::NotFound)
    }

    pub fn update_volume(
        conn: &mut SqliteConnection,
        guild_id: &str,
        volume: f32,
    ) -> QueryResult<usize> {
        diesel::update(guild_settings::table)
            .filter(guild_settings::guild_id.eq(guild_id))
            .set((
                guild_settings::volume.eq(volume),
                guild_settings::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
    }

    pub fn update_search_provider(
        conn: &mut SqliteConnection,
        guild_id: &str,
        provider: i32,
    ) -> QueryResult<usize> {
        diesel::update(guild_settings::table)
            .filter(guild_settings::guild_id.eq(guild_id))
            .set((
                guild_settings::search_provider.eq(provider),
                guild_settings::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
    }

    pub fn update_prefix(
        conn: &mut SqliteConnection,
        guild_id: &str,
        prefix: &str,
    ) -> QueryResult<usize> {
        diesel::update(guild_settings::table)
            .filter(guild_settings::guild_id.eq(guild_id))
            .set((
                guild_settings::prefix.eq(prefix),
                guild_settings::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
    }

    pub fn count(conn: &mut SqliteConnection) -> QueryResult<i64> {
        guild_settings::table.count().get_result(conn)
    }
}
