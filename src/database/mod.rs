pub mod models;
pub mod schema;

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

const CREATE_GUILD_SETTINGS: &str = "CREATE TABLE IF NOT EXISTS guild_settings (
    guild_id TEXT PRIMARY KEY NOT NULL,
    prefix TEXT NOT NULL DEFAULT '!' CHECK (length(prefix) <= 10),
    volume REAL NOT NULL DEFAULT 50.0,
    search_provider INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
)";

/// Open the settings database and make sure the table exists.
pub fn establish_connection(
    database_url: &str,
) -> Result<SqliteConnection, crate::error::SettingsError> {
    let mut conn = SqliteConnection::establish(database_url)?;
    diesel::sql_query(CREATE_GUILD_SETTINGS).execute(&mut conn)?;
    Ok(conn)
}
