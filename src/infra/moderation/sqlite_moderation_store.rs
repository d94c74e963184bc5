// SQLite-backed moderation store.
//
// Tables:
// - moderation_config: Per-guild moderation settings
// - strike_records: One row per strike
// - mute_states: One row per muted member, deleted when the mute is lifted
//
// Timestamps are Unix milliseconds.

use crate::core::moderation::{
    ModerationConfig, ModerationError, ModerationStore, MuteState, StrikeRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Pool, Row, Sqlite};

pub struct SqliteModerationStore {
    pool: Pool<Sqlite>,
}

impl SqliteModerationStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Run database migrations to create required tables.
    pub async fn migrate(&self) -> Result<(), ModerationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS moderation_config (
                guild_id INTEGER PRIMARY KEY,
                enabled BOOLEAN NOT NULL DEFAULT 0,
                max_strikes INTEGER NOT NULL,
                restriction_role_id INTEGER
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strike_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                guild_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                reason TEXT NOT NULL,
                issued_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_strike_records_guild_user
                ON strike_records(guild_id, user_id, issued_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mute_states (
                guild_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                muted_until INTEGER NOT NULL,
                PRIMARY KEY (guild_id, user_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }
}

fn storage_error(e: sqlx::Error) -> ModerationError {
    ModerationError::StorageError(e.to_string())
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

fn row_to_mute(row: &sqlx::sqlite::SqliteRow) -> MuteState {
    MuteState {
        guild_id: row.get::<i64, _>("guild_id") as u64,
        user_id: row.get::<i64, _>("user_id") as u64,
        muted_until: from_millis(row.get("muted_until")),
    }
}

#[async_trait]
impl ModerationStore for SqliteModerationStore {
    async fn get_config(&self, guild_id: u64) -> Result<Option<ModerationConfig>, ModerationError> {
        let row = sqlx::query(
            "SELECT enabled, max_strikes, restriction_role_id FROM moderation_config WHERE guild_id = ?",
        )
        .bind(guild_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(row.map(|row| ModerationConfig {
            enabled: row.get("enabled"),
            max_strikes: row.get::<i64, _>("max_strikes") as u32,
            restriction_role_id: row
                .get::<Option<i64>, _>("restriction_role_id")
                .map(|id| id as u64),
        }))
    }

    async fn save_config(
        &self,
        guild_id: u64,
        config: &ModerationConfig,
    ) -> Result<(), ModerationError> {
        sqlx::query(
            r#"
            INSERT INTO moderation_config (guild_id, enabled, max_strikes, restriction_role_id)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(guild_id) DO UPDATE SET
                enabled = excluded.enabled,
                max_strikes = excluded.max_strikes,
                restriction_role_id = excluded.restriction_role_id
            "#,
        )
        .bind(guild_id as i64)
        .bind(config.enabled)
        .bind(config.max_strikes as i64)
        .bind(config.restriction_role_id.map(|id| id as i64))
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn insert_strike(
        &self,
        guild_id: u64,
        user_id: u64,
        reason: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<i64, ModerationError> {
        let result = sqlx::query(
            r#"
            INSERT INTO strike_records (guild_id, user_id, reason, issued_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(guild_id as i64)
        .bind(user_id as i64)
        .bind(reason)
        .bind(issued_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(result.last_insert_rowid())
    }

    async fn count_strikes(&self, guild_id: u64, user_id: u64) -> Result<u32, ModerationError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS strikes FROM strike_records WHERE guild_id = ? AND user_id = ?",
        )
        .bind(guild_id as i64)
        .bind(user_id as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(row.get::<i64, _>("strikes") as u32)
    }

    async fn list_strikes(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Vec<StrikeRecord>, ModerationError> {
        let rows = sqlx::query(
            r#"
            SELECT id, guild_id, user_id, reason, issued_at
            FROM strike_records
            WHERE guild_id = ? AND user_id = ?
            ORDER BY issued_at ASC, id ASC
            "#,
        )
        .bind(guild_id as i64)
        .bind(user_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows
            .iter()
            .map(|row| StrikeRecord {
                id: row.get("id"),
                guild_id: row.get::<i64, _>("guild_id") as u64,
                user_id: row.get::<i64, _>("user_id") as u64,
                reason: row.get("reason"),
                issued_at: from_millis(row.get("issued_at")),
            })
            .collect())
    }

    async fn delete_strike(&self, guild_id: u64, strike_id: i64) -> Result<bool, ModerationError> {
        let result = sqlx::query("DELETE FROM strike_records WHERE id = ? AND guild_id = ?")
            .bind(strike_id)
            .bind(guild_id as i64)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_mute(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<MuteState>, ModerationError> {
        let row = sqlx::query(
            "SELECT guild_id, user_id, muted_until FROM mute_states WHERE guild_id = ? AND user_id = ?",
        )
        .bind(guild_id as i64)
        .bind(user_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(row.as_ref().map(row_to_mute))
    }

    async fn set_muted_until(
        &self,
        guild_id: u64,
        user_id: u64,
        muted_until: DateTime<Utc>,
    ) -> Result<(), ModerationError> {
        sqlx::query(
            r#"
            INSERT INTO mute_states (guild_id, user_id, muted_until)
            VALUES (?, ?, ?)
            ON CONFLICT(guild_id, user_id) DO UPDATE SET
                muted_until = excluded.muted_until
            "#,
        )
        .bind(guild_id as i64)
        .bind(user_id as i64)
        .bind(muted_until.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn release_mute(
        &self,
        guild_id: u64,
        user_id: u64,
        due_by: Option<DateTime<Utc>>,
    ) -> Result<bool, ModerationError> {
        let result = match due_by {
            Some(due_by) => {
                sqlx::query(
                    "DELETE FROM mute_states WHERE guild_id = ? AND user_id = ? AND muted_until <= ?",
                )
                .bind(guild_id as i64)
                .bind(user_id as i64)
                .bind(due_by.timestamp_millis())
                .execute(&self.pool)
                .await
            }
            None => {
                sqlx::query("DELETE FROM mute_states WHERE guild_id = ? AND user_id = ?")
                    .bind(guild_id as i64)
                    .bind(user_id as i64)
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(storage_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn active_mutes(&self) -> Result<Vec<MuteState>, ModerationError> {
        let rows = sqlx::query(
            "SELECT guild_id, user_id, muted_until FROM mute_states ORDER BY muted_until ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows.iter().map(row_to_mute).collect())
    }
}
