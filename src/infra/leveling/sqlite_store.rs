use crate::core::leveling::{DeletionTally, LevelingError, RewardAccount, RewardStore};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;

/// Reward accounts in SQLite.
///
/// Timestamps are stored as Unix milliseconds so cooldown comparisons happen
/// inside the database, in the same statement that grants the award.
pub struct SqliteRewardStore {
    pool: Pool<Sqlite>,
}

impl SqliteRewardStore {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let in_memory = database_url.contains(":memory:");

        // Ensure the file exists if it's a file path
        let path_str = database_url.trim_start_matches("sqlite://");
        if !in_memory && !Path::new(path_str).exists() {
            if let Some(parent) = Path::new(path_str).parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::File::create(path_str)?;
        }

        let conn_str = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite://{}", database_url)
        };

        // Every connection to :memory: gets its own empty database.
        let mut options = SqlitePoolOptions::new();
        if in_memory {
            options = options.max_connections(1);
        }
        let pool = options.connect(&conn_str).await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// The underlying pool, so other stores can share the same database.
    pub fn pool(&self) -> Pool<Sqlite> {
        self.pool.clone()
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reward_accounts (
                user_id INTEGER NOT NULL,
                guild_id INTEGER NOT NULL,
                points INTEGER NOT NULL DEFAULT 0,
                next_eligible_at INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, guild_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_reward_accounts_guild_points
                ON reward_accounts(guild_id, points DESC);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deleted_messages (
                user_id INTEGER NOT NULL,
                guild_id INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, guild_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ensure_account(&self, user_id: u64, guild_id: u64) -> Result<(), LevelingError> {
        sqlx::query(
            r#"
            INSERT INTO reward_accounts (user_id, guild_id, points, next_eligible_at)
            VALUES (?, ?, 0, 0)
            ON CONFLICT(user_id, guild_id) DO NOTHING
            "#,
        )
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }
}

fn storage_error(e: sqlx::Error) -> LevelingError {
    LevelingError::StorageError(e.to_string())
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

fn row_to_account(row: &sqlx::sqlite::SqliteRow) -> RewardAccount {
    RewardAccount {
        user_id: row.get::<i64, _>("user_id") as u64,
        guild_id: row.get::<i64, _>("guild_id") as u64,
        points: row.get::<i64, _>("points") as u64,
        next_eligible_at: from_millis(row.get::<i64, _>("next_eligible_at")),
    }
}

#[async_trait]
impl RewardStore for SqliteRewardStore {
    async fn get_account(
        &self,
        user_id: u64,
        guild_id: u64,
    ) -> Result<Option<RewardAccount>, LevelingError> {
        let row = sqlx::query(
            "SELECT user_id, guild_id, points, next_eligible_at FROM reward_accounts WHERE user_id = ? AND guild_id = ?",
        )
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(row.as_ref().map(row_to_account))
    }

    async fn claim_award(
        &self,
        user_id: u64,
        guild_id: u64,
        amount: u64,
        now: DateTime<Utc>,
        next_eligible_at: DateTime<Utc>,
    ) -> Result<Option<u64>, LevelingError> {
        self.ensure_account(user_id, guild_id).await?;

        // The eligibility check and the increment are one statement, so two
        // racing messages cannot both be paid.
        let row = sqlx::query(
            r#"
            UPDATE reward_accounts
            SET points = points + ?, next_eligible_at = ?
            WHERE user_id = ? AND guild_id = ? AND next_eligible_at <= ?
            RETURNING points
            "#,
        )
        .bind(amount as i64)
        .bind(next_eligible_at.timestamp_millis())
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(row.map(|r| r.get::<i64, _>("points") as u64))
    }

    async fn add_points(
        &self,
        user_id: u64,
        guild_id: u64,
        amount: u64,
    ) -> Result<u64, LevelingError> {
        let row = sqlx::query(
            r#"
            INSERT INTO reward_accounts (user_id, guild_id, points, next_eligible_at)
            VALUES (?, ?, ?, 0)
            ON CONFLICT(user_id, guild_id) DO UPDATE SET
                points = points + excluded.points
            RETURNING points
            "#,
        )
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .bind(amount as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(row.get::<i64, _>("points") as u64)
    }

    async fn set_points(
        &self,
        user_id: u64,
        guild_id: u64,
        points: u64,
    ) -> Result<(), LevelingError> {
        sqlx::query(
            r#"
            INSERT INTO reward_accounts (user_id, guild_id, points, next_eligible_at)
            VALUES (?, ?, ?, 0)
            ON CONFLICT(user_id, guild_id) DO UPDATE SET
                points = excluded.points
            "#,
        )
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .bind(points as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    async fn deduct_points(
        &self,
        user_id: u64,
        guild_id: u64,
        amount: u64,
    ) -> Result<Option<u64>, LevelingError> {
        self.ensure_account(user_id, guild_id).await?;

        let row = sqlx::query(
            r#"
            UPDATE reward_accounts
            SET points = points - ?
            WHERE user_id = ? AND guild_id = ? AND points >= ?
            RETURNING points
            "#,
        )
        .bind(amount as i64)
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .bind(amount as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(row.map(|r| r.get::<i64, _>("points") as u64))
    }

    async fn count_ahead(&self, guild_id: u64, points: u64) -> Result<u64, LevelingError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS ahead FROM reward_accounts WHERE guild_id = ? AND points > ?",
        )
        .bind(guild_id as i64)
        .bind(points as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(row.get::<i64, _>("ahead") as u64)
    }

    async fn get_leaderboard(
        &self,
        guild_id: u64,
        limit: usize,
    ) -> Result<Vec<RewardAccount>, LevelingError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, guild_id, points, next_eligible_at
            FROM reward_accounts
            WHERE guild_id = ? AND points > 0
            ORDER BY points DESC, user_id ASC
            LIMIT ?
            "#,
        )
        .bind(guild_id as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows.iter().map(row_to_account).collect())
    }

    async fn record_deleted_message(
        &self,
        user_id: u64,
        guild_id: u64,
    ) -> Result<u64, LevelingError> {
        let row = sqlx::query(
            r#"
            INSERT INTO deleted_messages (user_id, guild_id, deleted)
            VALUES (?, ?, 1)
            ON CONFLICT(user_id, guild_id) DO UPDATE SET
                deleted = deleted + 1
            RETURNING deleted
            "#,
        )
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(row.get::<i64, _>("deleted") as u64)
    }

    async fn get_deletion_board(
        &self,
        guild_id: u64,
        limit: usize,
    ) -> Result<Vec<DeletionTally>, LevelingError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, deleted
            FROM deleted_messages
            WHERE guild_id = ? AND deleted > 0
            ORDER BY deleted DESC, user_id ASC
            LIMIT ?
            "#,
        )
        .bind(guild_id as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows
            .iter()
            .map(|row| DeletionTally {
                user_id: row.get::<i64, _>("user_id") as u64,
                deleted: row.get::<i64, _>("deleted") as u64,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn memory_store() -> SqliteRewardStore {
        SqliteRewardStore::new("sqlite::memory:").await.unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn claim_respects_the_stored_cooldown() {
        let store = memory_store().await;

        let total = store
            .claim_award(1, 2, 5, at(1000), at(1060))
            .await
            .unwrap();
        assert_eq!(total, Some(5));

        // Still cooling down: nothing changes.
        let total = store
            .claim_award(1, 2, 5, at(1030), at(1090))
            .await
            .unwrap();
        assert_eq!(total, None);

        let account = store.get_account(1, 2).await.unwrap().unwrap();
        assert_eq!(account.points, 5);
        assert_eq!(account.next_eligible_at, at(1060));

        // Exactly at the boundary the account is eligible again.
        let total = store
            .claim_award(1, 2, 3, at(1060), at(1120))
            .await
            .unwrap();
        assert_eq!(total, Some(8));
    }

    #[tokio::test]
    async fn add_points_leaves_the_cooldown_alone() {
        let store = memory_store().await;
        store
            .claim_award(1, 2, 5, at(1000), at(1060))
            .await
            .unwrap();

        assert_eq!(store.add_points(1, 2, 10).await.unwrap(), 15);
        let account = store.get_account(1, 2).await.unwrap().unwrap();
        assert_eq!(account.next_eligible_at, at(1060));

        // Creates accounts too.
        assert_eq!(store.add_points(3, 2, 4).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn deduction_is_refused_below_zero() {
        let store = memory_store().await;
        store.set_points(1, 2, 10).await.unwrap();

        assert_eq!(store.deduct_points(1, 2, 10).await.unwrap(), Some(0));
        assert_eq!(store.deduct_points(1, 2, 1).await.unwrap(), None);
        assert_eq!(store.get_account(1, 2).await.unwrap().unwrap().points, 0);
    }

    #[tokio::test]
    async fn leaderboard_and_rank_counts() {
        let store = memory_store().await;
        store.set_points(10, 1, 300).await.unwrap();
        store.set_points(11, 1, 500).await.unwrap();
        store.set_points(12, 1, 300).await.unwrap();
        store.set_points(13, 1, 0).await.unwrap();
        store.set_points(14, 2, 999).await.unwrap();

        let board = store.get_leaderboard(1, 10).await.unwrap();
        let order: Vec<u64> = board.iter().map(|a| a.user_id).collect();
        assert_eq!(order, vec![11, 10, 12]);

        assert_eq!(store.get_leaderboard(1, 1).await.unwrap().len(), 1);
        assert_eq!(store.count_ahead(1, 300).await.unwrap(), 1);
        assert_eq!(store.count_ahead(1, 500).await.unwrap(), 0);
        assert_eq!(store.count_ahead(1, 0).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn deleted_messages_count_up_per_guild() {
        let store = memory_store().await;
        assert_eq!(store.record_deleted_message(10, 1).await.unwrap(), 1);
        assert_eq!(store.record_deleted_message(10, 1).await.unwrap(), 2);
        assert_eq!(store.record_deleted_message(11, 1).await.unwrap(), 1);
        assert_eq!(store.record_deleted_message(10, 2).await.unwrap(), 1);

        let board = store.get_deletion_board(1, 10).await.unwrap();
        assert_eq!(
            board,
            vec![
                DeletionTally { user_id: 10, deleted: 2 },
                DeletionTally { user_id: 11, deleted: 1 },
            ]
        );
        assert_eq!(store.get_deletion_board(1, 1).await.unwrap().len(), 1);
        assert!(store.get_deletion_board(3, 10).await.unwrap().is_empty());

        // Deletions never touch points.
        assert_eq!(store.get_account(10, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn accounts_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join("aika.db");
        let url = path.to_string_lossy().to_string();

        {
            let store = SqliteRewardStore::new(&url).await.unwrap();
            store
                .claim_award(5, 7, 6, at(2000), at(2060))
                .await
                .unwrap();
            store.pool.close().await;
        }

        let reopened = SqliteRewardStore::new(&url).await.unwrap();
        let account = reopened.get_account(5, 7).await.unwrap().unwrap();
        assert_eq!(account.points, 6);
        assert_eq!(account.next_eligible_at, at(2060));
    }
}
