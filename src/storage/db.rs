use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::storage::RepositoryError;

/// Shared handle over the SQLite pool. All repository operations hang off
/// this type; cloning is cheap (the pool is internally reference-counted).
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database at `path` and run migrations.
    ///
    /// Any number of processes may open the same path; writers queue on the
    /// busy timeout and the job state machine serializes itself through its
    /// CAS predicates.
    pub async fn open(path: &str) -> Result<Self, RepositoryError> {
        // busy_timeout=5000: wait up to 5s for a competing writer before
        // surfacing SQLITE_BUSY. The scheduler, worker and api processes all
        // write to the same file; transient lock contention is expected.
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");

        let pool = SqlitePoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the schema. All statements are idempotent (`IF NOT EXISTS`)
    /// and run inside one transaction, so a partially applied migration is
    /// rolled back as a unit.
    async fn migrate(&self) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed (
                id INTEGER PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                title TEXT,
                published_at INTEGER,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_post (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feed(id),
                title TEXT NOT NULL,
                summary TEXT,
                url TEXT NOT NULL,
                guid TEXT NOT NULL,
                published_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(feed_id, guid)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feed_post_feed ON feed_post(feed_id)")
            .execute(&mut *tx)
            .await?;

        // state is stored with the contract encoding pending=1, in_progress=2,
        // complete=3, failed=4.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_refresh_job (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL UNIQUE REFERENCES feed(id),
                state INTEGER NOT NULL,
                state_changed_at INTEGER NOT NULL,
                execute_after INTEGER NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Serves both selection queries: the scheduler filters on
        // (state, state_changed_at) and the worker orders by state_changed_at
        // within one state.
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_refresh_job_state
             ON feed_refresh_job(state, state_changed_at)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
