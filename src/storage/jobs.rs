//! Refresh-job repository: the persisted queue behind the scheduler and
//! worker loops.
//!
//! Every state change is a compare-and-swap: `UPDATE … WHERE id = ? AND
//! state = ?`. A lone UPDATE takes the database write lock in SQLite, so the
//! state observation and the change are a single atomic step; across
//! processes the CAS predicate itself decides who wins. A transition that
//! matched zero rows surfaces as `StateTransition`, which callers treat as
//! either a benign lost race (claiming) or a real fault.

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::storage::types::JobRow;
use crate::storage::{
    Database, FeedUpdates, JobFilter, JobOrdering, JobState, JobUpdates, NewFeedPost,
    NewRefreshJob, RefreshJob, RepositoryError,
};

const JOB_COLUMNS: &str =
    "id, feed_id, state, state_changed_at, execute_after, retries, created_at, updated_at";

impl Database {
    pub async fn get_job(&self, job_id: i64) -> Result<RefreshJob, RepositoryError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM feed_refresh_job WHERE id = ?",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| RepositoryError::not_found(format!("refresh job {}", job_id)))?
            .into_job()
    }

    pub async fn get_job_by_feed(&self, feed_id: i64) -> Result<RefreshJob, RepositoryError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM feed_refresh_job WHERE feed_id = ?",
            JOB_COLUMNS
        ))
        .bind(feed_id)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| RepositoryError::not_found(format!("refresh job for feed {}", feed_id)))?
            .into_job()
    }

    /// Insert a new job in `pending`. A second job for the same feed is
    /// `AlreadyExists`; a dangling `feed_id` is `NoFeed`.
    pub async fn create_job(&self, new: &NewRefreshJob) -> Result<RefreshJob, RepositoryError> {
        let now = chrono::Utc::now().timestamp();
        let row: JobRow = sqlx::query_as(&format!(
            "INSERT INTO feed_refresh_job
                 (feed_id, state, state_changed_at, execute_after, retries, created_at, updated_at)
             VALUES (?, ?, ?, ?, 0, ?, ?)
             RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(new.feed_id)
        .bind(JobState::Pending.as_i64())
        .bind(now)
        .bind(new.execute_after)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(RepositoryError::from_insert)?;

        row.into_job()
    }

    /// Insert the job or return the existing one for the feed. At most one
    /// job per feed ever exists; a lost insert race resolves to the winner's
    /// row.
    pub async fn get_or_create_job(&self, new: &NewRefreshJob) -> Result<RefreshJob, RepositoryError> {
        match self.get_job_by_feed(new.feed_id).await {
            Ok(job) => return Ok(job),
            Err(RepositoryError::NotFound(_)) => {
                tracing::debug!(feed_id = new.feed_id, "no refresh job for feed, creating one");
            }
            Err(err) => return Err(err),
        }

        match self.create_job(new).await {
            Ok(job) => Ok(job),
            Err(RepositoryError::AlreadyExists) => self.get_job_by_feed(new.feed_id).await,
            Err(err) => Err(err),
        }
    }

    /// List jobs matching `filter`, ordered by `order` with id as the
    /// tie-breaker.
    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        order: JobOrdering,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RefreshJob>, RepositoryError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM feed_refresh_job", JOB_COLUMNS));

        let mut prefix = " WHERE ";
        if let Some(state) = filter.state {
            builder.push(prefix).push("state = ").push_bind(state.as_i64());
            prefix = " AND ";
        }
        if let Some(before) = filter.state_changed_before {
            builder
                .push(prefix)
                .push("state_changed_at < ")
                .push_bind(before);
            prefix = " AND ";
        }
        if let Some(before) = filter.execute_before {
            builder
                .push(prefix)
                .push("execute_after <= ")
                .push_bind(before);
        }

        match order {
            JobOrdering::IdAsc => builder.push(" ORDER BY id ASC"),
            JobOrdering::ExecuteAfterAsc => builder.push(" ORDER BY execute_after ASC, id ASC"),
            JobOrdering::StateChangedAtAsc => {
                builder.push(" ORDER BY state_changed_at ASC, id ASC")
            }
        };

        builder.push(" LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let rows: Vec<JobRow> = builder.build_query_as().fetch_all(self.pool()).await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// Apply a partial update to `execute_after`/`retries`. State is out of
    /// reach here; only the CAS transitions touch it.
    pub async fn update_job(
        &self,
        job_id: i64,
        updates: &JobUpdates,
    ) -> Result<RefreshJob, RepositoryError> {
        let mut conn = self.pool().acquire().await?;
        update_job_on(&mut conn, job_id, updates).await
    }

    /// CAS the job from `old` to `new`, stamping `state_changed_at`.
    pub async fn transit_job_state(
        &self,
        job_id: i64,
        old: JobState,
        new: JobState,
    ) -> Result<RefreshJob, RepositoryError> {
        let mut conn = self.pool().acquire().await?;
        transit_on(&mut conn, job_id, old, new).await
    }

    /// Bulk CAS: flip every job in `ids` that is still in `old`. Returns the
    /// rows actually updated; a shorter result than `ids` means other
    /// workers won those rows, and the returned subset is authoritative.
    pub async fn transit_job_state_batch(
        &self,
        ids: &[i64],
        old: JobState,
        new: JobState,
    ) -> Result<Vec<RefreshJob>, RepositoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let now = chrono::Utc::now().timestamp();
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE feed_refresh_job SET state = ");
        builder.push_bind(new.as_i64());
        builder.push(", state_changed_at = ");
        builder.push_bind(now);
        builder.push(", updated_at = ");
        builder.push_bind(now);
        builder.push(" WHERE state = ");
        builder.push_bind(old.as_i64());
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        builder.push(" RETURNING ");
        builder.push(JOB_COLUMNS);

        let rows: Vec<JobRow> = builder.build_query_as().fetch_all(self.pool()).await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    // ========================================================================
    // Composite worker commits
    // ========================================================================

    /// Commit a successful refresh in one transaction: complete the job,
    /// reset its retry counter, and when the fetch produced items, advance
    /// the feed metadata/watermark and ingest the posts. Returns the number
    /// of posts actually inserted.
    pub async fn complete_job(
        &self,
        job_id: i64,
        feed_id: i64,
        feed_updates: Option<FeedUpdates>,
        posts: &[NewFeedPost],
    ) -> Result<usize, RepositoryError> {
        let mut tx = self.pool().begin().await?;

        transit_on(&mut *tx, job_id, JobState::InProgress, JobState::Complete).await?;
        update_job_on(
            &mut *tx,
            job_id,
            &JobUpdates {
                retries: Some(0),
                execute_after: None,
            },
        )
        .await?;

        let mut inserted = 0;
        if let Some(updates) = feed_updates {
            super::feeds::update_feed_on(&mut *tx, feed_id, &updates).await?;
            inserted = super::posts::insert_posts_on(&mut *tx, posts).await?.len();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Put a failed job back in the queue with backoff, in one transaction:
    /// CAS back to `pending`, bump the retry counter, and set the earliest
    /// next attempt.
    pub async fn retry_job(
        &self,
        job: &RefreshJob,
        execute_after: i64,
    ) -> Result<RefreshJob, RepositoryError> {
        let mut tx = self.pool().begin().await?;

        transit_on(&mut *tx, job.id, JobState::InProgress, JobState::Pending).await?;
        let job = update_job_on(
            &mut *tx,
            job.id,
            &JobUpdates {
                retries: Some(job.retries + 1),
                execute_after: Some(execute_after),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    /// Park the job in `failed`; it stays there until an explicit reset.
    pub async fn fail_job(&self, job_id: i64) -> Result<RefreshJob, RepositoryError> {
        self.transit_job_state(job_id, JobState::InProgress, JobState::Failed)
            .await
    }

    /// The user-requested refresh path: requeue a settled (`complete` or
    /// `failed`) job as immediately runnable with a clean retry counter.
    pub async fn reset_job(&self, job: &RefreshJob) -> Result<RefreshJob, RepositoryError> {
        let mut tx = self.pool().begin().await?;

        transit_on(&mut *tx, job.id, job.state, JobState::Pending).await?;
        let job = update_job_on(
            &mut *tx,
            job.id,
            &JobUpdates {
                retries: Some(0),
                execute_after: Some(chrono::Utc::now().timestamp()),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(job)
    }
}

// ============================================================================
// Connection-level operations
// ============================================================================

/// The CAS transition on an explicit connection, for composing into a
/// larger transaction. `old == new` is rejected up front: a no-op
/// "transition" would either skip the `state_changed_at` stamp or stamp it
/// without a state change, and both break the monotonicity contract.
pub(crate) async fn transit_on(
    conn: &mut SqliteConnection,
    job_id: i64,
    old: JobState,
    new: JobState,
) -> Result<RefreshJob, RepositoryError> {
    if old == new {
        return Err(RepositoryError::StateTransition { job_id, old, new });
    }

    let now = chrono::Utc::now().timestamp();
    let row: Option<JobRow> = sqlx::query_as(&format!(
        "UPDATE feed_refresh_job
         SET state = ?, state_changed_at = ?, updated_at = ?
         WHERE id = ? AND state = ?
         RETURNING {}",
        JOB_COLUMNS
    ))
    .bind(new.as_i64())
    .bind(now)
    .bind(now)
    .bind(job_id)
    .bind(old.as_i64())
    .fetch_optional(&mut *conn)
    .await?;

    row.ok_or(RepositoryError::StateTransition { job_id, old, new })?
        .into_job()
}

pub(crate) async fn update_job_on(
    conn: &mut SqliteConnection,
    job_id: i64,
    updates: &JobUpdates,
) -> Result<RefreshJob, RepositoryError> {
    let now = chrono::Utc::now().timestamp();
    let row: Option<JobRow> = sqlx::query_as(&format!(
        "UPDATE feed_refresh_job
         SET execute_after = COALESCE(?, execute_after),
             retries = COALESCE(?, retries),
             updated_at = ?
         WHERE id = ?
         RETURNING {}",
        JOB_COLUMNS
    ))
    .bind(updates.execute_after)
    .bind(updates.retries)
    .bind(now)
    .bind(job_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.ok_or_else(|| RepositoryError::not_found(format!("refresh job {}", job_id)))?
        .into_job()
}
