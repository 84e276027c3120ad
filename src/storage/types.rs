use std::fmt;

use crate::storage::RepositoryError;

// ============================================================================
// Job State
// ============================================================================

/// Lifecycle state of a feed refresh job.
///
/// The integer encoding (pending=1 .. failed=4) is part of the persisted
/// contract; external schedulers and scripts match on the raw values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending = 1,
    InProgress = 2,
    Complete = 3,
    Failed = 4,
}

impl JobState {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(JobState::Pending),
            2 => Some(JobState::InProgress),
            3 => Some(JobState::Complete),
            4 => Some(JobState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::InProgress => "in_progress",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Feed
// ============================================================================

/// Feed row. `published_at` is the watermark: the publication time of the
/// newest post observed on the last successful refresh.
#[derive(Debug, Clone)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub published_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewFeed {
    pub url: String,
}

/// Partial feed update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct FeedUpdates {
    pub title: Option<String>,
    pub published_at: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct FeedFilter {
    pub ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Copy)]
pub enum FeedOrdering {
    IdAsc,
    PublishedAtDesc,
}

// ============================================================================
// Feed Post
// ============================================================================

/// A single ingested post. Immutable once written; the `(feed_id, guid)`
/// pair is the natural key that makes ingestion idempotent.
#[derive(Debug, Clone)]
pub struct FeedPost {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub summary: Option<String>,
    pub url: String,
    pub guid: String,
    pub published_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewFeedPost {
    pub feed_id: i64,
    pub title: String,
    pub summary: Option<String>,
    pub url: String,
    pub guid: String,
    pub published_at: i64,
}

// ============================================================================
// Refresh Job
// ============================================================================

/// The per-feed control record that drives the refresh pipeline.
#[derive(Debug, Clone)]
pub struct RefreshJob {
    pub id: i64,
    pub feed_id: i64,
    pub state: JobState,
    /// Wall-clock time of the last state change, maintained by the repository.
    pub state_changed_at: i64,
    /// Earliest time the job may be claimed while `pending`.
    pub execute_after: i64,
    /// Consecutive failures since the last successful completion.
    pub retries: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewRefreshJob {
    pub feed_id: i64,
    pub execute_after: i64,
}

impl NewRefreshJob {
    /// A job for `feed_id` runnable immediately. New jobs always start out
    /// `pending` with zero retries.
    pub fn for_feed(feed_id: i64) -> Self {
        Self {
            feed_id,
            execute_after: chrono::Utc::now().timestamp(),
        }
    }
}

/// Partial job update. Never touches `state`; state changes go through the
/// CAS transitions only.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobUpdates {
    pub execute_after: Option<i64>,
    pub retries: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    /// Matches rows with `state_changed_at` strictly before the given time.
    pub state_changed_before: Option<i64>,
    /// Matches rows with `execute_after` at or before the given time.
    pub execute_before: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub enum JobOrdering {
    IdAsc,
    ExecuteAfterAsc,
    StateChangedAtAsc,
}

// ============================================================================
// Row Types (sqlx FromRow)
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedRow {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub published_at: Option<i64>,
    pub created_at: i64,
}

impl FeedRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            id: self.id,
            url: self.url,
            title: self.title,
            published_at: self.published_at,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PostRow {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub summary: Option<String>,
    pub url: String,
    pub guid: String,
    pub published_at: i64,
    pub created_at: i64,
}

impl PostRow {
    pub(crate) fn into_post(self) -> FeedPost {
        FeedPost {
            id: self.id,
            feed_id: self.feed_id,
            title: self.title,
            summary: self.summary,
            url: self.url,
            guid: self.guid,
            published_at: self.published_at,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub feed_id: i64,
    pub state: i64,
    pub state_changed_at: i64,
    pub execute_after: i64,
    pub retries: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JobRow {
    /// Decode the persisted state integer; a value outside 1..=4 means the
    /// row was corrupted by something outside this codebase.
    pub(crate) fn into_job(self) -> Result<RefreshJob, RepositoryError> {
        let state = JobState::from_i64(self.state).ok_or_else(|| {
            RepositoryError::Integrity(format!(
                "job {} has unknown state value {}",
                self.id, self.state
            ))
        })?;

        Ok(RefreshJob {
            id: self.id,
            feed_id: self.feed_id,
            state,
            state_changed_at: self.state_changed_at,
            execute_after: self.execute_after,
            retries: self.retries,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
