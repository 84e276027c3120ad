mod db;
mod feeds;
mod jobs;
mod posts;
#[cfg(test)]
pub(crate) mod testutil;
mod types;

pub use db::Database;
pub use types::{
    Feed, FeedFilter, FeedOrdering, FeedPost, FeedUpdates, JobFilter, JobOrdering, JobState,
    JobUpdates, NewFeed, NewFeedPost, NewRefreshJob, RefreshJob,
};

use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by the repository layer.
///
/// The first five variants are the contract the pipeline is written against;
/// callers match on them to decide between benign races and real faults.
/// No operation retries internally.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The target row does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// An insert referenced a feed that does not exist.
    #[error("referenced feed does not exist")]
    NoFeed,

    /// A unique constraint rejected an explicit create.
    #[error("row already exists")]
    AlreadyExists,

    /// A compare-and-swap state update matched zero rows. Normal under
    /// concurrency: another worker advanced the state first.
    #[error("failed to transit job {job_id} from {old} to {new}")]
    StateTransition {
        job_id: i64,
        old: JobState,
        new: JobState,
    },

    /// Persisted data violates an invariant the schema cannot express.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Any other database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl RepositoryError {
    /// Classify a sqlx error raised by an INSERT into the taxonomy above.
    pub(crate) fn from_insert(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.kind() {
                sqlx::error::ErrorKind::UniqueViolation => return RepositoryError::AlreadyExists,
                sqlx::error::ErrorKind::ForeignKeyViolation => return RepositoryError::NoFeed,
                _ => {}
            }
        }
        RepositoryError::Database(err)
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        RepositoryError::NotFound(what.into())
    }
}
