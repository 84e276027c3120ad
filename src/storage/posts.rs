//! Post repository: bulk ingestion with drop-on-conflict and per-feed
//! listing. Posts are immutable once written; re-ingesting the same items is
//! a no-op thanks to the `(feed_id, guid)` unique key.

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::storage::types::PostRow;
use crate::storage::{Database, FeedPost, NewFeedPost, RepositoryError};

const POST_COLUMNS: &str = "id, feed_id, title, summary, url, guid, published_at, created_at";

// 7 bind parameters per row; 50 rows stays well under SQLite's 999 limit.
const INSERT_BATCH_SIZE: usize = 50;

impl Database {
    /// Bulk-insert posts, silently dropping rows that collide on
    /// `(feed_id, guid)`. Returns only the rows actually inserted.
    pub async fn create_posts(
        &self,
        posts: &[NewFeedPost],
    ) -> Result<Vec<FeedPost>, RepositoryError> {
        let mut tx = self.pool().begin().await?;
        let inserted = insert_posts_on(&mut *tx, posts).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// Posts of one feed, newest first (ties broken by id, newest insert
    /// first).
    pub async fn list_posts(
        &self,
        feed_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FeedPost>, RepositoryError> {
        let rows: Vec<PostRow> = sqlx::query_as(&format!(
            "SELECT {} FROM feed_post
             WHERE feed_id = ?
             ORDER BY published_at DESC, id DESC
             LIMIT ? OFFSET ?",
            POST_COLUMNS
        ))
        .bind(feed_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(PostRow::into_post).collect())
    }
}

/// Insert posts on an explicit connection so the worker can commit them in
/// the same transaction as the job state change.
pub(crate) async fn insert_posts_on(
    conn: &mut SqliteConnection,
    posts: &[NewFeedPost],
) -> Result<Vec<FeedPost>, RepositoryError> {
    if posts.is_empty() {
        return Ok(Vec::new());
    }

    let now = chrono::Utc::now().timestamp();
    let mut inserted = Vec::new();

    for chunk in posts.chunks(INSERT_BATCH_SIZE) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO feed_post (feed_id, title, summary, url, guid, published_at, created_at) ",
        );

        builder.push_values(chunk, |mut b, post| {
            b.push_bind(post.feed_id)
                .push_bind(&post.title)
                .push_bind(&post.summary)
                .push_bind(&post.url)
                .push_bind(&post.guid)
                .push_bind(post.published_at)
                .push_bind(now);
        });

        // RETURNING reports only the rows that survived the conflict clause
        builder.push(" ON CONFLICT(feed_id, guid) DO NOTHING RETURNING ");
        builder.push(POST_COLUMNS);

        let rows: Vec<PostRow> = builder
            .build_query_as()
            .fetch_all(&mut *conn)
            .await
            .map_err(RepositoryError::from_insert)?;
        inserted.extend(rows.into_iter().map(PostRow::into_post));
    }

    Ok(inserted)
}
