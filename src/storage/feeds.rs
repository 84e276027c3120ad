//! Feed repository: lookup, creation on first subscription, and the
//! metadata/watermark update performed by the worker after a successful
//! refresh.

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::storage::types::FeedRow;
use crate::storage::{Database, Feed, FeedFilter, FeedOrdering, FeedUpdates, NewFeed, RepositoryError};

const FEED_COLUMNS: &str = "id, url, title, published_at, created_at";

impl Database {
    pub async fn get_feed(&self, feed_id: i64) -> Result<Feed, RepositoryError> {
        let row: Option<FeedRow> =
            sqlx::query_as(&format!("SELECT {} FROM feed WHERE id = ?", FEED_COLUMNS))
                .bind(feed_id)
                .fetch_optional(self.pool())
                .await?;

        row.map(FeedRow::into_feed)
            .ok_or_else(|| RepositoryError::not_found(format!("feed {}", feed_id)))
    }

    pub async fn get_feed_by_url(&self, url: &str) -> Result<Feed, RepositoryError> {
        let row: Option<FeedRow> =
            sqlx::query_as(&format!("SELECT {} FROM feed WHERE url = ?", FEED_COLUMNS))
                .bind(url)
                .fetch_optional(self.pool())
                .await?;

        row.map(FeedRow::into_feed)
            .ok_or_else(|| RepositoryError::not_found(format!("feed with url {}", url)))
    }

    /// Insert a new feed; a duplicate `url` surfaces as `AlreadyExists`.
    pub async fn create_feed(&self, new: &NewFeed) -> Result<Feed, RepositoryError> {
        let now = chrono::Utc::now().timestamp();
        let row: FeedRow = sqlx::query_as(&format!(
            "INSERT INTO feed (url, created_at) VALUES (?, ?) RETURNING {}",
            FEED_COLUMNS
        ))
        .bind(&new.url)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(RepositoryError::from_insert)?;

        Ok(row.into_feed())
    }

    /// Insert the feed or return the existing row for the same url. Losing
    /// an insert race to a concurrent subscriber resolves to their row.
    pub async fn get_or_create_feed(&self, new: &NewFeed) -> Result<Feed, RepositoryError> {
        match self.get_feed_by_url(&new.url).await {
            Ok(feed) => return Ok(feed),
            Err(RepositoryError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        match self.create_feed(new).await {
            Ok(feed) => Ok(feed),
            Err(RepositoryError::AlreadyExists) => self.get_feed_by_url(&new.url).await,
            Err(err) => Err(err),
        }
    }

    pub async fn list_feeds(
        &self,
        filter: &FeedFilter,
        order: FeedOrdering,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Feed>, RepositoryError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM feed", FEED_COLUMNS));

        if let Some(ids) = &filter.ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            builder.push(" WHERE id IN (");
            let mut separated = builder.separated(", ");
            for id in ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
        }

        match order {
            FeedOrdering::IdAsc => builder.push(" ORDER BY id ASC"),
            FeedOrdering::PublishedAtDesc => {
                // NULL watermarks (never refreshed) sort last
                builder.push(" ORDER BY published_at IS NULL, published_at DESC, id DESC")
            }
        };

        builder.push(" LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let rows: Vec<FeedRow> = builder.build_query_as().fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(FeedRow::into_feed).collect())
    }

    pub async fn update_feed(
        &self,
        feed_id: i64,
        updates: &FeedUpdates,
    ) -> Result<Feed, RepositoryError> {
        let mut conn = self.pool().acquire().await?;
        update_feed_on(&mut conn, feed_id, updates).await
    }
}

/// Apply a partial feed update on an explicit connection, so the worker can
/// fold it into the same transaction as the job completion.
pub(crate) async fn update_feed_on(
    conn: &mut SqliteConnection,
    feed_id: i64,
    updates: &FeedUpdates,
) -> Result<Feed, RepositoryError> {
    let row: Option<FeedRow> = sqlx::query_as(&format!(
        "UPDATE feed
         SET title = COALESCE(?, title),
             published_at = COALESCE(?, published_at)
         WHERE id = ?
         RETURNING {}",
        FEED_COLUMNS
    ))
    .bind(&updates.title)
    .bind(updates.published_at)
    .bind(feed_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(FeedRow::into_feed)
        .ok_or_else(|| RepositoryError::not_found(format!("feed {}", feed_id)))
}
