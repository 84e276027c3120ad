//! HTTP surface for subscriptions and reads.
//!
//! Deliberately thin: every endpoint is a couple of repository calls. The
//! one piece of pipeline logic here is the refresh reset path, which
//! requeues a settled job through the same CAS discipline the loops use.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::storage::{
    Database, Feed, FeedFilter, FeedOrdering, FeedPost, JobState, NewFeed, NewRefreshJob,
    RefreshJob, RepositoryError,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
enum ApiError {
    #[error("{0}")]
    UnprocessableEntity(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::UnprocessableEntity(message) => {
                (StatusCode::UNPROCESSABLE_ENTITY, message.clone())
            }
            ApiError::Repository(RepositoryError::NotFound(what)) => {
                (StatusCode::NOT_FOUND, format!("{} not found", what))
            }
            ApiError::Repository(err) => {
                tracing::error!(error = %err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { detail: message })).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    detail: String,
}

// ============================================================================
// Schemas
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateFeedRequest {
    url: String,
}

#[derive(Debug, Serialize)]
struct FeedResponse {
    id: i64,
    url: String,
    title: Option<String>,
    published_at: Option<i64>,
    created_at: i64,
}

impl From<Feed> for FeedResponse {
    fn from(feed: Feed) -> Self {
        Self {
            id: feed.id,
            url: feed.url,
            title: feed.title,
            published_at: feed.published_at,
            created_at: feed.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct JobResponse {
    id: i64,
    feed_id: i64,
    /// Contract encoding: pending=1, in_progress=2, complete=3, failed=4.
    state: i64,
    state_changed_at: i64,
    execute_after: i64,
    retries: i64,
}

impl From<RefreshJob> for JobResponse {
    fn from(job: RefreshJob) -> Self {
        Self {
            id: job.id,
            feed_id: job.feed_id,
            state: job.state.as_i64(),
            state_changed_at: job.state_changed_at,
            execute_after: job.execute_after,
            retries: job.retries,
        }
    }
}

#[derive(Debug, Serialize)]
struct PostResponse {
    id: i64,
    feed_id: i64,
    title: String,
    summary: Option<String>,
    url: String,
    guid: String,
    published_at: i64,
}

impl From<FeedPost> for PostResponse {
    fn from(post: FeedPost) -> Self {
        Self {
            id: post.id,
            feed_id: post.feed_id,
            title: post.title,
            summary: post.summary,
            url: post.url,
            guid: post.guid,
            published_at: post.published_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Pagination {
    limit: Option<i64>,
    offset: Option<i64>,
}

impl Pagination {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 500)
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

// ============================================================================
// Router
// ============================================================================

pub fn router(db: Database) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/feeds", post(create_feed).get(list_feeds))
        .route("/feeds/:feed_id", get(get_feed))
        .route("/feeds/:feed_id/posts", get(list_feed_posts))
        .route("/feeds/:feed_id/refresh", post(refresh_feed))
        .layer(TraceLayer::new_for_http())
        .with_state(db)
}

/// Serve the API until `shutdown` flips; in-flight requests drain first.
pub async fn serve(
    db: Database,
    listen_addr: &str,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "api listening");

    axum::serve(listener, router(db))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(db): State<Database>) -> Result<Json<serde_json::Value>, ApiError> {
    // prove the database answers, not just that the process is up
    db.list_feeds(&FeedFilter::default(), FeedOrdering::IdAsc, 1, 0)
        .await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// Subscribe to a feed: create (or find) the feed row and its refresh job.
/// A settled job is requeued so the subscriber gets fresh content soon.
async fn create_feed(
    State(db): State<Database>,
    Json(body): Json<CreateFeedRequest>,
) -> Result<(StatusCode, Json<FeedResponse>), ApiError> {
    let url = validate_feed_url(&body.url)?;

    let feed = db.get_or_create_feed(&NewFeed { url }).await?;
    let job = db.get_or_create_job(&NewRefreshJob::for_feed(feed.id)).await?;
    requeue_if_settled(&db, &job).await?;

    tracing::info!(feed_id = feed.id, url = %feed.url, "feed subscribed");
    Ok((StatusCode::CREATED, Json(feed.into())))
}

async fn list_feeds(
    State(db): State<Database>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<FeedResponse>>, ApiError> {
    let feeds = db
        .list_feeds(
            &FeedFilter::default(),
            FeedOrdering::PublishedAtDesc,
            page.limit(),
            page.offset(),
        )
        .await?;
    Ok(Json(feeds.into_iter().map(FeedResponse::from).collect()))
}

async fn get_feed(
    State(db): State<Database>,
    Path(feed_id): Path<i64>,
) -> Result<Json<FeedResponse>, ApiError> {
    let feed = db.get_feed(feed_id).await?;
    Ok(Json(feed.into()))
}

async fn list_feed_posts(
    State(db): State<Database>,
    Path(feed_id): Path<i64>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<PostResponse>>, ApiError> {
    // 404 for unknown feeds rather than an empty list
    db.get_feed(feed_id).await?;
    let posts = db.list_posts(feed_id, page.limit(), page.offset()).await?;
    Ok(Json(posts.into_iter().map(PostResponse::from).collect()))
}

/// The explicit reset path: make the feed's job runnable now if it has
/// settled in `complete` or `failed`. A job that is queued or actively
/// running is returned as-is.
async fn refresh_feed(
    State(db): State<Database>,
    Path(feed_id): Path<i64>,
) -> Result<Json<JobResponse>, ApiError> {
    let feed = db.get_feed(feed_id).await?;
    let job = db.get_or_create_job(&NewRefreshJob::for_feed(feed.id)).await?;
    let job = requeue_if_settled(&db, &job).await?;
    Ok(Json(job.into()))
}

/// Requeue a `complete` or `failed` job as immediately runnable. A job
/// already `pending` or `in_progress` is left alone, and losing the CAS
/// race means someone else requeued it first, which is just as good.
async fn requeue_if_settled(db: &Database, job: &RefreshJob) -> Result<RefreshJob, ApiError> {
    if matches!(job.state, JobState::Pending | JobState::InProgress) {
        return Ok(job.clone());
    }

    match db.reset_job(job).await {
        Ok(job) => Ok(job),
        Err(RepositoryError::StateTransition { .. }) => {
            tracing::info!(
                job_id = job.id,
                feed_id = job.feed_id,
                "refresh already requeued elsewhere"
            );
            Ok(db.get_job(job.id).await?)
        }
        Err(err) => Err(err.into()),
    }
}

fn validate_feed_url(raw: &str) -> Result<String, ApiError> {
    let parsed = url::Url::parse(raw)
        .map_err(|err| ApiError::UnprocessableEntity(format!("invalid feed url: {}", err)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::UnprocessableEntity(
            "feed url must be http or https".to_string(),
        ));
    }
    Ok(parsed.to_string())
}
