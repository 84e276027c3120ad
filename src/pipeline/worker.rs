//! Worker loop: drains due `pending` jobs, fetches and parses their feeds,
//! and commits the outcome.
//!
//! Each tick claims a batch with one bulk CAS; only the returned subset is
//! owned, anything else went to a competing worker. Owned jobs are fetched
//! concurrently and finalized by per-job handlers that never abort their
//! siblings: a success commits posts and the watermark in one transaction, a
//! failure re-queues the job with backoff or parks it in `failed` once the
//! retry table is exhausted.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use futures::future;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::{RefreshConfig, WorkerConfig};
use crate::feed::{FeedContent, FeedError, FeedFetcher, FetchRequest};
use crate::storage::{
    Database, Feed, FeedFilter, FeedOrdering, FeedUpdates, JobFilter, JobOrdering, JobState,
    NewFeedPost, RefreshJob, RepositoryError,
};

pub struct Worker {
    db: Database,
    fetcher: FeedFetcher,
    interval: Duration,
    batch_size: i64,
    retry_delay_m: Vec<u64>,
}

impl Worker {
    pub fn new(
        db: Database,
        fetcher: FeedFetcher,
        worker: &WorkerConfig,
        refresh: &RefreshConfig,
    ) -> Self {
        Self {
            db,
            fetcher,
            interval: Duration::from_secs(worker.interval_s),
            batch_size: worker.batch_size,
            retry_delay_m: refresh.retry_delay_m.clone(),
        }
    }

    /// Run ticks at a fixed interval until `shutdown` flips. The in-flight
    /// tick finishes first (bounded by the fetch timeout); jobs interrupted
    /// harder than that stay `in_progress` and need the explicit reset path.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_s = self.interval.as_secs(),
            batch_size = self.batch_size,
            "worker started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(err) = self.tick().await {
                tracing::error!(error = %err, "worker tick failed");
            }
            if *shutdown.borrow() {
                break;
            }
        }
        tracing::info!("worker stopped");
    }

    /// One pass: claim due jobs, fetch their feeds, commit the results.
    pub async fn tick(&self) -> Result<()> {
        let claimed = self.claim_due_jobs().await?;
        if claimed.is_empty() {
            return Ok(());
        }

        let responses = self.fetch_for_jobs(&claimed).await?;

        let jobs_by_request: HashMap<Uuid, &RefreshJob> = claimed
            .iter()
            .zip(responses.requests.iter())
            .map(|(job, request)| (request.request_id, job))
            .collect();

        // finalize concurrently; a handler failure is logged, never fatal to
        // the tick or to sibling handlers
        let handlers = responses.outcomes.into_iter().filter_map(|(request_id, outcome)| {
            let job = *jobs_by_request.get(&request_id)?;
            Some(async move {
                let result = match outcome {
                    Ok(content) => self.handle_success(job, content).await,
                    Err(err) => self.handle_failure(job, &err).await,
                };
                if let Err(err) = result {
                    tracing::error!(
                        job_id = job.id,
                        feed_id = job.feed_id,
                        error = %err,
                        "failed to finalize refresh job"
                    );
                }
            })
        });
        future::join_all(handlers).await;

        Ok(())
    }

    /// Select due pending jobs and claim them with one bulk CAS. Jobs the
    /// CAS did not return were claimed by another worker and are ignored.
    async fn claim_due_jobs(&self) -> Result<Vec<RefreshJob>> {
        let now = chrono::Utc::now().timestamp();
        let candidates = self
            .db
            .list_jobs(
                &JobFilter {
                    state: Some(JobState::Pending),
                    execute_before: Some(now),
                    ..Default::default()
                },
                // oldest waiters first, ties by id for FIFO fairness
                JobOrdering::StateChangedAtAsc,
                self.batch_size,
                0,
            )
            .await?;

        if candidates.is_empty() {
            tracing::debug!("no jobs to process");
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = candidates.iter().map(|job| job.id).collect();
        let claimed = self
            .db
            .transit_job_state_batch(&ids, JobState::Pending, JobState::InProgress)
            .await?;

        if claimed.len() != candidates.len() {
            tracing::warn!(
                requested = candidates.len(),
                claimed = claimed.len(),
                "some jobs were claimed by another worker"
            );
        }
        tracing::info!(count = claimed.len(), "claimed refresh jobs");

        Ok(claimed)
    }

    /// Resolve the claimed jobs' feeds and fetch them as one batch.
    async fn fetch_for_jobs(&self, jobs: &[RefreshJob]) -> Result<BatchOutcome> {
        let feed_ids: Vec<i64> = jobs.iter().map(|job| job.feed_id).collect();
        let feeds = self
            .db
            .list_feeds(
                &FeedFilter {
                    ids: Some(feed_ids),
                },
                FeedOrdering::IdAsc,
                jobs.len() as i64,
                0,
            )
            .await?;
        let feeds_by_id: HashMap<i64, &Feed> = feeds.iter().map(|feed| (feed.id, feed)).collect();

        // one request per job, correlated by a fresh uuid; published_since is
        // the feed's watermark so already-seen items are filtered at parse time
        let requests: Vec<FetchRequest> = jobs
            .iter()
            .map(|job| {
                let feed = feeds_by_id
                    .get(&job.feed_id)
                    .ok_or(RepositoryError::NoFeed)?;
                Ok(FetchRequest {
                    request_id: Uuid::new_v4(),
                    url: feed.url.clone(),
                    published_since: feed.published_at,
                })
            })
            .collect::<Result<_, RepositoryError>>()?;

        let outcomes = self.fetcher.fetch_batch(requests.clone()).await;
        Ok(BatchOutcome { requests, outcomes })
    }

    /// Finalize a successful fetch in one transaction: job → `complete`
    /// with a clean retry counter, plus feed metadata and posts when the
    /// parse produced items.
    async fn handle_success(
        &self,
        job: &RefreshJob,
        content: FeedContent,
    ) -> Result<(), RepositoryError> {
        if content.items.is_empty() {
            self.db.complete_job(job.id, job.feed_id, None, &[]).await?;
            tracing::info!(job_id = job.id, feed_id = job.feed_id, "feed has no new content");
            return Ok(());
        }

        let updates = FeedUpdates {
            title: Some(content.title.clone()),
            published_at: content.published_at,
        };
        let posts: Vec<NewFeedPost> = content
            .items
            .into_iter()
            .map(|item| NewFeedPost {
                feed_id: job.feed_id,
                title: item.title,
                summary: item.summary,
                url: item.url,
                guid: item.guid,
                published_at: item.published_at,
            })
            .collect();

        let inserted = self
            .db
            .complete_job(job.id, job.feed_id, Some(updates), &posts)
            .await?;
        tracing::info!(
            job_id = job.id,
            feed_id = job.feed_id,
            new_posts = inserted,
            "feed content updated"
        );
        Ok(())
    }

    /// Finalize a failed fetch: look up the backoff for the job's retry
    /// count; past the end of the table the job is parked in `failed` until
    /// an external reset.
    async fn handle_failure(
        &self,
        job: &RefreshJob,
        err: &FeedError,
    ) -> Result<(), RepositoryError> {
        tracing::warn!(
            job_id = job.id,
            feed_id = job.feed_id,
            error = %err,
            "feed refresh failed"
        );

        let delay_m = usize::try_from(job.retries)
            .ok()
            .and_then(|retries| self.retry_delay_m.get(retries).copied());

        match delay_m {
            None => {
                self.db.fail_job(job.id).await?;
                tracing::warn!(
                    job_id = job.id,
                    feed_id = job.feed_id,
                    retries = job.retries,
                    "job out of retries, marked failed"
                );
            }
            Some(delay_m) => {
                let execute_after = chrono::Utc::now().timestamp() + (delay_m * 60) as i64;
                let job = self.db.retry_job(job, execute_after).await?;
                tracing::info!(
                    job_id = job.id,
                    feed_id = job.feed_id,
                    retries = job.retries,
                    execute_after,
                    "refresh rescheduled with backoff"
                );
            }
        }
        Ok(())
    }
}

struct BatchOutcome {
    requests: Vec<FetchRequest>,
    outcomes: HashMap<Uuid, Result<FeedContent, FeedError>>,
}
