//! Scheduler loop: the only path by which a successfully refreshed feed
//! becomes due again.
//!
//! Each tick promotes jobs that have rested in `complete` longer than the
//! refresh interval back to `pending`, oldest wait first. Several scheduler
//! instances may run against the same database; the batch CAS guarantees
//! each row is promoted exactly once.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;

use crate::config::{RefreshConfig, SchedulerConfig};
use crate::storage::{Database, JobFilter, JobOrdering, JobState};

pub struct Scheduler {
    db: Database,
    interval: Duration,
    batch_size: i64,
    refresh_interval_s: i64,
}

impl Scheduler {
    pub fn new(db: Database, scheduler: &SchedulerConfig, refresh: &RefreshConfig) -> Self {
        Self {
            db,
            interval: Duration::from_secs(scheduler.interval_s),
            batch_size: scheduler.batch_size,
            refresh_interval_s: refresh.update_frequency_s as i64,
        }
    }

    /// Run ticks at a fixed interval until `shutdown` flips. An in-flight
    /// tick always completes; each repository call is transactional, so no
    /// partial work is left behind.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_s = self.interval.as_secs(),
            batch_size = self.batch_size,
            "scheduler started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(err) = self.tick().await {
                tracing::error!(error = %err, "scheduler tick failed");
            }
            if *shutdown.borrow() {
                break;
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// One pass: promote up to `batch_size` stale completed jobs.
    pub async fn tick(&self) -> Result<()> {
        let threshold = chrono::Utc::now().timestamp() - self.refresh_interval_s;

        let stale = self
            .db
            .list_jobs(
                &JobFilter {
                    state: Some(JobState::Complete),
                    state_changed_before: Some(threshold),
                    ..Default::default()
                },
                // jobs completed the longest time ago go first
                JobOrdering::StateChangedAtAsc,
                self.batch_size,
                0,
            )
            .await?;

        if stale.is_empty() {
            tracing::debug!("no jobs to schedule");
            return Ok(());
        }

        let ids: Vec<i64> = stale.iter().map(|job| job.id).collect();
        let scheduled = self
            .db
            .transit_job_state_batch(&ids, JobState::Complete, JobState::Pending)
            .await?;

        if scheduled.len() != stale.len() {
            // another scheduler instance got to some rows first
            tracing::warn!(
                requested = stale.len(),
                scheduled = scheduled.len(),
                "some jobs were already scheduled elsewhere"
            );
        }
        tracing::info!(count = scheduled.len(), "scheduled jobs for refresh");

        Ok(())
    }
}
