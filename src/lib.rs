//! RSS/Atom feed aggregation backend.
//!
//! Subscriptions create a feed row plus a persisted refresh job; from there
//! the pipeline owns the feed. The scheduler loop re-queues jobs whose last
//! successful refresh has gone stale, and the worker loop claims due jobs,
//! fetches and parses the documents, and commits new posts idempotently.
//! All coordination happens through CAS state transitions on the job rows,
//! so any number of scheduler and worker processes can share one database.

pub mod api;
pub mod config;
pub mod feed;
pub mod pipeline;
pub mod storage;
