//! End-to-end tests for the refresh pipeline: scheduler and worker ticks
//! driven against wiremock-served feed documents and temp-file SQLite
//! databases.
//!
//! Each test gets its own database file so a second handle opened on the
//! same path (two "processes") sees the same store, exactly as in
//! production.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedhub::config::{RefreshConfig, SchedulerConfig, WorkerConfig};
use feedhub::feed::FeedFetcher;
use feedhub::pipeline::{Scheduler, Worker};
use feedhub::storage::{
    Database, FeedUpdates, JobState, JobUpdates, NewFeed, NewFeedPost, NewRefreshJob,
};

static DB_SEQ: AtomicU32 = AtomicU32::new(0);

fn db_uri() -> String {
    let seq = DB_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "feedhub_pipeline_test_{}_{}.db",
        std::process::id(),
        seq
    ));
    // a previous run may have left a file behind under a recycled pid
    let _ = std::fs::remove_file(&path);
    path.to_str().unwrap().to_string()
}

// 2023-08-30T10:02:26Z, 10:12:16Z, 12:29:25Z
const TS_A: i64 = 1_693_389_746;
const TS_B: i64 = 1_693_390_336;
const TS_C: i64 = 1_693_398_565;
// 2023-08-30T10:10:00Z, between A and B
const WATERMARK: i64 = 1_693_390_200;

const FEED_DOC: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Example Feed</title>
    <link>https://example.com</link>
    <item>
        <guid>c</guid>
        <title>Third</title>
        <link>https://example.com/c</link>
        <pubDate>Wed, 30 Aug 2023 12:29:25 GMT</pubDate>
    </item>
    <item>
        <guid>a</guid>
        <title>First</title>
        <link>https://example.com/a</link>
        <pubDate>Wed, 30 Aug 2023 10:02:26 GMT</pubDate>
    </item>
    <item>
        <guid>b</guid>
        <title>Second</title>
        <link>https://example.com/b</link>
        <pubDate>Wed, 30 Aug 2023 10:12:16 GMT</pubDate>
    </item>
</channel></rss>"#;

fn worker_for(db: &Database, max_feed_size_b: usize) -> Worker {
    let refresh = RefreshConfig {
        retry_delay_m: vec![2, 5, 8],
        max_feed_size_b,
        ..Default::default()
    };
    let fetcher = FeedFetcher::new(Duration::from_secs(5), max_feed_size_b).unwrap();
    Worker::new(
        db.clone(),
        fetcher,
        &WorkerConfig {
            interval_s: 1,
            batch_size: 50,
        },
        &refresh,
    )
}

fn scheduler_for(db: &Database, update_frequency_s: u64) -> Scheduler {
    Scheduler::new(
        db.clone(),
        &SchedulerConfig {
            interval_s: 1,
            batch_size: 20,
        },
        &RefreshConfig {
            update_frequency_s,
            ..Default::default()
        },
    )
}

async fn serve_feed(body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;
    server
}

/// Subscribe to the mock server's feed: feed row plus pending job.
async fn subscribe(db: &Database, server: &MockServer) -> (i64, i64) {
    let feed = db
        .get_or_create_feed(&NewFeed {
            url: format!("{}/feed", server.uri()),
        })
        .await
        .unwrap();
    let job = db
        .get_or_create_job(&NewRefreshJob::for_feed(feed.id))
        .await
        .unwrap();
    (feed.id, job.id)
}

/// Force a job's state via a second handle on the shared database, the way
/// an operator script would.
async fn force_job_state(uri: &str, job_id: i64, state: JobState, state_changed_at: i64) {
    let pool = sqlx::SqlitePool::connect(&format!("sqlite:{}", uri)).await.unwrap();
    sqlx::query("UPDATE feed_refresh_job SET state = ?, state_changed_at = ? WHERE id = ?")
        .bind(state.as_i64())
        .bind(state_changed_at)
        .bind(job_id)
        .execute(&pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_happy_fetch_ingests_all_items() {
    let db = Database::open(&db_uri()).await.unwrap();
    let server = serve_feed(FEED_DOC).await;
    let (feed_id, job_id) = subscribe(&db, &server).await;

    worker_for(&db, 1 << 20).tick().await.unwrap();

    let job = db.get_job(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Complete);
    assert_eq!(job.retries, 0);

    let feed = db.get_feed(feed_id).await.unwrap();
    assert_eq!(feed.title.as_deref(), Some("Example Feed"));
    assert_eq!(feed.published_at, Some(TS_C));

    let posts = db.list_posts(feed_id, 10, 0).await.unwrap();
    let mut by_time: Vec<(i64, String)> = posts
        .iter()
        .map(|p| (p.published_at, p.guid.clone()))
        .collect();
    by_time.sort();
    assert_eq!(
        by_time,
        vec![
            (TS_A, "a".to_string()),
            (TS_B, "b".to_string()),
            (TS_C, "c".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_watermark_and_guid_conflicts_filter_ingestion() {
    let db = Database::open(&db_uri()).await.unwrap();

    // same document plus an item already ingested on a previous refresh
    let doc_with_g = FEED_DOC.replace(
        "</channel>",
        r#"<item>
            <guid>g</guid>
            <title>Seen before</title>
            <link>https://example.com/g</link>
            <pubDate>Wed, 30 Aug 2023 11:00:00 GMT</pubDate>
        </item>
</channel>"#,
    );
    let server = serve_feed(&doc_with_g).await;
    let (feed_id, job_id) = subscribe(&db, &server).await;

    db.update_feed(
        feed_id,
        &FeedUpdates {
            title: None,
            published_at: Some(WATERMARK),
        },
    )
    .await
    .unwrap();
    db.create_posts(&[NewFeedPost {
        feed_id,
        title: "Seen before".into(),
        summary: None,
        url: "https://example.com/g".into(),
        guid: "g".into(),
        published_at: 1_693_393_200,
    }])
    .await
    .unwrap();

    worker_for(&db, 1 << 20).tick().await.unwrap();

    // a is filtered by the watermark, g is dropped on guid conflict
    let posts = db.list_posts(feed_id, 10, 0).await.unwrap();
    let mut guids: Vec<&str> = posts.iter().map(|p| p.guid.as_str()).collect();
    guids.sort_unstable();
    assert_eq!(guids, vec!["b", "c", "g"]);

    let job = db.get_job(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Complete);

    let feed = db.get_feed(feed_id).await.unwrap();
    assert_eq!(feed.title.as_deref(), Some("Example Feed"));
    assert_eq!(feed.published_at, Some(TS_C));
}

#[tokio::test]
async fn test_oversized_feed_schedules_first_retry() {
    let db = Database::open(&db_uri()).await.unwrap();
    let server = serve_feed(&"x".repeat(4096)).await;
    let (feed_id, job_id) = subscribe(&db, &server).await;

    let before = chrono::Utc::now().timestamp();
    worker_for(&db, 1024).tick().await.unwrap();
    let after = chrono::Utc::now().timestamp();

    let job = db.get_job(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.retries, 1);
    // first backoff step is 2 minutes
    assert!(job.execute_after >= before + 120);
    assert!(job.execute_after <= after + 120);

    // no feed or post rows were touched
    let feed = db.get_feed(feed_id).await.unwrap();
    assert_eq!(feed.title, None);
    assert_eq!(feed.published_at, None);
    assert!(db.list_posts(feed_id, 10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_backoff_steps_follow_retry_table() {
    let uri = db_uri();
    let db = Database::open(&uri).await.unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let (_, job_id) = subscribe(&db, &server).await;

    let worker = worker_for(&db, 1 << 20);
    for (attempt, delay_m) in [(1i64, 2i64), (2, 5), (3, 8)] {
        let before = chrono::Utc::now().timestamp();
        worker.tick().await.unwrap();
        let job = db.get_job(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.retries, attempt);
        assert!(job.execute_after >= before + delay_m * 60);

        // make it due again for the next attempt
        db.update_job(
            job_id,
            &JobUpdates {
                execute_after: Some(before),
                retries: None,
            },
        )
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn test_retry_exhaustion_parks_job_in_failed() {
    let uri = db_uri();
    let db = Database::open(&uri).await.unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let (_, job_id) = subscribe(&db, &server).await;

    // three failures already happened; the retry table [2, 5, 8] is spent
    db.update_job(
        job_id,
        &JobUpdates {
            execute_after: None,
            retries: Some(3),
        },
    )
    .await
    .unwrap();

    worker_for(&db, 1 << 20).tick().await.unwrap();

    let job = db.get_job(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);

    // further ticks leave it alone
    worker_for(&db, 1 << 20).tick().await.unwrap();
    assert_eq!(db.get_job(job_id).await.unwrap().state, JobState::Failed);
}

#[tokio::test]
async fn test_scheduler_promotes_stale_then_worker_refreshes() {
    let uri = db_uri();
    let db = Database::open(&uri).await.unwrap();
    let server = serve_feed(FEED_DOC).await;
    let (feed_id, job_id) = subscribe(&db, &server).await;

    // first refresh completes and the feed goes quiet for 20 minutes
    worker_for(&db, 1 << 20).tick().await.unwrap();
    let stale_since = chrono::Utc::now().timestamp() - 20 * 60;
    force_job_state(&uri, job_id, JobState::Complete, stale_since).await;

    scheduler_for(&db, 600).tick().await.unwrap();
    let job = db.get_job(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Pending);

    // the re-run ingests nothing new: older items fall to the watermark,
    // the item at the watermark falls to its guid
    worker_for(&db, 1 << 20).tick().await.unwrap();
    let job = db.get_job(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Complete);
    assert_eq!(db.list_posts(feed_id, 10, 0).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_rerunning_worker_over_same_content_is_idempotent() {
    let uri = db_uri();
    let db = Database::open(&uri).await.unwrap();
    let server = serve_feed(FEED_DOC).await;
    let (feed_id, job_id) = subscribe(&db, &server).await;

    worker_for(&db, 1 << 20).tick().await.unwrap();
    let first_posts = db.list_posts(feed_id, 10, 0).await.unwrap();

    // requeue and refetch the identical document: anything the watermark
    // lets through is dropped by the guid key
    force_job_state(
        &uri,
        job_id,
        JobState::Pending,
        chrono::Utc::now().timestamp(),
    )
    .await;

    worker_for(&db, 1 << 20).tick().await.unwrap();
    let second_posts = db.list_posts(feed_id, 10, 0).await.unwrap();

    let ids = |posts: &[feedhub::storage::FeedPost]| -> Vec<i64> {
        posts.iter().map(|p| p.id).collect()
    };
    assert_eq!(ids(&first_posts), ids(&second_posts));
    assert_eq!(db.get_job(job_id).await.unwrap().state, JobState::Complete);
}

#[tokio::test]
async fn test_concurrent_claim_yields_disjoint_ownership() {
    let uri = db_uri();
    let db_a = Database::open(&uri).await.unwrap();
    let db_b = Database::open(&uri).await.unwrap();
    let server = serve_feed(FEED_DOC).await;

    let mut job_ids = Vec::new();
    for n in 0..2 {
        let feed = db_a
            .get_or_create_feed(&NewFeed {
                url: format!("{}/feed/{}", server.uri(), n),
            })
            .await
            .unwrap();
        let job = db_a
            .create_job(&NewRefreshJob::for_feed(feed.id))
            .await
            .unwrap();
        job_ids.push(job.id);
    }

    // both workers listed the same pending jobs; only one CAS batch wins
    let claimed_a = db_a
        .transit_job_state_batch(&job_ids, JobState::Pending, JobState::InProgress)
        .await
        .unwrap();
    let claimed_b = db_b
        .transit_job_state_batch(&job_ids, JobState::Pending, JobState::InProgress)
        .await
        .unwrap();

    assert_eq!(claimed_a.len(), 2);
    assert!(claimed_b.is_empty());
}

#[tokio::test]
async fn test_scheduler_twice_equals_once() {
    let uri = db_uri();
    let db = Database::open(&uri).await.unwrap();
    let server = serve_feed(FEED_DOC).await;
    let (_, job_id) = subscribe(&db, &server).await;
    force_job_state(
        &uri,
        job_id,
        JobState::Complete,
        chrono::Utc::now().timestamp() - 20 * 60,
    )
    .await;

    let scheduler = scheduler_for(&db, 600);
    scheduler.tick().await.unwrap();
    let after_first = db.get_job(job_id).await.unwrap();

    scheduler.tick().await.unwrap();
    let after_second = db.get_job(job_id).await.unwrap();

    assert_eq!(after_first.state, JobState::Pending);
    assert_eq!(after_second.state, JobState::Pending);
    assert_eq!(after_second.state_changed_at, after_first.state_changed_at);
}

#[tokio::test]
async fn test_handler_failure_does_not_abort_siblings() {
    let db = Database::open(&db_uri()).await.unwrap();

    let good = serve_feed(FEED_DOC).await;
    let bad = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&bad)
        .await;

    let (good_feed, good_job) = subscribe(&db, &good).await;
    let (_, bad_job) = subscribe(&db, &bad).await;

    worker_for(&db, 1 << 20).tick().await.unwrap();

    // the failing feed retried, the good one committed
    assert_eq!(db.get_job(good_job).await.unwrap().state, JobState::Complete);
    let bad_job = db.get_job(bad_job).await.unwrap();
    assert_eq!(bad_job.state, JobState::Pending);
    assert_eq!(bad_job.retries, 1);
    assert_eq!(db.list_posts(good_feed, 10, 0).await.unwrap().len(), 3);
}
