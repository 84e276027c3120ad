//! Shared helpers for the storage test suites.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::storage::Database;

static DB_SEQ: AtomicU32 = AtomicU32::new(0);

/// A fresh database with the full schema, backed by a unique temp file.
///
/// A file rather than `:memory:`: every connection in the pool must see the
/// same database, and concurrent writers must queue on the busy timeout the
/// way they do in production.
pub(crate) async fn test_db() -> Database {
    let seq = DB_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "feedhub_storage_test_{}_{}.db",
        std::process::id(),
        seq
    ));
    // a previous run may have left a file behind under a recycled pid
    let _ = std::fs::remove_file(&path);
    Database::open(path.to_str().unwrap()).await.unwrap()
}
