use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that compacts the WAL once enough transactions have been
/// appended since the last compaction. Exits when the engine is dropped
/// everywhere else.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let engine = Arc::downgrade(&engine);
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(engine) = engine.upgrade() else {
            return;
        };
        if compact_if_needed(&engine, threshold).await {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        }
    }
}

/// Returns whether a compaction ran and succeeded.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}
