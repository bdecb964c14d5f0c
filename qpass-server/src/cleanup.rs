//! Background cleanup: purge old tombstones, forget idle rate-limit buckets.

use crate::rate_limit::RateLimiter;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use qpass_core::store::{RecordStore, StoreError};
use qpass_core::Database;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

pub fn spawn_cleanup_task(
    store: Database,
    limiter: RateLimiter,
    tombstone_retention_days: u64,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        loop {
            interval.tick().await;
            let store = store.clone();
            let purge =
                tokio::task::spawn_blocking(move || run_cleanup(&store, tombstone_retention_days))
                    .await;
            match purge {
                Ok(Ok(0)) => tracing::debug!("Cleanup completed"),
                Ok(Ok(purged)) => tracing::info!(purged, "Purged expired tombstones"),
                Ok(Err(e)) => tracing::error!("Cleanup error: {}", e),
                Err(e) => tracing::error!("Cleanup task panicked: {}", e),
            }
            limiter.prune(every);
        }
    })
}

/// Oldest change time a tombstone may have and survive, or `None` when the
/// retention window reaches past what chrono can represent.
pub fn retention_cutoff(tombstone_retention_days: u64) -> Option<DateTime<Utc>> {
    let days = i64::try_from(tombstone_retention_days).ok()?;
    Utc::now().checked_sub_signed(ChronoDuration::try_days(days)?)
}

pub fn run_cleanup(store: &Database, tombstone_retention_days: u64) -> Result<usize, StoreError> {
    match retention_cutoff(tombstone_retention_days) {
        Some(cutoff) => store.purge_tombstones(cutoff),
        None => {
            tracing::warn!(
                tombstone_retention_days,
                "Retention window out of range, skipping purge"
            );
            Ok(0)
        }
    }
}
