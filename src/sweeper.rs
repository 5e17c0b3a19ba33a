use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::Engine;
use crate::wire::IdempotencyCache;

/// Background task that periodically evicts expired range-query cache
/// entries (the TTL backstop against missed invalidations) and stale
/// idempotency replays.
pub async fn run_sweeper(engine: Arc<Engine>, idempotency: Arc<IdempotencyCache>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let evicted = engine.cache.sweep_expired();
        let replays = idempotency.sweep_expired();
        if evicted + replays > 0 {
            debug!("sweeper evicted {evicted} cache entries, {replays} idempotency entries");
        }
    }
}

/// Background task that compacts the WAL once enough appends have
/// accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HourSet, SlotSnapshot, WeeklyTemplate};
    use crate::notify::NotifyHub;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotwise_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compactor_threshold_respected() {
        let path = test_wal_path("compactor_threshold.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(path, notify).unwrap());

        let day = HourSet::from_hours(&[9]).unwrap();
        let template = WeeklyTemplate { weekdays: [day; 7] };
        for _ in 0..3 {
            engine
                .set_availability(Ulid::new(), template.clone())
                .await
                .unwrap();
        }
        assert_eq!(engine.wal_appends_since_compact().await, 3);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }

    #[tokio::test]
    async fn sweeper_state_is_reachable() {
        let path = test_wal_path("sweeper_reachable.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(path, notify).unwrap());

        // Fresh entries survive a sweep; the TTL backstop only removes
        // entries once they have aged out.
        engine.cache.put_slot(
            Ulid::new(),
            NaiveDate::from_ymd_opt(2026, 5, 4).unwrap(),
            9,
            SlotSnapshot {
                disabled: false,
                active_requester: None,
                last_cancelled_by: None,
            },
        );
        assert_eq!(engine.cache.sweep_expired(), 0);
        assert_eq!(engine.cache.len(), 1);
    }
}
