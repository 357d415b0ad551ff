use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use folio_storage::FinanceStore;
use tracing::warn;

use crate::error::{SyncError, SyncResult};

pub const BATCH_LOCK: &str = "daily-batch";
pub const RETENTION_LOCK: &str = "retention";

/// A lock older than this is treated as left behind by a crashed run.
pub const STALE_LOCK_AFTER: Duration = Duration::from_secs(2 * 60 * 60);

/// Runs `work` while holding the named run lock. The lock is released
/// whatever `work` returns; a failed release is logged and left to expire.
pub async fn with_run_lock<T, F, Fut>(
    store: &dyn FinanceStore,
    name: &str,
    now: DateTime<Utc>,
    work: F,
) -> SyncResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let Some(lease) = store.try_lock_run(name, now, STALE_LOCK_AFTER).await? else {
        return Err(SyncError::BatchAlreadyRunning(name.to_string()));
    };
    let result = work().await;
    if let Err(err) = store.unlock_run(name, lease).await {
        warn!(lock = name, error = %err, "failed to release run lock");
    }
    result
}
