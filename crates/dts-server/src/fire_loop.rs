//! Periodic firing of due scheduled runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use dts_storage::{DtsStorage, StorageError};
use dts_types::Execution;

/// Fail executions past their timeout, collect orphaned runs, then fire
/// every run due at `now`. Returns the executions started by this tick.
pub async fn tick(storage: &DtsStorage, now: DateTime<Utc>) -> Result<Vec<Execution>, StorageError> {
    let expired = storage.expire_timed_out_executions(now).await?;
    let collected = storage.collect_orphaned_runs().await?;
    let started = storage.fire_due_runs(now).await?;
    if !expired.is_empty() || collected > 0 || !started.is_empty() {
        debug!(
            expired = expired.len(),
            collected,
            fired = started.len(),
            "Fire loop tick"
        );
    }
    Ok(started)
}

/// Tick forever. Errors are logged and the next tick retries.
pub async fn run_fire_loop(storage: Arc<DtsStorage>, interval: Duration) {
    info!(interval_secs = interval.as_secs(), "Fire loop started");
    loop {
        match tick(&storage, dts_storage::now()).await {
            Ok(started) => {
                for execution in started {
                    info!(job_id = %execution.job_id, execution_id = %execution.id, "Execution started");
                }
            }
            Err(e) => warn!("Fire loop tick failed: {e}"),
        }
        tokio::time::sleep(interval).await;
    }
}
