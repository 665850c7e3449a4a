//! Stale-task reaper.
//!
//! Fails every `processing` task older than [`TASK_TIMEOUT`]. Runs once at
//! startup and then every [`REAP_INTERVAL`]. Terminal tasks are never
//! touched, and a worker that finishes after being reaped loses the race
//! harmlessly because terminal rows refuse further transitions.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::db::Database;
use crate::prom_metrics::Metrics;

pub const TASK_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);
pub const TIMEOUT_MESSAGE: &str = "任务超时";

/// One sweep against the current clock.
pub async fn reap_once(db: &Database, metrics: &Metrics) -> Result<u64> {
    let threshold = Utc::now() - chrono::Duration::from_std(TASK_TIMEOUT)?;
    let reaped = db.reap_stale_tasks(threshold, TIMEOUT_MESSAGE).await?;
    metrics.tasks_reaped.inc_by(reaped);
    Ok(reaped)
}

/// Start the periodic sweep. The first tick fires immediately.
pub fn spawn(db: Database, metrics: Arc<Metrics>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        loop {
            interval.tick().await;
            match reap_once(&db, &metrics).await {
                Ok(n) if n > 0 => info!(count = n, "reaped stale tasks"),
                Err(e) => warn!(error = %e, "stale task sweep failed"),
                _ => {}
            }
        }
    })
}
