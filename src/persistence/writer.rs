//! Dedicated persistence writer task (spec.md §5: "the persistence store
//! is single-writer; the aggregator thread schedules writes via a
//! dedicated writer worker"). Decouples blocking SQLite I/O from the
//! aggregator's per-Reading hot path. Writes are applied in the order
//! they're received, which preserves the ordering-by-snapshot-version
//! guarantee as long as the aggregator enqueues them in merge order.

use super::{DailySummary, PersistenceStore, PowerHistoryRow};
use crate::domain::SystemState;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

pub enum PersistenceJob {
    PowerSnapshot {
        wall_ts: DateTime<Utc>,
        row: PowerHistoryRow,
    },
    StateSnapshot {
        wall_ts: DateTime<Utc>,
        state: Arc<SystemState>,
    },
    DailyRollup {
        date: NaiveDate,
        summary: DailySummary,
    },
}

/// Spawns the writer loop: applies queued jobs and runs the retention
/// sweep on a fixed hourly timer, independent of job traffic.
pub fn spawn(store: PersistenceStore) -> (mpsc::Sender<PersistenceJob>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<PersistenceJob>(64);
    let handle = tokio::spawn(async move {
        let mut sweep = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        sweep.tick().await; // first tick fires immediately; don't sweep on startup
        loop {
            tokio::select! {
                job = rx.recv() => {
                    let Some(job) = job else { break };
                    if let Err(e) = apply(&store, job).await {
                        tracing::warn!(error = %e, "persistence write failed");
                    }
                }
                _ = sweep.tick() => {
                    match store.sweep_retention(Utc::now()).await {
                        Ok(0) => {}
                        Ok(deleted) => tracing::debug!(deleted, "retention sweep removed stale rows"),
                        Err(e) => tracing::warn!(error = %e, "retention sweep failed"),
                    }
                }
            }
        }
    });
    (tx, handle)
}

async fn apply(store: &PersistenceStore, job: PersistenceJob) -> Result<(), crate::error::PersistenceError> {
    match job {
        PersistenceJob::PowerSnapshot { wall_ts, row } => store.insert_power_snapshot(wall_ts, row).await,
        PersistenceJob::StateSnapshot { wall_ts, state } => store.insert_state_snapshot(wall_ts, &state).await,
        PersistenceJob::DailyRollup { date, summary } => store.upsert_daily_summary(date, summary).await,
    }
}
