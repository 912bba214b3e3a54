//! Embedded persistence (spec.md §4.7, C7): a single-writer SQLite store
//! for power-history snapshots, on-demand state snapshots, and daily
//! summaries.
#![cfg(feature = "persistence")]

pub mod writer;

use crate::domain::SystemState;
use crate::error::PersistenceError;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

const MAX_BUSY_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct PowerHistoryRow {
    pub soc_percent: Option<f64>,
    pub pv_watts: Option<f64>,
    pub battery_watts: Option<f64>,
    pub load_watts: Option<f64>,
    pub grid_watts_signed: Option<f64>,
}

/// The six standard kWh fields rolled up once per local day (spec.md §4.7,
/// `HistoryRecord` in §3).
#[derive(Debug, Clone, Copy, Default)]
pub struct DailySummary {
    pub pv_yield_kwh: f64,
    pub load_energy_kwh: f64,
    pub battery_charge_kwh: f64,
    pub battery_discharge_kwh: f64,
    pub grid_import_kwh: f64,
    pub grid_export_kwh: f64,
}

pub struct PersistenceStore {
    pool: SqlitePool,
    history_max_age: chrono::Duration,
}

impl PersistenceStore {
    pub async fn connect(path: &str, history_max_age_hours: i64) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(PersistenceError::Database)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1) // single-writer store (spec.md §4.7)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            history_max_age: chrono::Duration::hours(history_max_age_hours),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS power_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                wall_ts TEXT NOT NULL,
                soc_percent REAL,
                pv_watts REAL,
                battery_watts REAL,
                load_watts REAL,
                grid_watts_signed REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                wall_ts TEXT NOT NULL,
                state_json TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_summary (
                summary_date TEXT PRIMARY KEY,
                pv_yield_kwh REAL NOT NULL,
                load_energy_kwh REAL NOT NULL,
                battery_charge_kwh REAL NOT NULL,
                battery_discharge_kwh REAL NOT NULL,
                grid_import_kwh REAL NOT NULL,
                grid_export_kwh REAL NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // spec.md §4.7: "monthly and yearly summaries are derived views".
        sqlx::query(
            r#"
            CREATE VIEW IF NOT EXISTS monthly_summary AS
            SELECT substr(summary_date, 1, 7) AS summary_month,
                   SUM(pv_yield_kwh) AS pv_yield_kwh,
                   SUM(load_energy_kwh) AS load_energy_kwh,
                   SUM(battery_charge_kwh) AS battery_charge_kwh,
                   SUM(battery_discharge_kwh) AS battery_discharge_kwh,
                   SUM(grid_import_kwh) AS grid_import_kwh,
                   SUM(grid_export_kwh) AS grid_export_kwh
            FROM daily_summary
            GROUP BY summary_month
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE VIEW IF NOT EXISTS yearly_summary AS
            SELECT substr(summary_date, 1, 4) AS summary_year,
                   SUM(pv_yield_kwh) AS pv_yield_kwh,
                   SUM(load_energy_kwh) AS load_energy_kwh,
                   SUM(battery_charge_kwh) AS battery_charge_kwh,
                   SUM(battery_discharge_kwh) AS battery_discharge_kwh,
                   SUM(grid_import_kwh) AS grid_import_kwh,
                   SUM(grid_export_kwh) AS grid_export_kwh
            FROM daily_summary
            GROUP BY summary_year
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// spec.md §4.7 "power snapshot" write path, invoked by the caller on
    /// `snapshot_interval` (default 60s).
    pub async fn insert_power_snapshot(&self, wall_ts: DateTime<Utc>, row: PowerHistoryRow) -> Result<(), PersistenceError> {
        self.with_busy_retry(|| {
            let pool = self.pool.clone();
            let wall_ts = wall_ts;
            async move {
                sqlx::query(
                    "INSERT INTO power_history (wall_ts, soc_percent, pv_watts, battery_watts, load_watts, grid_watts_signed) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(wall_ts.to_rfc3339())
                .bind(row.soc_percent)
                .bind(row.pv_watts)
                .bind(row.battery_watts)
                .bind(row.load_watts)
                .bind(row.grid_watts_signed)
                .execute(&pool)
                .await
            }
        })
        .await?;
        Ok(())
    }

    /// spec.md §4.7 "state snapshot" write path: on-demand full dump of
    /// `SystemState`, for debugging.
    pub async fn insert_state_snapshot(&self, wall_ts: DateTime<Utc>, state: &SystemState) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(&SerializableState::from(state)).unwrap_or_else(|_| "{}".to_string());
        self.with_busy_retry(|| {
            let pool = self.pool.clone();
            let wall_ts = wall_ts;
            let json = json.clone();
            async move {
                sqlx::query("INSERT INTO state_history (wall_ts, state_json) VALUES (?, ?)")
                    .bind(wall_ts.to_rfc3339())
                    .bind(json)
                    .execute(&pool)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    /// spec.md §4.7 "daily summary" roll-up, invoked at local midnight.
    pub async fn upsert_daily_summary(&self, date: chrono::NaiveDate, summary: DailySummary) -> Result<(), PersistenceError> {
        self.with_busy_retry(|| {
            let pool = self.pool.clone();
            let date = date;
            async move {
                sqlx::query(
                    "INSERT INTO daily_summary (summary_date, pv_yield_kwh, load_energy_kwh, battery_charge_kwh, \
                     battery_discharge_kwh, grid_import_kwh, grid_export_kwh) VALUES (?, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT(summary_date) DO UPDATE SET \
                     pv_yield_kwh = excluded.pv_yield_kwh, \
                     load_energy_kwh = excluded.load_energy_kwh, \
                     battery_charge_kwh = excluded.battery_charge_kwh, \
                     battery_discharge_kwh = excluded.battery_discharge_kwh, \
                     grid_import_kwh = excluded.grid_import_kwh, \
                     grid_export_kwh = excluded.grid_export_kwh",
                )
                .bind(date.to_string())
                .bind(summary.pv_yield_kwh)
                .bind(summary.load_energy_kwh)
                .bind(summary.battery_charge_kwh)
                .bind(summary.battery_discharge_kwh)
                .bind(summary.grid_import_kwh)
                .bind(summary.grid_export_kwh)
                .execute(&pool)
                .await
            }
        })
        .await?;
        Ok(())
    }

    /// Deletes `power_history`/`state_history` rows older than
    /// `history_max_age_hours`; `daily_summary` rows are kept indefinitely
    /// (spec.md §4.7 retention rule).
    pub async fn sweep_retention(&self, now: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let cutoff = (now - self.history_max_age).to_rfc3339();
        let power = sqlx::query("DELETE FROM power_history WHERE wall_ts < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
        let state = sqlx::query("DELETE FROM state_history WHERE wall_ts < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
        Ok(power.rows_affected() + state.rows_affected())
    }

    pub async fn latest_power_snapshot(&self) -> Result<Option<PowerHistoryRow>, PersistenceError> {
        let row = sqlx::query("SELECT soc_percent, pv_watts, battery_watts, load_watts, grid_watts_signed FROM power_history ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| PowerHistoryRow {
            soc_percent: r.get("soc_percent"),
            pv_watts: r.get("pv_watts"),
            battery_watts: r.get("battery_watts"),
            load_watts: r.get("load_watts"),
            grid_watts_signed: r.get("grid_watts_signed"),
        }))
    }

    /// Short transactions with bounded exponential retry-on-busy (spec.md
    /// §4.7: "because the store is single-writer").
    async fn with_busy_retry<F, Fut>(&self, mut op: F) -> Result<(), PersistenceError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<sqlx::sqlite::SqliteQueryResult, sqlx::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(_) => return Ok(()),
                Err(sqlx::Error::Database(db_err)) if is_busy(&db_err) && attempt < MAX_BUSY_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(50 * 2u64.pow(attempt))).await;
                }
                Err(e) if attempt >= MAX_BUSY_RETRIES => {
                    let _ = e;
                    return Err(PersistenceError::BusyRetriesExhausted { attempts: attempt });
                }
                Err(e) => return Err(PersistenceError::Database(e)),
            }
        }
    }
}

fn is_busy(err: &dyn sqlx::error::DatabaseError) -> bool {
    err.message().contains("database is locked") || err.message().contains("busy")
}

/// A flattened, JSON-friendly projection of `SystemState` for the debug
/// state-history table.
#[derive(serde::Serialize)]
struct SerializableState {
    version: u64,
    entries: std::collections::BTreeMap<String, crate::domain::Value>,
}

impl From<&SystemState> for SerializableState {
    fn from(state: &SystemState) -> Self {
        Self {
            version: state.version(),
            entries: state.iter().map(|(k, e)| (k.canonical_name(), e.value.clone())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrates_and_round_trips_a_power_snapshot() {
        let store = PersistenceStore::connect("sqlite::memory:", 24).await.unwrap();
        let now = Utc::now();
        store
            .insert_power_snapshot(
                now,
                PowerHistoryRow {
                    soc_percent: Some(80.0),
                    pv_watts: Some(1200.0),
                    battery_watts: Some(-300.0),
                    load_watts: Some(900.0),
                    grid_watts_signed: Some(0.0),
                },
            )
            .await
            .unwrap();

        let latest = store.latest_power_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.pv_watts, Some(1200.0));
    }

    #[tokio::test]
    async fn retention_sweep_deletes_only_stale_rows() {
        let store = PersistenceStore::connect("sqlite::memory:", 1).await.unwrap();
        let old = Utc::now() - chrono::Duration::hours(5);
        store
            .insert_power_snapshot(old, PowerHistoryRow { soc_percent: None, pv_watts: None, battery_watts: None, load_watts: None, grid_watts_signed: None })
            .await
            .unwrap();
        store
            .insert_power_snapshot(Utc::now(), PowerHistoryRow { soc_percent: None, pv_watts: None, battery_watts: None, load_watts: None, grid_watts_signed: None })
            .await
            .unwrap();

        let deleted = store.sweep_retention(Utc::now()).await.unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn daily_summary_upsert_is_idempotent_per_date() {
        let store = PersistenceStore::connect("sqlite::memory:", 24).await.unwrap();
        let date = Utc::now().date_naive();
        store.upsert_daily_summary(date, DailySummary { pv_yield_kwh: 10.0, ..Default::default() }).await.unwrap();
        store.upsert_daily_summary(date, DailySummary { pv_yield_kwh: 12.0, ..Default::default() }).await.unwrap();

        let row: (f64,) = sqlx::query_as("SELECT pv_yield_kwh FROM daily_summary WHERE summary_date = ?")
            .bind(date.to_string())
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(row.0, 12.0);
    }

    #[tokio::test]
    async fn monthly_view_aggregates_daily_rows() {
        let store = PersistenceStore::connect("sqlite::memory:", 24).await.unwrap();
        let date_a = chrono::NaiveDate::from_ymd_opt(2026, 7, 1).unwrap();
        let date_b = chrono::NaiveDate::from_ymd_opt(2026, 7, 2).unwrap();
        store.upsert_daily_summary(date_a, DailySummary { pv_yield_kwh: 5.0, ..Default::default() }).await.unwrap();
        store.upsert_daily_summary(date_b, DailySummary { pv_yield_kwh: 7.0, ..Default::default() }).await.unwrap();

        let row: (f64,) = sqlx::query_as("SELECT pv_yield_kwh FROM monthly_summary WHERE summary_month = '2026-07'")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(row.0, 12.0);
    }
}
