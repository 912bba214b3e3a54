//! Aggregator (spec.md §4.5, C5): merges plugin Readings into the single
//! `SystemState`, running every value through the adaptive filter first
//! and recomputing derived fields afterwards.

use crate::config::schema::FilterConfig;
use crate::domain::{Reading, StandardKey, SystemState, Value};
use crate::filter::{AdaptiveFilter, FilterDecision};
use crate::publisher::Publisher;
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub struct Aggregator {
    state: SystemState,
    filter: AdaptiveFilter,
    reading_rx: mpsc::Receiver<Reading>,
    publisher: Option<Arc<Publisher>>,
    timezone: Tz,
    #[cfg(feature = "persistence")]
    persistence_tx: Option<mpsc::Sender<crate::persistence::writer::PersistenceJob>>,
    #[cfg(feature = "persistence")]
    snapshot_interval: Duration,
    #[cfg(feature = "persistence")]
    last_snapshot_at: Option<Instant>,
    last_wall_date: Option<chrono::NaiveDate>,
}

impl Aggregator {
    pub fn new(filter_config: &FilterConfig, timezone: Tz, reading_rx: mpsc::Receiver<Reading>) -> Self {
        Self {
            state: SystemState::new(),
            filter: AdaptiveFilter::new(filter_config, timezone),
            reading_rx,
            publisher: None,
            timezone,
            #[cfg(feature = "persistence")]
            persistence_tx: None,
            #[cfg(feature = "persistence")]
            snapshot_interval: Duration::from_secs(60),
            #[cfg(feature = "persistence")]
            last_snapshot_at: None,
            last_wall_date: None,
        }
    }

    /// The publisher (C9) to notify after each Reading is merged (spec.md
    /// §4.5 step 5: "publish a snapshot event").
    pub fn with_publisher(mut self, publisher: Arc<Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Wires the dedicated persistence writer (spec.md §5: "the aggregator
    /// thread schedules writes via a dedicated writer worker"). Power
    /// snapshots are scheduled every `snapshot_interval`; daily rollups are
    /// scheduled when a Reading's local date crosses local midnight.
    #[cfg(feature = "persistence")]
    pub fn with_persistence(
        mut self,
        persistence_tx: mpsc::Sender<crate::persistence::writer::PersistenceJob>,
        snapshot_interval: Duration,
    ) -> Self {
        self.persistence_tx = Some(persistence_tx);
        self.snapshot_interval = snapshot_interval;
        self
    }

    pub fn state(&self) -> &SystemState {
        &self.state
    }

    /// Drains the reading channel until the sender side is dropped,
    /// merging each Reading in turn. Never interleaves the key-writes of
    /// one Reading with another (spec.md §4.5 ordering guarantee) because
    /// each Reading is merged to completion before the next is received.
    pub async fn run(mut self) -> SystemState {
        while let Some(reading) = self.reading_rx.recv().await {
            self.merge(reading);
        }
        self.state
    }

    fn merge(&mut self, reading: Reading) {
        for (key, value) in reading.values {
            self.apply(&reading.instance_id, key, value, reading.monotonic_ts, reading.wall_ts_utc);
        }
        self.recompute_derived(&reading.instance_id, reading.wall_ts_utc);
        #[cfg(feature = "persistence")]
        self.maybe_persist(reading.wall_ts_utc);
        #[cfg(not(feature = "persistence"))]
        self.track_local_date(reading.wall_ts_utc);
        if let Some(publisher) = &self.publisher {
            publisher.publish(Arc::new(self.state.clone()));
        }
    }

    /// Updates the local-date tracker used to detect midnight rollover,
    /// without the persistence feature there is nothing to roll up into.
    #[cfg(not(feature = "persistence"))]
    fn track_local_date(&mut self, wall_ts: chrono::DateTime<chrono::Utc>) {
        self.last_wall_date = Some(wall_ts.with_timezone(&self.timezone).date_naive());
    }

    /// Schedules power snapshots (every `snapshot_interval`) and a daily
    /// rollup (on local-midnight crossing) onto the persistence writer
    /// channel. Uses `try_send` so a full writer queue drops a snapshot
    /// rather than stalling the merge hot path.
    #[cfg(feature = "persistence")]
    fn maybe_persist(&mut self, wall_ts: chrono::DateTime<chrono::Utc>) {
        use crate::persistence::writer::PersistenceJob;
        use crate::persistence::{DailySummary, PowerHistoryRow};

        if let Some(tx) = &self.persistence_tx {
            let now = Instant::now();
            let due = self
                .last_snapshot_at
                .map(|t| now.duration_since(t) >= self.snapshot_interval)
                .unwrap_or(true);
            if due {
                self.last_snapshot_at = Some(now);
                let get = |k: &StandardKey| self.state.get(k).and_then(|e| e.value.as_f64());
                let row = PowerHistoryRow {
                    soc_percent: get(&StandardKey::BatteryStateOfChargePercent),
                    pv_watts: get(&StandardKey::PvTotalDcPowerWatts),
                    battery_watts: get(&StandardKey::BatteryPowerWatts),
                    load_watts: get(&StandardKey::LoadTotalPowerWatts),
                    grid_watts_signed: get(&StandardKey::GridTotalActivePowerWatts),
                };
                let _ = tx.try_send(PersistenceJob::PowerSnapshot { wall_ts, row });
            }

            let local_date = wall_ts.with_timezone(&self.timezone).date_naive();
            match self.last_wall_date {
                None => self.last_wall_date = Some(local_date),
                Some(prev) if prev != local_date => {
                    let get = |k: &StandardKey| self.state.get(k).and_then(|e| e.value.as_f64()).unwrap_or(0.0);
                    let summary = DailySummary {
                        pv_yield_kwh: get(&StandardKey::EnergyPvDailyKwh),
                        load_energy_kwh: get(&StandardKey::EnergyLoadDailyKwh),
                        battery_charge_kwh: get(&StandardKey::EnergyBatteryChargeDailyKwh),
                        battery_discharge_kwh: get(&StandardKey::EnergyBatteryDischargeDailyKwh),
                        grid_import_kwh: get(&StandardKey::EnergyGridImportDailyKwh),
                        grid_export_kwh: get(&StandardKey::EnergyGridExportDailyKwh),
                    };
                    let _ = tx.try_send(PersistenceJob::DailyRollup { date: prev, summary });
                    self.last_wall_date = Some(local_date);
                }
                Some(_) => {}
            }
        }
    }

    fn apply(
        &mut self,
        instance_id: &str,
        key: StandardKey,
        value: Value,
        now: std::time::Instant,
        wall_ts: chrono::DateTime<chrono::Utc>,
    ) {
        let routed_key = if key.is_per_instance_namespaced() {
            namespace(&key, instance_id)
        } else {
            key
        };

        let Some(numeric) = value.as_f64() else {
            // Non-numeric values (text, mappings) bypass the filter: it only
            // reasons about scalar magnitudes.
            self.state.set(routed_key, value, instance_id, wall_ts);
            return;
        };

        match self.filter.accept(&routed_key, numeric, now, wall_ts) {
            FilterDecision::Accept(accepted) => {
                self.state.set(routed_key, Value::Number(accepted), instance_id, wall_ts);
            }
            FilterDecision::Reject(_) => {
                // Previous accepted value stays; the filter already logged
                // and counted the rejection.
            }
        }
    }

    /// spec.md §4.5 step 4: derived fields, tolerating missing inputs by
    /// leaving the field unset rather than guessing.
    fn recompute_derived(&mut self, instance_id: &str, wall_ts: chrono::DateTime<chrono::Utc>) {
        let get = |k: &StandardKey| self.state.get(k).and_then(|e| e.value.as_f64());

        if let (Some(pv_dc), Some(battery), Some(grid)) = (
            get(&StandardKey::PvTotalDcPowerWatts),
            get(&StandardKey::BatteryPowerWatts),
            get(&StandardKey::GridTotalActivePowerWatts),
        ) {
            let load = pv_dc - grid - battery;
            self.state
                .set(StandardKey::LoadTotalPowerWatts, Value::Number(load), instance_id, wall_ts);
        }

        if let (Some(pv_daily), Some(export), Some(charge), Some(import), Some(discharge)) = (
            get(&StandardKey::EnergyPvDailyKwh),
            get(&StandardKey::EnergyGridExportDailyKwh),
            get(&StandardKey::EnergyBatteryChargeDailyKwh),
            get(&StandardKey::EnergyGridImportDailyKwh),
            get(&StandardKey::EnergyBatteryDischargeDailyKwh),
        ) {
            let load = (pv_daily - export - charge + import + discharge).max(0.0);
            self.state
                .set(StandardKey::EnergyLoadDailyKwh, Value::Number(load), instance_id, wall_ts);
        }
    }
}

/// Namespaces a per-instance key (e.g. categorized alerts) so distinct
/// instances don't clobber each other's entries in `SystemState`, which is
/// keyed only by `StandardKey`.
fn namespace(key: &StandardKey, instance_id: &str) -> StandardKey {
    StandardKey::Unknown(format!("{}::{}", key.canonical_name(), instance_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn filter_config() -> FilterConfig {
        FilterConfig {
            confirmation_samples: 3,
            decrease_window_minutes: 10,
            min_consistent_samples: 5,
            filter_state_ttl_minutes: 5,
            daily_limits_kwh: BTreeMap::new(),
            per_key_base_rates: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn merges_reading_and_computes_load_total_power() {
        let (tx, rx) = mpsc::channel(8);
        let mut aggregator = Aggregator::new(&filter_config(), Tz::UTC, rx);

        let reading = Reading::new("inv1")
            .with_value(StandardKey::PvTotalDcPowerWatts, 1000.0)
            .with_value(StandardKey::GridTotalActivePowerWatts, 200.0)
            .with_value(StandardKey::BatteryPowerWatts, 300.0);
        tx.send(reading).await.unwrap();
        drop(tx);

        let state = aggregator.run().await;
        assert_eq!(
            state.get(&StandardKey::LoadTotalPowerWatts).unwrap().value,
            Value::Number(500.0)
        );
    }

    #[tokio::test]
    async fn missing_inputs_leave_derived_field_unset() {
        let (tx, rx) = mpsc::channel(8);
        let mut aggregator = Aggregator::new(&filter_config(), Tz::UTC, rx);
        tx.send(Reading::new("inv1").with_value(StandardKey::PvTotalDcPowerWatts, 1000.0))
            .await
            .unwrap();
        drop(tx);

        let state = aggregator.run().await;
        assert!(state.get(&StandardKey::LoadTotalPowerWatts).is_none());
    }

    #[tokio::test]
    async fn derived_field_is_recomputed_on_every_merge_not_frozen() {
        let (tx, rx) = mpsc::channel(8);
        let mut aggregator = Aggregator::new(&filter_config(), Tz::UTC, rx);

        tx.send(
            Reading::new("inv1")
                .with_value(StandardKey::PvTotalDcPowerWatts, 1000.0)
                .with_value(StandardKey::GridTotalActivePowerWatts, 200.0)
                .with_value(StandardKey::BatteryPowerWatts, 300.0),
        )
        .await
        .unwrap();
        tx.send(
            Reading::new("inv1")
                .with_value(StandardKey::PvTotalDcPowerWatts, 1200.0)
                .with_value(StandardKey::GridTotalActivePowerWatts, 400.0)
                .with_value(StandardKey::BatteryPowerWatts, 100.0),
        )
        .await
        .unwrap();
        drop(tx);

        let state = aggregator.run().await;
        let entry = state.get(&StandardKey::LoadTotalPowerWatts).unwrap();
        assert_eq!(entry.value, Value::Number(700.0));
    }

    #[tokio::test]
    async fn per_instance_namespaced_keys_do_not_clobber() {
        let (tx, rx) = mpsc::channel(8);
        let mut aggregator = Aggregator::new(&filter_config(), Tz::UTC, rx);

        let mut alerts_a = BTreeMap::new();
        alerts_a.insert("fault".to_string(), Value::Bool(true));
        let mut alerts_b = BTreeMap::new();
        alerts_b.insert("fault".to_string(), Value::Bool(false));

        tx.send(Reading::new("a").with_value(StandardKey::OperationalCategorizedAlertsDict, Value::Mapping(alerts_a)))
            .await
            .unwrap();
        tx.send(Reading::new("b").with_value(StandardKey::OperationalCategorizedAlertsDict, Value::Mapping(alerts_b)))
            .await
            .unwrap();
        drop(tx);

        let state = aggregator.run().await;
        assert_eq!(state.len(), 2);
    }
}
