//! Adaptive filter (spec.md §4.6, C6): rejects physically impossible
//! spikes using elapsed-time-aware thresholds and hard daily ceilings,
//! and self-corrects from a persistent lower reading.
//!
//! Δt is measured on the monotonic clock, not wall-clock, per the design
//! note in spec.md §9 ("all time arithmetic in the filter... uses a
//! monotonic clock"); wall-clock is used only to detect local-midnight
//! rollover. See `DESIGN.md` for why this reading of §4.6 was chosen over
//! its literal "wall-clock elapsed" phrasing.

use crate::config::schema::FilterConfig;
use crate::domain::StandardKey;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    HardCeiling,
    ImmediateSpike,
    PendingConfirmation,
    PendingDecrease,
    OutOfRange,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterDecision {
    Accept(f64),
    Reject(RejectReason),
}

struct ConfirmationState {
    candidate: f64,
    count: u32,
}

struct DecreaseState {
    candidate: f64,
    count: u32,
    first_seen: Instant,
}

struct EnergyKeyState {
    last_accepted: f64,
    last_accept_instant: Instant,
    last_accept_wall: DateTime<Utc>,
    confirmation: Option<ConfirmationState>,
    decrease: Option<DecreaseState>,
    last_touched: Instant,
}

struct InstantaneousKeyState {
    last_accepted: f64,
    last_touched: Instant,
}

/// Built-in sanity ranges for instantaneous quantities (spec.md §4.6:
/// "the filter applies only range sanity... configurable per key"); the
/// configuration file format (§6) does not expose per-key range
/// overrides, so these defaults are the whole of it.
fn instantaneous_range(key: &StandardKey) -> Option<(f64, f64)> {
    match key {
        StandardKey::BatteryStateOfChargePercent | StandardKey::BatteryStateOfHealthPercent => {
            Some((0.0, 100.0))
        }
        StandardKey::GridFrequencyHz => Some((40.0, 70.0)),
        StandardKey::GridVoltageVolts | StandardKey::BatteryVoltageVolts => Some((0.0, 1000.0)),
        _ => None,
    }
}

pub struct AdaptiveFilter {
    confirmation_samples: u32,
    decrease_window: Duration,
    min_consistent_samples: u32,
    state_ttl: Duration,
    daily_limits: BTreeMap<StandardKey, f64>,
    base_rates: BTreeMap<StandardKey, f64>,
    timezone: Tz,
    energy_states: BTreeMap<StandardKey, EnergyKeyState>,
    instantaneous_states: BTreeMap<StandardKey, InstantaneousKeyState>,
    rejection_counts: BTreeMap<StandardKey, u64>,
}

impl AdaptiveFilter {
    pub fn new(config: &FilterConfig, timezone: Tz) -> Self {
        let mut daily_limits = BTreeMap::new();
        for (raw, limit) in &config.daily_limits_kwh {
            daily_limits.insert(raw.parse::<StandardKey>().unwrap(), *limit);
        }
        let mut base_rates = BTreeMap::new();
        for (raw, rate) in &config.per_key_base_rates {
            base_rates.insert(raw.parse::<StandardKey>().unwrap(), *rate);
        }

        Self {
            confirmation_samples: config.confirmation_samples,
            decrease_window: Duration::from_secs(config.decrease_window_minutes as u64 * 60),
            min_consistent_samples: config.min_consistent_samples,
            state_ttl: Duration::from_secs(config.filter_state_ttl_minutes as u64 * 60),
            daily_limits,
            base_rates,
            timezone,
            energy_states: BTreeMap::new(),
            instantaneous_states: BTreeMap::new(),
            rejection_counts: BTreeMap::new(),
        }
    }

    /// `base_rate` is taken from the per-key configuration override when
    /// present; otherwise `limit_kwh / 86400` is the fallback (spec.md
    /// §9 open question, resolved in favor of explicit overrides).
    fn base_rate(&self, key: &StandardKey) -> f64 {
        if let Some(rate) = self.base_rates.get(key) {
            return *rate;
        }
        self.daily_limits.get(key).copied().unwrap_or(0.0) / 86_400.0
    }

    fn daily_limit(&self, key: &StandardKey) -> f64 {
        self.daily_limits.get(key).copied().unwrap_or(f64::MAX)
    }

    pub fn rejection_count(&self, key: &StandardKey) -> u64 {
        self.rejection_counts.get(key).copied().unwrap_or(0)
    }

    fn record_rejection(&mut self, key: &StandardKey, reason: RejectReason, proposed: f64, elapsed: Duration) {
        *self.rejection_counts.entry(key.clone()).or_insert(0) += 1;
        tracing::warn!(
            key = %key,
            proposed,
            elapsed_s = elapsed.as_secs_f64(),
            reason = ?reason,
            "filter rejected sample"
        );
    }

    /// Evaluate one `(key, proposed)` sample. `now` drives elapsed-time
    /// arithmetic; `wall_ts` is used only for the daily-midnight check.
    pub fn accept(&mut self, key: &StandardKey, proposed: f64, now: Instant, wall_ts: DateTime<Utc>) -> FilterDecision {
        self.expire_stale(now);
        if key.is_daily_energy() {
            self.accept_energy(key, proposed, now, wall_ts)
        } else {
            self.accept_instantaneous(key, proposed, now)
        }
    }

    fn accept_energy(&mut self, key: &StandardKey, proposed: f64, now: Instant, wall_ts: DateTime<Utc>) -> FilterDecision {
        let limit = self.daily_limit(key);
        if proposed > limit {
            self.record_rejection(key, RejectReason::HardCeiling, proposed, Duration::ZERO);
            return FilterDecision::Reject(RejectReason::HardCeiling);
        }

        let crossed_midnight = self
            .energy_states
            .get(key)
            .map(|s| local_date(s.last_accept_wall, self.timezone) != local_date(wall_ts, self.timezone))
            .unwrap_or(false);

        if crossed_midnight {
            self.energy_states.remove(key);
        }

        let Some(state) = self.energy_states.get_mut(key) else {
            self.energy_states.insert(
                key.clone(),
                EnergyKeyState {
                    last_accepted: proposed,
                    last_accept_instant: now,
                    last_accept_wall: wall_ts,
                    confirmation: None,
                    decrease: None,
                    last_touched: now,
                },
            );
            return FilterDecision::Accept(proposed);
        };

        state.last_touched = now;
        let elapsed = now.saturating_duration_since(state.last_accept_instant);
        let bounded_secs = elapsed.as_secs_f64().clamp(1.0, 3600.0);
        let max_increase = self.base_rate(key) * bounded_secs;
        let diff = proposed - state.last_accepted;

        if diff <= 0.0 {
            let consistent = state
                .decrease
                .as_ref()
                .map(|d| (d.candidate - proposed).abs() <= (limit * 0.02).max(0.001))
                .unwrap_or(false);

            if consistent {
                let d = state.decrease.as_mut().unwrap();
                d.count += 1;
            } else {
                state.decrease = Some(DecreaseState {
                    candidate: proposed,
                    count: 1,
                    first_seen: now,
                });
            }

            let d = state.decrease.as_ref().unwrap();
            let window_elapsed = now.saturating_duration_since(d.first_seen);
            if d.count >= self.min_consistent_samples && window_elapsed >= self.decrease_window {
                state.last_accepted = proposed;
                state.last_accept_instant = now;
                state.last_accept_wall = wall_ts;
                state.confirmation = None;
                state.decrease = None;
                return FilterDecision::Accept(proposed);
            }

            self.record_rejection(key, RejectReason::PendingDecrease, proposed, elapsed);
            return FilterDecision::Reject(RejectReason::PendingDecrease);
        }

        state.decrease = None;

        if diff <= max_increase {
            state.last_accepted = proposed;
            state.last_accept_instant = now;
            state.last_accept_wall = wall_ts;
            state.confirmation = None;
            return FilterDecision::Accept(proposed);
        }

        if diff > 10.0 * max_increase {
            state.confirmation = None;
            self.record_rejection(key, RejectReason::ImmediateSpike, proposed, elapsed);
            return FilterDecision::Reject(RejectReason::ImmediateSpike);
        }

        let consistent = state
            .confirmation
            .as_ref()
            .map(|c| (c.candidate - proposed).abs() <= (limit * 0.02).max(0.001))
            .unwrap_or(false);

        if consistent {
            state.confirmation.as_mut().unwrap().count += 1;
        } else {
            state.confirmation = Some(ConfirmationState { candidate: proposed, count: 1 });
        }

        if state.confirmation.as_ref().unwrap().count >= self.confirmation_samples {
            state.last_accepted = proposed;
            state.last_accept_instant = now;
            state.last_accept_wall = wall_ts;
            state.confirmation = None;
            return FilterDecision::Accept(proposed);
        }

        self.record_rejection(key, RejectReason::PendingConfirmation, proposed, elapsed);
        FilterDecision::Reject(RejectReason::PendingConfirmation)
    }

    fn accept_instantaneous(&mut self, key: &StandardKey, proposed: f64, now: Instant) -> FilterDecision {
        if let Some((min, max)) = instantaneous_range(key) {
            if proposed < min || proposed > max {
                self.record_rejection(key, RejectReason::OutOfRange, proposed, Duration::ZERO);
                return FilterDecision::Reject(RejectReason::OutOfRange);
            }
        }

        if let Some(state) = self.instantaneous_states.get(key) {
            // Soft rate-of-change check: logged, never rejects.
            let rate = (proposed - state.last_accepted).abs();
            if rate > instantaneous_soft_threshold(key) {
                tracing::debug!(key = %key, rate, "instantaneous value changed sharply between polls");
            }
        }

        self.instantaneous_states.insert(
            key.clone(),
            InstantaneousKeyState { last_accepted: proposed, last_touched: now },
        );
        FilterDecision::Accept(proposed)
    }

    fn expire_stale(&mut self, now: Instant) {
        self.energy_states
            .retain(|_, s| now.saturating_duration_since(s.last_touched) < self.state_ttl);
        self.instantaneous_states
            .retain(|_, s| now.saturating_duration_since(s.last_touched) < self.state_ttl);
    }
}

fn instantaneous_soft_threshold(key: &StandardKey) -> f64 {
    match key {
        StandardKey::BatteryStateOfChargePercent => 20.0,
        StandardKey::GridVoltageVolts | StandardKey::BatteryVoltageVolts => 50.0,
        _ => f64::MAX,
    }
}

fn local_date(wall_ts: DateTime<Utc>, tz: Tz) -> chrono::NaiveDate {
    tz.from_utc_datetime(&wall_ts.naive_utc()).date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    fn config(base_rate: f64, limit: f64) -> FilterConfig {
        let mut daily_limits_kwh = Map::new();
        daily_limits_kwh.insert("energy_pv_daily_kwh".to_string(), limit);
        let mut per_key_base_rates = Map::new();
        per_key_base_rates.insert("energy_pv_daily_kwh".to_string(), base_rate);
        FilterConfig {
            confirmation_samples: 3,
            decrease_window_minutes: 10,
            min_consistent_samples: 5,
            filter_state_ttl_minutes: 5,
            daily_limits_kwh,
            per_key_base_rates,
        }
    }

    #[test]
    fn s3_filter_spike_is_rejected_by_ten_times_rule() {
        let mut filter = AdaptiveFilter::new(&config(0.0275, 100.0), Tz::UTC);
        let key = StandardKey::EnergyPvDailyKwh;
        let t0 = Instant::now();
        let w0 = Utc::now();

        let samples = [1.000, 1.005, 9.400, 1.010, 1.015];
        let mut last_accepted = 0.0;
        for (i, &v) in samples.iter().enumerate() {
            let now = t0 + Duration::from_secs(5 * i as u64);
            let wall = w0 + chrono::Duration::seconds(5 * i as i64);
            if let FilterDecision::Accept(v) = filter.accept(&key, v, now, wall) {
                last_accepted = v;
            }
        }

        assert_eq!(last_accepted, 1.015);
        assert_eq!(filter.rejection_count(&key), 1);
    }

    #[test]
    fn s4_longer_elapsed_time_permits_a_larger_jump() {
        let mut filter = AdaptiveFilter::new(&config(0.0275, 100.0), Tz::UTC);
        let key = StandardKey::EnergyPvDailyKwh;
        let t0 = Instant::now();
        let w0 = Utc::now();

        filter.accept(&key, 1.000, t0, w0);
        let decision = filter.accept(&key, 1.300, t0 + Duration::from_secs(120), w0 + chrono::Duration::seconds(120));
        assert_eq!(decision, FilterDecision::Accept(1.300));
    }

    #[test]
    fn s4_same_jump_at_five_seconds_is_rejected() {
        let mut filter = AdaptiveFilter::new(&config(0.0275, 100.0), Tz::UTC);
        let key = StandardKey::EnergyPvDailyKwh;
        let t0 = Instant::now();
        let w0 = Utc::now();

        filter.accept(&key, 1.000, t0, w0);
        let decision = filter.accept(&key, 1.300, t0 + Duration::from_secs(5), w0 + chrono::Duration::seconds(5));
        assert!(matches!(decision, FilterDecision::Reject(_)));
    }

    #[test]
    fn s5_decrease_self_correction_after_window_and_sample_count() {
        let mut filter = AdaptiveFilter::new(&config(0.0275, 100.0), Tz::UTC);
        let key = StandardKey::EnergyPvDailyKwh;
        let t0 = Instant::now();
        let w0 = Utc::now();

        // Spike gets accepted as the (incorrect) baseline for this test,
        // simulating "a spike was previously accepted".
        filter.accept(&key, 9.4, t0, w0);

        let mut last = FilterDecision::Reject(RejectReason::PendingDecrease);
        for i in 1..=6 {
            let now = t0 + Duration::from_secs(i * 120); // 2 minutes apart, 6 samples -> 12 min span
            let wall = w0 + chrono::Duration::seconds((i * 120) as i64);
            last = filter.accept(&key, 2.1, now, wall);
        }

        assert_eq!(last, FilterDecision::Accept(2.1));
    }

    #[test]
    fn hard_ceiling_rejects_unconditionally() {
        let mut filter = AdaptiveFilter::new(&config(0.0275, 10.0), Tz::UTC);
        let key = StandardKey::EnergyPvDailyKwh;
        let decision = filter.accept(&key, 20.0, Instant::now(), Utc::now());
        assert_eq!(decision, FilterDecision::Reject(RejectReason::HardCeiling));
    }

    #[test]
    fn daily_reset_establishes_a_fresh_baseline() {
        let mut filter = AdaptiveFilter::new(&config(0.0275, 100.0), Tz::UTC);
        let key = StandardKey::EnergyPvDailyKwh;
        let t0 = Instant::now();
        let w0 = Utc.with_ymd_and_hms(2026, 7, 27, 23, 0, 0).unwrap();
        filter.accept(&key, 50.0, t0, w0);

        let next_day = w0 + chrono::Duration::hours(2); // crosses local midnight (UTC here)
        let decision = filter.accept(&key, 1.0, t0 + Duration::from_secs(7200), next_day);
        assert_eq!(decision, FilterDecision::Accept(1.0));
    }

    #[test]
    fn instantaneous_out_of_range_is_rejected() {
        let mut filter = AdaptiveFilter::new(&config(0.0275, 100.0), Tz::UTC);
        let decision = filter.accept(&StandardKey::BatteryStateOfChargePercent, 150.0, Instant::now(), Utc::now());
        assert_eq!(decision, FilterDecision::Reject(RejectReason::OutOfRange));
    }
}
