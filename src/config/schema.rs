//! Typed configuration structs (spec.md §6), built from the parsed
//! `key = value` map. Validation follows the teacher's `validator`-derive
//! convention even though the source grammar is hand-rolled, not TOML.

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GeneralConfig {
    pub plugin_instances: Vec<String>,
    #[validate(range(min = 1, max = 3600))]
    pub poll_interval_seconds: u64,
    pub local_timezone: String,
    #[validate(range(min = 1))]
    pub max_reconnect_attempts: u32,
    /// Every worker must release its transport within this many seconds of
    /// a shutdown signal, or the process force-exits (spec.md §5).
    #[validate(range(min = 1, max = 300))]
    pub shutdown_grace_seconds: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            plugin_instances: Vec::new(),
            poll_interval_seconds: 5,
            local_timezone: "UTC".to_string(),
            max_reconnect_attempts: 5,
            shutdown_grace_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub db_path: String,
    #[validate(range(min = 1, max = 3600))]
    pub snapshot_interval_seconds: u64,
    #[validate(range(min = 1))]
    pub history_max_age_hours: i64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: "solar-core.sqlite3".to_string(),
            snapshot_interval_seconds: 60,
            history_max_age_hours: 24 * 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InverterSystemConfig {
    #[validate(range(min = 1, max = 32))]
    pub mppt_count: u8,
    #[validate(range(min = 0.0))]
    pub pv_peak_watts: f64,
    #[validate(range(min = 0.0))]
    pub ac_max_watts: f64,
    #[validate(range(min = 0.0))]
    pub battery_usable_kwh: f64,
    #[validate(range(min = 0.0))]
    pub battery_max_charge_watts: f64,
    #[validate(range(min = 0.0))]
    pub battery_max_discharge_watts: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeyeModelSeries {
    ModernHybrid,
    LegacyHybrid,
    ThreePhase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionSpec {
    Tcp {
        host: String,
        port: u16,
    },
    Serial {
        port: String,
        baud: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InstanceConfig {
    pub name: String,
    pub plugin_type: String,
    #[serde(flatten)]
    pub connection: ConnectionSpec,
    pub slave_address: u8,
    #[validate(range(min = 1, max = 120))]
    pub modbus_timeout_seconds: u64,
    pub inter_read_delay_ms: u64,
    #[validate(range(min = 1, max = 125))]
    pub max_regs_per_read: u16,
    pub max_register_gap: u16,
    #[validate(range(min = 1, max = 10))]
    pub max_read_retries_per_group: u8,
    pub deye_model_series: Option<DeyeModelSeries>,
    pub powmr_protocol_version: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FilterConfig {
    #[validate(range(min = 1))]
    pub confirmation_samples: u32,
    #[validate(range(min = 1))]
    pub decrease_window_minutes: u32,
    #[validate(range(min = 1))]
    pub min_consistent_samples: u32,
    pub filter_state_ttl_minutes: u32,
    pub daily_limits_kwh: std::collections::BTreeMap<String, f64>,
    pub per_key_base_rates: std::collections::BTreeMap<String, f64>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            confirmation_samples: 3,
            decrease_window_minutes: 10,
            min_consistent_samples: 5,
            filter_state_ttl_minutes: 5,
            daily_limits_kwh: std::collections::BTreeMap::new(),
            per_key_base_rates: std::collections::BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub general: GeneralConfig,
    #[validate(nested)]
    pub inverter_system: InverterSystemConfig,
    #[validate(nested)]
    pub filter: FilterConfig,
    #[validate(nested)]
    pub persistence: PersistenceConfig,
    #[validate(nested)]
    pub instances: Vec<InstanceConfig>,
}
