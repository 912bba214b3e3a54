//! Configuration loading (spec.md §6, SPEC_FULL.md §10.4): a hand-rolled
//! `key = value` parser feeding `validator`-checked typed structs.

pub mod parser;
pub mod schema;

use crate::error::ConfigError;
use schema::{
    AppConfig, ConnectionSpec, DeyeModelSeries, FilterConfig, GeneralConfig, InstanceConfig,
    InverterSystemConfig, PersistenceConfig,
};
use std::collections::BTreeMap;
use std::path::Path;
use validator::Validate;

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let map = parser::parse_str(contents)?;
        let config = build_app_config(&map)?;
        config
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(config)
    }
}

fn build_app_config(map: &BTreeMap<String, String>) -> Result<AppConfig, ConfigError> {
    let general = build_general(map)?;
    let inverter_system = build_inverter_system(map)?;
    let filter = build_filter(map);
    let persistence = build_persistence(map)?;
    let instances = general
        .plugin_instances
        .iter()
        .map(|name| build_instance(map, name))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AppConfig {
        general,
        inverter_system,
        filter,
        persistence,
        instances,
    })
}

fn required<'a>(map: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str, ConfigError> {
    map.get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
}

fn parse_typed<T: std::str::FromStr>(map: &BTreeMap<String, String>, key: &str) -> Result<T, ConfigError> {
    required(map, key)?
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: "could not parse value".to_string(),
        })
}

fn parse_typed_or<T: std::str::FromStr>(map: &BTreeMap<String, String>, key: &str, default: T) -> Result<T, ConfigError> {
    match map.get(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: "could not parse value".to_string(),
        }),
        None => Ok(default),
    }
}

fn build_general(map: &BTreeMap<String, String>) -> Result<GeneralConfig, ConfigError> {
    let plugin_instances = required(map, "general.plugin_instances")?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    Ok(GeneralConfig {
        plugin_instances,
        poll_interval_seconds: parse_typed_or(map, "general.poll_interval_seconds", 5)?,
        local_timezone: map
            .get("general.local_timezone")
            .cloned()
            .unwrap_or_else(|| "UTC".to_string()),
        max_reconnect_attempts: parse_typed_or(map, "general.max_reconnect_attempts", 5)?,
        shutdown_grace_seconds: parse_typed_or(map, "general.shutdown_grace_seconds", 10)?,
    })
}

fn build_persistence(map: &BTreeMap<String, String>) -> Result<PersistenceConfig, ConfigError> {
    let default = PersistenceConfig::default();
    Ok(PersistenceConfig {
        enabled: parse_typed_or(map, "persistence.enabled", default.enabled)?,
        db_path: map
            .get("persistence.db_path")
            .cloned()
            .unwrap_or(default.db_path),
        snapshot_interval_seconds: parse_typed_or(
            map,
            "persistence.snapshot_interval_seconds",
            default.snapshot_interval_seconds,
        )?,
        history_max_age_hours: parse_typed_or(
            map,
            "persistence.history_max_age_hours",
            default.history_max_age_hours,
        )?,
    })
}

fn build_inverter_system(map: &BTreeMap<String, String>) -> Result<InverterSystemConfig, ConfigError> {
    Ok(InverterSystemConfig {
        mppt_count: parse_typed(map, "inverter_system.mppt_count")?,
        pv_peak_watts: parse_typed(map, "inverter_system.pv_peak_watts")?,
        ac_max_watts: parse_typed(map, "inverter_system.ac_max_watts")?,
        battery_usable_kwh: parse_typed(map, "inverter_system.battery_usable_kwh")?,
        battery_max_charge_watts: parse_typed(map, "inverter_system.battery_max_charge_watts")?,
        battery_max_discharge_watts: parse_typed(map, "inverter_system.battery_max_discharge_watts")?,
    })
}

fn build_filter(map: &BTreeMap<String, String>) -> FilterConfig {
    let mut daily_limits_kwh = BTreeMap::new();
    let mut per_key_base_rates = BTreeMap::new();
    let limit_prefix = "filter.daily_limit.";
    let rate_prefix = "filter.base_rate.";
    for (k, v) in map {
        if let Some(key) = k.strip_prefix(limit_prefix) {
            if let Ok(limit) = v.parse() {
                daily_limits_kwh.insert(key.to_string(), limit);
            }
        } else if let Some(key) = k.strip_prefix(rate_prefix) {
            if let Ok(rate) = v.parse() {
                per_key_base_rates.insert(key.to_string(), rate);
            }
        }
    }

    FilterConfig {
        confirmation_samples: parse_typed_or(map, "filter.confirmation_samples", 3).unwrap_or(3),
        decrease_window_minutes: parse_typed_or(map, "filter.decrease_window_minutes", 10).unwrap_or(10),
        min_consistent_samples: parse_typed_or(map, "filter.min_consistent_samples", 5).unwrap_or(5),
        filter_state_ttl_minutes: parse_typed_or(map, "filter.filter_state_ttl_minutes", 5).unwrap_or(5),
        daily_limits_kwh,
        per_key_base_rates,
    }
}

fn build_instance(map: &BTreeMap<String, String>, name: &str) -> Result<InstanceConfig, ConfigError> {
    let prefixed = |field: &str| format!("{name}.{field}");

    let plugin_type = required(map, &prefixed("plugin_type"))?.to_string();
    let connection_type = required(map, &prefixed("connection_type"))?;

    let connection = match connection_type {
        "tcp" => ConnectionSpec::Tcp {
            host: required(map, &prefixed("host"))?.to_string(),
            port: parse_typed(map, &prefixed("port"))?,
        },
        "serial" => ConnectionSpec::Serial {
            port: required(map, &prefixed("port"))?.to_string(),
            baud: parse_typed(map, &prefixed("baud"))?,
        },
        other => {
            return Err(ConfigError::InvalidValue {
                key: prefixed("connection_type"),
                message: format!("expected tcp|serial, got {other:?}"),
            })
        }
    };

    let deye_model_series = match map.get(&prefixed("deye_model_series")).map(|s| s.as_str()) {
        None => None,
        Some("modern_hybrid") => Some(DeyeModelSeries::ModernHybrid),
        Some("legacy_hybrid") => Some(DeyeModelSeries::LegacyHybrid),
        Some("three_phase") => Some(DeyeModelSeries::ThreePhase),
        Some(other) => {
            return Err(ConfigError::InvalidValue {
                key: prefixed("deye_model_series"),
                message: format!("unknown deye_model_series {other:?}"),
            })
        }
    };

    let powmr_protocol_version = match map.get(&prefixed("powmr_protocol_version")) {
        Some(raw) => Some(raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: prefixed("powmr_protocol_version"),
            message: "expected 1 or 2".to_string(),
        })?),
        None => None,
    };

    Ok(InstanceConfig {
        name: name.to_string(),
        plugin_type,
        connection,
        slave_address: parse_typed(map, &prefixed("slave_address"))?,
        modbus_timeout_seconds: parse_typed_or(map, &prefixed("modbus_timeout_seconds"), 5)?,
        inter_read_delay_ms: parse_typed_or(map, &prefixed("inter_read_delay_ms"), 50)?,
        max_regs_per_read: parse_typed_or(map, &prefixed("max_regs_per_read"), 60)?,
        max_register_gap: parse_typed_or(map, &prefixed("max_register_gap"), 10)?,
        max_read_retries_per_group: parse_typed_or(map, &prefixed("max_read_retries_per_group"), 2)?,
        deye_model_series,
        powmr_protocol_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> String {
        r#"
general.plugin_instances = solar1
general.poll_interval_seconds = 5
general.local_timezone = Europe/Amsterdam
general.max_reconnect_attempts = 5

inverter_system.mppt_count = 2
inverter_system.pv_peak_watts = 6000
inverter_system.ac_max_watts = 5000
inverter_system.battery_usable_kwh = 10
inverter_system.battery_max_charge_watts = 3000
inverter_system.battery_max_discharge_watts = 3000

filter.daily_limit.energy_pv_daily_kwh = 100

solar1.plugin_type = generic.modbus_inverter
solar1.connection_type = tcp
solar1.host = 192.168.1.50
solar1.port = 502
solar1.slave_address = 1
"#
        .to_string()
    }

    #[test]
    fn loads_a_minimal_valid_config() {
        let config = AppConfig::from_str(&sample_config()).unwrap();
        assert_eq!(config.general.plugin_instances, vec!["solar1"]);
        assert_eq!(config.instances.len(), 1);
        assert_eq!(config.instances[0].plugin_type, "generic.modbus_inverter");
        assert_eq!(config.filter.daily_limits_kwh.get("energy_pv_daily_kwh"), Some(&100.0));
    }

    #[test]
    fn missing_required_key_is_rejected() {
        let broken = sample_config().replace("general.plugin_instances = solar1", "");
        let err = AppConfig::from_str(&broken).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(_)));
    }

    #[test]
    fn unknown_connection_type_is_rejected() {
        let broken = sample_config().replace("solar1.connection_type = tcp", "solar1.connection_type = bluetooth");
        let err = AppConfig::from_str(&broken).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
