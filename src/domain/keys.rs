//! `StandardKey` — the closed, versioned vocabulary of quantities the
//! aggregator and every publisher understand (spec.md §3). Anything a
//! plugin produces outside this set is dropped with a one-time warning
//! (see `plugin::translate`).

use std::fmt;
use std::str::FromStr;

/// A member of the fixed StandardKey vocabulary.
///
/// Cell-indexed and alert-category keys are modeled as variants carrying
/// an index/category rather than as 1-per-index enum members, which would
/// make the vocabulary open-ended. `all_cell_voltage_keys` and friends
/// enumerate the closed range the plugins are allowed to use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StandardKey {
    PvTotalDcPowerWatts,
    PvStringVoltageVolts(u8),
    PvStringCurrentAmps(u8),
    GridTotalActivePowerWatts,
    GridFrequencyHz,
    GridVoltageVolts,
    LoadTotalPowerWatts,
    BatteryPowerWatts,
    BatteryStateOfChargePercent,
    BatteryStateOfHealthPercent,
    BatteryVoltageVolts,
    BatteryCurrentAmps,
    BatteryCellVoltage(u16),
    BatteryCellTemperature(u8),
    EnergyPvDailyKwh,
    EnergyLoadDailyKwh,
    EnergyBatteryChargeDailyKwh,
    EnergyBatteryDischargeDailyKwh,
    EnergyGridImportDailyKwh,
    EnergyGridExportDailyKwh,
    OperationalInverterStatusText,
    OperationalManufacturerText,
    OperationalModelText,
    OperationalCategorizedAlertsDict,
    StaticDeviceCategory,
    /// Escape hatch used only by tests / forward compatibility checks; never
    /// emitted by a real plugin. Carries the raw string so unrecognized
    /// keys can still be logged with their original spelling.
    Unknown(String),
}

impl StandardKey {
    /// Monotonically increasing daily-energy counters, per spec.md §4.6.
    pub fn is_daily_energy(&self) -> bool {
        matches!(
            self,
            StandardKey::EnergyPvDailyKwh
                | StandardKey::EnergyLoadDailyKwh
                | StandardKey::EnergyBatteryChargeDailyKwh
                | StandardKey::EnergyBatteryDischargeDailyKwh
                | StandardKey::EnergyGridImportDailyKwh
                | StandardKey::EnergyGridExportDailyKwh
        )
    }

    /// True for keys the publisher namespaces by instance id before merging
    /// (spec.md §4.5 step 2) instead of overwriting a single global slot.
    pub fn is_per_instance_namespaced(&self) -> bool {
        matches!(self, StandardKey::OperationalCategorizedAlertsDict)
    }

    pub fn canonical_name(&self) -> String {
        match self {
            StandardKey::PvTotalDcPowerWatts => "pv_total_dc_power_watts".into(),
            StandardKey::PvStringVoltageVolts(n) => format!("pv_string_{n}_voltage_volts"),
            StandardKey::PvStringCurrentAmps(n) => format!("pv_string_{n}_current_amps"),
            StandardKey::GridTotalActivePowerWatts => "grid_total_active_power_watts".into(),
            StandardKey::GridFrequencyHz => "grid_frequency_hz".into(),
            StandardKey::GridVoltageVolts => "grid_voltage_volts".into(),
            StandardKey::LoadTotalPowerWatts => "load_total_power_watts".into(),
            StandardKey::BatteryPowerWatts => "battery_power_watts".into(),
            StandardKey::BatteryStateOfChargePercent => "battery_state_of_charge_percent".into(),
            StandardKey::BatteryStateOfHealthPercent => "battery_state_of_health_percent".into(),
            StandardKey::BatteryVoltageVolts => "battery_voltage_volts".into(),
            StandardKey::BatteryCurrentAmps => "battery_current_amps".into(),
            StandardKey::BatteryCellVoltage(n) => format!("bms_cell_voltage_{n}"),
            StandardKey::BatteryCellTemperature(n) => format!("bms_cell_temperature_{n}"),
            StandardKey::EnergyPvDailyKwh => "energy_pv_daily_kwh".into(),
            StandardKey::EnergyLoadDailyKwh => "energy_load_daily_kwh".into(),
            StandardKey::EnergyBatteryChargeDailyKwh => "energy_battery_charge_daily_kwh".into(),
            StandardKey::EnergyBatteryDischargeDailyKwh => {
                "energy_battery_discharge_daily_kwh".into()
            }
            StandardKey::EnergyGridImportDailyKwh => "energy_grid_import_daily_kwh".into(),
            StandardKey::EnergyGridExportDailyKwh => "energy_grid_export_daily_kwh".into(),
            StandardKey::OperationalInverterStatusText => "operational_inverter_status_text".into(),
            StandardKey::OperationalManufacturerText => "operational_manufacturer_text".into(),
            StandardKey::OperationalModelText => "operational_model_text".into(),
            StandardKey::OperationalCategorizedAlertsDict => {
                "operational_categorized_alerts_dict".into()
            }
            StandardKey::StaticDeviceCategory => "static_device_category".into(),
            StandardKey::Unknown(raw) => raw.clone(),
        }
    }
}

impl fmt::Display for StandardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_name())
    }
}

impl FromStr for StandardKey {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pv_total_dc_power_watts" => StandardKey::PvTotalDcPowerWatts,
            "grid_total_active_power_watts" => StandardKey::GridTotalActivePowerWatts,
            "grid_frequency_hz" => StandardKey::GridFrequencyHz,
            "grid_voltage_volts" => StandardKey::GridVoltageVolts,
            "load_total_power_watts" => StandardKey::LoadTotalPowerWatts,
            "battery_power_watts" => StandardKey::BatteryPowerWatts,
            "battery_state_of_charge_percent" => StandardKey::BatteryStateOfChargePercent,
            "battery_state_of_health_percent" => StandardKey::BatteryStateOfHealthPercent,
            "battery_voltage_volts" => StandardKey::BatteryVoltageVolts,
            "battery_current_amps" => StandardKey::BatteryCurrentAmps,
            "energy_pv_daily_kwh" => StandardKey::EnergyPvDailyKwh,
            "energy_load_daily_kwh" => StandardKey::EnergyLoadDailyKwh,
            "energy_battery_charge_daily_kwh" => StandardKey::EnergyBatteryChargeDailyKwh,
            "energy_battery_discharge_daily_kwh" => StandardKey::EnergyBatteryDischargeDailyKwh,
            "energy_grid_import_daily_kwh" => StandardKey::EnergyGridImportDailyKwh,
            "energy_grid_export_daily_kwh" => StandardKey::EnergyGridExportDailyKwh,
            "operational_inverter_status_text" => StandardKey::OperationalInverterStatusText,
            "operational_manufacturer_text" => StandardKey::OperationalManufacturerText,
            "operational_model_text" => StandardKey::OperationalModelText,
            "operational_categorized_alerts_dict" => StandardKey::OperationalCategorizedAlertsDict,
            "static_device_category" => StandardKey::StaticDeviceCategory,
            other => {
                if let Some(n) = other
                    .strip_prefix("bms_cell_voltage_")
                    .and_then(|s| s.parse::<u16>().ok())
                {
                    StandardKey::BatteryCellVoltage(n)
                } else if let Some(n) = other
                    .strip_prefix("bms_cell_temperature_")
                    .and_then(|s| s.parse::<u8>().ok())
                {
                    StandardKey::BatteryCellTemperature(n)
                } else if let Some(rest) = other.strip_prefix("pv_string_") {
                    if let Some(n) = rest
                        .strip_suffix("_voltage_volts")
                        .and_then(|s| s.parse::<u8>().ok())
                    {
                        StandardKey::PvStringVoltageVolts(n)
                    } else if let Some(n) = rest
                        .strip_suffix("_current_amps")
                        .and_then(|s| s.parse::<u8>().ok())
                    {
                        StandardKey::PvStringCurrentAmps(n)
                    } else {
                        StandardKey::Unknown(other.to_string())
                    }
                } else {
                    StandardKey::Unknown(other.to_string())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_well_known_keys() {
        for key in [
            StandardKey::PvTotalDcPowerWatts,
            StandardKey::BatteryStateOfChargePercent,
            StandardKey::EnergyPvDailyKwh,
            StandardKey::BatteryCellVoltage(7),
            StandardKey::PvStringVoltageVolts(2),
        ] {
            let s = key.canonical_name();
            let parsed: StandardKey = s.parse().unwrap();
            assert_eq!(parsed, key);
        }
    }

    #[test]
    fn unknown_key_is_preserved_not_dropped_silently() {
        let key: StandardKey = "totally_unrecognized_thing".parse().unwrap();
        assert_eq!(key, StandardKey::Unknown("totally_unrecognized_thing".into()));
    }

    #[test]
    fn daily_energy_membership_is_closed() {
        assert!(StandardKey::EnergyPvDailyKwh.is_daily_energy());
        assert!(!StandardKey::BatteryStateOfChargePercent.is_daily_energy());
    }
}
