//! Maps `plugin_type` dotted-path strings (spec.md §6) to plugin
//! constructors, replacing class-inheritance dispatch (spec.md §9).

use super::plugins::generic_bms::GenericBms;
use super::plugins::generic_modbus_inverter::GenericModbusInverter;
use super::plugins::powmr_inv8851::PowmrInv8851;
use super::Plugin;
use crate::config::schema::InstanceConfig;
use crate::error::ConfigError;

pub fn build_plugin(instance: &InstanceConfig) -> Result<Box<dyn Plugin>, ConfigError> {
    match instance.plugin_type.as_str() {
        "generic.modbus_inverter" => Ok(Box::new(GenericModbusInverter::from_config(instance)?)),
        "generic.modbus_bms" => Ok(Box::new(GenericBms::from_config(instance)?)),
        "powmr.inv8851" => Ok(Box::new(PowmrInv8851::from_config(instance)?)),
        other => Err(ConfigError::InvalidValue {
            key: format!("{}.plugin_type", instance.name),
            message: format!("unknown plugin_type {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ConnectionSpec, InstanceConfig};

    fn base_instance(plugin_type: &str) -> InstanceConfig {
        InstanceConfig {
            name: "test".to_string(),
            plugin_type: plugin_type.to_string(),
            connection: ConnectionSpec::Tcp {
                host: "127.0.0.1".to_string(),
                port: 502,
            },
            slave_address: 1,
            modbus_timeout_seconds: 5,
            inter_read_delay_ms: 50,
            max_regs_per_read: 60,
            max_register_gap: 10,
            max_read_retries_per_group: 2,
            deye_model_series: None,
            powmr_protocol_version: None,
        }
    }

    #[test]
    fn unknown_plugin_type_is_rejected() {
        let instance = base_instance("no.such.plugin");
        let err = build_plugin(&instance).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn known_plugin_types_construct() {
        assert!(build_plugin(&base_instance("generic.modbus_inverter")).is_ok());
        assert!(build_plugin(&base_instance("generic.modbus_bms")).is_ok());
        let mut powmr = base_instance("powmr.inv8851");
        powmr.powmr_protocol_version = Some(1);
        assert!(build_plugin(&powmr).is_ok());
    }
}
