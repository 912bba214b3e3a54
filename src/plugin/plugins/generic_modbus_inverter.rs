//! A representative generic hybrid-inverter register map over Modbus
//! (TCP or RTU), grounded on the common Deye/Growatt-style holding
//! register layout (spec.md §4.4).

use super::UnknownKeyWarner;
use crate::config::schema::{ConnectionSpec, InstanceConfig};
use crate::domain::{Reading, StandardKey, Value};
use crate::error::{ConfigError, PluginError};
use crate::plugin::{DeviceCategory, ParamDescriptor, ParamType, Plugin};
use crate::protocol::modbus::{
    decode_register, group_descriptors, rtu, tcp, FunctionType, Priority, ReadGroup,
    RegisterDescriptor, RegisterType,
};
use crate::transport::tcp::TcpTransport;
use crate::transport::Transport;
use async_trait::async_trait;
use std::net::ToSocketAddrs;
use std::time::Duration;

/// Upper bound on MPPT/PV-string inputs this register map probes. The
/// *actual* count is detected per spec.md §4.4 (model-code register when
/// present, otherwise nonzero-voltage inference across the first three
/// successful dynamic polls) rather than hardcoded.
const MAX_PV_STRINGS: u8 = 4;

/// Internal-only key for the raw model-code register; filtered out of
/// every `Reading` before it reaches the aggregator, since it's a
/// plugin-private detection input, not a StandardKey quantity.
const MODEL_CODE_KEY: &str = "__generic_modbus_inverter_model_code";

/// Maps a raw model-code register value to an MPPT/string count, for the
/// inverter families whose model code directly encodes it. Returns `None`
/// for unknown codes (including the common "not implemented" value 0),
/// falling back to nonzero-voltage inference.
fn mppt_count_from_model_code(code: i64) -> Option<u8> {
    match code {
        1..=4 => Some(code as u8),
        _ => None,
    }
}

fn status_dictionary(code: i64) -> &'static str {
    match code {
        0 => "standby",
        1 => "normal",
        2 => "fault",
        3 => "initializing",
        4 => "waiting",
        _ => "unknown",
    }
}

enum Framing {
    Tcp { txn: tcp::TransactionIdGenerator },
    Rtu,
}

pub struct GenericModbusInverter {
    instance_id: String,
    transport: Box<dyn Transport>,
    framing: Framing,
    slave: u8,
    connect_timeout: Duration,
    read_deadline: Duration,
    inter_read_delay: Duration,
    max_retries: u8,
    static_descriptors: Vec<RegisterDescriptor>,
    static_groups: Vec<ReadGroup>,
    dynamic_descriptors: Vec<RegisterDescriptor>,
    dynamic_groups: Vec<ReadGroup>,
    connected: bool,
    #[allow(dead_code)]
    warner: UnknownKeyWarner,
    /// `None` until detected, either from the model-code register or from
    /// three polls of nonzero-voltage inference (spec.md §4.4).
    mppt_count: Option<u8>,
    dc_voltage_ever_nonzero: [bool; MAX_PV_STRINGS as usize],
    probe_polls_done: u8,
}

impl GenericModbusInverter {
    pub fn from_config(instance: &InstanceConfig) -> Result<Self, ConfigError> {
        let (transport, framing): (Box<dyn Transport>, Framing) = match &instance.connection {
            ConnectionSpec::Tcp { host, port } => {
                let addr = (host.as_str(), *port)
                    .to_socket_addrs()
                    .map_err(|e| ConfigError::InvalidValue {
                        key: format!("{}.host", instance.name),
                        message: e.to_string(),
                    })?
                    .next()
                    .ok_or_else(|| ConfigError::InvalidValue {
                        key: format!("{}.host", instance.name),
                        message: "host resolved to no addresses".to_string(),
                    })?;
                (
                    Box::new(TcpTransport::new(addr)),
                    Framing::Tcp {
                        txn: tcp::TransactionIdGenerator::new(),
                    },
                )
            }
            ConnectionSpec::Serial { port, baud } => {
                #[cfg(feature = "serial")]
                {
                    (
                        Box::new(crate::transport::serial::SerialTransport::new(
                            port.clone(),
                            *baud,
                            8,
                            crate::transport::SerialParity::None,
                            1,
                        )),
                        Framing::Rtu,
                    )
                }
                #[cfg(not(feature = "serial"))]
                {
                    return Err(ConfigError::InvalidValue {
                        key: format!("{}.connection_type", instance.name),
                        message: "serial transport requires the `serial` feature".to_string(),
                    });
                }
            }
        };

        let static_descriptors = vec![
            RegisterDescriptor {
                key: StandardKey::OperationalManufacturerText,
                address: 0,
                register_type: RegisterType::Ascii8,
                scale: 1.0,
                is_static: true,
                priority: Priority::Summary,
                function: FunctionType::Holding,
                little_endian_words: false,
            },
            RegisterDescriptor {
                key: StandardKey::OperationalModelText,
                address: 8,
                register_type: RegisterType::Ascii8,
                scale: 1.0,
                is_static: true,
                priority: Priority::Summary,
                function: FunctionType::Holding,
                little_endian_words: false,
            },
            RegisterDescriptor {
                key: StandardKey::Unknown(MODEL_CODE_KEY.to_string()),
                address: 16,
                register_type: RegisterType::Code,
                scale: 1.0,
                is_static: true,
                priority: Priority::Summary,
                function: FunctionType::Holding,
                little_endian_words: false,
            },
        ];
        let static_groups = group_descriptors(&static_descriptors, instance.max_regs_per_read, instance.max_register_gap);

        let mut dynamic_descriptors = vec![
            desc(100, RegisterType::U16, 1.0, StandardKey::PvTotalDcPowerWatts, Priority::Critical),
            desc(101, RegisterType::I16, 1.0, StandardKey::GridTotalActivePowerWatts, Priority::Critical),
            desc(102, RegisterType::U16, 0.1, StandardKey::GridFrequencyHz, Priority::Summary),
            desc(103, RegisterType::U16, 0.1, StandardKey::GridVoltageVolts, Priority::Summary),
            desc(104, RegisterType::I16, 1.0, StandardKey::BatteryPowerWatts, Priority::Critical),
            desc(105, RegisterType::U16, 1.0, StandardKey::BatteryStateOfChargePercent, Priority::Critical),
            desc(106, RegisterType::U16, 1.0, StandardKey::BatteryStateOfHealthPercent, Priority::Summary),
            desc(107, RegisterType::U16, 0.1, StandardKey::BatteryVoltageVolts, Priority::Summary),
            desc(108, RegisterType::I16, 0.1, StandardKey::BatteryCurrentAmps, Priority::Summary),
            desc(109, RegisterType::U32, 0.1, StandardKey::EnergyPvDailyKwh, Priority::Summary),
            desc(111, RegisterType::U32, 0.1, StandardKey::EnergyLoadDailyKwh, Priority::Summary),
            desc(113, RegisterType::U32, 0.1, StandardKey::EnergyBatteryChargeDailyKwh, Priority::Summary),
            desc(115, RegisterType::U32, 0.1, StandardKey::EnergyBatteryDischargeDailyKwh, Priority::Summary),
            desc(117, RegisterType::U32, 0.1, StandardKey::EnergyGridImportDailyKwh, Priority::Summary),
            desc(119, RegisterType::U32, 0.1, StandardKey::EnergyGridExportDailyKwh, Priority::Summary),
            desc(121, RegisterType::Code, 1.0, StandardKey::OperationalInverterStatusText, Priority::Summary),
        ];
        for n in 0..MAX_PV_STRINGS {
            let base = 130 + (n as u16) * 2;
            dynamic_descriptors.push(desc(base, RegisterType::U16, 0.1, StandardKey::PvStringVoltageVolts(n), Priority::Summary));
            dynamic_descriptors.push(desc(base + 1, RegisterType::U16, 0.1, StandardKey::PvStringCurrentAmps(n), Priority::Summary));
        }
        let dynamic_groups = group_descriptors(&dynamic_descriptors, instance.max_regs_per_read, instance.max_register_gap);

        Ok(Self {
            instance_id: instance.name.clone(),
            transport,
            framing,
            slave: instance.slave_address,
            connect_timeout: Duration::from_secs(instance.modbus_timeout_seconds),
            read_deadline: Duration::from_secs(instance.modbus_timeout_seconds),
            inter_read_delay: Duration::from_millis(instance.inter_read_delay_ms),
            max_retries: instance.max_read_retries_per_group,
            static_descriptors,
            static_groups,
            dynamic_descriptors,
            dynamic_groups,
            connected: false,
            warner: UnknownKeyWarner::new(),
            mppt_count: None,
            dc_voltage_ever_nonzero: [false; MAX_PV_STRINGS as usize],
            probe_polls_done: 0,
        })
    }

    /// Consumes the raw model-code reading (if the static poll produced
    /// one) to finalize `mppt_count` immediately, per spec.md §4.4's
    /// "read the model code when present" clause. Strips the internal key
    /// out of the `Reading` either way, since it's not a StandardKey.
    fn detect_mppt_count_from_static(&mut self, reading: &mut Reading) {
        let raw = reading.values.remove(&StandardKey::Unknown(MODEL_CODE_KEY.to_string()));
        if self.mppt_count.is_some() {
            return;
        }
        if let Some(Value::Int(code)) = raw {
            self.mppt_count = mppt_count_from_model_code(code);
        }
    }

    /// Inference fallback: across the first three successful dynamic
    /// polls, a PV string whose voltage was nonzero at least once is
    /// considered present (spec.md §4.4: "infer from nonzero voltage on
    /// the corresponding DC input across the first three successful
    /// polls").
    fn probe_mppt_count_from_dynamic(&mut self, reading: &Reading) {
        if self.mppt_count.is_some() || self.probe_polls_done >= 3 {
            return;
        }
        for n in 0..MAX_PV_STRINGS {
            if let Some(Value::Number(v)) = reading.values.get(&StandardKey::PvStringVoltageVolts(n)) {
                if *v != 0.0 {
                    self.dc_voltage_ever_nonzero[n as usize] = true;
                }
            }
        }
        self.probe_polls_done += 1;
        if self.probe_polls_done >= 3 {
            let detected = self.dc_voltage_ever_nonzero.iter().filter(|&&seen| seen).count() as u8;
            self.mppt_count = Some(detected.max(1));
        }
    }

    /// Once `mppt_count` is known, drop the probe channels beyond it so
    /// downstream consumers only ever see the strings that actually
    /// exist on this inverter.
    fn filter_pv_strings_to_detected_count(&self, reading: &mut Reading) {
        let Some(count) = self.mppt_count else { return };
        for n in count..MAX_PV_STRINGS {
            reading.values.remove(&StandardKey::PvStringVoltageVolts(n));
            reading.values.remove(&StandardKey::PvStringCurrentAmps(n));
        }
    }

    async fn read_group_with_retries(&mut self, group: &ReadGroup) -> Result<Vec<u16>, PluginError> {
        let mut attempt = 0;
        loop {
            match self.read_group_once(group).await {
                Ok(words) => return Ok(words),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    tokio::time::sleep(self.inter_read_delay).await;
                    tracing::debug!(instance_id = %self.instance_id, attempt, error = %e, "retrying register group");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_group_once(&mut self, group: &ReadGroup) -> Result<Vec<u16>, PluginError> {
        let deadline = self.read_deadline;
        match &mut self.framing {
            Framing::Tcp { txn } => {
                let id = txn.next();
                let req = tcp::build_read_request(id, self.slave, group.function, group.start_address, group.register_count);
                self.transport.write_all(&req, deadline).await.map_err(PluginError::Io)?;
                let mut header = [0u8; 7];
                self.transport.read_exact(&mut header, deadline).await.map_err(PluginError::Io)?;
                let remaining = tcp::response_payload_len(&header);
                let mut rest = vec![0u8; remaining];
                self.transport.read_exact(&mut rest, deadline).await.map_err(PluginError::Io)?;
                let mut full = header.to_vec();
                full.extend(rest);
                tcp::parse_read_response(&full, id, self.slave).map_err(PluginError::ExceptionResponse)
            }
            Framing::Rtu => {
                let req = rtu::build_read_request(self.slave, group.function, group.start_address, group.register_count);
                self.transport.write_all(&req, deadline).await.map_err(PluginError::Io)?;
                let mut head = [0u8; 3];
                self.transport.read_exact(&mut head, deadline).await.map_err(PluginError::Io)?;
                let fc = head[1];
                let mut frame = head.to_vec();
                if fc & 0x80 != 0 {
                    let mut tail = [0u8; 2];
                    self.transport.read_exact(&mut tail, deadline).await.map_err(PluginError::Io)?;
                    frame.extend_from_slice(&tail);
                } else {
                    let byte_count = head[2] as usize;
                    let mut tail = vec![0u8; byte_count + 2];
                    self.transport.read_exact(&mut tail, deadline).await.map_err(PluginError::Io)?;
                    frame.extend_from_slice(&tail);
                }
                rtu::parse_read_response(&frame, self.slave).map_err(PluginError::ExceptionResponse)
            }
        }
    }

    fn postprocess(&self, descriptor: &RegisterDescriptor, value: Value) -> Value {
        if descriptor.key == StandardKey::OperationalInverterStatusText {
            if let Value::Int(code) = value {
                return Value::Text(status_dictionary(code).to_string());
            }
        }
        value
    }

    async fn read_groups(
        &mut self,
        groups: Vec<ReadGroup>,
        descriptors: Vec<RegisterDescriptor>,
    ) -> Result<Reading, PluginError> {
        let mut reading = Reading::new(self.instance_id.clone());
        let mut succeeded = 0usize;
        let total = groups.len();
        for group in &groups {
            match self.read_group_with_retries(group).await {
                Ok(words) => {
                    succeeded += 1;
                    for &idx in &group.members {
                        let descriptor = &descriptors[idx];
                        let offset = (descriptor.address - group.start_address) as usize;
                        let slice = &words[offset..offset + descriptor.width() as usize];
                        match decode_register(descriptor, slice) {
                            Ok(value) => {
                                let value = self.postprocess(descriptor, value);
                                reading.values.insert(descriptor.key.clone(), value);
                            }
                            Err(e) => tracing::warn!(
                                instance_id = %self.instance_id,
                                key = %descriptor.key,
                                error = %e,
                                "register decode error"
                            ),
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(instance_id = %self.instance_id, error = %e, "register group read failed");
                    if self.atomic_read() {
                        return Err(e);
                    }
                }
            }
        }
        if succeeded == 0 && total > 0 {
            return Err(PluginError::PartialGroup { succeeded, total });
        }
        Ok(reading)
    }
}

fn desc(address: u16, register_type: RegisterType, scale: f64, key: StandardKey, priority: Priority) -> RegisterDescriptor {
    RegisterDescriptor {
        key,
        address,
        register_type,
        scale,
        is_static: false,
        priority,
        function: FunctionType::Holding,
        little_endian_words: false,
    }
}

#[async_trait]
impl Plugin for GenericModbusInverter {
    fn name(&self) -> &str {
        &self.instance_id
    }

    fn pretty_name(&self) -> &str {
        "Generic Modbus Inverter"
    }

    fn category(&self) -> DeviceCategory {
        DeviceCategory::Inverter
    }

    async fn connect(&mut self, deadline: Duration) -> Result<bool, PluginError> {
        let deadline = deadline.min(self.connect_timeout);
        match self.transport.connect(deadline).await {
            Ok(()) => {
                self.connected = true;
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(instance_id = %self.instance_id, error = %e, "connect failed");
                self.transport.close().await;
                self.connected = false;
                Ok(false)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.transport.close().await;
        self.connected = false;
    }

    async fn read_static(&mut self) -> Result<Reading, PluginError> {
        let groups = self.static_groups.clone();
        let descriptors = self.static_descriptors.clone();
        let mut reading = self.read_groups(groups, descriptors).await?;
        self.detect_mppt_count_from_static(&mut reading);
        reading.values.insert(StandardKey::StaticDeviceCategory, Value::Text("inverter".to_string()));
        Ok(reading)
    }

    async fn read_dynamic(&mut self) -> Result<Reading, PluginError> {
        let groups = self.dynamic_groups.clone();
        let descriptors = self.dynamic_descriptors.clone();
        let mut reading = self.read_groups(groups, descriptors).await?;
        self.probe_mppt_count_from_dynamic(&reading);
        self.filter_pv_strings_to_detected_count(&mut reading);
        Ok(reading)
    }

    fn configurable_params(&self) -> Vec<ParamDescriptor> {
        vec![
            ParamDescriptor { key: "slave_address", param_type: ParamType::Integer, required: true, default: None },
            ParamDescriptor { key: "modbus_timeout_seconds", param_type: ParamType::Integer, required: false, default: Some("5") },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::InstanceConfig;

    fn instance() -> InstanceConfig {
        InstanceConfig {
            name: "inv1".to_string(),
            plugin_type: "generic.modbus_inverter".to_string(),
            connection: ConnectionSpec::Tcp { host: "127.0.0.1".to_string(), port: 502 },
            slave_address: 1,
            modbus_timeout_seconds: 5,
            inter_read_delay_ms: 10,
            max_regs_per_read: 60,
            max_register_gap: 10,
            max_read_retries_per_group: 1,
            deye_model_series: None,
            powmr_protocol_version: None,
        }
    }

    #[test]
    fn builds_non_empty_dynamic_register_groups() {
        let plugin = GenericModbusInverter::from_config(&instance()).unwrap();
        assert!(!plugin.dynamic_groups.is_empty());
        assert!(!plugin.static_groups.is_empty());
    }

    #[test]
    fn status_dictionary_maps_known_and_unknown_codes() {
        assert_eq!(status_dictionary(1), "normal");
        assert_eq!(status_dictionary(999), "unknown");
    }

    #[tokio::test]
    async fn connect_failure_returns_false_not_error() {
        let mut plugin = GenericModbusInverter::from_config(&instance()).unwrap();
        let ok = plugin.connect(Duration::from_millis(50)).await.unwrap();
        assert!(!ok);
        assert!(!plugin.connected);
    }

    #[test]
    fn model_code_register_determines_mppt_count_immediately() {
        let mut plugin = GenericModbusInverter::from_config(&instance()).unwrap();
        let mut reading = Reading::new("inv1");
        reading.values.insert(StandardKey::Unknown(MODEL_CODE_KEY.to_string()), Value::Int(3));
        plugin.detect_mppt_count_from_static(&mut reading);
        assert_eq!(plugin.mppt_count, Some(3));
        assert!(!reading.values.contains_key(&StandardKey::Unknown(MODEL_CODE_KEY.to_string())));
    }

    #[test]
    fn unknown_model_code_falls_back_to_voltage_inference() {
        let mut plugin = GenericModbusInverter::from_config(&instance()).unwrap();

        for _ in 0..2 {
            let mut reading = Reading::new("inv1");
            reading.values.insert(StandardKey::PvStringVoltageVolts(0), Value::Number(320.0));
            reading.values.insert(StandardKey::PvStringVoltageVolts(1), Value::Number(0.0));
            plugin.probe_mppt_count_from_dynamic(&reading);
        }
        assert_eq!(plugin.mppt_count, None, "count only finalizes after three polls");

        let mut reading = Reading::new("inv1");
        reading.values.insert(StandardKey::PvStringVoltageVolts(0), Value::Number(318.0));
        reading.values.insert(StandardKey::PvStringVoltageVolts(1), Value::Number(0.0));
        plugin.probe_mppt_count_from_dynamic(&reading);
        assert_eq!(plugin.mppt_count, Some(1));
    }

    #[test]
    fn detected_count_filters_undetected_string_channels() {
        let mut plugin = GenericModbusInverter::from_config(&instance()).unwrap();
        plugin.mppt_count = Some(1);
        let mut reading = Reading::new("inv1");
        reading.values.insert(StandardKey::PvStringVoltageVolts(0), Value::Number(320.0));
        reading.values.insert(StandardKey::PvStringVoltageVolts(1), Value::Number(0.0));
        reading.values.insert(StandardKey::PvStringCurrentAmps(1), Value::Number(0.0));
        plugin.filter_pv_strings_to_detected_count(&mut reading);
        assert!(reading.values.contains_key(&StandardKey::PvStringVoltageVolts(0)));
        assert!(!reading.values.contains_key(&StandardKey::PvStringVoltageVolts(1)));
        assert!(!reading.values.contains_key(&StandardKey::PvStringCurrentAmps(1)));
    }
}
