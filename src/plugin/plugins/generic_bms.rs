//! A representative generic BMS register map over Modbus (spec.md §4.4):
//! SOC/SOH, pack voltage/current, and up to 16 cell voltages.

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

const CELL_COUNT: u16 = 16;

enum Framing {
    Tcp { txn: tcp::TransactionIdGenerator },
    Rtu,
}

pub struct GenericBms {
    instance_id: String,
    transport: Box<dyn Transport>,
    framing: Framing,
    slave: u8,
    read_deadline: Duration,
    inter_read_delay: Duration,
    max_retries: u8,
    static_descriptors: Vec<RegisterDescriptor>,
    static_groups: Vec<ReadGroup>,
    dynamic_descriptors: Vec<RegisterDescriptor>,
    dynamic_groups: Vec<ReadGroup>,
    connected: bool,
}

impl GenericBms {
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
                (Box::new(TcpTransport::new(addr)), Framing::Tcp { txn: tcp::TransactionIdGenerator::new() })
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

        let static_descriptors = vec![RegisterDescriptor {
            key: StandardKey::OperationalModelText,
            address: 0,
            register_type: RegisterType::Ascii8,
            scale: 1.0,
            is_static: true,
            priority: Priority::Summary,
            function: FunctionType::Holding,
            little_endian_words: false,
        }];
        let static_groups = group_descriptors(&static_descriptors, instance.max_regs_per_read, instance.max_register_gap);

        let mut dynamic_descriptors = vec![
            desc(50, RegisterType::U16, 1.0, StandardKey::BatteryStateOfChargePercent, Priority::Critical),
            desc(51, RegisterType::U16, 1.0, StandardKey::BatteryStateOfHealthPercent, Priority::Summary),
            desc(52, RegisterType::U16, 0.1, StandardKey::BatteryVoltageVolts, Priority::Critical),
            desc(53, RegisterType::I16, 0.1, StandardKey::BatteryCurrentAmps, Priority::Critical),
        ];
        for n in 0..CELL_COUNT {
            dynamic_descriptors.push(desc(
                100 + n,
                RegisterType::U16,
                0.001,
                StandardKey::BatteryCellVoltage(n),
                Priority::Summary,
            ));
        }
        let dynamic_groups = group_descriptors(&dynamic_descriptors, instance.max_regs_per_read, instance.max_register_gap);

        Ok(Self {
            instance_id: instance.name.clone(),
            transport,
            framing,
            slave: instance.slave_address,
            read_deadline: Duration::from_secs(instance.modbus_timeout_seconds),
            inter_read_delay: Duration::from_millis(instance.inter_read_delay_ms),
            max_retries: instance.max_read_retries_per_group,
            static_descriptors,
            static_groups,
            dynamic_descriptors,
            dynamic_groups,
            connected: false,
        })
    }

    async fn read_group_with_retries(&mut self, group: &ReadGroup) -> Result<Vec<u16>, PluginError> {
        let mut attempt = 0;
        loop {
            match self.read_group_once(group).await {
                Ok(words) => return Ok(words),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::debug!(instance_id = %self.instance_id, attempt, error = %e, "retrying register group");
                    tokio::time::sleep(self.inter_read_delay).await;
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

    async fn read_groups(&mut self, groups: Vec<ReadGroup>, descriptors: Vec<RegisterDescriptor>) -> Result<Reading, PluginError> {
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
                        if let Ok(value) = decode_register(descriptor, slice) {
                            reading.values.insert(descriptor.key.clone(), value);
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
impl Plugin for GenericBms {
    fn name(&self) -> &str {
        &self.instance_id
    }

    fn pretty_name(&self) -> &str {
        "Generic Modbus BMS"
    }

    fn category(&self) -> DeviceCategory {
        DeviceCategory::Bms
    }

    async fn connect(&mut self, deadline: Duration) -> Result<bool, PluginError> {
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
        reading.values.insert(StandardKey::StaticDeviceCategory, Value::Text("bms".to_string()));
        Ok(reading)
    }

    async fn read_dynamic(&mut self) -> Result<Reading, PluginError> {
        let groups = self.dynamic_groups.clone();
        let descriptors = self.dynamic_descriptors.clone();
        self.read_groups(groups, descriptors).await
    }

    fn configurable_params(&self) -> Vec<ParamDescriptor> {
        vec![ParamDescriptor {
            key: "slave_address",
            param_type: ParamType::Integer,
            required: true,
            default: None,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> InstanceConfig {
        InstanceConfig {
            name: "bms1".to_string(),
            plugin_type: "generic.modbus_bms".to_string(),
            connection: ConnectionSpec::Tcp { host: "127.0.0.1".to_string(), port: 502 },
            slave_address: 2,
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
    fn groups_all_sixteen_cell_voltages() {
        let plugin = GenericBms::from_config(&instance()).unwrap();
        let cell_descriptors = plugin
            .dynamic_descriptors
            .iter()
            .filter(|d| matches!(d.key, StandardKey::BatteryCellVoltage(_)))
            .count();
        assert_eq!(cell_descriptors, CELL_COUNT as usize);
    }
}
