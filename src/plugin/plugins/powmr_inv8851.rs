//! POWMR "inv8851" vendor binary plugin (spec.md §4.2.3, §4.4).

use crate::config::schema::{ConnectionSpec, InstanceConfig};
use crate::domain::{Reading, StandardKey, Value};
use crate::error::{ConfigError, PluginError};
use crate::plugin::{DeviceCategory, ParamDescriptor, ParamType, Plugin};
use crate::protocol::powmr::status::parse_status_payload;
use crate::protocol::powmr::{build_frame, Frame, ProtocolVersion};
use crate::transport::tcp::TcpTransport;
use crate::transport::Transport;
use async_trait::async_trait;
use std::net::ToSocketAddrs;
use std::time::Duration;

/// Request command: ask the device for its current BMS/status payload.
const CMD_READ_STATUS: u8 = 0x01;

pub struct PowmrInv8851 {
    instance_id: String,
    transport: Box<dyn Transport>,
    version: ProtocolVersion,
    read_deadline: Duration,
    connected: bool,
}

impl PowmrInv8851 {
    pub fn from_config(instance: &InstanceConfig) -> Result<Self, ConfigError> {
        let transport: Box<dyn Transport> = match &instance.connection {
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
                Box::new(TcpTransport::new(addr))
            }
            ConnectionSpec::Serial { port, baud } => {
                #[cfg(feature = "serial")]
                {
                    Box::new(crate::transport::serial::SerialTransport::new(
                        port.clone(),
                        *baud,
                        8,
                        crate::transport::SerialParity::None,
                        1,
                    ))
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

        let version = match instance.powmr_protocol_version {
            Some(1) | None => ProtocolVersion::V1,
            Some(2) => ProtocolVersion::V2,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: format!("{}.powmr_protocol_version", instance.name),
                    message: format!("expected 1 or 2, got {other}"),
                })
            }
        };

        Ok(Self {
            instance_id: instance.name.clone(),
            transport,
            version,
            read_deadline: Duration::from_secs(instance.modbus_timeout_seconds),
            connected: false,
        })
    }

    async fn request_status(&mut self) -> Result<Vec<u8>, PluginError> {
        let deadline = self.read_deadline;
        let request = build_frame(&Frame {
            version: self.version,
            cmd: CMD_READ_STATUS,
            payload: Vec::new(),
        });
        self.transport.write_all(&request, deadline).await.map_err(PluginError::Io)?;

        let mut header = [0u8; 6];
        self.transport.read_exact(&mut header, deadline).await.map_err(PluginError::Io)?;
        let payload_len = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut tail = vec![0u8; payload_len + 2];
        self.transport.read_exact(&mut tail, deadline).await.map_err(PluginError::Io)?;

        let mut full = header.to_vec();
        full.extend(tail);
        let frame = crate::protocol::powmr::parse_frame(&full).map_err(PluginError::VendorFrame)?;
        Ok(frame.payload)
    }
}

#[async_trait]
impl Plugin for PowmrInv8851 {
    fn name(&self) -> &str {
        &self.instance_id
    }

    fn pretty_name(&self) -> &str {
        "POWMR inv8851"
    }

    fn category(&self) -> DeviceCategory {
        DeviceCategory::Inverter
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
        let mut reading = Reading::new(self.instance_id.clone());
        reading.values.insert(StandardKey::StaticDeviceCategory, Value::Text("inverter".to_string()));
        reading.values.insert(StandardKey::OperationalManufacturerText, Value::Text("POWMR".to_string()));
        reading.values.insert(StandardKey::OperationalModelText, Value::Text("inv8851".to_string()));
        Ok(reading)
    }

    async fn read_dynamic(&mut self) -> Result<Reading, PluginError> {
        let payload = self.request_status().await?;
        let status = parse_status_payload(&payload).map_err(PluginError::Decode)?;

        let mut reading = Reading::new(self.instance_id.clone());
        reading.values.extend(status.into_values());
        Ok(reading)
    }

    fn configurable_params(&self) -> Vec<ParamDescriptor> {
        vec![ParamDescriptor {
            key: "powmr_protocol_version",
            param_type: ParamType::Integer,
            required: false,
            default: Some("1"),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(version: Option<u8>) -> InstanceConfig {
        InstanceConfig {
            name: "powmr1".to_string(),
            plugin_type: "powmr.inv8851".to_string(),
            connection: ConnectionSpec::Tcp { host: "127.0.0.1".to_string(), port: 8899 },
            slave_address: 1,
            modbus_timeout_seconds: 5,
            inter_read_delay_ms: 10,
            max_regs_per_read: 60,
            max_register_gap: 10,
            max_read_retries_per_group: 1,
            deye_model_series: None,
            powmr_protocol_version: version,
        }
    }

    #[test]
    fn defaults_to_protocol_v1() {
        let plugin = PowmrInv8851::from_config(&instance(None)).unwrap();
        assert_eq!(plugin.version, ProtocolVersion::V1);
    }

    #[test]
    fn rejects_unknown_protocol_version() {
        let err = PowmrInv8851::from_config(&instance(Some(9))).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn static_read_reports_manufacturer_and_model() {
        let mut plugin = PowmrInv8851::from_config(&instance(Some(1))).unwrap();
        let reading = plugin.read_static().await.unwrap();
        assert_eq!(
            reading.values.get(&StandardKey::OperationalManufacturerText),
            Some(&Value::Text("POWMR".to_string()))
        );
    }
}
