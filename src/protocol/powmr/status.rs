//! Bit-packed BMS status payload carried inside an inv8851 frame
//! (spec.md §4.2.3): up to 16 cell voltages, four NTC temperatures, a
//! battery-temperature sensor, and categorized fault groups.

use crate::domain::{StandardKey, Value};
use std::collections::BTreeMap;

const MAX_CELLS: usize = 16;
const MAX_NTC: usize = 4;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BmsStatus {
    /// Millivolts per cell, in cell order; a device with fewer than 16
    /// cells reports fewer entries.
    pub cell_voltages_mv: Vec<u16>,
    /// Tenths of a degree C, NTC probes 1..=4.
    pub ntc_temperatures_decidegrees: Vec<i16>,
    pub battery_temperature_decidegrees: i16,
    /// Bitmask per fault category, category index -> raw bits.
    pub fault_groups: BTreeMap<u8, u16>,
}

/// Parse a status payload. Layout: `cell_count(1) cells(2*cell_count)
/// ntc_count(1) ntc(2*ntc_count) battery_temp(2) fault_group_count(1)
/// [category(1) bits(2)]*`.
pub fn parse_status_payload(payload: &[u8]) -> Result<BmsStatus, String> {
    let mut cursor = 0usize;
    let mut take = |n: usize| -> Result<&[u8], String> {
        let slice = payload
            .get(cursor..cursor + n)
            .ok_or_else(|| format!("status payload truncated at offset {cursor}"))?;
        cursor += n;
        Ok(slice)
    };

    let cell_count = take(1)?[0] as usize;
    if cell_count > MAX_CELLS {
        return Err(format!("cell_count {cell_count} exceeds max {MAX_CELLS}"));
    }
    let mut cell_voltages_mv = Vec::with_capacity(cell_count);
    for _ in 0..cell_count {
        let bytes = take(2)?;
        cell_voltages_mv.push(u16::from_be_bytes([bytes[0], bytes[1]]));
    }

    let ntc_count = take(1)?[0] as usize;
    if ntc_count > MAX_NTC {
        return Err(format!("ntc_count {ntc_count} exceeds max {MAX_NTC}"));
    }
    let mut ntc_temperatures_decidegrees = Vec::with_capacity(ntc_count);
    for _ in 0..ntc_count {
        let bytes = take(2)?;
        ntc_temperatures_decidegrees.push(i16::from_be_bytes([bytes[0], bytes[1]]));
    }

    let battery_temp_bytes = take(2)?;
    let battery_temperature_decidegrees = i16::from_be_bytes([battery_temp_bytes[0], battery_temp_bytes[1]]);

    let fault_group_count = take(1)?[0] as usize;
    let mut fault_groups = BTreeMap::new();
    for _ in 0..fault_group_count {
        let category = take(1)?[0];
        let bits_bytes = take(2)?;
        fault_groups.insert(category, u16::from_be_bytes([bits_bytes[0], bits_bytes[1]]));
    }

    Ok(BmsStatus {
        cell_voltages_mv,
        ntc_temperatures_decidegrees,
        battery_temperature_decidegrees,
        fault_groups,
    })
}

impl BmsStatus {
    /// Project onto the canonical key vocabulary (spec.md §3): one
    /// `battery_cell_voltage(n)`/`battery_cell_temperature(n)` per probe,
    /// plus a categorized alerts mapping.
    pub fn into_values(self) -> BTreeMap<StandardKey, Value> {
        let mut out = BTreeMap::new();
        for (i, mv) in self.cell_voltages_mv.iter().enumerate() {
            out.insert(
                StandardKey::BatteryCellVoltage(i as u16),
                Value::Number(*mv as f64 / 1000.0),
            );
        }
        for (i, tenths) in self.ntc_temperatures_decidegrees.iter().enumerate() {
            out.insert(
                StandardKey::BatteryCellTemperature(i as u8),
                Value::Number(*tenths as f64 / 10.0),
            );
        }
        if !self.fault_groups.is_empty() {
            let mut alerts = std::collections::BTreeMap::new();
            for (category, bits) in &self.fault_groups {
                alerts.insert(category.to_string(), Value::Int(*bits as i64));
            }
            out.insert(
                StandardKey::OperationalCategorizedAlertsDict,
                Value::Mapping(alerts),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_sample() -> Vec<u8> {
        let mut buf = vec![2u8]; // cell_count
        buf.extend_from_slice(&3300u16.to_be_bytes());
        buf.extend_from_slice(&3310u16.to_be_bytes());
        buf.push(1); // ntc_count
        buf.extend_from_slice(&(250i16).to_be_bytes());
        buf.extend_from_slice(&(245i16).to_be_bytes()); // battery temp
        buf.push(1); // fault_group_count
        buf.push(0); // category
        buf.extend_from_slice(&0b0000_0001_0000_0000u16.to_be_bytes());
        buf
    }

    #[test]
    fn parses_cells_ntc_and_faults() {
        let payload = encode_sample();
        let status = parse_status_payload(&payload).unwrap();
        assert_eq!(status.cell_voltages_mv, vec![3300, 3310]);
        assert_eq!(status.ntc_temperatures_decidegrees, vec![250]);
        assert_eq!(status.battery_temperature_decidegrees, 245);
        assert_eq!(status.fault_groups.get(&0), Some(&0b0000_0001_0000_0000));
    }

    #[test]
    fn rejects_cell_count_above_sixteen() {
        let mut payload = vec![17u8];
        payload.extend(std::iter::repeat(0u8).take(34));
        let err = parse_status_payload(&payload).unwrap_err();
        assert!(err.contains("exceeds max"));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let err = parse_status_payload(&[2, 0, 1]).unwrap_err();
        assert!(err.contains("truncated"));
    }

    #[test]
    fn projects_into_standard_keys() {
        let status = parse_status_payload(&encode_sample()).unwrap();
        let values = status.into_values();
        assert_eq!(
            values.get(&StandardKey::BatteryCellVoltage(0)),
            Some(&Value::Number(3.3))
        );
        assert_eq!(
            values.get(&StandardKey::BatteryCellTemperature(0)),
            Some(&Value::Number(25.0))
        );
        assert!(values.contains_key(&StandardKey::OperationalCategorizedAlertsDict));
    }
}
