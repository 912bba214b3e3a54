//! Modbus-TCP framing: the MBAP header (spec.md §4.2.1).
//!
//! `transaction_id` monotonic per client, `protocol_id` always 0,
//! `length` covers unit id + PDU, `unit_id` addresses the slave.

use super::registers::FunctionType;
use crate::error::ModbusError;
use std::sync::atomic::{AtomicU16, Ordering};

/// Generates monotonically increasing transaction ids for one client
/// connection, wrapping per the 16-bit field width.
pub struct TransactionIdGenerator(AtomicU16);

impl TransactionIdGenerator {
    pub fn new() -> Self {
        Self(AtomicU16::new(0))
    }

    pub fn next(&self) -> u16 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

pub fn build_read_request(
    transaction_id: u16,
    unit_id: u8,
    function: FunctionType,
    address: u16,
    count: u16,
) -> Vec<u8> {
    let pdu_len: u16 = 1 /* unit id */ + 1 /* fc */ + 4 /* addr + count */;
    let mut frame = Vec::with_capacity(6 + 6);
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes()); // protocol id
    frame.extend_from_slice(&pdu_len.to_be_bytes());
    frame.push(unit_id);
    frame.push(function.function_code());
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    frame
}

/// Parse a full MBAP response frame (header already read in full, as the
/// caller must read the fixed 7-byte header first to learn `length`).
pub fn parse_read_response(
    frame: &[u8],
    expected_transaction_id: u16,
    expected_unit_id: u8,
) -> Result<Vec<u16>, ModbusError> {
    if frame.len() < 9 {
        return Err(ModbusError::Truncated {
            expected: 9,
            actual: frame.len(),
        });
    }

    let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
    let protocol_id = u16::from_be_bytes([frame[2], frame[3]]);
    let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
    let unit_id = frame[6];
    let fc = frame[7];

    if transaction_id != expected_transaction_id {
        return Err(ModbusError::TransactionMismatch {
            expected: expected_transaction_id,
            actual: transaction_id,
        });
    }
    if protocol_id != 0 || unit_id != expected_unit_id {
        return Err(ModbusError::Mbap);
    }
    if frame.len() != 6 + length {
        return Err(ModbusError::Truncated {
            expected: 6 + length,
            actual: frame.len(),
        });
    }

    if fc & 0x80 != 0 {
        let code = frame[8];
        return Err(ModbusError::Exception {
            function: fc & 0x7f,
            code,
        });
    }
    if fc != 0x03 && fc != 0x04 {
        return Err(ModbusError::UnexpectedFunction(fc));
    }

    let byte_count = frame[8] as usize;
    let data = frame.get(9..9 + byte_count).ok_or(ModbusError::Truncated {
        expected: 9 + byte_count,
        actual: frame.len(),
    })?;

    Ok(data
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

/// Decode the 7-byte MBAP+function header to learn how many more bytes
/// of payload to read, before `parse_read_response` is called on the
/// full frame. Returns `(full_frame_length_after_header, )`.
pub fn response_payload_len(header: &[u8; 7]) -> usize {
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    // `length` counts unit_id + pdu; we've already consumed unit_id (1
    // byte of it) plus nothing of the pdu, but the header slice passed
    // in is only 6 bytes of MBAP + the unit id is header[6]; the
    // remaining bytes to read are length - 1 (unit id already in header).
    length.saturating_sub(1)
}
