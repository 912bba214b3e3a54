//! Byte-level transport (spec.md §4.1, C1).
//!
//! A `Transport` owns one exclusive byte-stream endpoint (TCP socket or
//! serial port). Every operation takes an explicit deadline derived from
//! the caller's per-poll budget; nothing here blocks past it.

pub mod serial;
pub mod tcp;

use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait Transport: Send {
    /// Open the underlying endpoint, pre-validating reachability. Must
    /// not block past `deadline`.
    async fn connect(&mut self, deadline: Duration) -> Result<(), TransportError>;

    /// Read exactly `buf.len()` bytes or fail.
    async fn read_exact(&mut self, buf: &mut [u8], deadline: Duration) -> Result<(), TransportError>;

    /// Write the entire buffer or fail.
    async fn write_all(&mut self, buf: &[u8], deadline: Duration) -> Result<(), TransportError>;

    /// Close the endpoint. Always safe to call, even if not connected.
    async fn close(&mut self);

    fn is_connected(&self) -> bool;
}

/// How a plugin instance reaches its device, per spec.md §6.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Serial {
        port: String,
        baud: u32,
        /// 8-N-1 unless overridden, per spec.md §4.1.
        data_bits: u8,
        parity: SerialParity,
        stop_bits: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialParity {
    None,
    Even,
    Odd,
}

impl Endpoint {
    pub fn serial_default(port: impl Into<String>, baud: u32) -> Self {
        Endpoint::Serial {
            port: port.into(),
            baud,
            data_bits: 8,
            parity: SerialParity::None,
            stop_bits: 1,
        }
    }
}
