//! Error kinds shared across the crate.
//!
//! Each module boundary gets its own `thiserror` enum so callers can match
//! on a specific kind rather than stringly-typed errors. Orchestration code
//! (workers, supervisor, main) wraps these in `anyhow::Result` and adds
//! context; the aggregator and publisher only ever see the typed kinds
//! below, never a raw `std::io::Error`.

use thiserror::Error;

/// Errors surfaced by the transport layer (`transport::Transport`).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport already closed")]
    Closed,
}

/// Errors surfaced by the Modbus codec (`protocol::modbus`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModbusError {
    #[error("CRC mismatch: expected {expected:04x}, got {actual:04x}")]
    Crc { expected: u16, actual: u16 },

    #[error("malformed MBAP header")]
    Mbap,

    #[error("device returned exception code {code:#04x} for function {function:#04x}")]
    Exception { function: u8, code: u8 },

    #[error("frame truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unexpected function code {0:#04x} in response")]
    UnexpectedFunction(u8),

    #[error("transaction id mismatch: expected {expected}, got {actual}")]
    TransactionMismatch { expected: u16, actual: u16 },
}

/// Errors surfaced by the vendor (POWMR inv8851) frame codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad sync bytes: {0:04x}")]
    BadSync(u16),

    #[error("payload length {0} exceeds maximum for this protocol revision")]
    OverlongPayload(u16),

    #[error("checksum mismatch: expected {expected:04x}, got {actual:04x}")]
    BadChecksum { expected: u16, actual: u16 },

    #[error("frame truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// Errors surfaced by a plugin's public contract (`plugin::Plugin`).
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("read timed out")]
    Timeout,

    #[error("device returned a protocol exception: {0}")]
    ExceptionResponse(#[from] ModbusError),

    #[error("vendor frame error: {0}")]
    VendorFrame(#[from] FrameError),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("only part of the register groups were read: {succeeded}/{total}")]
    PartialGroup { succeeded: usize, total: usize },

    #[error("plugin configuration error: {0}")]
    ConfigError(String),

    #[error("transport error: {0}")]
    Io(#[from] TransportError),
}

/// Errors surfaced by the embedded persistence layer (`persistence`).
#[cfg(feature = "persistence")]
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database busy after {attempts} retries")]
    BusyRetriesExhausted { attempts: u32 },
}

/// Errors surfaced while loading/validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("syntax error in config at line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("missing required key: {0}")]
    MissingKey(String),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("validation failed: {0}")]
    Validation(String),
}
