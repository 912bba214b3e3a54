//! solar-core: supervised data-acquisition for heterogeneous solar
//! inverters and BMS devices over Modbus and vendor binary protocols.

pub mod aggregator;
pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod filter;
pub mod persistence;
pub mod plugin;
pub mod protocol;
pub mod publisher;
pub mod supervisor;
pub mod telemetry;
pub mod transport;
