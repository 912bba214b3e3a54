//! Plugin runtime (spec.md §4.3, C3): the device-facing capability
//! contract and the per-instance worker state machine.
//!
//! Plugin polymorphism is a capability contract rather than class
//! inheritance (spec.md §9): a fixed operation set plus a registry
//! mapping `plugin_type` strings to constructors. Variant handling per
//! device family is data-driven (register maps + dictionaries).

pub mod plugins;
pub mod registry;
pub mod worker;

use crate::domain::Reading;
use crate::error::PluginError;
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCategory {
    Inverter,
    Bms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Float,
    Bool,
}

#[derive(Debug, Clone)]
pub struct ParamDescriptor {
    pub key: &'static str,
    pub param_type: ParamType,
    pub required: bool,
    pub default: Option<&'static str>,
}

/// Public contract every concrete plugin implements (spec.md §4.3).
#[async_trait]
pub trait Plugin: Send {
    fn name(&self) -> &str;
    fn pretty_name(&self) -> &str;
    fn category(&self) -> DeviceCategory;

    /// Establish the transport; idempotent; never blocks past `deadline`;
    /// cleans up any half-open resource on failure.
    async fn connect(&mut self, deadline: Duration) -> Result<bool, PluginError>;

    /// Always safe to call; leaks no file descriptor or port lock.
    async fn disconnect(&mut self);

    /// Called once per connect. MUST include `static_device_category`
    /// and a manufacturer string; cached for the connection's lifetime.
    async fn read_static(&mut self) -> Result<Reading, PluginError>;

    /// Called every poll cycle.
    async fn read_dynamic(&mut self) -> Result<Reading, PluginError>;

    fn configurable_params(&self) -> Vec<ParamDescriptor>;

    /// Whether a partial-group failure invalidates the whole read
    /// (spec.md §9 open question: defaults to `false`).
    fn atomic_read(&self) -> bool {
        false
    }
}
