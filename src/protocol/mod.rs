//! Wire-level codecs: Modbus (TCP/RTU) and the POWMR vendor framing
//! (spec.md §4.2).

pub mod modbus;
pub mod powmr;
