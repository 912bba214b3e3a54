//! `RegisterDescriptor` and `ReadGroup` (spec.md §3).

use crate::domain::StandardKey;

/// Wire representation of one readable Modbus quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterType {
    U16,
    I16,
    U32,
    I32,
    Ascii8,
    Code,
    Bitfield,
    Hex,
}

impl RegisterType {
    /// Number of consecutive 16-bit registers this type occupies on the wire.
    pub fn width(&self) -> u16 {
        match self {
            RegisterType::U16
            | RegisterType::I16
            | RegisterType::Code
            | RegisterType::Bitfield
            | RegisterType::Hex => 1,
            RegisterType::U32 | RegisterType::I32 => 2,
            RegisterType::Ascii8 => 8,
        }
    }

    /// Numeric scaling applies to every type except the three "opaque
    /// word" kinds (spec.md §4.2.1: "scaled iff the unit is not in
    /// {code, bitfield, hex}").
    pub fn is_scaled(&self) -> bool {
        !matches!(self, RegisterType::Code | RegisterType::Bitfield | RegisterType::Hex)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionType {
    /// FC03
    Holding,
    /// FC04
    Input,
}

impl FunctionType {
    pub fn function_code(&self) -> u8 {
        match self {
            FunctionType::Holding => 0x03,
            FunctionType::Input => 0x04,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Critical,
    Summary,
}

/// Describes one readable quantity on a device (spec.md §3).
#[derive(Debug, Clone)]
pub struct RegisterDescriptor {
    pub key: StandardKey,
    pub address: u16,
    pub register_type: RegisterType,
    pub scale: f64,
    /// Static entries are read once on (re)connect; dynamic entries are
    /// read every poll cycle.
    pub is_static: bool,
    pub priority: Priority,
    pub function: FunctionType,
    /// Word order is big-endian by default; some devices (e.g. EG4) swap
    /// the two words of a 32-bit value (spec.md §4.2.1).
    pub little_endian_words: bool,
}

impl RegisterDescriptor {
    pub fn width(&self) -> u16 {
        self.register_type.width()
    }

    pub fn end_address(&self) -> u16 {
        self.address + self.width()
    }
}

/// A contiguous (or near-contiguous) run of descriptors fused into one
/// wire request (spec.md §3/§4.2.2).
#[derive(Debug, Clone)]
pub struct ReadGroup {
    pub start_address: u16,
    pub register_count: u16,
    pub function: FunctionType,
    /// Descriptor indices (into the caller's original descriptor slice),
    /// in address order.
    pub members: Vec<usize>,
}

impl ReadGroup {
    pub fn end_address(&self) -> u16 {
        self.start_address + self.register_count
    }
}
