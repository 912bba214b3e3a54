//! Modbus wire protocol: register descriptors, grouping, decoding, and
//! RTU/TCP framing (spec.md §4.2.1, §4.2.2).

pub mod decode;
pub mod grouping;
pub mod registers;
pub mod rtu;
pub mod tcp;

pub use decode::decode_register;
pub use grouping::group_descriptors;
pub use registers::{FunctionType, Priority, ReadGroup, RegisterDescriptor, RegisterType};
