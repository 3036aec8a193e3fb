//! The GATT client engine (spec §4.6.1): discovery, reads/writes, and
//! notification/indication dispatch atop an open ATT L2CAP channel.

pub mod engine;

pub use engine::{GattCharacteristic, GattDescriptor, GattEngine, GattService};
