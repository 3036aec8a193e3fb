//! The SMP pairing engine (spec §4.6.2) and its persisted key store (spec §6).

pub mod engine;
pub mod keybin;

pub use engine::{KeyMaterial, PairingMode, PairingRecord, PairingState, SmpEngine};
pub use keybin::{Role, SmpKeyBin};
