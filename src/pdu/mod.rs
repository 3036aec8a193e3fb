//! Tagged wire PDU types (spec §4.2).
//!
//! Each family below owns its backing octets and exposes a classifier
//! (`parse`) that returns a typed variant or a generic "unknown opcode"
//! fallback, plus constructors that build a PDU into a fresh owned buffer.
//! None of the classifiers panic on a truncated frame: insufficient bytes
//! produce the family's `Malformed`/`Unknown` variant instead (spec §4.2,
//! invariant P7's counterpart for the boundary case).

pub mod att;
pub mod hci;
pub mod mgmt;
pub mod smp;
