//! User-facing pairing types: I/O capability, passkeys, and the pairing
//! agent trait consulted during SMP user interaction (spec §4.6.3).
//!
//! The agent trait is a plain (non-`async`) trait since this crate's
//! pairing state machine runs on a dedicated reader thread rather than an
//! async runtime.

use crate::device::DeviceId;

/// Bluetooth input/output capabilities for pairing.
///
/// See the Bluetooth Core Specification, Vol 3, Part H, §2.3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum IoCapability {
    /// Can display a passkey but not accept user input.
    DisplayOnly,
    /// Can display a passkey and request simple confirmation from the user.
    DisplayYesNo,
    /// Can request a passkey from the user but not display anything.
    KeyboardOnly,
    /// Cannot display anything to or request anything from the user.
    NoInputNoOutput,
    /// Can display a passkey to and/or request a passkey or confirmation from the user.
    KeyboardDisplay,
}

impl IoCapability {
    /// The wire value of this capability, Core Spec Vol 3, Part H, Table 2.7.
    pub fn to_wire(self) -> u8 {
        match self {
            IoCapability::DisplayOnly => 0x00,
            IoCapability::DisplayYesNo => 0x01,
            IoCapability::KeyboardOnly => 0x02,
            IoCapability::NoInputNoOutput => 0x03,
            IoCapability::KeyboardDisplay => 0x04,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => IoCapability::DisplayOnly,
            0x01 => IoCapability::DisplayYesNo,
            0x02 => IoCapability::KeyboardOnly,
            0x03 => IoCapability::NoInputNoOutput,
            0x04 => IoCapability::KeyboardDisplay,
            _ => return None,
        })
    }
}

/// An error indicating the pairing request has been rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PairingRejected;

impl std::fmt::Display for PairingRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("pairing rejected")
    }
}

impl std::error::Error for PairingRejected {}

/// An error returned when trying to convert an invalid value into a [`Passkey`].
///
/// `Passkey`s must be a 6-digit numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InvalidPasskey(());

impl std::fmt::Display for InvalidPasskey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("invalid passkey")
    }
}

impl std::error::Error for InvalidPasskey {}

/// A Bluetooth 6-digit passkey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Passkey(u32);

impl Passkey {
    pub fn new(n: u32) -> Self {
        assert!(n <= 999_999);
        Passkey(n)
    }
}

impl std::fmt::Display for Passkey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

impl From<Passkey> for u32 {
    fn from(val: Passkey) -> Self {
        val.0
    }
}

impl std::convert::TryFrom<u32> for Passkey {
    type Error = InvalidPasskey;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value <= 999_999 {
            Ok(Passkey(value))
        } else {
            Err(InvalidPasskey(()))
        }
    }
}

impl std::str::FromStr for Passkey {
    type Err = InvalidPasskey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>().map_err(|_| InvalidPasskey(())).and_then(Passkey::try_from)
    }
}

/// A custom pairing agent, consulted from the SMP reader thread whenever a
/// device's pairing state machine reaches a user-interaction state (spec
/// §4.6.3). Calls must not block indefinitely: doing so stalls that
/// device's SMP reader thread (not the transport's).
pub trait PairingAgent: Send + Sync {
    /// The input/output capabilities of this agent.
    fn io_capability(&self) -> IoCapability;

    /// Request pairing confirmation from the user ("Just Works" or numeric-comparison-less confirm).
    fn confirm(&self, _id: &DeviceId) -> Result<(), PairingRejected> {
        Err(PairingRejected)
    }

    /// Request numeric-comparison confirmation; `passkey` should be displayed for validation.
    fn confirm_passkey(&self, _id: &DeviceId, _passkey: Passkey) -> Result<(), PairingRejected> {
        Err(PairingRejected)
    }

    /// Request a 6-digit passkey from the user.
    fn request_passkey(&self, _id: &DeviceId) -> Result<Passkey, PairingRejected> {
        Err(PairingRejected)
    }

    /// Display a 6-digit passkey to the user until pairing completes or is cancelled.
    fn display_passkey(&self, _id: &DeviceId, _passkey: Passkey) {}
}

/// The simplest possible pairing agent: "Just Works" only, no user interaction.
pub struct NoInputOutputPairingAgent;

impl PairingAgent for NoInputOutputPairingAgent {
    fn io_capability(&self) -> IoCapability {
        IoCapability::NoInputNoOutput
    }

    fn confirm(&self, _id: &DeviceId) -> Result<(), PairingRejected> {
        Ok(())
    }
}
