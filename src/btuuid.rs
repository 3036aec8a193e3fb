//! `Uuid` extensions and assigned-number constants for Bluetooth UUIDs.
//!
//! The full Bluetooth SIG assigned-numbers table has several hundred
//! entries; this keeps the subset this crate's GATT engine actually looks
//! up (Generic Access/Attribute, CCCD, and a representative sample of the
//! rest) rather than reproducing the whole grid — see DESIGN.md.

use uuid::Uuid;

pub const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Const function to create a 16-bit Bluetooth UUID
pub const fn bluetooth_uuid_from_u16(uuid: u16) -> Uuid {
    Uuid::from_u128(((uuid as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// Const function to create a 32-bit Bluetooth UUID
pub const fn bluetooth_uuid_from_u32(uuid: u32) -> Uuid {
    Uuid::from_u128(((uuid as u128) << 96) | BLUETOOTH_BASE_UUID)
}

mod private {
    use uuid::Uuid;

    pub trait Sealed {}
    impl Sealed for Uuid {}
}

/// Extension trait for [`uuid::Uuid`] with helpers for 16/32-bit Bluetooth UUIDs.
pub trait BluetoothUuidExt: private::Sealed {
    fn from_u16(uuid: u16) -> Self;
    fn from_u32(uuid: u32) -> Self;

    /// Creates a UUID from `bytes`.
    ///
    /// # Panics
    ///
    /// Panics if `bytes.len()` is not one of 2, 4, or 16. Only call this with
    /// a length this crate itself chose (e.g. a literal `put_uuid` width);
    /// for a length derived from wire data use [`Self::try_from_bluetooth_bytes`].
    fn from_bluetooth_bytes(bytes: &[u8]) -> Self;

    /// Creates a UUID from `bytes`, or `None` if `bytes.len()` is not one of
    /// 2, 4, or 16. Use this whenever the length comes from a peer-controlled
    /// field instead of [`Self::from_bluetooth_bytes`].
    fn try_from_bluetooth_bytes(bytes: &[u8]) -> Option<Self>
    where
        Self: Sized;

    fn is_u16_uuid(&self) -> bool;
    fn is_u32_uuid(&self) -> bool;

    fn try_to_u16(&self) -> Option<u16>;
    fn try_to_u32(&self) -> Option<u32>;

    /// The shortest wire representation of this UUID: 2 or 4 bytes if it
    /// falls within the Bluetooth base range, else the full 16 bytes.
    fn as_bluetooth_bytes(&self) -> &[u8];
}

impl BluetoothUuidExt for Uuid {
    fn from_u16(uuid: u16) -> Self {
        bluetooth_uuid_from_u16(uuid)
    }

    fn from_u32(uuid: u32) -> Self {
        bluetooth_uuid_from_u32(uuid)
    }

    fn from_bluetooth_bytes(bytes: &[u8]) -> Self {
        match Self::try_from_bluetooth_bytes(bytes) {
            Some(uuid) => uuid,
            None => panic!("invalid byte slice length {}", bytes.len()),
        }
    }

    fn try_from_bluetooth_bytes(bytes: &[u8]) -> Option<Self> {
        Some(match bytes.len() {
            2 => Self::from_u16(u16::from_be_bytes(bytes.try_into().ok()?)),
            4 => Self::from_u32(u32::from_be_bytes(bytes.try_into().ok()?)),
            16 => Self::from_bytes(bytes.try_into().ok()?),
            _ => return None,
        })
    }

    fn is_u16_uuid(&self) -> bool {
        let u = self.as_u128();
        (u & ((1 << 96) - 1)) == BLUETOOTH_BASE_UUID && (((u >> 96) as u32) & 0xffff0000) == 0
    }

    fn is_u32_uuid(&self) -> bool {
        let u = self.as_u128();
        (u & ((1 << 96) - 1)) == BLUETOOTH_BASE_UUID && (((u >> 96) as u32) & 0xffff0000) != 0
    }

    fn try_to_u16(&self) -> Option<u16> {
        let u = self.as_u128();
        self.is_u16_uuid().then(|| (u >> 96) as u16)
    }

    fn try_to_u32(&self) -> Option<u32> {
        let u = self.as_u128();
        self.is_u32_uuid().then(|| (u >> 96) as u32)
    }

    fn as_bluetooth_bytes(&self) -> &[u8] {
        let bytes = &*self.as_bytes();
        if self.is_u16_uuid() {
            &bytes[2..4]
        } else if self.is_u32_uuid() {
            &bytes[0..4]
        } else {
            &bytes[..]
        }
    }
}

/// Bluetooth GATT Service 16-bit UUIDs (representative subset).
pub mod services {
    #![allow(missing_docs)]

    use uuid::Uuid;

    use super::bluetooth_uuid_from_u16;

    pub const GENERIC_ACCESS: Uuid = bluetooth_uuid_from_u16(0x1800);
    pub const GENERIC_ATTRIBUTE: Uuid = bluetooth_uuid_from_u16(0x1801);
    pub const IMMEDIATE_ALERT: Uuid = bluetooth_uuid_from_u16(0x1802);
    pub const TX_POWER: Uuid = bluetooth_uuid_from_u16(0x1804);
    pub const DEVICE_INFORMATION: Uuid = bluetooth_uuid_from_u16(0x180A);
    pub const HEART_RATE: Uuid = bluetooth_uuid_from_u16(0x180D);
    pub const BATTERY: Uuid = bluetooth_uuid_from_u16(0x180F);
    pub const HUMAN_INTERFACE_DEVICE: Uuid = bluetooth_uuid_from_u16(0x1812);
}

/// Bluetooth GATT Characteristic 16-bit UUIDs (representative subset).
pub mod characteristics {
    #![allow(missing_docs)]

    use uuid::Uuid;

    use super::bluetooth_uuid_from_u16;

    pub const DEVICE_NAME: Uuid = bluetooth_uuid_from_u16(0x2A00);
    pub const APPEARANCE: Uuid = bluetooth_uuid_from_u16(0x2A01);
    pub const PERIPHERAL_PREFERRED_CONNECTION_PARAMETERS: Uuid = bluetooth_uuid_from_u16(0x2A04);
    pub const SERVICE_CHANGED: Uuid = bluetooth_uuid_from_u16(0x2A05);
    pub const BATTERY_LEVEL: Uuid = bluetooth_uuid_from_u16(0x2A19);
    pub const MANUFACTURER_NAME_STRING: Uuid = bluetooth_uuid_from_u16(0x2A29);
    pub const MODEL_NUMBER_STRING: Uuid = bluetooth_uuid_from_u16(0x2A24);
}

/// Bluetooth GATT Descriptor 16-bit UUIDs.
pub mod descriptors {
    #![allow(missing_docs)]

    use uuid::Uuid;

    use super::bluetooth_uuid_from_u16;

    pub const CHARACTERISTIC_EXTENDED_PROPERTIES: Uuid = bluetooth_uuid_from_u16(0x2900);
    pub const CHARACTERISTIC_USER_DESCRIPTION: Uuid = bluetooth_uuid_from_u16(0x2901);
    pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = bluetooth_uuid_from_u16(0x2902);
    pub const SERVER_CHARACTERISTIC_CONFIGURATION: Uuid = bluetooth_uuid_from_u16(0x2903);
    pub const CHARACTERISTIC_PRESENTATION_FORMAT: Uuid = bluetooth_uuid_from_u16(0x2904);
}

/// ATT/GATT-internal attribute types used by discovery (spec §4.6.1).
pub mod attribute_types {
    #![allow(missing_docs)]

    use uuid::Uuid;

    use super::bluetooth_uuid_from_u16;

    pub const PRIMARY_SERVICE: Uuid = bluetooth_uuid_from_u16(0x2800);
    pub const SECONDARY_SERVICE: Uuid = bluetooth_uuid_from_u16(0x2801);
    pub const INCLUDE: Uuid = bluetooth_uuid_from_u16(0x2802);
    pub const CHARACTERISTIC: Uuid = bluetooth_uuid_from_u16(0x2803);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_uuid_round_trips() {
        let uuid = services::GENERIC_ACCESS;
        assert!(uuid.is_u16_uuid());
        assert_eq!(uuid.try_to_u16(), Some(0x1800));
        assert_eq!(uuid.as_bluetooth_bytes().len(), 2);
    }
}
