#![warn(missing_docs)]

//! A userspace Bluetooth host stack that talks directly to a Bluetooth
//! controller over Linux's raw HCI and MGMT sockets, bypassing `bluetoothd`.
//! It provides adapter discovery, LE connection establishment, SMP pairing,
//! and GATT client access.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use btstack::{Config, DiscoveryPolicy, Manager};
//!
//! # fn main() -> Result<(), btstack::Error> {
//! let manager = Manager::open(Config::default())?;
//! let adapter = manager.adapters().into_iter().next().ok_or(btstack::error::ErrorKind::UnknownDevice)?;
//! adapter.set_powered(true)?;
//! adapter.start_discovery(DiscoveryPolicy::AutoOff)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Overview
//!
//! The primary functions provided by this crate are:
//!
//! - Adapter and device lifecycle:
//!   - [Discovering controllers][Manager::adapters] and powering them on
//!   - [Scanning][Adapter::start_discovery] for devices
//!   - [Connecting][Adapter::connect_device] to discovered devices
//!   - [Pairing][Device::pair_with_agent] with a configurable I/O-capability agent
//! - Accessing remote GATT services:
//!   - Discovering a device's [services][Device::discover_services]
//!   - Discovering a service's [characteristics][Service::characteristics]
//!   - Discovering a characteristic's [descriptors][Characteristic::descriptors]
//!   - [Read][Characteristic::read], [write][Characteristic::write], and
//!     [subscribe][Characteristic::subscribe] operations on remote characteristics
//!   - [Read][Descriptor::read] and [write][Descriptor::write] operations on descriptors
//!
//! # Feature flags
//!
//! The `serde` feature enables serializing/deserializing device identifiers.

mod adapter;
pub mod address;
pub mod btuuid;
mod characteristic;
pub mod codec;
pub mod config;
mod descriptor;
mod device;
pub mod error;
mod gatt;
mod hci;
mod l2cap;
mod manager;
pub mod pairing;
pub mod pdu;
mod service;
mod smp;
mod sock;
mod util;

use std::collections::HashMap;

pub use adapter::{Adapter, DiscoveredDevice, DiscoveryPolicy, DiscoveryState};
pub use address::{Address, AddressAndType, AddressType, RandomAddressKind};
pub use btuuid::BluetoothUuidExt;
pub use characteristic::Characteristic;
pub use config::Config;
pub use descriptor::Descriptor;
pub use device::{Device, DeviceId, ValueChangedEvent};
pub use error::Error;
pub use manager::Manager;
pub use pairing::{IoCapability, Passkey, PairingAgent};
pub use service::Service;
pub use uuid::Uuid;

/// Convenience alias for a result with [`Error`]
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Events generated by [`Adapter`] settings-change listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AdapterEvent {
    /// The adapter has become available (powered on and ready to use)
    Available,
    /// The adapter has become unavailable (powered off or otherwise disabled)
    Unavailable,
}

/// A device discovered during a scan operation (spec §4.5.5 "Discovery").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingDevice {
    /// The discovered device's identity.
    pub id: DeviceId,
    /// The advertisement data parsed from the EIR/AD report.
    pub adv_data: AdvertisementData,
    /// The signal strength in dBm of the received advertisement packet.
    pub rssi: Option<i16>,
}

/// Data included in a Bluetooth advertisement or scan response (CSS §A.1,
/// spec §4.5.5 "EIR/AD parsing").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementData {
    /// The (possibly shortened) local name of the device (CSS §A.1.2)
    pub local_name: Option<String>,
    /// Manufacturer specific data (CSS §A.1.4)
    pub manufacturer_data: Option<ManufacturerData>,
    /// Advertised GATT service UUIDs (CSS §A.1.1)
    pub services: Vec<Uuid>,
    /// Service associated data (CSS §A.1.11)
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Transmitted power level (CSS §A.1.5)
    pub tx_power_level: Option<i16>,
    /// Set to true for connectable advertising packets
    pub is_connectable: bool,
}

/// Manufacturer specific data included in Bluetooth advertisements (CSS §A.1.4).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ManufacturerData {
    /// Company identifier (Bluetooth SIG assigned numbers).
    pub company_id: u16,
    /// Manufacturer specific data.
    pub data: Vec<u8>,
}

/// GATT characteristic properties as defined in the Bluetooth Core
/// Specification, Vol 3, Part G, §3.3.1.1. Extended properties are also
/// included as defined in §3.3.3.1.
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CharacteristicProperties {
    pub broadcast: bool,
    pub read: bool,
    pub write_without_response: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
    pub authenticated_signed_writes: bool,
    pub extended_properties: bool,
    pub reliable_write: bool,
    pub writable_auxiliaries: bool,
}

impl CharacteristicProperties {
    /// Raw transmutation from [`u32`].
    ///
    /// Extended properties are in the upper bits.
    pub fn from_bits(bits: u32) -> Self {
        CharacteristicProperties {
            broadcast: (bits & (1 << 0)) != 0,
            read: (bits & (1 << 1)) != 0,
            write_without_response: (bits & (1 << 2)) != 0,
            write: (bits & (1 << 3)) != 0,
            notify: (bits & (1 << 4)) != 0,
            indicate: (bits & (1 << 5)) != 0,
            authenticated_signed_writes: (bits & (1 << 6)) != 0,
            extended_properties: (bits & (1 << 7)) != 0,
            reliable_write: (bits & (1 << 8)) != 0,
            writable_auxiliaries: (bits & (1 << 9)) != 0,
        }
    }

    /// Raw transmutation to [`u32`].
    ///
    /// Extended properties are in the upper bits.
    pub fn to_bits(self) -> u32 {
        u32::from(self.broadcast)
            | (u32::from(self.read) << 1)
            | (u32::from(self.write_without_response) << 2)
            | (u32::from(self.write) << 3)
            | (u32::from(self.notify) << 4)
            | (u32::from(self.indicate) << 5)
            | (u32::from(self.authenticated_signed_writes) << 6)
            | (u32::from(self.extended_properties) << 7)
            | (u32::from(self.reliable_write) << 8)
            | (u32::from(self.writable_auxiliaries) << 9)
    }
}
