//! A characteristic descriptor, a thin facade over
//! [`crate::gatt::GattDescriptor`] (spec §4.6.1 "Discovery" step 3).
//!
//! Descriptor reads/writes use the same ATT read/write-by-handle operations
//! as characteristic values; the protocol does not distinguish them.
//!
//! Clone-cheap newtype, equality by handle plus owning device identity.

use std::sync::Arc;

use uuid::Uuid;

use crate::device::Device;
use crate::error::Error;
use crate::gatt::GattDescriptor;

#[derive(Clone)]
pub struct Descriptor {
    device: Arc<Device>,
    inner: GattDescriptor,
}

impl Descriptor {
    pub(crate) fn new(device: Arc<Device>, inner: GattDescriptor) -> Self {
        Descriptor { device, inner }
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn handle(&self) -> u16 {
        self.inner.handle
    }

    pub fn read(&self) -> Result<Vec<u8>, Error> {
        self.device.read_characteristic(self.inner.handle)
    }

    pub fn write(&self, value: &[u8]) -> Result<(), Error> {
        self.device.write_characteristic(self.inner.handle, value, true)
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner && self.device.id() == other.device.id()
    }
}

impl Eq for Descriptor {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, AddressAndType, AddressType};
    use crate::config::Config;
    use crate::device::DeviceId;

    fn test_descriptor(handle: u16) -> Descriptor {
        let device = Device::new(
            DeviceId(AddressAndType {
                address: Address::any(),
                address_type: AddressType::LePublic,
            }),
            Config::default(),
        );
        Descriptor::new(device, GattDescriptor { handle, uuid: crate::btuuid::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION })
    }

    #[test]
    fn equality_is_by_handle_and_owning_device() {
        assert!(test_descriptor(5) == test_descriptor(5));
        assert!(test_descriptor(5) != test_descriptor(6));
    }
}
