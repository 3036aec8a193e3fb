//! A discovered characteristic, a thin facade over
//! [`crate::gatt::GattCharacteristic`] (spec §4.6.1).
//!
//! Clone-cheap newtype, equality by handle plus owning device identity.

use std::sync::Arc;

use uuid::Uuid;

use crate::descriptor::Descriptor;
use crate::device::{Device, ValueChangedEvent};
use crate::error::Error;
use crate::gatt::GattCharacteristic;
use crate::CharacteristicProperties;

#[derive(Clone)]
pub struct Characteristic {
    device: Arc<Device>,
    inner: GattCharacteristic,
}

impl Characteristic {
    pub(crate) fn new(device: Arc<Device>, inner: GattCharacteristic) -> Self {
        Characteristic { device, inner }
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn value_handle(&self) -> u16 {
        self.inner.value_handle
    }

    pub fn properties(&self) -> CharacteristicProperties {
        CharacteristicProperties::from_bits(self.inner.properties as u32)
    }

    /// A long read, transparently fragmented with `ReadBlobReq` as needed
    /// (spec §4.6.1 "Long read").
    pub fn read(&self) -> Result<Vec<u8>, Error> {
        self.device.read_characteristic(self.inner.value_handle)
    }

    pub fn write(&self, value: &[u8]) -> Result<(), Error> {
        self.device.write_characteristic(self.inner.value_handle, value, true)
    }

    pub fn write_without_response(&self, value: &[u8]) -> Result<(), Error> {
        self.device.write_characteristic(self.inner.value_handle, value, false)
    }

    /// Enables notification (or indication, if the characteristic only
    /// supports that) delivery and registers `callback` for each value
    /// change (spec §4.6.1 "Notification/Indication subscription").
    pub fn subscribe(&self, callback: impl Fn(ValueChangedEvent) + Send + Sync + 'static) -> Result<(), Error> {
        let props = self.properties();
        self.device.subscribe(&self.inner, props.notify, props.indicate && !props.notify, callback)
    }

    pub fn unsubscribe(&self) -> Result<(), Error> {
        self.device.unsubscribe(&self.inner)
    }

    pub fn descriptors(&self) -> Result<Vec<Descriptor>, Error> {
        Ok(self
            .device
            .descriptors(&self.inner)?
            .into_iter()
            .map(|d| Descriptor::new(self.device.clone(), d))
            .collect())
    }
}

impl PartialEq for Characteristic {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner && self.device.id() == other.device.id()
    }
}

impl Eq for Characteristic {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, AddressAndType, AddressType};
    use crate::config::Config;
    use crate::device::DeviceId;

    fn test_characteristic(value_handle: u16, properties: u8) -> Characteristic {
        let device = Device::new(
            DeviceId(AddressAndType {
                address: Address::any(),
                address_type: AddressType::LePublic,
            }),
            Config::default(),
        );
        Characteristic::new(
            device,
            GattCharacteristic {
                declaration_handle: value_handle - 1,
                properties,
                value_handle,
                uuid: crate::btuuid::characteristics::BATTERY_LEVEL,
                cccd_handle: None,
            },
        )
    }

    #[test]
    fn properties_decodes_notify_and_read_bits() {
        let c = test_characteristic(3, 0b0001_0010);
        let props = c.properties();
        assert!(props.read);
        assert!(props.notify);
        assert!(!props.write);
    }

    #[test]
    fn equality_is_by_handle_and_owning_device() {
        let a = test_characteristic(3, 0);
        let b = test_characteristic(3, 0);
        assert!(a == b);
        let c = test_characteristic(4, 0);
        assert!(a != c);
    }
}
