//! A discovered primary service, a thin facade over [`crate::gatt::GattService`]
//! plus its already-discovered characteristics (spec §4.6.1).
//!
//! Clone-cheap newtype, equality by handle range plus owning device identity.

use std::sync::Arc;

use uuid::Uuid;

use crate::characteristic::Characteristic;
use crate::device::Device;
use crate::gatt::GattService;

#[derive(Clone)]
pub struct Service {
    device: Arc<Device>,
    inner: GattService,
}

impl Service {
    pub(crate) fn new(device: Arc<Device>, inner: GattService) -> Self {
        Service { device, inner }
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn start_handle(&self) -> u16 {
        self.inner.start_handle
    }

    pub fn end_handle(&self) -> u16 {
        self.inner.end_handle
    }

    pub fn characteristics(&self) -> Vec<Characteristic> {
        self.device
            .characteristics(&self.inner)
            .into_iter()
            .map(|c| Characteristic::new(self.device.clone(), c))
            .collect()
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner && self.device.id() == other.device.id()
    }
}

impl Eq for Service {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, AddressAndType, AddressType};
    use crate::config::Config;
    use crate::device::DeviceId;

    fn test_service(start_handle: u16, end_handle: u16) -> (Arc<Device>, Service) {
        let device = Device::new(
            DeviceId(AddressAndType {
                address: Address::any(),
                address_type: AddressType::LePublic,
            }),
            Config::default(),
        );
        let inner = GattService {
            uuid: crate::btuuid::services::BATTERY,
            start_handle,
            end_handle,
        };
        (device.clone(), Service::new(device, inner))
    }

    #[test]
    fn characteristics_is_empty_before_discovery() {
        let (_device, service) = test_service(1, 5);
        assert!(service.characteristics().is_empty());
    }

    #[test]
    fn equality_is_by_handle_range_and_owning_device() {
        let (_, a) = test_service(1, 5);
        let (_, b) = test_service(1, 5);
        assert!(a == b);
        let (_, c) = test_service(1, 6);
        assert!(a != c);
    }
}
