//! Compiles (never runs) a walk over the crate's full public API shape, the
//! same role the teacher's own `tests/check_api.rs` plays for its async API.

#![allow(clippy::let_unit_value)]

use std::sync::Arc;
use std::time::Duration;

use btstack::pairing::NoInputOutputPairingAgent;
use btstack::{Adapter, Characteristic, Config, Descriptor, Device, DeviceId, DiscoveryPolicy, Error, Manager, Service};

fn assert_send<T: Send>(t: T) -> T {
    t
}

#[allow(unused)]
fn check_manager_apis() -> Result<Arc<Adapter>, Error> {
    let manager: Arc<Manager> = assert_send(Manager::open(Config::default())?);
    let adapters: Vec<Arc<Adapter>> = assert_send(manager.adapters());
    Ok(adapters.into_iter().next().unwrap())
}

#[allow(unused)]
fn check_adapter_apis(adapter: Arc<Adapter>) -> Result<Arc<Device>, Error> {
    let _index: u16 = assert_send(adapter.index());
    let _powered: bool = assert_send(adapter.is_powered());
    let _set_powered: () = assert_send(adapter.set_powered(true)?);

    adapter.add_settings_listener(|_old: u32, _new: u32, _diff: u32| {});
    adapter.add_discovery_listener(|_device| {});

    let _start: () = assert_send(adapter.start_discovery(DiscoveryPolicy::AutoOff)?);
    let _stop: () = assert_send(adapter.stop_discovery()?);
    let _state: btstack::DiscoveryState = assert_send(adapter.discovery_state());
    let _discovered: Vec<btstack::DiscoveredDevice> = assert_send(adapter.discovered_devices());
    let _connected: Vec<Arc<Device>> = assert_send(adapter.connected_devices());

    let id: DeviceId = adapter.discovered_devices().into_iter().next().unwrap().id;
    let device: Arc<Device> = assert_send(adapter.connect_device(id)?);
    let _disconnect: () = assert_send(adapter.disconnect_device(id)?);

    Ok(device)
}

#[allow(unused)]
fn check_device_apis(device: Arc<Device>) -> Result<Service, Error> {
    let _id: DeviceId = device.id();
    let _name: Option<String> = device.name();
    let _is_connected: bool = device.is_connected();
    let _is_paired: bool = device.is_paired();
    let _handle: Option<u16> = device.connection_handle();

    let _pair: () = assert_send(device.pair_with_agent(&NoInputOutputPairingAgent)?);

    let services: Vec<Service> = assert_send(device.discover_services()?);

    Ok(services.into_iter().next().unwrap())
}

#[allow(unused)]
fn check_service_apis(service: Service) -> Result<Characteristic, Error> {
    let _uuid: uuid::Uuid = service.uuid();
    let characteristics: Vec<Characteristic> = assert_send(service.characteristics());
    Ok(characteristics.into_iter().next().unwrap())
}

#[allow(unused)]
fn check_characteristic_apis(characteristic: Characteristic) -> Result<Descriptor, Error> {
    let _uuid: uuid::Uuid = characteristic.uuid();
    let _value: Vec<u8> = assert_send(characteristic.read()?);
    let _res: () = assert_send(characteristic.write(&[0u8])?);
    let _res: () = assert_send(characteristic.write_without_response(&[0u8])?);
    let _subscribed: () = assert_send(characteristic.subscribe(|_event| {})?);

    let descriptors: Vec<Descriptor> = assert_send(characteristic.descriptors()?);
    Ok(descriptors.into_iter().next().unwrap())
}

#[allow(unused)]
fn check_descriptor_apis(descriptor: Descriptor) -> Result<(), Error> {
    let _value: Vec<u8> = assert_send(descriptor.read()?);
    let _res: () = assert_send(descriptor.write(&[0u8])?);
    Ok(())
}

#[allow(unused)]
fn check_apis() -> Result<(), Error> {
    let adapter = check_manager_apis()?;
    let device = check_adapter_apis(adapter)?;
    let service = check_device_apis(device)?;
    let characteristic = check_service_apis(service)?;
    let descriptor = check_characteristic_apis(characteristic)?;
    check_descriptor_apis(descriptor)?;
    let _timeout = Duration::from_secs(1);
    Ok(())
}

fn main() {}
