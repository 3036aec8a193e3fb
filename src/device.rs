//! Device lifecycle (spec §4.5, §9): a remote peer's connection state,
//! pairing record, and GATT access, addressed by its address-and-type.
//!
//! A thin-facade newtype delegating every call to a backend, generalized
//! here so the backend *is* this crate's own protocol engines rather than
//! an external platform API.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::address::{Address, AddressAndType, AddressType};
use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::gatt::{GattCharacteristic, GattDescriptor, GattEngine, GattService};
use crate::l2cap::L2capChannel;
use crate::pairing::PairingAgent;
use crate::service::Service;
use crate::smp::{KeyMaterial, PairingMode as SmpPairingMode, PairingState, SmpEngine, SmpKeyBin};
use crate::util::ListenerList;

/// A stable identifier for a remote device: its address-and-type pair is
/// the equality key (spec §3 "an address-and-type pair is the equality key
/// for a remote device").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(pub AddressAndType);

impl DeviceId {
    pub fn address(&self) -> AddressAndType {
        self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.address)
    }
}

/// A characteristic or descriptor value-change notification (spec §4.6.1).
#[derive(Debug, Clone)]
pub struct ValueChangedEvent {
    pub handle: u16,
    pub value: Vec<u8>,
}

/// Snapshot of a connected device's two protocol engines, torn down
/// together on disconnect.
struct ConnectedLink {
    gatt: Arc<GattEngine>,
    smp: Arc<SmpEngine>,
}

/// One remote device's full state (spec §4.5.4 "Device sets", §9 "cyclic
/// device/adapter references"). Cheap to clone: it's an `Arc`-backed handle.
pub struct Device {
    id: DeviceId,
    config: Config,
    name: Mutex<Option<String>>,
    is_connected: AtomicBool,
    connection_handle: AtomicU16,
    link: Mutex<Option<ConnectedLink>>,
    services: Mutex<Vec<(GattService, Vec<GattCharacteristic>)>>,
    key_bin_dir: Mutex<Option<std::path::PathBuf>>,
    /// This adapter's own local address (spec §3 "Adapter info"), threaded
    /// in from [`crate::adapter::Adapter`] so key-bin filtering (spec §6
    /// "multi-adapter key-bin isolation") distinguishes one adapter's
    /// bonded peers from another's instead of a shared placeholder.
    local_address: Mutex<Option<Address>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    /// Fired once pairing completes (spec §4.5.2 `PauseConnectedUntilPaired`
    /// discovery-resume hook); empty for devices an adapter never registers
    /// interest on.
    pairing_listeners: ListenerList<Arc<dyn Fn() + Send + Sync>>,
}

impl Device {
    pub fn new(id: DeviceId, config: Config) -> Arc<Self> {
        Arc::new(Device {
            id,
            config,
            name: Mutex::new(None),
            is_connected: AtomicBool::new(false),
            connection_handle: AtomicU16::new(0),
            link: Mutex::new(None),
            services: Mutex::new(Vec::new()),
            key_bin_dir: Mutex::new(None),
            local_address: Mutex::new(None),
            watchdog: Mutex::new(None),
            pairing_listeners: ListenerList::new(),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().unwrap().clone()
    }

    pub(crate) fn set_name(&self, name: String) {
        *self.name.lock().unwrap() = Some(name);
    }

    /// Non-zero connection handle iff connected (spec §8 P1).
    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    pub fn connection_handle(&self) -> Option<u16> {
        let h = self.connection_handle.load(Ordering::Acquire);
        (h != 0).then_some(h)
    }

    pub fn is_paired(&self) -> bool {
        self.link.lock().unwrap().as_ref().map(|l| l.smp.state() != PairingState::None && l.smp.state() != PairingState::Failed).unwrap_or(false)
    }

    pub fn set_key_bin_dir(&self, dir: std::path::PathBuf) {
        *self.key_bin_dir.lock().unwrap() = Some(dir);
    }

    pub fn add_pairing_listener(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.pairing_listeners.push(Arc::new(callback));
    }

    pub fn set_local_address(&self, address: Address) {
        *self.local_address.lock().unwrap() = Some(address);
    }

    fn local_address(&self) -> Address {
        self.local_address.lock().unwrap().unwrap_or(Address::any())
    }

    /// Establishes the ATT and SMP L2CAP channels against a live connection
    /// handle (spec §4.5.3 "Connection gate" hands this a claimed slot).
    pub(crate) fn attach(
        self: &Arc<Self>,
        connection_handle: u16,
        att_channel: Arc<L2capChannel>,
        smp_channel: Arc<L2capChannel>,
        agent: Arc<dyn PairingAgent>,
    ) -> Result<(), Error> {
        let this = self.clone();
        let gatt = GattEngine::open(att_channel, self.config.clone(), true, move || {
            this.handle_link_dead();
        })?;

        let device_id = self.id;
        let on_completed_dev = self.clone();
        let on_failed_dev = self.clone();
        let smp = SmpEngine::open(
            smp_channel,
            device_id,
            agent,
            move |id, mode| on_completed_dev.handle_pairing_completed(id, mode),
            move |id, reason| on_failed_dev.handle_pairing_failed(id, reason),
        );

        if let Some(dir) = self.key_bin_dir.lock().unwrap().as_ref() {
            if let Some(bin) = SmpKeyBin::scan_dir(dir, self.local_address()).into_iter().find(|b| b.remote_address == self.id.0) {
                smp.adopt_pre_paired(KeyMaterial {
                    ltk: bin.ltk,
                    ediv: bin.ediv,
                    rand: bin.rand,
                    irk: bin.irk,
                    csrk: bin.csrk,
                    identity_address: None,
                });
            }
        }

        *self.link.lock().unwrap() = Some(ConnectedLink { gatt, smp });
        self.connection_handle.store(connection_handle, Ordering::Release);
        self.is_connected.store(true, Ordering::Release);
        self.spawn_smp_watchdog();
        Ok(())
    }

    /// Drives `smp_watchdog_tick` every `smp_watchdog_interval` until the
    /// device disconnects (spec §4.6.2 "Pairing watchdog"). Wakes in short
    /// slices rather than sleeping the full interval so a disconnect is
    /// noticed promptly instead of leaving a stalled pairing live.
    fn spawn_smp_watchdog(self: &Arc<Self>) {
        let interval = self.config.smp_watchdog_interval;
        let slice = interval.min(Duration::from_millis(200));
        let weak: Weak<Device> = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("btstack-smp-watchdog".into())
            .spawn(move || {
                let mut elapsed = Duration::ZERO;
                loop {
                    std::thread::sleep(slice);
                    let Some(device) = weak.upgrade() else { return };
                    if !device.is_connected() {
                        return;
                    }
                    elapsed += slice;
                    if elapsed < interval {
                        continue;
                    }
                    elapsed = Duration::ZERO;
                    if device.smp_watchdog_tick() {
                        tracing::warn!(target: "btstack::device", address = %device.id(), "SMP pairing watchdog tripped, disconnecting");
                        device.disconnect_internal();
                        return;
                    }
                }
            })
            .expect("spawning SMP watchdog thread");
        *self.watchdog.lock().unwrap() = Some(handle);
    }

    fn handle_link_dead(&self) {
        self.disconnect_internal();
    }

    fn handle_pairing_completed(&self, _id: DeviceId, _mode: SmpPairingMode) {
        if let Some(dir) = self.key_bin_dir.lock().unwrap().as_ref() {
            if let Some(link) = self.link.lock().unwrap().as_ref() {
                let record = link.smp.record_snapshot();
                let bin = SmpKeyBin {
                    local_address: AddressAndType {
                        address: self.local_address(),
                        address_type: AddressType::LePublic,
                    },
                    remote_address: self.id.0,
                    role: crate::smp::Role::Master,
                    mode: keybin_mode(record.mode),
                    security_level: 2,
                    ltk: record.local_keys.ltk,
                    ediv: record.local_keys.ediv,
                    rand: record.local_keys.rand,
                    irk: record.local_keys.irk,
                    csrk: record.local_keys.csrk,
                    created_at_unix: crate::smp::keybin::now_unix(),
                };
                if let Err(e) = bin.write_to_dir(dir) {
                    tracing::warn!(target: "btstack::device", error = %e, "failed to persist SMP key bin");
                }
            }
        }
        for listener in self.pairing_listeners.snapshot().iter() {
            listener();
        }
    }

    fn handle_pairing_failed(&self, _id: DeviceId, reason: crate::error::SmpReason) {
        tracing::warn!(target: "btstack::device", ?reason, "pairing failed");
    }

    fn disconnect_internal(&self) {
        if let Some(link) = self.link.lock().unwrap().take() {
            link.gatt.close();
            link.smp.close();
        }
        self.is_connected.store(false, Ordering::Release);
        self.connection_handle.store(0, Ordering::Release);
        self.services.lock().unwrap().clear();
        // Not joined: the watchdog may be the caller (it disconnects itself
        // on trip), and a thread cannot join itself. It observes
        // `is_connected` on its next short wake and exits on its own.
        self.watchdog.lock().unwrap().take();
    }

    pub fn disconnect(&self) {
        self.disconnect_internal();
    }

    fn gatt(&self) -> Result<Arc<GattEngine>, Error> {
        self.link.lock().unwrap().as_ref().map(|l| l.gatt.clone()).ok_or_else(|| ErrorKind::NotConnected.into())
    }

    fn smp(&self) -> Result<Arc<SmpEngine>, Error> {
        self.link.lock().unwrap().as_ref().map(|l| l.smp.clone()).ok_or_else(|| ErrorKind::NotConnected.into())
    }

    /// Discovers this device's primary services, returning the public
    /// [`Service`] facade directly (mirroring the teacher's
    /// `discover_services` returning its own wrapped `Service`, not a raw
    /// backend type).
    pub fn discover_services(self: &Arc<Self>) -> Result<Vec<Service>, Error> {
        let all = self.gatt()?.discover_all()?;
        let services: Vec<_> = all.iter().map(|(s, _)| Service::new(self.clone(), s.clone())).collect();
        *self.services.lock().unwrap() = all;
        Ok(services)
    }

    pub fn characteristics(&self, service: &GattService) -> Vec<GattCharacteristic> {
        self.services
            .lock()
            .unwrap()
            .iter()
            .find(|(s, _)| s == service)
            .map(|(_, c)| c.clone())
            .unwrap_or_default()
    }

    /// Re-discovers the descriptors within `characteristic`'s value range
    /// (spec §4.6.1 step 3). Not cached: descriptor enumeration is rare
    /// enough that a fresh `FindInformationReq` sweep is cheaper than
    /// tracking a third nested collection alongside `services`.
    pub fn descriptors(&self, characteristic: &GattCharacteristic) -> Result<Vec<GattDescriptor>, Error> {
        let services = self.services.lock().unwrap();
        let Some((service, chars)) = services.iter().find(|(_, cs)| cs.iter().any(|c| c == characteristic)) else {
            return Ok(Vec::new());
        };
        let idx = chars.iter().position(|c| c == characteristic).unwrap();
        let next_value_handle = chars.get(idx + 1).map(|c| c.declaration_handle).unwrap_or(service.end_handle + 1);
        let range_end = next_value_handle.saturating_sub(1).max(characteristic.value_handle).min(service.end_handle);
        drop(services);
        let (descriptors, _) = self.gatt()?.discover_descriptors(characteristic.value_handle, range_end)?;
        Ok(descriptors)
    }

    pub fn read_characteristic(&self, handle: u16) -> Result<Vec<u8>, Error> {
        self.gatt()?.read(handle)
    }

    pub fn write_characteristic(&self, handle: u16, value: &[u8], with_response: bool) -> Result<(), Error> {
        let gatt = self.gatt()?;
        if with_response {
            gatt.write_with_response(handle, value)
        } else {
            gatt.write_without_response(handle, value)
        }
    }

    pub fn subscribe(&self, characteristic: &GattCharacteristic, notify: bool, indicate: bool, callback: impl Fn(ValueChangedEvent) + Send + Sync + 'static) -> Result<(), Error> {
        let Some(cccd) = characteristic.cccd_handle else {
            return Err(ErrorKind::InvalidParameters.into());
        };
        let gatt = self.gatt()?;
        let value_handle = characteristic.value_handle;
        gatt.add_characteristic_listener(value_handle, move |handle, value, _ts| {
            callback(ValueChangedEvent {
                handle,
                value: value.to_vec(),
            });
        });
        gatt.set_notify_indicate(cccd, notify, indicate)
    }

    pub fn unsubscribe(&self, characteristic: &GattCharacteristic) -> Result<(), Error> {
        let gatt = self.gatt()?;
        gatt.remove_characteristic_listeners(characteristic.value_handle);
        match characteristic.cccd_handle {
            Some(cccd) => gatt.set_notify_indicate(cccd, false, false),
            None => Ok(()),
        }
    }

    /// Starts pairing using `agent`'s I/O capabilities (spec §4.6.3).
    pub fn pair_with_agent(&self, agent: &dyn PairingAgent) -> Result<(), Error> {
        let smp = self.smp()?;
        smp.start_pairing(agent.io_capability(), default_auth_req(), 16, 0, 0)
    }

    pub fn ping(&self, appearance_handle: u16) -> Result<(), Error> {
        self.gatt()?.ping(appearance_handle)
    }

    /// Watchdog tick for the pairing state machine (spec §4.6.2 "Pairing
    /// watchdog"); returns `true` if it tripped and the link should be torn
    /// down by the caller.
    pub fn smp_watchdog_tick(&self) -> bool {
        match self.smp() {
            Ok(smp) => smp.watchdog_tick(),
            Err(_) => false,
        }
    }
}

fn default_auth_req() -> u8 {
    crate::pdu::smp::auth_req::BONDING | crate::pdu::smp::auth_req::MITM
}

fn keybin_mode(mode: Option<SmpPairingMode>) -> crate::smp::keybin::PairingMode {
    use crate::smp::keybin::PairingMode as Kb;
    match mode {
        Some(SmpPairingMode::JustWorks) | None => Kb::JustWorks,
        Some(SmpPairingMode::PasskeyEntry) => Kb::PasskeyEntry,
        Some(SmpPairingMode::NumericComparison) => Kb::NumericComparison,
        Some(SmpPairingMode::OutOfBand) => Kb::OutOfBand,
        Some(SmpPairingMode::PrePaired) => Kb::PrePaired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::btuuid::{characteristics, services};
    use crate::codec::{ByteOrder, ByteWriter};
    use crate::l2cap::{L2capChannel, L2capSocket};
    use crate::pairing::NoInputOutputPairingAgent;
    use crate::pdu::att;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct FakeSocket {
        inbox: Mutex<VecDeque<Vec<u8>>>,
        closed: AtomicBool,
    }

    impl FakeSocket {
        fn new(frames: Vec<Vec<u8>>) -> Arc<Self> {
            Arc::new(FakeSocket {
                inbox: Mutex::new(VecDeque::from(frames)),
                closed: AtomicBool::new(false),
            })
        }
    }

    impl L2capSocket for FakeSocket {
        fn send(&self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn recv(&self, buf: &mut [u8], _poll_timeout: Duration) -> io::Result<Option<usize>> {
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            match self.inbox.lock().unwrap().pop_front() {
                Some(frame) => {
                    buf[..frame.len()].copy_from_slice(&frame);
                    Ok(Some(frame.len()))
                }
                None => {
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(None)
                }
            }
        }

        fn interrupt(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    fn test_device() -> Arc<Device> {
        Device::new(
            DeviceId(AddressAndType {
                address: Address::any(),
                address_type: AddressType::LePublic,
            }),
            Config::default(),
        )
    }

    fn read_by_group_type_rsp(start: u16, end: u16, uuid: uuid::Uuid) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_u8(att::opcode::ReadByGroupTypeRsp);
        w.put_u8(6);
        w.put_u16(start, ByteOrder::Little);
        w.put_u16(end, ByteOrder::Little);
        w.put_uuid(&uuid, 2);
        w.into_bytes()
    }

    fn read_by_type_rsp(decl: u16, properties: u8, value: u16, uuid: uuid::Uuid) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_u8(att::opcode::ReadByTypeRsp);
        w.put_u8(7);
        w.put_u16(decl, ByteOrder::Little);
        w.put_u8(properties);
        w.put_u16(value, ByteOrder::Little);
        w.put_uuid(&uuid, 2);
        w.into_bytes()
    }

    fn find_information_rsp_empty() -> Vec<u8> {
        vec![att::opcode::FindInformationRsp, 1]
    }

    #[test]
    fn operations_on_unconnected_device_return_not_connected() {
        let device = test_device();
        assert_eq!(device.read_characteristic(3).unwrap_err().kind, ErrorKind::NotConnected);
        assert_eq!(device.write_characteristic(3, b"x", true).unwrap_err().kind, ErrorKind::NotConnected);
        assert_eq!(device.ping(1).unwrap_err().kind, ErrorKind::NotConnected);
        assert_eq!(device.pair_with_agent(&NoInputOutputPairingAgent).unwrap_err().kind, ErrorKind::NotConnected);
        assert!(!device.smp_watchdog_tick());
    }

    #[test]
    fn descriptors_for_unknown_characteristic_returns_empty_without_a_connection() {
        let device = test_device();
        let characteristic = GattCharacteristic {
            declaration_handle: 2,
            properties: 0x12,
            value_handle: 3,
            uuid: characteristics::BATTERY_LEVEL,
            cccd_handle: None,
        };
        assert_eq!(device.descriptors(&characteristic).unwrap(), Vec::new());
    }

    #[test]
    fn attach_then_discover_services_populates_the_service_cache() {
        let device = test_device();
        let att_frames = vec![
            att::exchange_mtu_rsp(23),
            read_by_group_type_rsp(1, 5, services::BATTERY),
            att::error_rsp(att::opcode::ReadByGroupTypeReq, 6, 0x0a),
            read_by_type_rsp(2, 0x12, 3, characteristics::BATTERY_LEVEL),
            att::error_rsp(att::opcode::ReadByTypeReq, 3, 0x0a),
            find_information_rsp_empty(),
            find_information_rsp_empty(),
        ];
        let att_channel = Arc::new(L2capChannel::with_socket(FakeSocket::new(att_frames), Duration::from_millis(5)));
        let smp_channel = Arc::new(L2capChannel::with_socket(FakeSocket::new(vec![]), Duration::from_millis(5)));

        device.attach(1, att_channel, smp_channel, Arc::new(NoInputOutputPairingAgent)).unwrap();
        assert!(device.is_connected());
        assert_eq!(device.connection_handle(), Some(1));

        let discovered = device.discover_services().unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].uuid(), services::BATTERY);

        let chars = discovered[0].characteristics();
        assert_eq!(chars.len(), 1);
        assert_eq!(chars[0].uuid(), characteristics::BATTERY_LEVEL);

        let descriptors = chars[0].descriptors().unwrap();
        assert!(descriptors.is_empty());

        device.disconnect();
        assert!(!device.is_connected());
    }
}
