//! Adapter lifecycle: discovery, the connection gate, and the device sets
//! (spec §4.5).
//!
//! Built around the "one adapter owns the control socket and fans out
//! events to listeners" shape, rebuilt here atop this crate's own
//! `hci::Transport` rather than an async session handle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::address::{Address, AddressAndType, AddressType};
use crate::config::Config;
use crate::device::{Device, DeviceId};
use crate::error::{Error, ErrorKind, HciStatus};
use crate::hci::{RawHciChannel, Transport};
use crate::l2cap::L2capChannel;
use crate::pairing::PairingAgent;
use crate::pdu::hci::HciEvent;
use crate::pdu::mgmt::{self, settings, ControllerInfo, MgmtEvent};
use crate::sock::{SecurityLevel, CID_ATT, CID_SMP};
use crate::util::ListenerList;

/// Discovery pause policy applied on a connection event (spec §4.5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPolicy {
    /// Simply stop discovery on connect; the caller must restart it.
    AutoOff,
    /// Pause discovery while any device is connecting/connected, and
    /// auto-restart once the last paused device disconnects.
    PauseConnectedUntilDisconnected,
    /// Auto-restart once the last paused device finishes its connect
    /// handshake (this crate has no separate "ready" signal past attach
    /// completing, so `Ready` and attach completion are synonymous here).
    PauseConnectedUntilReady,
    /// Auto-restart once the last paused device completes pairing.
    PauseConnectedUntilPaired,
    /// Stop discovery, then immediately restart it.
    AlwaysOn,
}

/// Settings-derived discovery enablement (spec §4.5.2 "Discovery state
/// machine"): `meta_scan` is what the application asked for, `native_scan`
/// is what the controller is actually doing; they diverge briefly around
/// pause/resume transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryState {
    pub meta_scan: bool,
    pub native_scan: bool,
    pub policy: DiscoveryPolicy,
    /// Devices whose connection is causing a temporary scan pause (spec
    /// §4.5.2); non-empty only between a pausing connect and the condition
    /// (disconnect/ready/paired) its policy names.
    pub paused_devices: HashSet<AddressAndType>,
}

/// A device observed during discovery, with its most recent advertisement.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    pub rssi: Option<i8>,
    pub eir: Vec<u8>,
}

/// Settings-diff listener (spec §4.5.1): `(old, new, diff)`, all as raw
/// current-settings bitmasks (spec §3). `NONE` is `0`.
type AdapterEventListener = Arc<dyn Fn(u32, u32, u32) + Send + Sync>;
type DiscoveryListener = Arc<dyn Fn(DiscoveredDevice) + Send + Sync>;

/// Single-slot connection gate (spec §4.5.3): only one connect attempt may
/// be in flight at a time, because the controller serializes LE connection
/// creation.
struct ConnectGate {
    busy: Mutex<bool>,
    released: Condvar,
}

impl ConnectGate {
    fn new() -> Self {
        ConnectGate {
            busy: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    fn lock_connect(&self, timeout: std::time::Duration) -> Result<(), Error> {
        let mut busy = self.busy.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while *busy {
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(ErrorKind::Timeout.into());
            }
            let (guard, result) = self.released.wait_timeout(busy, deadline - now).unwrap();
            busy = guard;
            if result.timed_out() && *busy {
                return Err(ErrorKind::Timeout.into());
            }
        }
        *busy = true;
        Ok(())
    }

    fn unlock(&self) {
        *self.busy.lock().unwrap() = false;
        self.released.notify_all();
    }
}

/// Owns the controller's MGMT control socket and the three device sets
/// (spec §4.5.4: shared/discovered/connected).
pub struct Adapter {
    index: u16,
    config: Config,
    transport: Arc<Transport>,
    devices: Mutex<HashMap<AddressAndType, Arc<Device>>>,
    discovered: Mutex<HashMap<AddressAndType, DiscoveredDevice>>,
    connected: Mutex<Vec<AddressAndType>>,
    current_settings: AtomicU32,
    discovery: Mutex<DiscoveryState>,
    scan_restart_attempts: AtomicU32,
    connect_gate: ConnectGate,
    agent: Arc<dyn PairingAgent>,
    key_bin_dir: Option<std::path::PathBuf>,
    settings_listeners: ListenerList<AdapterEventListener>,
    discovery_listeners: ListenerList<DiscoveryListener>,
    /// This controller's own identity (spec §3 "Adapter info"), filled in by
    /// [`Self::initialize_adapter`]. `None` until then (e.g. in tests that
    /// construct an `Adapter` directly over a fake socket).
    info: Mutex<Option<ControllerInfo>>,
    /// The raw HCI event channel used only to backfill a real connection
    /// handle (spec §8 P1); absent when it couldn't be opened (typically a
    /// missing `CAP_NET_RAW`), in which case handles are synthesized.
    raw_hci: Mutex<Option<Arc<RawHciChannel>>>,
    pending_handles: Mutex<HashMap<AddressAndType, u16>>,
    next_synthetic_handle: AtomicU16,
    self_weak: Mutex<std::sync::Weak<Adapter>>,
}

impl Adapter {
    /// Opens the transport for `index`, subscribes to its events (spec
    /// §4.5.1 "Settings change dispatch"), and runs the "Initialize adapter"
    /// sequence (spec §4.3) before returning.
    pub fn open(index: u16, config: Config, agent: Arc<dyn PairingAgent>, key_bin_dir: Option<std::path::PathBuf>) -> Result<Arc<Self>, Error> {
        let transport = Transport::open(config.clone())?;
        // Deferred preload: key-bin filtering needs this adapter's real
        // local address, which `initialize_adapter`'s `ReadControllerInfo`
        // step supplies (spec §6 "multi-adapter key-bin isolation").
        let adapter = Self::build(index, transport, config, agent, key_bin_dir, false);
        adapter.initialize_adapter()?;
        adapter.preload_key_bins();
        Ok(adapter)
    }

    /// Builds an `Adapter` over an already-open transport without running
    /// the initialize sequence, for tests driving a fake socket directly.
    /// Preloads key bins immediately (there is no real local address to
    /// wait for in this path).
    pub fn with_transport(index: u16, transport: Arc<Transport>, config: Config, agent: Arc<dyn PairingAgent>, key_bin_dir: Option<std::path::PathBuf>) -> Arc<Self> {
        Self::build(index, transport, config, agent, key_bin_dir, true)
    }

    fn build(index: u16, transport: Arc<Transport>, config: Config, agent: Arc<dyn PairingAgent>, key_bin_dir: Option<std::path::PathBuf>, auto_preload: bool) -> Arc<Self> {
        let adapter = Arc::new(Adapter {
            index,
            config: config.clone(),
            transport,
            devices: Mutex::new(HashMap::new()),
            discovered: Mutex::new(HashMap::new()),
            connected: Mutex::new(Vec::new()),
            current_settings: AtomicU32::new(0),
            discovery: Mutex::new(DiscoveryState {
                meta_scan: false,
                native_scan: false,
                policy: DiscoveryPolicy::AutoOff,
                paused_devices: HashSet::new(),
            }),
            scan_restart_attempts: AtomicU32::new(0),
            connect_gate: ConnectGate::new(),
            agent,
            key_bin_dir,
            settings_listeners: ListenerList::new(),
            discovery_listeners: ListenerList::new(),
            info: Mutex::new(None),
            raw_hci: Mutex::new(None),
            pending_handles: Mutex::new(HashMap::new()),
            next_synthetic_handle: AtomicU16::new(1),
            self_weak: Mutex::new(std::sync::Weak::new()),
        });
        *adapter.self_weak.lock().unwrap() = Arc::downgrade(&adapter);

        let listener_adapter = adapter.clone();
        adapter.transport.add_listener(Some(index), move |event| listener_adapter.handle_event(event));
        match RawHciChannel::open(index, config.l2cap_poll_timeout) {
            Ok(channel) => {
                let handle_adapter = adapter.clone();
                channel.add_listener(move |event| handle_adapter.handle_hci_event(event));
                *adapter.raw_hci.lock().unwrap() = Some(channel);
            }
            Err(e) => {
                tracing::warn!(target: "btstack::adapter", error = %e, "raw HCI channel unavailable, connection handles will be synthesized");
            }
        }
        if auto_preload {
            adapter.preload_key_bins();
        }
        adapter
    }

    /// Runs the mandatory MGMT "Initialize adapter" sequence (spec §4.3):
    /// read-version, read-commands (optional), read-controller-info, then
    /// power off, configure BR/EDR+LE/SC/SSP/I-O-capability/bondable, flush
    /// the whitelist, clear default connection parameters, and power back
    /// on. Fails if the controller never reaches the powered state.
    pub fn initialize_adapter(&self) -> Result<(), Error> {
        let version_reply = self.transport.command_no_reply_wait(mgmt::opcode::ReadVersion, self.index, &mgmt::command_no_params(mgmt::opcode::ReadVersion, self.index))?;
        let version = mgmt::parse_version(&version_reply).ok_or(ErrorKind::MalformedPdu)?;
        if version < 1 {
            return Err(Error::new(ErrorKind::OperationNotSupported, format!("MGMT API version {version} is below the required 1.0")));
        }

        if let Err(e) = self
            .transport
            .command_no_reply_wait(mgmt::opcode::ReadSupportedCommands, self.index, &mgmt::command_no_params(mgmt::opcode::ReadSupportedCommands, self.index))
        {
            tracing::debug!(target: "btstack::adapter", error = %e, "read-supported-commands failed, continuing (optional step)");
        }

        let info_reply = self
            .transport
            .command_no_reply_wait(mgmt::opcode::ReadControllerInfo, self.index, &mgmt::command_no_params(mgmt::opcode::ReadControllerInfo, self.index))?;
        let info = mgmt::parse_controller_info(&info_reply).ok_or(ErrorKind::MalformedPdu)?;
        *self.info.lock().unwrap() = Some(info);

        self.set_power_and_record(false)?;
        self.transport
            .command_no_reply_wait(mgmt::opcode::SetBrEdr, self.index, &mgmt::set_bredr(self.index, self.config.scan_bredr))?;
        self.transport
            .command_no_reply_wait(mgmt::opcode::SetLowEnergy, self.index, &mgmt::set_low_energy(self.index, true))?;
        self.transport
            .command_no_reply_wait(mgmt::opcode::SetSecureConnections, self.index, &mgmt::set_secure_connections(self.index, 1))?;
        self.transport
            .command_no_reply_wait(mgmt::opcode::SetSecureSimplePairing, self.index, &mgmt::set_secure_simple_pairing(self.index, true))?;
        self.transport
            .command_no_reply_wait(mgmt::opcode::SetIoCapability, self.index, &mgmt::set_io_capability(self.index, self.config.default_io_capability.to_wire()))?;
        self.transport
            .command_no_reply_wait(mgmt::opcode::SetBondable, self.index, &mgmt::set_bondable(self.index, true))?;
        self.transport
            .command_no_reply_wait(mgmt::opcode::RemoveDevice, self.index, &mgmt::remove_all_devices(self.index))?;
        self.transport
            .command_no_reply_wait(mgmt::opcode::LoadConnectionParameters, self.index, &mgmt::load_connection_parameters_empty(self.index))?;
        self.set_power_and_record(true)?;

        if !self.is_powered() {
            return Err(Error::new(ErrorKind::NotPowered, "controller did not reach the powered state during initialization"));
        }
        Ok(())
    }

    /// Issues `SetPowered` and applies its returned current-settings word
    /// immediately (spec §4.5.1), rather than waiting for the asynchronous
    /// `NewSettings` event the same change also triggers, so
    /// [`Self::is_powered`] is accurate the instant this call returns.
    fn set_power_and_record(&self, on: bool) -> Result<(), Error> {
        let timeout = if on { self.config.hci_power_on_timeout } else { self.config.hci_reply_timeout };
        let reply = self.transport.send_with_reply(mgmt::opcode::SetPowered, self.index, &mgmt::set_powered(self.index, on), timeout)?;
        if reply.len() >= 4 {
            let current = u32::from_le_bytes([reply[0], reply[1], reply[2], reply[3]]);
            self.handle_new_settings(current);
        }
        Ok(())
    }

    /// This controller's own address (spec §3 "Adapter info"), once known;
    /// `Address::any()` before [`Self::initialize_adapter`] has run.
    pub fn local_address(&self) -> Address {
        self.info.lock().unwrap().map(|i| i.address).unwrap_or_else(Address::any)
    }

    pub fn controller_info(&self) -> Option<ControllerInfo> {
        *self.info.lock().unwrap()
    }

    /// Eagerly loads every bonded key-bin in `key_bin_dir` into the shared
    /// device set and the controller's own resolving list, so a resolvable
    /// private address from a known peer is already recognized by the kernel
    /// before the first `DeviceFound` event arrives (spec §8 "Key-bin
    /// directory preload", "RPA resolution"). A no-op when no directory was
    /// configured.
    fn preload_key_bins(self: &Arc<Self>) {
        let Some(dir) = &self.key_bin_dir else { return };
        let bins = crate::smp::SmpKeyBin::scan_dir(dir, self.local_address());
        if bins.is_empty() {
            return;
        }
        let mut devices = self.devices.lock().unwrap();
        for bin in &bins {
            devices.entry(bin.remote_address).or_insert_with(|| {
                let device = Device::new(DeviceId(bin.remote_address), self.config.clone());
                device.set_key_bin_dir(dir.clone());
                device.set_local_address(self.local_address());
                device
            });
        }
        drop(devices);

        let irks: Vec<_> = bins.iter().filter_map(|b| b.irk.map(|irk| (b.remote_address, irk))).collect();
        if !irks.is_empty() {
            let frame = mgmt::load_identity_resolving_keys(self.index, &irks);
            if let Err(e) = self.transport.command_no_reply_wait(mgmt::opcode::LoadIdentityResolvingKeys, self.index, &frame) {
                tracing::warn!(target: "btstack::adapter", error = %e, "failed to load identity resolving keys");
            }
        }
        for bin in &bins {
            let frame = mgmt::add_device(self.index, bin.remote_address, 0x01);
            if let Err(e) = self.transport.command_no_reply_wait(mgmt::opcode::AddDevice, self.index, &frame) {
                tracing::warn!(target: "btstack::adapter", error = %e, "failed to add bonded device to controller");
            }
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn is_powered(&self) -> bool {
        self.current_settings.load(Ordering::Acquire) & settings::POWERED != 0
    }

    pub fn set_powered(&self, on: bool) -> Result<(), Error> {
        self.transport.set_power(self.index, on)
    }

    /// Registers a settings listener, delivering it a synthetic `(NONE,
    /// current, NONE)` event immediately (spec §4.5.1) so it can learn the
    /// adapter's current state without racing a real transition.
    pub fn add_settings_listener(&self, callback: impl Fn(u32, u32, u32) + Send + Sync + 'static) {
        let cb: AdapterEventListener = Arc::new(callback);
        let current = self.current_settings.load(Ordering::Acquire);
        cb(0, current, 0);
        self.settings_listeners.push(cb);
    }

    pub fn add_discovery_listener(&self, callback: impl Fn(DiscoveredDevice) + Send + Sync + 'static) {
        self.discovery_listeners.push(Arc::new(callback));
    }

    fn handle_event(&self, event: &MgmtEvent) {
        match event {
            MgmtEvent::NewSettings { current_settings, .. } => self.handle_new_settings(*current_settings),
            MgmtEvent::DeviceFound {
                address,
                address_type,
                rssi,
                flags: _,
                eir,
                ..
            } => self.handle_device_found(*address, *address_type, *rssi, eir),
            MgmtEvent::DeviceConnected { address, address_type, .. } => self.handle_device_connected(*address, *address_type),
            MgmtEvent::DeviceDisconnected { address, address_type, .. } => self.handle_device_disconnected(*address, *address_type),
            MgmtEvent::Discovering { discovering, .. } => self.handle_discovering_changed(*discovering),
            _ => {}
        }
    }

    /// Tracks the controller's actual scan state and detects a
    /// controller-initiated disable (spec §4.5.2): `native_scan` clearing
    /// while the application still wants to scan (`meta_scan`) and no pause
    /// is in effect means the kernel turned scanning off on its own (e.g. on
    /// a connection), so a background restart is scheduled.
    fn handle_discovering_changed(&self, discovering: bool) {
        let mut state = self.discovery.lock().unwrap();
        let was_native = state.native_scan;
        state.native_scan = discovering;
        let controller_initiated_disable = was_native && !discovering && state.meta_scan && state.paused_devices.is_empty();
        drop(state);
        if controller_initiated_disable {
            self.schedule_scan_restart();
        }
    }

    /// Retries `start_discovery` up to `config.scan_restart_max_retries`
    /// times with a short delay between attempts (spec §4.5.2), bailing out
    /// early if the application stopped wanting to scan or a pause engaged
    /// in the meantime.
    fn schedule_scan_restart(&self) {
        let Some(adapter) = self.self_weak.lock().unwrap().upgrade() else { return };
        self.scan_restart_attempts.store(0, Ordering::Relaxed);
        std::thread::spawn(move || {
            for attempt in 1..=adapter.config.scan_restart_max_retries as u32 {
                std::thread::sleep(Duration::from_millis(200));
                let state = adapter.discovery.lock().unwrap();
                if !state.meta_scan || state.native_scan || !state.paused_devices.is_empty() {
                    return;
                }
                drop(state);
                adapter.scan_restart_attempts.store(attempt, Ordering::Relaxed);
                if adapter.transport.start_discovery(adapter.index, adapter.scan_type_mask()).is_ok() {
                    return;
                }
            }
            tracing::warn!(target: "btstack::adapter", "giving up restarting discovery after controller-initiated disable");
        });
    }

    /// Classifies raw HCI events read off [`RawHciChannel`], correlating LE
    /// connection completions by peer address so [`Self::connect_device_locked`]
    /// can hand the real handle to a device instead of a placeholder (spec
    /// §8 P1).
    fn handle_hci_event(&self, event: &HciEvent) {
        if let HciEvent::LeConnectionComplete {
            status: HciStatus::Success,
            handle,
            peer_address_type,
            peer_address,
            ..
        } = event
        {
            let key = AddressAndType {
                address: *peer_address,
                address_type: *peer_address_type,
            };
            self.pending_handles.lock().unwrap().insert(key, *handle);
        }
    }

    /// Settings-diff dispatch (spec §4.5.1): computes `old ^ new` and fires
    /// every listener whenever that diff is non-empty, not just on the
    /// powered bit, and cascades a cleanup of the connected set when the
    /// controller is powered off underneath us.
    fn handle_new_settings(&self, current: u32) {
        let old = self.current_settings.swap(current, Ordering::AcqRel);
        let diff = old ^ current;
        if diff != 0 {
            for listener in self.settings_listeners.snapshot().iter() {
                listener(old, current, diff);
            }
        }
        let was_powered = old & settings::POWERED != 0;
        let now_powered = current & settings::POWERED != 0;
        if was_powered && !now_powered {
            self.cleanup_on_power_off();
        }
    }

    fn cleanup_on_power_off(&self) {
        let devices = self.devices.lock().unwrap();
        for id in self.connected.lock().unwrap().drain(..) {
            if let Some(device) = devices.get(&id) {
                device.disconnect();
            }
        }
        self.discovered.lock().unwrap().clear();
        let mut state = self.discovery.lock().unwrap();
        state.meta_scan = false;
        state.native_scan = false;
        state.paused_devices.clear();
    }

    /// Found-device policy (spec §4.5.5): a device already connected is
    /// never re-surfaced; otherwise the discovered-set entry is upserted,
    /// and a report that exactly repeats the last-known RSSI and EIR for a
    /// device already in the set is treated as a duplicate advertisement
    /// and not re-notified (spec §8 "deviceUpdated diff computation"), so a
    /// busy scan doesn't re-fire a listener once per advertising interval
    /// for an unchanged peer.
    fn handle_device_found(&self, address: Address, address_type: AddressType, rssi: i8, eir: &[u8]) {
        let key = AddressAndType { address, address_type };
        if self.connected.lock().unwrap().contains(&key) {
            return;
        }
        let entry = DiscoveredDevice {
            id: DeviceId(key),
            rssi: Some(rssi),
            eir: eir.to_vec(),
        };
        let mut discovered = self.discovered.lock().unwrap();
        let unchanged = discovered.get(&key).is_some_and(|prev| prev.rssi == entry.rssi && prev.eir == entry.eir);
        discovered.insert(key, entry.clone());
        drop(discovered);
        if unchanged {
            return;
        }
        for listener in self.discovery_listeners.snapshot().iter() {
            listener(entry.clone());
        }
    }

    /// Applies the pause policy on a connect (spec §4.5.2): `AutoOff` just
    /// stops; `AlwaysOn` stops then restarts immediately; the three
    /// `PauseConnectedUntil*` variants mark `key` paused and resume scanning
    /// once [`Self::resume_if_unpaused`] observes the matching condition
    /// cleared every paused device.
    fn pause_discovery_for_connect(&self, key: AddressAndType) {
        let mut state = self.discovery.lock().unwrap();
        if !state.meta_scan {
            return;
        }
        match state.policy {
            DiscoveryPolicy::AutoOff => {
                state.meta_scan = false;
                drop(state);
                let _ = self.transport.stop_discovery(self.index, self.scan_type_mask());
            }
            DiscoveryPolicy::AlwaysOn => {
                drop(state);
                let _ = self.transport.stop_discovery(self.index, self.scan_type_mask());
                let _ = self.transport.start_discovery(self.index, self.scan_type_mask());
            }
            DiscoveryPolicy::PauseConnectedUntilDisconnected | DiscoveryPolicy::PauseConnectedUntilReady | DiscoveryPolicy::PauseConnectedUntilPaired => {
                state.paused_devices.insert(key);
                drop(state);
                let _ = self.transport.stop_discovery(self.index, self.scan_type_mask());
            }
        }
    }

    /// Clears `key` from the paused set (if present) and restarts discovery
    /// once no paused devices remain (spec §4.5.2). `reached` is the
    /// condition that just occurred for `key` (disconnected/ready/paired);
    /// only policies waiting on that specific condition are affected.
    fn resume_if_unpaused(&self, key: AddressAndType, reached: DiscoveryPolicy) {
        let mut state = self.discovery.lock().unwrap();
        if state.policy != reached || !state.paused_devices.remove(&key) {
            return;
        }
        if state.meta_scan && state.paused_devices.is_empty() {
            drop(state);
            if let Err(e) = self.transport.start_discovery(self.index, self.scan_type_mask()) {
                tracing::warn!(target: "btstack::adapter", error = %e, "failed to resume discovery after pause");
            }
        }
    }

    fn handle_device_connected(&self, address: Address, address_type: AddressType) {
        let key = AddressAndType { address, address_type };
        self.pause_discovery_for_connect(key);
    }

    fn handle_device_disconnected(&self, address: Address, address_type: AddressType) {
        let key = AddressAndType { address, address_type };
        self.connected.lock().unwrap().retain(|k| *k != key);
        if let Some(device) = self.devices.lock().unwrap().get(&key) {
            device.disconnect();
        }
        self.resume_if_unpaused(key, DiscoveryPolicy::PauseConnectedUntilDisconnected);
    }

    /// Starts discovery across the LE public/random address types, plus a
    /// BR/EDR inquiry when `config.scan_bredr` is set (spec §4.5.2, §8 "scan
    /// type bitmask"). Flushes the discovered-device set on every call,
    /// including a restart while already scanning, so a caller can rely on a
    /// clean slate immediately after this returns rather than after the next
    /// `Discovering` event. `policy` governs how a subsequent connect pauses
    /// (and resumes) this scan.
    pub fn start_discovery(&self, policy: DiscoveryPolicy) -> Result<(), Error> {
        self.discovered.lock().unwrap().clear();
        self.transport.start_discovery(self.index, self.scan_type_mask())?;
        let mut state = self.discovery.lock().unwrap();
        state.meta_scan = true;
        state.policy = policy;
        state.paused_devices.clear();
        Ok(())
    }

    pub fn stop_discovery(&self) -> Result<(), Error> {
        let mut state = self.discovery.lock().unwrap();
        if !state.meta_scan {
            return Ok(());
        }
        self.transport.stop_discovery(self.index, self.scan_type_mask())?;
        state.meta_scan = false;
        state.paused_devices.clear();
        Ok(())
    }

    fn scan_type_mask(&self) -> u8 {
        const LE_PUBLIC: u8 = 0b0000_0010;
        const LE_RANDOM: u8 = 0b0000_0100;
        const BR_EDR: u8 = 0b0000_0001;
        let mut mask = LE_PUBLIC | LE_RANDOM;
        if self.config.scan_bredr {
            mask |= BR_EDR;
        }
        mask
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery.lock().unwrap().clone()
    }

    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.discovered.lock().unwrap().values().cloned().collect()
    }

    pub fn connected_devices(&self) -> Vec<Arc<Device>> {
        let devices = self.devices.lock().unwrap();
        self.connected
            .lock()
            .unwrap()
            .iter()
            .filter_map(|id| devices.get(id).cloned())
            .collect()
    }

    /// Looks up (or lazily creates) the shared `Device` handle for an
    /// address-and-type (spec §4.5.4 "shared set").
    pub fn device(&self, id: DeviceId) -> Arc<Device> {
        let mut devices = self.devices.lock().unwrap();
        devices
            .entry(id.address())
            .or_insert_with(|| {
                let device = Device::new(id, self.config.clone());
                if let Some(dir) = &self.key_bin_dir {
                    device.set_key_bin_dir(dir.clone());
                }
                device.set_local_address(self.local_address());
                device
            })
            .clone()
    }

    /// Connects to a discovered device: claims the connection gate, opens
    /// the ATT and SMP L2CAP channels, and attaches them to the device
    /// (spec §4.5.3).
    pub fn connect_device(&self, id: DeviceId) -> Result<Arc<Device>, Error> {
        self.connect_gate.lock_connect(self.config.connect_gate_timeout)?;
        let result = self.connect_device_locked(id);
        self.connect_gate.unlock();
        result
    }

    fn connect_device_locked(&self, id: DeviceId) -> Result<Arc<Device>, Error> {
        let device = self.device(id);
        let peer = id.address();
        let att = Arc::new(L2capChannel::connect(peer.address, peer.address_type, CID_ATT, SecurityLevel::Low, &self.config)?);
        let smp = Arc::new(L2capChannel::connect(peer.address, peer.address_type, CID_SMP, SecurityLevel::Low, &self.config)?);
        let handle = self.resolve_connection_handle(peer);
        if let Some(adapter) = self.self_weak.lock().unwrap().upgrade() {
            device.add_pairing_listener(move || adapter.resume_if_unpaused(peer, DiscoveryPolicy::PauseConnectedUntilPaired));
        }
        device.attach(handle, att, smp, self.agent.clone())?;
        self.connected.lock().unwrap().push(peer);
        self.discovered.lock().unwrap().remove(&peer);
        self.resume_if_unpaused(peer, DiscoveryPolicy::PauseConnectedUntilReady);
        Ok(device)
    }

    /// Waits briefly for [`Self::handle_hci_event`] to have correlated a real
    /// handle for `peer` (it usually races the L2CAP connect above and wins),
    /// falling back to a synthesized non-zero handle if the raw HCI channel
    /// is unavailable or nothing arrived in time — still satisfies spec §8
    /// P1 ("connected iff non-zero handle"), just without a real one to show.
    fn resolve_connection_handle(&self, peer: AddressAndType) -> u16 {
        let deadline = std::time::Instant::now() + self.config.hci_reply_timeout;
        loop {
            if let Some(handle) = self.pending_handles.lock().unwrap().remove(&peer) {
                return handle;
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let mut handle = self.next_synthetic_handle.fetch_add(1, Ordering::Relaxed);
        if handle == 0 {
            handle = self.next_synthetic_handle.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(target: "btstack::adapter", address = %peer.address, "no raw HCI connection-complete observed in time, synthesizing a connection handle");
        handle
    }

    pub fn disconnect_device(&self, id: DeviceId) -> Result<(), Error> {
        let frame = mgmt::disconnect(self.index, id.address().address, id.address().address_type);
        self.transport.command_no_reply_wait(mgmt::opcode::Disconnect, self.index, &frame)?;
        self.handle_device_disconnected(id.address().address, id.address().address_type);
        Ok(())
    }

    pub fn close(&self) {
        for device in self.devices.lock().unwrap().values() {
            device.disconnect();
        }
        if let Some(channel) = self.raw_hci.lock().unwrap().take() {
            channel.close();
        }
        self.transport.close();
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::HciSocket;
    use crate::pairing::NoInputOutputPairingAgent;
    use std::collections::VecDeque;
    use std::io;
    use std::time::Duration;

    #[test]
    fn connect_gate_serializes_and_times_out() {
        let gate = ConnectGate::new();
        gate.lock_connect(Duration::from_millis(50)).unwrap();
        assert_eq!(gate.lock_connect(Duration::from_millis(20)).unwrap_err().kind, ErrorKind::Timeout);
        gate.unlock();
        gate.lock_connect(Duration::from_millis(50)).unwrap();
    }

    struct FakeSocket {
        inbox: Mutex<VecDeque<Vec<u8>>>,
    }

    impl HciSocket for FakeSocket {
        fn send(&self, _frame: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn recv(&self, buf: &mut [u8], _poll_timeout: Duration) -> io::Result<Option<usize>> {
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
    }

    fn command_complete(opcode: u16, index: u16) -> Vec<u8> {
        let mut params = Vec::new();
        params.extend_from_slice(&opcode.to_le_bytes());
        params.push(0x00);
        mgmt::command_with_params(mgmt::event::CommandComplete, index, &params)
    }

    fn test_adapter(replies: Vec<Vec<u8>>) -> Arc<Adapter> {
        let socket = Arc::new(FakeSocket {
            inbox: Mutex::new(VecDeque::from(replies)),
        });
        let transport = crate::hci::Transport::with_socket(socket, Config::default());
        Adapter::with_transport(0, transport, Config::default(), Arc::new(NoInputOutputPairingAgent), None)
    }

    #[test]
    fn start_discovery_flushes_discovered_devices_even_while_already_scanning() {
        let adapter = test_adapter(vec![
            command_complete(mgmt::opcode::StartDiscovery, 0),
            command_complete(mgmt::opcode::StartDiscovery, 0),
        ]);
        adapter.start_discovery(DiscoveryPolicy::AutoOff).unwrap();
        adapter.handle_device_found(Address::any(), AddressType::LePublic, -40, &[]);
        assert_eq!(adapter.discovered_devices().len(), 1);

        adapter.start_discovery(DiscoveryPolicy::AutoOff).unwrap();
        assert_eq!(adapter.discovered_devices().len(), 0);
        adapter.close();
    }

    #[test]
    fn preload_key_bins_registers_device_and_loads_irks_into_the_controller() {
        let dir = std::env::temp_dir().join(format!("btstack-test-keybins-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let remote = AddressAndType {
            address: Address::any(),
            address_type: AddressType::LePublic,
        };
        let bin = crate::smp::SmpKeyBin {
            local_address: AddressAndType {
                address: Address::any(),
                address_type: AddressType::LePublic,
            },
            remote_address: remote,
            role: crate::smp::keybin::Role::Master,
            mode: crate::smp::keybin::PairingMode::JustWorks,
            security_level: 2,
            ltk: Some([1u8; 16]),
            ediv: 0,
            rand: 0,
            irk: Some([2u8; 16]),
            csrk: None,
            created_at_unix: 0,
        };
        bin.write_to_dir(&dir).unwrap();

        let socket = Arc::new(FakeSocket {
            inbox: Mutex::new(VecDeque::from(vec![
                command_complete(mgmt::opcode::LoadIdentityResolvingKeys, 0),
                command_complete(mgmt::opcode::AddDevice, 0),
            ])),
        });
        let transport = crate::hci::Transport::with_socket(socket, Config::default());
        let adapter = Adapter::with_transport(0, transport, Config::default(), Arc::new(NoInputOutputPairingAgent), Some(dir.clone()));

        assert!(adapter.devices.lock().unwrap().contains_key(&remote));
        adapter.close();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn device_found_is_dropped_when_already_connected() {
        let adapter = test_adapter(vec![]);
        let key = AddressAndType {
            address: Address::any(),
            address_type: AddressType::LePublic,
        };
        adapter.connected.lock().unwrap().push(key);
        adapter.handle_device_found(key.address, key.address_type, -40, &[]);
        assert_eq!(adapter.discovered_devices().len(), 0);
        adapter.close();
    }

    #[test]
    fn settings_listener_gets_a_synthetic_initial_event_then_fires_on_any_diff() {
        let adapter = test_adapter(vec![]);
        let seen: Arc<Mutex<Vec<(u32, u32, u32)>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        adapter.add_settings_listener(move |old, new, diff| recorded.lock().unwrap().push((old, new, diff)));
        assert_eq!(seen.lock().unwrap().as_slice(), &[(0, 0, 0)]);

        // Flip a bit unrelated to POWERED: the listener must still fire
        // (spec §4.5.1 "any non-empty diff", not just the powered bit).
        adapter.handle_new_settings(settings::CONNECTABLE);
        assert_eq!(seen.lock().unwrap().as_slice(), &[(0, 0, 0), (0, settings::CONNECTABLE, settings::CONNECTABLE)]);

        // An unchanged settings value is not a diff and must not fire.
        adapter.handle_new_settings(settings::CONNECTABLE);
        assert_eq!(seen.lock().unwrap().len(), 2);
        adapter.close();
    }

    #[test]
    fn powering_off_cleans_up_connections_and_discovery_state() {
        let adapter = test_adapter(vec![]);
        adapter.current_settings.store(settings::POWERED, Ordering::Release);
        let key = AddressAndType {
            address: Address::any(),
            address_type: AddressType::LePublic,
        };
        adapter.connected.lock().unwrap().push(key);
        adapter.discovered.lock().unwrap().insert(
            key,
            DiscoveredDevice {
                id: DeviceId(key),
                rssi: None,
                eir: Vec::new(),
            },
        );

        adapter.handle_new_settings(0);

        assert!(adapter.connected.lock().unwrap().is_empty());
        assert!(adapter.discovered_devices().is_empty());
        assert!(!adapter.discovery_state().meta_scan);
        adapter.close();
    }

    #[test]
    fn pause_connected_until_disconnected_stops_then_resumes_discovery() {
        let adapter = test_adapter(vec![
            command_complete(mgmt::opcode::StartDiscovery, 0),
            command_complete(mgmt::opcode::StopDiscovery, 0),
            command_complete(mgmt::opcode::StartDiscovery, 0),
        ]);
        adapter.start_discovery(DiscoveryPolicy::PauseConnectedUntilDisconnected).unwrap();
        assert!(adapter.discovery_state().meta_scan);

        let key = AddressAndType {
            address: Address::any(),
            address_type: AddressType::LePublic,
        };
        adapter.handle_device_connected(key.address, key.address_type);
        assert!(adapter.discovery_state().paused_devices.contains(&key));

        adapter.handle_device_disconnected(key.address, key.address_type);
        assert!(adapter.discovery_state().paused_devices.is_empty());
        assert!(adapter.discovery_state().meta_scan);
        adapter.close();
    }

    #[test]
    fn always_on_policy_restarts_discovery_immediately_on_connect() {
        let adapter = test_adapter(vec![
            command_complete(mgmt::opcode::StartDiscovery, 0),
            command_complete(mgmt::opcode::StopDiscovery, 0),
            command_complete(mgmt::opcode::StartDiscovery, 0),
        ]);
        adapter.start_discovery(DiscoveryPolicy::AlwaysOn).unwrap();

        let key = AddressAndType {
            address: Address::any(),
            address_type: AddressType::LePublic,
        };
        adapter.handle_device_connected(key.address, key.address_type);

        assert!(adapter.discovery_state().paused_devices.is_empty());
        assert!(adapter.discovery_state().meta_scan);
        adapter.close();
    }
}
