//! The SMP pairing state machine (spec §4.6.2): an MTU-aware send/recv
//! wrapper around a dedicated L2CAP channel (CID = SMP), a 10-state pairing
//! machine, and a watchdog that fails stalled pairings.
//!
//! Grounded in the same reader-thread-plus-listener-fanout shape as
//! `hci/transport.rs`, generalized from a request/reply multiplexer to a
//! protocol state machine: the reader thread here drives state transitions
//! directly instead of only feeding a reply ring.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::device::DeviceId;
use crate::error::{Error, ErrorKind, SmpReason};
use crate::l2cap::L2capChannel;
use crate::pairing::{IoCapability, PairingAgent};
use crate::pdu::smp::{self, auth_req, key_dist, PairingParams, SmpPdu};

/// SMP channel MTU when Secure Connections pairing is in use (spec §4.6.2:
/// large enough for a `Pairing Public Key` PDU, opcode + two 32-byte ECDH
/// coordinates).
const SMP_MTU_SC: usize = 65;
/// SMP channel MTU for legacy (non-SC) pairing (spec §4.6.2, Core Spec
/// default ATT/SMP MTU floor).
const SMP_MTU_LEGACY: usize = 23;

/// SMP pairing states (spec §4.6.2 "States").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    None,
    RequestedByResponder,
    FeatureExchangeStarted,
    FeatureExchangeCompleted,
    PasskeyExpected,
    NumericCompareExpected,
    OobExpected,
    KeyDistribution,
    Completed,
    Failed,
}

/// The negotiated pairing association model (Core Spec Vol 3, Part H, Table 2.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingMode {
    JustWorks,
    PasskeyEntry,
    NumericComparison,
    OutOfBand,
    PrePaired,
}

#[derive(Debug, Clone, Default)]
struct SidePairingFields {
    auth_req: u8,
    io_capability: u8,
    oob: bool,
    max_enc_key_size: u8,
    key_distribution: u8,
}

#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub ltk: Option<[u8; 16]>,
    pub ediv: u16,
    pub rand: u64,
    pub irk: Option<[u8; 16]>,
    pub csrk: Option<[u8; 16]>,
    pub identity_address: Option<([u8; 6], u8)>,
}

impl Default for KeyMaterial {
    fn default() -> Self {
        KeyMaterial {
            ltk: None,
            ediv: 0,
            rand: 0,
            irk: None,
            csrk: None,
            identity_address: None,
        }
    }
}

/// All bookkeeping for one device's pairing session (spec §3 "Pairing data").
#[derive(Clone)]
pub struct PairingRecord {
    pub state: PairingState,
    pub mode: Option<PairingMode>,
    initiator: SidePairingFields,
    responder: SidePairingFields,
    use_sc: bool,
    received_key_dist: u8,
    pub local_keys: KeyMaterial,
    pub peer_keys: KeyMaterial,
}

impl Default for PairingRecord {
    fn default() -> Self {
        PairingRecord {
            state: PairingState::None,
            mode: None,
            initiator: SidePairingFields::default(),
            responder: SidePairingFields::default(),
            use_sc: false,
            received_key_dist: 0,
            local_keys: KeyMaterial::default(),
            peer_keys: KeyMaterial::default(),
        }
    }
}

impl PairingRecord {
    /// The pairing mode per Core Spec Vol 3, Part H, Table 2.8, computed
    /// from both sides' auth/IO/OOB fields once the response is recorded.
    fn compute_mode(&self) -> PairingMode {
        if self.initiator.oob || self.responder.oob {
            return PairingMode::OutOfBand;
        }
        let mitm = self.initiator.auth_req & auth_req::MITM != 0 || self.responder.auth_req & auth_req::MITM != 0;
        if !mitm {
            return PairingMode::JustWorks;
        }
        use crate::pairing::IoCapability as IoCap;
        let i = IoCap::from_wire(self.initiator.io_capability);
        let r = IoCap::from_wire(self.responder.io_capability);
        match (i, r) {
            (Some(IoCap::DisplayYesNo), Some(IoCap::DisplayYesNo)) if self.use_sc => PairingMode::NumericComparison,
            (Some(IoCap::KeyboardOnly), _) | (_, Some(IoCap::KeyboardOnly)) => PairingMode::PasskeyEntry,
            (Some(IoCap::KeyboardDisplay), Some(IoCap::KeyboardDisplay)) if self.use_sc => PairingMode::NumericComparison,
            _ => PairingMode::JustWorks,
        }
    }

    fn expected_key_dist_mask(&self) -> u8 {
        if self.use_sc {
            key_dist::ID_KEY | key_dist::SIGN_KEY
        } else {
            self.initiator.key_distribution | self.responder.key_distribution
        }
    }
}

/// `SmpEngine` owns the SMP fixed-channel socket and a dedicated reader
/// thread, analogous to `hci::Transport` but driving a protocol state
/// machine instead of a request/reply ring (spec §5: every reader-owning
/// component gets its own thread).
pub struct SmpEngine {
    channel: Arc<L2capChannel>,
    device_id: DeviceId,
    record: Mutex<PairingRecord>,
    agent: Arc<dyn PairingAgent>,
    events_in_window: AtomicUsize,
    on_completed: Box<dyn Fn(DeviceId, PairingMode) + Send + Sync>,
    on_failed: Box<dyn Fn(DeviceId, SmpReason) + Send + Sync>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SmpEngine {
    pub fn open(
        channel: Arc<L2capChannel>,
        device_id: DeviceId,
        agent: Arc<dyn PairingAgent>,
        on_completed: impl Fn(DeviceId, PairingMode) + Send + Sync + 'static,
        on_failed: impl Fn(DeviceId, SmpReason) + Send + Sync + 'static,
    ) -> Arc<Self> {
        let engine = Arc::new(SmpEngine {
            channel,
            device_id,
            record: Mutex::new(PairingRecord::default()),
            agent,
            events_in_window: AtomicUsize::new(0),
            on_completed: Box::new(on_completed),
            on_failed: Box::new(on_failed),
            reader: Mutex::new(None),
        });
        let reader_engine = engine.clone();
        let handle = std::thread::Builder::new()
            .name("btstack-smp-reader".into())
            .spawn(move || reader_engine.reader_loop())
            .expect("spawning SMP reader thread");
        *engine.reader.lock().unwrap() = Some(handle);
        engine
    }

    pub fn state(&self) -> PairingState {
        self.record.lock().unwrap().state
    }

    pub fn mode(&self) -> Option<PairingMode> {
        self.record.lock().unwrap().mode
    }

    /// The current SMP channel MTU (spec §4.6.2): 65 bytes once Secure
    /// Connections has been negotiated, 23 bytes otherwise (the legacy
    /// default, in effect until feature exchange completes).
    pub fn mtu(&self) -> usize {
        if self.record.lock().unwrap().use_sc {
            SMP_MTU_SC
        } else {
            SMP_MTU_LEGACY
        }
    }

    fn send_pdu(&self, frame: Vec<u8>) -> Result<(), Error> {
        if frame.len() > SMP_MTU_SC {
            return Err(ErrorKind::InvalidParameters.into());
        }
        self.channel.send(&frame)
    }

    /// A point-in-time copy of the pairing record, for persisting key
    /// material once pairing completes (spec §6 "Persisted state").
    pub fn record_snapshot(&self) -> PairingRecord {
        self.record.lock().unwrap().clone()
    }

    /// Preloads a previously bonded key set without any wire exchange (spec
    /// §8 P5: reconnect completes as `PrePaired` with no feature exchange).
    pub fn adopt_pre_paired(&self, keys: KeyMaterial) {
        let mut record = self.record.lock().unwrap();
        record.peer_keys = keys;
        record.mode = Some(PairingMode::PrePaired);
        record.state = PairingState::Completed;
        drop(record);
        (self.on_completed)(self.device_id, PairingMode::PrePaired);
    }

    /// Sends a `PAIRING_REQUEST` as the link's initiator.
    pub fn start_pairing(&self, io_capability: IoCapability, auth: u8, max_key_size: u8, ikd: u8, rkd: u8) -> Result<(), Error> {
        {
            let mut record = self.record.lock().unwrap();
            record.initiator = SidePairingFields {
                auth_req: auth,
                io_capability: io_capability.to_wire(),
                oob: false,
                max_enc_key_size: max_key_size,
                key_distribution: ikd,
            };
            record.state = PairingState::FeatureExchangeStarted;
            let _ = rkd;
        }
        let frame = smp::pairing_request(io_capability, auth, max_key_size, ikd, rkd);
        self.send_pdu(frame)
    }

    pub fn set_pairing_passkey(&self, passkey: u32) -> Result<(), Error> {
        let mut record = self.record.lock().unwrap();
        if record.state != PairingState::PasskeyExpected {
            return Err(ErrorKind::InvalidParameters.into());
        }
        record.state = PairingState::KeyDistribution;
        let _ = passkey; // confirm-value generation is a peer/crypto concern, out of scope here.
        Ok(())
    }

    pub fn set_pairing_passkey_negative(&self) -> Result<(), Error> {
        let mut record = self.record.lock().unwrap();
        if record.state != PairingState::PasskeyExpected {
            return Err(ErrorKind::InvalidParameters.into());
        }
        record.state = PairingState::Failed;
        drop(record);
        let _ = self.send_pdu(smp::pairing_failed(0x01));
        Ok(())
    }

    pub fn set_pairing_numeric_comparison(&self, accept: bool) -> Result<(), Error> {
        let mut record = self.record.lock().unwrap();
        if record.state != PairingState::NumericCompareExpected {
            return Err(ErrorKind::InvalidParameters.into());
        }
        record.state = if accept { PairingState::KeyDistribution } else { PairingState::Failed };
        Ok(())
    }

    /// Called by the pairing watchdog timer (spec §4.6.2 "Pairing watchdog").
    /// Returns `true` if this tick observed no SMP traffic while a pairing
    /// was in flight, the condition under which the caller should fail and
    /// disconnect the device.
    pub fn watchdog_tick(&self) -> bool {
        let events = self.events_in_window.swap(0, Ordering::AcqRel);
        let mut record = self.record.lock().unwrap();
        if events == 0 && record.state == PairingState::KeyDistribution {
            record.state = PairingState::Failed;
            true
        } else {
            false
        }
    }

    fn reader_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; SMP_MTU_SC];
        loop {
            if !self.channel.is_open() {
                break;
            }
            match self.channel.recv(&mut buf) {
                Ok(n) => {
                    self.events_in_window.fetch_add(1, Ordering::AcqRel);
                    self.handle_pdu(&buf[..n]);
                }
                Err(e) if e.kind == ErrorKind::Timeout => continue,
                Err(_) => break,
            }
        }
    }

    fn handle_pdu(&self, bytes: &[u8]) {
        if bytes.len() > self.mtu() {
            tracing::warn!(target: "btstack::smp", len = bytes.len(), mtu = self.mtu(), "received SMP PDU exceeding the current MTU, ignoring");
            return;
        }
        let pdu = SmpPdu::parse(bytes);
        match pdu {
            SmpPdu::Malformed => {
                tracing::warn!(target: "btstack::smp", "received malformed SMP PDU, ignoring");
            }
            SmpPdu::SecurityRequest { .. } => {
                self.record.lock().unwrap().state = PairingState::RequestedByResponder;
            }
            SmpPdu::PairingRequest(p) => self.on_pairing_request(p),
            SmpPdu::PairingResponse(p) => self.on_pairing_response(p),
            SmpPdu::PairingConfirm { .. } | SmpPdu::PairingRandom { .. } | SmpPdu::PairingPublicKey { .. } | SmpPdu::PairingDhKeyCheck { .. } => {
                self.record.lock().unwrap().state = PairingState::KeyDistribution;
            }
            SmpPdu::PairingFailed { reason } => self.on_pairing_failed(reason),
            SmpPdu::EncryptionInformation { long_term_key } => {
                self.record.lock().unwrap().peer_keys.ltk = Some(long_term_key);
                self.mark_key_received(key_dist::ENC_KEY);
            }
            SmpPdu::MasterIdentification { ediv, rand } => {
                let mut record = self.record.lock().unwrap();
                record.peer_keys.ediv = ediv;
                record.peer_keys.rand = rand;
            }
            SmpPdu::IdentityInformation { identity_resolving_key } => {
                self.record.lock().unwrap().peer_keys.irk = Some(identity_resolving_key);
                self.mark_key_received(key_dist::ID_KEY);
            }
            SmpPdu::IdentityAddressInformation { address_type, address } => {
                self.record.lock().unwrap().peer_keys.identity_address = Some((address, address_type));
            }
            SmpPdu::SigningInformation { signature_key } => {
                self.record.lock().unwrap().peer_keys.csrk = Some(signature_key);
                self.mark_key_received(key_dist::SIGN_KEY);
            }
            SmpPdu::PairingKeypressNotification { .. } => {}
        }
        self.maybe_complete();
    }

    fn on_pairing_request(&self, p: PairingParams) {
        let mut record = self.record.lock().unwrap();
        record.initiator = SidePairingFields {
            auth_req: p.auth_req,
            io_capability: p.io_capability,
            oob: p.oob_data_present,
            max_enc_key_size: p.max_encryption_key_size,
            key_distribution: p.initiator_key_distribution,
        };
        record.state = PairingState::FeatureExchangeStarted;
    }

    fn on_pairing_response(&self, p: PairingParams) {
        let mode = {
            let mut record = self.record.lock().unwrap();
            record.responder = SidePairingFields {
                auth_req: p.auth_req,
                io_capability: p.io_capability,
                oob: p.oob_data_present,
                max_enc_key_size: p.max_encryption_key_size,
                key_distribution: p.responder_key_distribution,
            };
            record.use_sc = record.initiator.auth_req & auth_req::SECURE_CONNECTIONS != 0 && p.uses_secure_connections();
            let mode = record.compute_mode();
            record.mode = Some(mode);
            record.state = match mode {
                PairingMode::PasskeyEntry => PairingState::PasskeyExpected,
                PairingMode::NumericComparison => PairingState::NumericCompareExpected,
                PairingMode::OutOfBand => PairingState::OobExpected,
                PairingMode::JustWorks | PairingMode::PrePaired => PairingState::FeatureExchangeCompleted,
            };
            mode
        };
        let _ = mode;
    }

    fn on_pairing_failed(&self, reason: SmpReason) {
        self.record.lock().unwrap().state = PairingState::Failed;
        (self.on_failed)(self.device_id, reason);
    }

    fn mark_key_received(&self, bit: u8) {
        self.record.lock().unwrap().received_key_dist |= bit;
    }

    fn maybe_complete(&self) {
        let mode = {
            let mut record = self.record.lock().unwrap();
            if record.state != PairingState::KeyDistribution {
                return;
            }
            if record.received_key_dist != record.expected_key_dist_mask() {
                return;
            }
            record.state = PairingState::Completed;
            record.mode.unwrap_or(PairingMode::JustWorks)
        };
        (self.on_completed)(self.device_id, mode);
    }

    pub fn close(&self) {
        self.channel.close();
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SmpEngine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, AddressAndType, AddressType};
    use crate::l2cap::L2capSocket;
    use crate::pairing::NoInputOutputPairingAgent;
    use std::collections::VecDeque;
    use std::io;
    use std::time::Duration;

    struct FakeSocket {
        inbox: Mutex<VecDeque<Vec<u8>>>,
        closed: std::sync::atomic::AtomicBool,
    }

    impl L2capSocket for FakeSocket {
        fn send(&self, _buf: &[u8]) -> io::Result<usize> {
            Ok(_buf.len())
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

    fn test_device_id() -> DeviceId {
        DeviceId(AddressAndType {
            address: Address::any(),
            address_type: AddressType::LePublic,
        })
    }

    fn open_engine(frames: Vec<Vec<u8>>) -> (Arc<SmpEngine>, Arc<Mutex<Vec<(DeviceId, PairingMode)>>>, Arc<Mutex<Vec<SmpReason>>>) {
        let socket = Arc::new(FakeSocket {
            inbox: Mutex::new(VecDeque::from(frames)),
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        let channel = Arc::new(L2capChannel::with_socket(socket, Duration::from_millis(5)));
        let completed = Arc::new(Mutex::new(Vec::new()));
        let failed = Arc::new(Mutex::new(Vec::new()));
        let completed2 = completed.clone();
        let failed2 = failed.clone();
        let engine = SmpEngine::open(
            channel,
            test_device_id(),
            Arc::new(NoInputOutputPairingAgent),
            move |id, mode| completed2.lock().unwrap().push((id, mode)),
            move |id, reason| failed2.lock().unwrap().push(reason),
        );
        (engine, completed, failed)
    }

    #[test]
    fn adopt_pre_paired_completes_without_wire_exchange() {
        let (engine, completed, _failed) = open_engine(vec![]);
        engine.adopt_pre_paired(KeyMaterial {
            ltk: Some([7u8; 16]),
            ..KeyMaterial::default()
        });
        assert_eq!(engine.state(), PairingState::Completed);
        assert_eq!(engine.mode(), Some(PairingMode::PrePaired));
        assert_eq!(completed.lock().unwrap().as_slice(), &[(test_device_id(), PairingMode::PrePaired)]);
        engine.close();
    }

    #[test]
    fn just_works_pairing_completes_after_key_distribution_traffic() {
        let response = smp::pairing_response(IoCapability::NoInputNoOutput, auth_req::BONDING, 16, 0, 0);
        let confirm = smp::pairing_confirm(&[0u8; 16]);
        let (engine, completed, _failed) = open_engine(vec![response, confirm]);
        engine.start_pairing(IoCapability::NoInputNoOutput, auth_req::BONDING, 16, 0, 0).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while engine.state() != PairingState::Completed && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(engine.state(), PairingState::Completed);
        assert_eq!(engine.mode(), Some(PairingMode::JustWorks));
        assert_eq!(completed.lock().unwrap().as_slice(), &[(test_device_id(), PairingMode::JustWorks)]);
        engine.close();
    }

    #[test]
    fn watchdog_trips_when_key_distribution_stalls() {
        let (engine, _completed, _failed) = open_engine(vec![]);
        engine.record.lock().unwrap().state = PairingState::KeyDistribution;
        assert!(engine.watchdog_tick());
        assert_eq!(engine.state(), PairingState::Failed);
        engine.close();
    }

    #[test]
    fn watchdog_does_not_trip_outside_key_distribution() {
        let (engine, _completed, _failed) = open_engine(vec![]);
        assert!(!engine.watchdog_tick());
        assert_eq!(engine.state(), PairingState::None);
        engine.close();
    }
}
