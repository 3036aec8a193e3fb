//! MGMT command/event PDUs (the Linux kernel's `mgmt-api`, spec §4.3/GLOSSARY "MGMT").
//!
//! Frame layout (all fields little-endian): a 6-byte header
//! (`opcode: u16`, `index: u16`, `param_len: u16`) followed by `param_len`
//! bytes of opcode-specific parameters. Command-complete events additionally
//! wrap a nested `(opcode: u16, status: u8)` before their return parameters;
//! command-status events carry just `(opcode: u16, status: u8)`.

use crate::address::{Address, AddressAndType, AddressType};
use crate::codec::{ByteOrder, ByteReader, ByteWriter};
use crate::error::HciStatus;

pub const HEADER_LEN: usize = 6;

/// MGMT command opcodes (Linux kernel `mgmt-api.txt`).
#[allow(missing_docs, non_upper_case_globals)]
pub mod opcode {
    pub const ReadVersion: u16 = 0x0001;
    pub const ReadSupportedCommands: u16 = 0x0002;
    pub const ReadControllerIndexList: u16 = 0x0003;
    pub const ReadControllerInfo: u16 = 0x0004;
    pub const SetPowered: u16 = 0x0005;
    pub const SetDiscoverable: u16 = 0x0006;
    pub const SetConnectable: u16 = 0x0007;
    pub const SetBondable: u16 = 0x0009;
    pub const SetSecureSimplePairing: u16 = 0x000B;
    pub const SetLowEnergy: u16 = 0x000D;
    pub const SetLocalName: u16 = 0x000F;
    pub const LoadLongTermKeys: u16 = 0x0013;
    pub const Disconnect: u16 = 0x0014;
    pub const SetIoCapability: u16 = 0x0018;
    pub const PairDevice: u16 = 0x0019;
    pub const UnpairDevice: u16 = 0x001B;
    pub const UserConfirmationReply: u16 = 0x001C;
    pub const UserConfirmationNegativeReply: u16 = 0x001D;
    pub const UserPasskeyReply: u16 = 0x001E;
    pub const UserPasskeyNegativeReply: u16 = 0x001F;
    pub const StartDiscovery: u16 = 0x0023;
    pub const StopDiscovery: u16 = 0x0024;
    pub const SetAdvertising: u16 = 0x0029;
    pub const SetBrEdr: u16 = 0x002A;
    pub const SetSecureConnections: u16 = 0x002D;
    pub const SetPrivacy: u16 = 0x002F;
    pub const LoadIdentityResolvingKeys: u16 = 0x0030;
    pub const AddDevice: u16 = 0x0033;
    pub const RemoveDevice: u16 = 0x0034;
    pub const LoadConnectionParameters: u16 = 0x0035;
}

/// MGMT event opcodes.
#[allow(missing_docs, non_upper_case_globals)]
pub mod event {
    pub const CommandComplete: u16 = 0x0001;
    pub const CommandStatus: u16 = 0x0002;
    pub const ControllerError: u16 = 0x0003;
    pub const IndexAdded: u16 = 0x0004;
    pub const IndexRemoved: u16 = 0x0005;
    pub const NewSettings: u16 = 0x0006;
    pub const DeviceConnected: u16 = 0x000B;
    pub const DeviceDisconnected: u16 = 0x000C;
    pub const ConnectFailed: u16 = 0x000D;
    pub const UserConfirmationRequest: u16 = 0x000F;
    pub const UserPasskeyRequest: u16 = 0x0010;
    pub const AuthenticationFailed: u16 = 0x0011;
    pub const DeviceFound: u16 = 0x0012;
    pub const Discovering: u16 = 0x0013;
    pub const NewLongTermKey: u16 = 0x000A;
    pub const NewIdentityResolvingKey: u16 = 0x0018;
    pub const PairDeviceComplete: u16 = 0xFFF0; // synthetic: PairDevice command-complete
}

/// Adapter current-settings bitmask (spec §3 "Adapter info").
pub mod settings {
    pub const POWERED: u32 = 1 << 0;
    pub const CONNECTABLE: u32 = 1 << 1;
    pub const FAST_CONNECTABLE: u32 = 1 << 2;
    pub const DISCOVERABLE: u32 = 1 << 3;
    pub const BONDABLE: u32 = 1 << 4;
    pub const LINK_SECURITY: u32 = 1 << 5;
    pub const SSP: u32 = 1 << 6;
    pub const BREDR: u32 = 1 << 7;
    pub const HS: u32 = 1 << 8;
    pub const LE: u32 = 1 << 9;
    pub const ADVERTISING: u32 = 1 << 10;
    pub const SECURE_CONNECTIONS: u32 = 1 << 11;
    pub const DEBUG_KEYS: u32 = 1 << 12;
    pub const PRIVACY: u32 = 1 << 13;
    pub const CONFIGURATION: u32 = 1 << 14;
    pub const STATIC_ADDRESS: u32 = 1 << 15;
}

/// A raw MGMT frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: u16,
    pub index: u16,
    pub param_len: u16,
}

/// A decoded MGMT event, classified by opcode (spec §4.2 classifier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MgmtEvent {
    CommandComplete {
        index: u16,
        request_opcode: u16,
        status: HciStatus,
        return_params: Vec<u8>,
    },
    CommandStatus {
        index: u16,
        request_opcode: u16,
        status: HciStatus,
    },
    NewSettings {
        index: u16,
        current_settings: u32,
    },
    IndexAdded {
        index: u16,
    },
    IndexRemoved {
        index: u16,
    },
    DeviceConnected {
        index: u16,
        address: Address,
        address_type: AddressType,
    },
    DeviceDisconnected {
        index: u16,
        address: Address,
        address_type: AddressType,
        reason: u8,
    },
    DeviceFound {
        index: u16,
        address: Address,
        address_type: AddressType,
        rssi: i8,
        flags: u32,
        eir: Vec<u8>,
    },
    Discovering {
        index: u16,
        address_type: u8,
        discovering: bool,
    },
    AuthenticationFailed {
        index: u16,
        address: Address,
        address_type: AddressType,
        status: HciStatus,
    },
    /// Any event this classifier didn't special-case, still carrying its
    /// opcode and raw parameters so a caller can special-case it later.
    Other { opcode: u16, index: u16, params: Vec<u8> },
    /// Too short to even contain a header.
    Malformed,
}

impl MgmtEvent {
    /// The controller index this event pertains to, if any (`Malformed` has none).
    pub fn index(&self) -> Option<u16> {
        match self {
            MgmtEvent::CommandComplete { index, .. }
            | MgmtEvent::CommandStatus { index, .. }
            | MgmtEvent::NewSettings { index, .. }
            | MgmtEvent::IndexAdded { index }
            | MgmtEvent::IndexRemoved { index }
            | MgmtEvent::DeviceConnected { index, .. }
            | MgmtEvent::DeviceDisconnected { index, .. }
            | MgmtEvent::DeviceFound { index, .. }
            | MgmtEvent::Discovering { index, .. }
            | MgmtEvent::AuthenticationFailed { index, .. }
            | MgmtEvent::Other { index, .. } => Some(*index),
            MgmtEvent::Malformed => None,
        }
    }

    /// Classifies a raw MGMT frame. Tolerates truncated frames (spec §4.2).
    pub fn parse(buf: &[u8]) -> Self {
        let mut r = ByteReader::new(buf);
        let (opcode, index, param_len) = match (
            r.get_u16(ByteOrder::Little),
            r.get_u16(ByteOrder::Little),
            r.get_u16(ByteOrder::Little),
        ) {
            (Ok(o), Ok(i), Ok(l)) => (o, i, l),
            _ => return MgmtEvent::Malformed,
        };
        let params = match r.get_slice(param_len as usize) {
            Ok(p) => p,
            Err(_) => return MgmtEvent::Malformed,
        };

        match opcode {
            event::CommandComplete => {
                let mut pr = ByteReader::new(params);
                let Ok(request_opcode) = pr.get_u16(ByteOrder::Little) else {
                    return MgmtEvent::Malformed;
                };
                let Ok(status) = pr.get_u8() else {
                    return MgmtEvent::Malformed;
                };
                MgmtEvent::CommandComplete {
                    index,
                    request_opcode,
                    status: HciStatus::from(status),
                    return_params: pr.get_remaining().to_vec(),
                }
            }
            event::CommandStatus => {
                let mut pr = ByteReader::new(params);
                match (pr.get_u16(ByteOrder::Little), pr.get_u8()) {
                    (Ok(request_opcode), Ok(status)) => MgmtEvent::CommandStatus {
                        index,
                        request_opcode,
                        status: HciStatus::from(status),
                    },
                    _ => MgmtEvent::Malformed,
                }
            }
            event::NewSettings => {
                let mut pr = ByteReader::new(params);
                match pr.get_u32(ByteOrder::Little) {
                    Ok(current_settings) => MgmtEvent::NewSettings { index, current_settings },
                    Err(_) => MgmtEvent::Malformed,
                }
            }
            event::IndexAdded => MgmtEvent::IndexAdded { index },
            event::IndexRemoved => MgmtEvent::IndexRemoved { index },
            event::DeviceConnected => parse_device_connected(index, params),
            event::DeviceDisconnected => parse_device_disconnected(index, params),
            event::DeviceFound => parse_device_found(index, params),
            event::Discovering => {
                let mut pr = ByteReader::new(params);
                match (pr.get_u8(), pr.get_u8()) {
                    (Ok(address_type), Ok(discovering)) => MgmtEvent::Discovering {
                        index,
                        address_type,
                        discovering: discovering != 0,
                    },
                    _ => MgmtEvent::Malformed,
                }
            }
            event::AuthenticationFailed => {
                let mut pr = ByteReader::new(params);
                let addr = read_addr(&mut pr);
                match (addr, pr.get_u8()) {
                    (Some((address, address_type)), Ok(status)) => MgmtEvent::AuthenticationFailed {
                        index,
                        address,
                        address_type,
                        status: HciStatus::from(status),
                    },
                    _ => MgmtEvent::Malformed,
                }
            }
            other => MgmtEvent::Other {
                opcode: other,
                index,
                params: params.to_vec(),
            },
        }
    }
}

fn read_addr(r: &mut ByteReader) -> Option<(Address, AddressType)> {
    let mut octets = [0u8; 6];
    for o in octets.iter_mut().rev() {
        *o = r.get_u8().ok()?;
    }
    let type_byte = r.get_u8().ok()?;
    let address_type = match type_byte {
        0 => AddressType::BrEdr,
        1 => AddressType::LePublic,
        2 => AddressType::LeRandom,
        _ => AddressType::Undefined,
    };
    Some((Address::new(octets), address_type))
}

fn parse_device_connected(index: u16, params: &[u8]) -> MgmtEvent {
    let mut pr = ByteReader::new(params);
    match read_addr(&mut pr) {
        Some((address, address_type)) => MgmtEvent::DeviceConnected {
            index,
            address,
            address_type,
        },
        None => MgmtEvent::Malformed,
    }
}

fn parse_device_disconnected(index: u16, params: &[u8]) -> MgmtEvent {
    let mut pr = ByteReader::new(params);
    let addr = read_addr(&mut pr);
    match (addr, pr.get_u8()) {
        (Some((address, address_type)), Ok(reason)) => MgmtEvent::DeviceDisconnected {
            index,
            address,
            address_type,
            reason,
        },
        _ => MgmtEvent::Malformed,
    }
}

fn parse_device_found(index: u16, params: &[u8]) -> MgmtEvent {
    let mut pr = ByteReader::new(params);
    let addr = read_addr(&mut pr);
    let Some((address, address_type)) = addr else {
        return MgmtEvent::Malformed;
    };
    let (rssi, flags, eir_len) = match (pr.get_i8(), pr.get_u32(ByteOrder::Little), pr.get_u16(ByteOrder::Little)) {
        (Ok(r), Ok(f), Ok(l)) => (r, f, l),
        _ => return MgmtEvent::Malformed,
    };
    match pr.get_slice(eir_len as usize) {
        Ok(eir) => MgmtEvent::DeviceFound {
            index,
            address,
            address_type,
            rssi,
            flags,
            eir: eir.to_vec(),
        },
        Err(_) => MgmtEvent::Malformed,
    }
}

/// Builds a MGMT command frame with no parameters.
pub fn command_no_params(opcode: u16, index: u16) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u16(opcode, ByteOrder::Little);
    w.put_u16(index, ByteOrder::Little);
    w.put_u16(0, ByteOrder::Little);
    w.into_bytes()
}

/// Builds a MGMT command frame with the given raw parameter bytes.
pub fn command_with_params(opcode: u16, index: u16, params: &[u8]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u16(opcode, ByteOrder::Little);
    w.put_u16(index, ByteOrder::Little);
    w.put_u16(params.len() as u16, ByteOrder::Little);
    w.put_slice(params);
    w.into_bytes()
}

pub fn set_powered(index: u16, on: bool) -> Vec<u8> {
    command_with_params(opcode::SetPowered, index, &[on as u8])
}

pub fn start_discovery(index: u16, address_type_mask: u8) -> Vec<u8> {
    command_with_params(opcode::StartDiscovery, index, &[address_type_mask])
}

pub fn stop_discovery(index: u16, address_type_mask: u8) -> Vec<u8> {
    command_with_params(opcode::StopDiscovery, index, &[address_type_mask])
}

pub fn disconnect(index: u16, address: Address, address_type: AddressType) -> Vec<u8> {
    let mut params = Vec::with_capacity(7);
    let mut octets = address.octets();
    octets.reverse();
    params.extend_from_slice(&octets);
    params.push(address_type_wire(address_type));
    command_with_params(opcode::Disconnect, index, &params)
}

fn address_type_wire(t: AddressType) -> u8 {
    match t {
        AddressType::BrEdr => 0,
        AddressType::LePublic => 1,
        AddressType::LeRandom => 2,
        AddressType::Undefined => 0xff,
    }
}

/// Loads a set of identity resolving keys into the controller's resolving
/// list, so the kernel resolves a bonded peer's resolvable private address
/// before it ever reaches an MGMT event (spec §8 "RPA resolution").
pub fn load_identity_resolving_keys(index: u16, irks: &[(AddressAndType, [u8; 16])]) -> Vec<u8> {
    let mut params = Vec::with_capacity(2 + irks.len() * 23);
    params.extend_from_slice(&(irks.len() as u16).to_le_bytes());
    for (addr, irk) in irks {
        let mut octets = addr.address.octets();
        octets.reverse();
        params.extend_from_slice(&octets);
        params.push(address_type_wire(addr.address_type));
        params.extend_from_slice(irk);
    }
    command_with_params(opcode::LoadIdentityResolvingKeys, index, &params)
}

/// Adds a bonded device to the controller's accept/resolving list so its
/// future advertisements are reported even while other scan filters apply
/// (spec §8 "Key-bin directory preload").
pub fn add_device(index: u16, address: AddressAndType, action: u8) -> Vec<u8> {
    let mut octets = address.address.octets();
    octets.reverse();
    let mut params = Vec::with_capacity(8);
    params.extend_from_slice(&octets);
    params.push(address_type_wire(address.address_type));
    params.push(action);
    command_with_params(opcode::AddDevice, index, &params)
}

pub fn set_bredr(index: u16, on: bool) -> Vec<u8> {
    command_with_params(opcode::SetBrEdr, index, &[on as u8])
}

pub fn set_low_energy(index: u16, on: bool) -> Vec<u8> {
    command_with_params(opcode::SetLowEnergy, index, &[on as u8])
}

pub fn set_secure_connections(index: u16, mode: u8) -> Vec<u8> {
    command_with_params(opcode::SetSecureConnections, index, &[mode])
}

pub fn set_secure_simple_pairing(index: u16, on: bool) -> Vec<u8> {
    command_with_params(opcode::SetSecureSimplePairing, index, &[on as u8])
}

pub fn set_io_capability(index: u16, capability: u8) -> Vec<u8> {
    command_with_params(opcode::SetIoCapability, index, &[capability])
}

pub fn set_bondable(index: u16, on: bool) -> Vec<u8> {
    command_with_params(opcode::SetBondable, index, &[on as u8])
}

/// Removes every device from the controller's accept/resolving list (the
/// all-zero address with type `0` means "all", per `mgmt-api.txt` Remove
/// Device) — "flush whitelist" in the init sequence (spec §4.3).
pub fn remove_all_devices(index: u16) -> Vec<u8> {
    let params = [0u8; 7];
    command_with_params(opcode::RemoveDevice, index, &params)
}

/// Clears any previously loaded per-device connection parameter overrides,
/// leaving the controller's own defaults in effect (spec §4.3 "set default
/// connection parameters").
pub fn load_connection_parameters_empty(index: u16) -> Vec<u8> {
    command_with_params(opcode::LoadConnectionParameters, index, &0u16.to_le_bytes())
}

/// The subset of `ReadControllerInfo`'s reply this crate keeps (spec §3
/// "Adapter info" identity): local address, controller HCI version,
/// manufacturer id, and the settings bitmasks. The reply also carries a
/// class-of-device and name/short-name pair this crate has no use for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerInfo {
    pub address: Address,
    pub hci_version: u8,
    pub manufacturer: u16,
    pub supported_settings: u32,
    pub current_settings: u32,
}

pub fn parse_controller_info(bytes: &[u8]) -> Option<ControllerInfo> {
    let mut r = ByteReader::new(bytes);
    let mut octets = [0u8; 6];
    for o in octets.iter_mut().rev() {
        *o = r.get_u8().ok()?;
    }
    let hci_version = r.get_u8().ok()?;
    let manufacturer = r.get_u16(ByteOrder::Little).ok()?;
    let supported_settings = r.get_u32(ByteOrder::Little).ok()?;
    let current_settings = r.get_u32(ByteOrder::Little).ok()?;
    Some(ControllerInfo {
        address: Address::new(octets),
        hci_version,
        manufacturer,
        supported_settings,
        current_settings,
    })
}

/// The subset of `ReadVersion`'s reply this crate checks: the MGMT API major
/// version must be at least 1.0 (spec §4.3 "Initialize adapter").
pub fn parse_version(bytes: &[u8]) -> Option<u8> {
    let mut r = ByteReader::new(bytes);
    r.get_u8().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_complete() {
        let mut params = Vec::new();
        params.extend_from_slice(&opcode::ReadVersion.to_le_bytes());
        params.push(0x00); // success
        params.extend_from_slice(&[1, 2, 3]);
        let frame = command_with_params(event::CommandComplete, 0, &params);
        match MgmtEvent::parse(&frame) {
            MgmtEvent::CommandComplete {
                request_opcode,
                status,
                return_params,
                ..
            } => {
                assert_eq!(request_opcode, opcode::ReadVersion);
                assert_eq!(status, HciStatus::Success);
                assert_eq!(return_params, vec![1, 2, 3]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_frame_is_malformed_not_a_panic() {
        assert_eq!(MgmtEvent::parse(&[0x01, 0x00]), MgmtEvent::Malformed);
    }

    #[test]
    fn device_found_round_trips_address() {
        let mut params = Vec::new();
        let mut octets = [0xAAu8, 0xBB, 0xCC, 0xDD, 0xEE, 0x01];
        octets.reverse();
        params.extend_from_slice(&octets);
        params.push(1); // LE public
        params.push((-60i8) as u8);
        params.extend_from_slice(&0u32.to_le_bytes());
        params.extend_from_slice(&0u16.to_le_bytes());
        let frame = command_with_params(event::DeviceFound, 3, &params);
        match MgmtEvent::parse(&frame) {
            MgmtEvent::DeviceFound { address, rssi, .. } => {
                assert_eq!(address.to_string(), "AA:BB:CC:DD:EE:01");
                assert_eq!(rssi, -60);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
