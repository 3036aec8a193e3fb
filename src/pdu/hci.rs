//! HCI command/event PDUs (spec §4.3, GLOSSARY "HCI").
//!
//! These are consulted only for the handful of controller operations the
//! MGMT socket doesn't cover (notably raw advertising-report parsing
//! fallback and disconnection reason decoding); most adapter/device control
//! flows through [`crate::pdu::mgmt`] instead.

use crate::address::{Address, AddressType};
use crate::codec::{ByteOrder, ByteReader, ByteWriter};
use crate::error::HciStatus;

/// HCI event codes (Core Spec Vol 4, Part E, §7.7).
#[allow(missing_docs, non_upper_case_globals)]
pub mod event_code {
    pub const DisconnectionComplete: u8 = 0x05;
    pub const EncryptionChange: u8 = 0x08;
    pub const CommandComplete: u8 = 0x0E;
    pub const CommandStatus: u8 = 0x0F;
    pub const NumberOfCompletedPackets: u8 = 0x13;
    pub const LeMetaEvent: u8 = 0x3E;
}

/// LE Meta subevent codes (Core Spec Vol 4, Part E, §7.7.65).
#[allow(missing_docs, non_upper_case_globals)]
pub mod le_subevent_code {
    pub const ConnectionComplete: u8 = 0x01;
    pub const AdvertisingReport: u8 = 0x02;
    pub const ConnectionUpdateComplete: u8 = 0x03;
    pub const EnhancedConnectionComplete: u8 = 0x0A;
}

/// A decoded HCI event, classified by event code (spec §4.2 classifier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciEvent {
    CommandComplete {
        num_hci_command_packets: u8,
        opcode: u16,
        return_params: Vec<u8>,
    },
    CommandStatus {
        status: HciStatus,
        num_hci_command_packets: u8,
        opcode: u16,
    },
    DisconnectionComplete {
        status: HciStatus,
        handle: u16,
        reason: HciStatus,
    },
    EncryptionChange {
        status: HciStatus,
        handle: u16,
        encryption_enabled: bool,
    },
    LeAdvertisingReport(Vec<AdvertisingReportEntry>),
    LeConnectionComplete {
        status: HciStatus,
        handle: u16,
        role: u8,
        peer_address_type: AddressType,
        peer_address: Address,
    },
    /// A recognized event code whose body this classifier doesn't
    /// special-case.
    Other { code: u8, params: Vec<u8> },
    Malformed,
}

/// One entry from an LE Advertising Report event (spec §4.5.5 input).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingReportEntry {
    pub event_type: u8,
    pub address_type: AddressType,
    pub address: Address,
    pub rssi: i8,
    pub data: Vec<u8>,
}

impl HciEvent {
    /// Classifies a raw HCI event packet, `code` then `param_len` then
    /// `param_len` bytes of parameters (Core Spec Vol 4, Part E, §5.4.4).
    pub fn parse(buf: &[u8]) -> Self {
        let mut r = ByteReader::new(buf);
        let (code, param_len) = match (r.get_u8(), r.get_u8()) {
            (Ok(c), Ok(l)) => (c, l),
            _ => return HciEvent::Malformed,
        };
        let params = match r.get_slice(param_len as usize) {
            Ok(p) => p,
            Err(_) => return HciEvent::Malformed,
        };

        match code {
            event_code::CommandComplete => {
                let mut pr = ByteReader::new(params);
                match (pr.get_u8(), pr.get_u16(ByteOrder::Little)) {
                    (Ok(num), Ok(opcode)) => HciEvent::CommandComplete {
                        num_hci_command_packets: num,
                        opcode,
                        return_params: pr.get_remaining().to_vec(),
                    },
                    _ => HciEvent::Malformed,
                }
            }
            event_code::CommandStatus => {
                let mut pr = ByteReader::new(params);
                match (pr.get_u8(), pr.get_u8(), pr.get_u16(ByteOrder::Little)) {
                    (Ok(status), Ok(num), Ok(opcode)) => HciEvent::CommandStatus {
                        status: HciStatus::from(status),
                        num_hci_command_packets: num,
                        opcode,
                    },
                    _ => HciEvent::Malformed,
                }
            }
            event_code::DisconnectionComplete => {
                let mut pr = ByteReader::new(params);
                match (pr.get_u8(), pr.get_u16(ByteOrder::Little), pr.get_u8()) {
                    (Ok(status), Ok(handle), Ok(reason)) => HciEvent::DisconnectionComplete {
                        status: HciStatus::from(status),
                        handle,
                        reason: HciStatus::from(reason),
                    },
                    _ => HciEvent::Malformed,
                }
            }
            event_code::EncryptionChange => {
                let mut pr = ByteReader::new(params);
                match (pr.get_u8(), pr.get_u16(ByteOrder::Little), pr.get_u8()) {
                    (Ok(status), Ok(handle), Ok(enabled)) => HciEvent::EncryptionChange {
                        status: HciStatus::from(status),
                        handle,
                        encryption_enabled: enabled != 0,
                    },
                    _ => HciEvent::Malformed,
                }
            }
            event_code::LeMetaEvent => parse_le_meta(params),
            other => HciEvent::Other {
                code: other,
                params: params.to_vec(),
            },
        }
    }
}

fn read_le_addr(r: &mut ByteReader) -> Option<(Address, AddressType)> {
    let type_byte = r.get_u8().ok()?;
    let mut octets = [0u8; 6];
    for o in octets.iter_mut().rev() {
        *o = r.get_u8().ok()?;
    }
    let address_type = match type_byte {
        0x00 => AddressType::LePublic,
        0x01 => AddressType::LeRandom,
        _ => AddressType::Undefined,
    };
    Some((Address::new(octets), address_type))
}

fn parse_le_meta(params: &[u8]) -> HciEvent {
    let mut pr = ByteReader::new(params);
    let Ok(subevent) = pr.get_u8() else {
        return HciEvent::Malformed;
    };
    match subevent {
        le_subevent_code::ConnectionComplete | le_subevent_code::EnhancedConnectionComplete => {
            let status = match pr.get_u8() {
                Ok(s) => HciStatus::from(s),
                Err(_) => return HciEvent::Malformed,
            };
            let handle = match pr.get_u16(ByteOrder::Little) {
                Ok(h) => h,
                Err(_) => return HciEvent::Malformed,
            };
            let role = match pr.get_u8() {
                Ok(r) => r,
                Err(_) => return HciEvent::Malformed,
            };
            match read_le_addr(&mut pr) {
                Some((address, peer_address_type)) => HciEvent::LeConnectionComplete {
                    status,
                    handle,
                    role,
                    peer_address_type,
                    peer_address: address,
                },
                None => HciEvent::Malformed,
            }
        }
        le_subevent_code::AdvertisingReport => parse_advertising_reports(&mut pr),
        _ => HciEvent::Other {
            code: event_code::LeMetaEvent,
            params: params.to_vec(),
        },
    }
}

fn parse_advertising_reports(pr: &mut ByteReader) -> HciEvent {
    let Ok(num_reports) = pr.get_u8() else {
        return HciEvent::Malformed;
    };
    let mut event_types = Vec::with_capacity(num_reports as usize);
    for _ in 0..num_reports {
        match pr.get_u8() {
            Ok(v) => event_types.push(v),
            Err(_) => return HciEvent::Malformed,
        }
    }
    let mut addrs = Vec::with_capacity(num_reports as usize);
    for _ in 0..num_reports {
        match read_le_addr(pr) {
            Some(a) => addrs.push(a),
            None => return HciEvent::Malformed,
        }
    }
    let mut data_lens = Vec::with_capacity(num_reports as usize);
    for _ in 0..num_reports {
        match pr.get_u8() {
            Ok(v) => data_lens.push(v),
            Err(_) => return HciEvent::Malformed,
        }
    }
    let mut data_fields = Vec::with_capacity(num_reports as usize);
    for &len in &data_lens {
        match pr.get_slice(len as usize) {
            Ok(d) => data_fields.push(d.to_vec()),
            Err(_) => return HciEvent::Malformed,
        }
    }
    let mut rssis = Vec::with_capacity(num_reports as usize);
    for _ in 0..num_reports {
        match pr.get_i8() {
            Ok(v) => rssis.push(v),
            Err(_) => return HciEvent::Malformed,
        }
    }

    let entries = (0..num_reports as usize)
        .map(|i| AdvertisingReportEntry {
            event_type: event_types[i],
            address_type: addrs[i].1,
            address: addrs[i].0,
            rssi: rssis[i],
            data: data_fields[i].clone(),
        })
        .collect();
    HciEvent::LeAdvertisingReport(entries)
}

/// Builds a raw HCI command packet: `opcode` (2 bytes LE) + length-prefixed
/// parameters.
pub fn command(opcode: u16, params: &[u8]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u16(opcode, ByteOrder::Little);
    w.put_u8(params.len() as u8);
    w.put_slice(params);
    w.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_complete() {
        let mut params = Vec::new();
        params.push(1u8); // num_hci_command_packets
        params.extend_from_slice(&0x0c03u16.to_le_bytes());
        params.push(0x00); // status
        let mut pkt = Vec::new();
        pkt.push(event_code::CommandComplete);
        pkt.push(params.len() as u8);
        pkt.extend_from_slice(&params);
        match HciEvent::parse(&pkt) {
            HciEvent::CommandComplete { opcode, .. } => assert_eq!(opcode, 0x0c03),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_event_is_malformed_not_a_panic() {
        assert_eq!(HciEvent::parse(&[event_code::CommandComplete]), HciEvent::Malformed);
    }

    #[test]
    fn disconnection_complete_carries_reason() {
        let params = [0x00u8, 0x01, 0x00, 0x13];
        let mut pkt = vec![event_code::DisconnectionComplete, params.len() as u8];
        pkt.extend_from_slice(&params);
        match HciEvent::parse(&pkt) {
            HciEvent::DisconnectionComplete { handle, reason, .. } => {
                assert_eq!(handle, 1);
                assert_eq!(reason, HciStatus::RemoteUserTerminated);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
