//! ATT protocol PDUs (spec §4.6.1, Bluetooth Core Spec Vol 3, Part F, §3.3).
//!
//! Grounded in `rubble`'s `att/pdus.rs`
//! (`examples/jonas-schievink-rubble/rubble/src/att/pdus.rs`) for the
//! opcode/payload shape, generalized from that crate's `no_std`/zero-copy
//! attribute server to this crate's client-and-server, heap-allocated
//! engine (spec §4.6).

use uuid::Uuid;

use crate::btuuid::BluetoothUuidExt;
use crate::codec::{ByteOrder, ByteReader, ByteWriter, CodecError};
use crate::error::AttError;

/// ATT opcodes (Core Spec Vol 3, Part F, §3.4.8).
#[allow(missing_docs, non_upper_case_globals)]
pub mod opcode {
    pub const ErrorRsp: u8 = 0x01;
    pub const ExchangeMtuReq: u8 = 0x02;
    pub const ExchangeMtuRsp: u8 = 0x03;
    pub const FindInformationReq: u8 = 0x04;
    pub const FindInformationRsp: u8 = 0x05;
    pub const FindByTypeValueReq: u8 = 0x06;
    pub const FindByTypeValueRsp: u8 = 0x07;
    pub const ReadByTypeReq: u8 = 0x08;
    pub const ReadByTypeRsp: u8 = 0x09;
    pub const ReadReq: u8 = 0x0A;
    pub const ReadRsp: u8 = 0x0B;
    pub const ReadBlobReq: u8 = 0x0C;
    pub const ReadBlobRsp: u8 = 0x0D;
    pub const ReadMultipleReq: u8 = 0x0E;
    pub const ReadMultipleRsp: u8 = 0x0F;
    pub const ReadByGroupTypeReq: u8 = 0x10;
    pub const ReadByGroupTypeRsp: u8 = 0x11;
    pub const WriteReq: u8 = 0x12;
    pub const WriteRsp: u8 = 0x13;
    pub const WriteCmd: u8 = 0x52;
    pub const PrepareWriteReq: u8 = 0x16;
    pub const PrepareWriteRsp: u8 = 0x17;
    pub const ExecuteWriteReq: u8 = 0x18;
    pub const ExecuteWriteRsp: u8 = 0x19;
    pub const HandleValueNotification: u8 = 0x1B;
    pub const HandleValueIndication: u8 = 0x1D;
    pub const HandleValueConfirmation: u8 = 0x1E;
    pub const SignedWriteCmd: u8 = 0xD2;
}

/// A decoded ATT PDU (spec §4.6.1 classifier: typed variant, or
/// [`AttPdu::Malformed`] on a truncated/unrecognized frame).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttPdu {
    ErrorRsp {
        request_opcode: u8,
        handle: u16,
        error: AttError,
    },
    ExchangeMtuReq {
        client_rx_mtu: u16,
    },
    ExchangeMtuRsp {
        server_rx_mtu: u16,
    },
    FindInformationReq {
        start_handle: u16,
        end_handle: u16,
    },
    FindInformationRsp {
        entries: Vec<(u16, Uuid)>,
    },
    ReadByTypeReq {
        start_handle: u16,
        end_handle: u16,
        attribute_type: Uuid,
    },
    ReadByTypeRsp {
        entry_len: u8,
        data: Vec<u8>,
    },
    ReadReq {
        handle: u16,
    },
    ReadRsp {
        value: Vec<u8>,
    },
    ReadBlobReq {
        handle: u16,
        offset: u16,
    },
    ReadBlobRsp {
        value: Vec<u8>,
    },
    ReadByGroupTypeReq {
        start_handle: u16,
        end_handle: u16,
        attribute_group_type: Uuid,
    },
    ReadByGroupTypeRsp {
        entry_len: u8,
        data: Vec<u8>,
    },
    WriteReq {
        handle: u16,
        value: Vec<u8>,
    },
    WriteRsp,
    WriteCmd {
        handle: u16,
        value: Vec<u8>,
    },
    HandleValueNotification {
        handle: u16,
        value: Vec<u8>,
    },
    HandleValueIndication {
        handle: u16,
        value: Vec<u8>,
    },
    HandleValueConfirmation,
    /// A recognized opcode this classifier doesn't special-case.
    Other { opcode: u8, params: Vec<u8> },
    Malformed,
}

/// Each entry in a Read By Type / Read By Group Type response is
/// `(handle, value_bytes)`, all sharing one `entry_len` across the PDU.
pub fn iter_handle_value_entries(entry_len: u8, data: &[u8]) -> Vec<(u16, &[u8])> {
    if entry_len < 2 {
        return Vec::new();
    }
    data.chunks_exact(entry_len as usize)
        .filter_map(|chunk| {
            let handle = u16::from_le_bytes([chunk[0], chunk[1]]);
            Some((handle, &chunk[2..]))
        })
        .collect()
}

impl AttPdu {
    pub fn parse(buf: &[u8]) -> Self {
        let mut r = ByteReader::new(buf);
        let Ok(op) = r.get_u8() else {
            return AttPdu::Malformed;
        };
        match op {
            opcode::ErrorRsp => match (r.get_u8(), r.get_u16(ByteOrder::Little), r.get_u8()) {
                (Ok(request_opcode), Ok(handle), Ok(err)) => AttPdu::ErrorRsp {
                    request_opcode,
                    handle,
                    error: AttError::from(err),
                },
                _ => AttPdu::Malformed,
            },
            opcode::ExchangeMtuReq => match r.get_u16(ByteOrder::Little) {
                Ok(mtu) => AttPdu::ExchangeMtuReq { client_rx_mtu: mtu },
                Err(_) => AttPdu::Malformed,
            },
            opcode::ExchangeMtuRsp => match r.get_u16(ByteOrder::Little) {
                Ok(mtu) => AttPdu::ExchangeMtuRsp { server_rx_mtu: mtu },
                Err(_) => AttPdu::Malformed,
            },
            opcode::FindInformationReq => match (r.get_u16(ByteOrder::Little), r.get_u16(ByteOrder::Little)) {
                (Ok(start_handle), Ok(end_handle)) => AttPdu::FindInformationReq { start_handle, end_handle },
                _ => AttPdu::Malformed,
            },
            opcode::FindInformationRsp => parse_find_information_rsp(&mut r),
            opcode::ReadByTypeReq => match (
                r.get_u16(ByteOrder::Little),
                r.get_u16(ByteOrder::Little),
                parse_remaining_uuid(&mut r),
            ) {
                (Ok(start_handle), Ok(end_handle), Some(attribute_type)) => AttPdu::ReadByTypeReq {
                    start_handle,
                    end_handle,
                    attribute_type,
                },
                _ => AttPdu::Malformed,
            },
            opcode::ReadByTypeRsp => match r.get_u8() {
                Ok(entry_len) => AttPdu::ReadByTypeRsp {
                    entry_len,
                    data: r.get_remaining().to_vec(),
                },
                Err(_) => AttPdu::Malformed,
            },
            opcode::ReadReq => match r.get_u16(ByteOrder::Little) {
                Ok(handle) => AttPdu::ReadReq { handle },
                Err(_) => AttPdu::Malformed,
            },
            opcode::ReadRsp => AttPdu::ReadRsp {
                value: r.get_remaining().to_vec(),
            },
            opcode::ReadBlobReq => match (r.get_u16(ByteOrder::Little), r.get_u16(ByteOrder::Little)) {
                (Ok(handle), Ok(offset)) => AttPdu::ReadBlobReq { handle, offset },
                _ => AttPdu::Malformed,
            },
            opcode::ReadBlobRsp => AttPdu::ReadBlobRsp {
                value: r.get_remaining().to_vec(),
            },
            opcode::ReadByGroupTypeReq => match (
                r.get_u16(ByteOrder::Little),
                r.get_u16(ByteOrder::Little),
                parse_remaining_uuid(&mut r),
            ) {
                (Ok(start_handle), Ok(end_handle), Some(attribute_group_type)) => AttPdu::ReadByGroupTypeReq {
                    start_handle,
                    end_handle,
                    attribute_group_type,
                },
                _ => AttPdu::Malformed,
            },
            opcode::ReadByGroupTypeRsp => match r.get_u8() {
                Ok(entry_len) => AttPdu::ReadByGroupTypeRsp {
                    entry_len,
                    data: r.get_remaining().to_vec(),
                },
                Err(_) => AttPdu::Malformed,
            },
            opcode::WriteReq => match r.get_u16(ByteOrder::Little) {
                Ok(handle) => AttPdu::WriteReq {
                    handle,
                    value: r.get_remaining().to_vec(),
                },
                Err(_) => AttPdu::Malformed,
            },
            opcode::WriteRsp => AttPdu::WriteRsp,
            opcode::WriteCmd => match r.get_u16(ByteOrder::Little) {
                Ok(handle) => AttPdu::WriteCmd {
                    handle,
                    value: r.get_remaining().to_vec(),
                },
                Err(_) => AttPdu::Malformed,
            },
            opcode::HandleValueNotification => match r.get_u16(ByteOrder::Little) {
                Ok(handle) => AttPdu::HandleValueNotification {
                    handle,
                    value: r.get_remaining().to_vec(),
                },
                Err(_) => AttPdu::Malformed,
            },
            opcode::HandleValueIndication => match r.get_u16(ByteOrder::Little) {
                Ok(handle) => AttPdu::HandleValueIndication {
                    handle,
                    value: r.get_remaining().to_vec(),
                },
                Err(_) => AttPdu::Malformed,
            },
            opcode::HandleValueConfirmation => AttPdu::HandleValueConfirmation,
            other => AttPdu::Other {
                opcode: other,
                params: r.get_remaining().to_vec(),
            },
        }
    }
}

fn parse_remaining_uuid(r: &mut ByteReader) -> Option<Uuid> {
    let width = r.remaining();
    if width != 2 && width != 16 {
        return None;
    }
    r.get_uuid(width).ok()
}

fn parse_find_information_rsp(r: &mut ByteReader) -> AttPdu {
    let Ok(format) = r.get_u8() else {
        return AttPdu::Malformed;
    };
    let uuid_width = match format {
        1 => 2,
        2 => 16,
        _ => return AttPdu::Malformed,
    };
    let mut entries = Vec::new();
    while !r.is_empty() {
        let handle = match r.get_u16(ByteOrder::Little) {
            Ok(h) => h,
            Err(_) => return AttPdu::Malformed,
        };
        let uuid = match r.get_uuid(uuid_width) {
            Ok(u) => u,
            Err(_) => return AttPdu::Malformed,
        };
        entries.push((handle, uuid));
    }
    AttPdu::FindInformationRsp { entries }
}

pub fn error_rsp(request_opcode: u8, handle: u16, error: u8) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u8(opcode::ErrorRsp);
    w.put_u8(request_opcode);
    w.put_u16(handle, ByteOrder::Little);
    w.put_u8(error);
    w.into_bytes()
}

pub fn exchange_mtu_req(client_rx_mtu: u16) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u8(opcode::ExchangeMtuReq);
    w.put_u16(client_rx_mtu, ByteOrder::Little);
    w.into_bytes()
}

pub fn exchange_mtu_rsp(server_rx_mtu: u16) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u8(opcode::ExchangeMtuRsp);
    w.put_u16(server_rx_mtu, ByteOrder::Little);
    w.into_bytes()
}

pub fn read_by_group_type_req(start_handle: u16, end_handle: u16, attribute_group_type: &Uuid) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u8(opcode::ReadByGroupTypeReq);
    w.put_u16(start_handle, ByteOrder::Little);
    w.put_u16(end_handle, ByteOrder::Little);
    w.put_uuid(attribute_group_type, attribute_group_type.as_bluetooth_bytes().len());
    w.into_bytes()
}

pub fn read_by_type_req(start_handle: u16, end_handle: u16, attribute_type: &Uuid) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u8(opcode::ReadByTypeReq);
    w.put_u16(start_handle, ByteOrder::Little);
    w.put_u16(end_handle, ByteOrder::Little);
    w.put_uuid(attribute_type, attribute_type.as_bluetooth_bytes().len());
    w.into_bytes()
}

pub fn find_information_req(start_handle: u16, end_handle: u16) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u8(opcode::FindInformationReq);
    w.put_u16(start_handle, ByteOrder::Little);
    w.put_u16(end_handle, ByteOrder::Little);
    w.into_bytes()
}

pub fn read_req(handle: u16) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u8(opcode::ReadReq);
    w.put_u16(handle, ByteOrder::Little);
    w.into_bytes()
}

pub fn read_blob_req(handle: u16, offset: u16) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u8(opcode::ReadBlobReq);
    w.put_u16(handle, ByteOrder::Little);
    w.put_u16(offset, ByteOrder::Little);
    w.into_bytes()
}

pub fn write_req(handle: u16, value: &[u8]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u8(opcode::WriteReq);
    w.put_u16(handle, ByteOrder::Little);
    w.put_slice(value);
    w.into_bytes()
}

pub fn write_cmd(handle: u16, value: &[u8]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u8(opcode::WriteCmd);
    w.put_u16(handle, ByteOrder::Little);
    w.put_slice(value);
    w.into_bytes()
}

pub fn handle_value_confirmation() -> Vec<u8> {
    vec![opcode::HandleValueConfirmation]
}

/// Whether `opcode` is any of the three request opcodes that solicit a
/// matching response/confirmation on the same ATT bearer (used by the GATT
/// reader task to pair replies with in-flight requests, spec §4.6.2).
pub fn expects_reply(opcode: u8) -> bool {
    matches!(
        opcode,
        opcode::ExchangeMtuReq
            | opcode::FindInformationReq
            | opcode::FindByTypeValueReq
            | opcode::ReadByTypeReq
            | opcode::ReadReq
            | opcode::ReadBlobReq
            | opcode::ReadMultipleReq
            | opcode::ReadByGroupTypeReq
            | opcode::WriteReq
            | opcode::PrepareWriteReq
            | opcode::ExecuteWriteReq
    )
}

impl From<CodecError> for AttPdu {
    fn from(_: CodecError) -> Self {
        AttPdu::Malformed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btuuid::characteristics::BATTERY_LEVEL;

    #[test]
    fn round_trips_read_req() {
        let pkt = read_req(0x0012);
        match AttPdu::parse(&pkt) {
            AttPdu::ReadReq { handle } => assert_eq!(handle, 0x0012),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn round_trips_read_by_type_req_with_short_uuid() {
        let pkt = read_by_type_req(1, 0xffff, &BATTERY_LEVEL);
        match AttPdu::parse(&pkt) {
            AttPdu::ReadByTypeReq {
                start_handle,
                end_handle,
                attribute_type,
            } => {
                assert_eq!(start_handle, 1);
                assert_eq!(end_handle, 0xffff);
                assert_eq!(attribute_type, BATTERY_LEVEL);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_rsp_carries_typed_error() {
        let pkt = error_rsp(opcode::ReadReq, 0x0003, 0x0a);
        match AttPdu::parse(&pkt) {
            AttPdu::ErrorRsp { error, handle, .. } => {
                assert_eq!(error, AttError::AttributeNotFound);
                assert_eq!(handle, 0x0003);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_pdu_is_malformed_not_a_panic() {
        assert_eq!(AttPdu::parse(&[opcode::ReadReq]), AttPdu::Malformed);
        assert_eq!(AttPdu::parse(&[]), AttPdu::Malformed);
    }

    #[test]
    fn handle_value_entries_split_correctly() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&[0xAA]);
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&[0xBB]);
        let entries = iter_handle_value_entries(3, &data);
        assert_eq!(entries, vec![(1, &[0xAAu8][..]), (2, &[0xBBu8][..])]);
    }
}
