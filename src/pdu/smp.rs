//! SMP (Security Manager Protocol) PDUs (spec §4.6.3, Core Spec Vol 3, Part H, §3.3).
//!
//! Grounded in `rubble`'s `security.rs`
//! (`examples/jonas-schievink-rubble/rubble/src/security.rs`) for PDU shape,
//! extended with LE Secure Connections fields (`PublicKey`, `DHKeyCheck`)
//! that crate's initial-pairing-only engine didn't need but this one's
//! 10-state pairing machine does (spec §4.6.3 state table).

use crate::codec::{ByteOrder, ByteReader, ByteWriter};
use crate::error::SmpReason;
use crate::pairing::IoCapability;

/// SMP opcodes (Core Spec Vol 3, Part H, §3.3).
#[allow(missing_docs, non_upper_case_globals)]
pub mod opcode {
    pub const PairingRequest: u8 = 0x01;
    pub const PairingResponse: u8 = 0x02;
    pub const PairingConfirm: u8 = 0x03;
    pub const PairingRandom: u8 = 0x04;
    pub const PairingFailed: u8 = 0x05;
    pub const EncryptionInformation: u8 = 0x06;
    pub const MasterIdentification: u8 = 0x07;
    pub const IdentityInformation: u8 = 0x08;
    pub const IdentityAddressInformation: u8 = 0x09;
    pub const SigningInformation: u8 = 0x0A;
    pub const SecurityRequest: u8 = 0x0B;
    pub const PairingPublicKey: u8 = 0x0C;
    pub const PairingDhKeyCheck: u8 = 0x0D;
    pub const PairingKeypressNotification: u8 = 0x0E;
}

/// Authentication request bitfield flags (Core Spec Vol 3, Part H, §3.5.1 Table 3.3).
pub mod auth_req {
    pub const BONDING: u8 = 0b01;
    pub const MITM: u8 = 1 << 2;
    pub const SECURE_CONNECTIONS: u8 = 1 << 3;
    pub const KEYPRESS: u8 = 1 << 4;
    pub const CT2: u8 = 1 << 5;
}

/// Key distribution bitfield flags (Core Spec Vol 3, Part H, §3.6.1 Table 3.7).
pub mod key_dist {
    pub const ENC_KEY: u8 = 1 << 0;
    pub const ID_KEY: u8 = 1 << 1;
    pub const SIGN_KEY: u8 = 1 << 2;
    pub const LINK_KEY: u8 = 1 << 3;
}

/// A fixed-shape key-distribution parameter set carried in Pairing
/// Request/Response (spec §4.6.3, "PairingParams").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingParams {
    pub io_capability: u8,
    pub oob_data_present: bool,
    pub auth_req: u8,
    pub max_encryption_key_size: u8,
    pub initiator_key_distribution: u8,
    pub responder_key_distribution: u8,
}

impl PairingParams {
    fn parse(r: &mut ByteReader) -> Option<Self> {
        Some(PairingParams {
            io_capability: r.get_u8().ok()?,
            oob_data_present: r.get_u8().ok()? != 0,
            auth_req: r.get_u8().ok()?,
            max_encryption_key_size: r.get_u8().ok()?,
            initiator_key_distribution: r.get_u8().ok()?,
            responder_key_distribution: r.get_u8().ok()?,
        })
    }

    fn write(&self, w: &mut ByteWriter) {
        w.put_u8(self.io_capability);
        w.put_u8(self.oob_data_present as u8);
        w.put_u8(self.auth_req);
        w.put_u8(self.max_encryption_key_size);
        w.put_u8(self.initiator_key_distribution);
        w.put_u8(self.responder_key_distribution);
    }

    pub fn requires_mitm(&self) -> bool {
        self.auth_req & auth_req::MITM != 0
    }

    pub fn uses_secure_connections(&self) -> bool {
        self.auth_req & auth_req::SECURE_CONNECTIONS != 0
    }
}

/// A decoded SMP PDU (spec §4.6.3 classifier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpPdu {
    PairingRequest(PairingParams),
    PairingResponse(PairingParams),
    PairingConfirm { confirm_value: [u8; 16] },
    PairingRandom { random_value: [u8; 16] },
    PairingFailed { reason: SmpReason },
    EncryptionInformation { long_term_key: [u8; 16] },
    MasterIdentification { ediv: u16, rand: u64 },
    IdentityInformation { identity_resolving_key: [u8; 16] },
    IdentityAddressInformation { address_type: u8, address: [u8; 6] },
    SigningInformation { signature_key: [u8; 16] },
    SecurityRequest { auth_req: u8 },
    PairingPublicKey { x: [u8; 32], y: [u8; 32] },
    PairingDhKeyCheck { dhkey_check: [u8; 16] },
    PairingKeypressNotification { notification_type: u8 },
    Malformed,
}

fn read_array<const N: usize>(r: &mut ByteReader) -> Option<[u8; N]> {
    r.get_slice(N).ok()?.try_into().ok()
}

impl SmpPdu {
    pub fn parse(buf: &[u8]) -> Self {
        let mut r = ByteReader::new(buf);
        let Ok(op) = r.get_u8() else {
            return SmpPdu::Malformed;
        };
        match op {
            opcode::PairingRequest => match PairingParams::parse(&mut r) {
                Some(p) => SmpPdu::PairingRequest(p),
                None => SmpPdu::Malformed,
            },
            opcode::PairingResponse => match PairingParams::parse(&mut r) {
                Some(p) => SmpPdu::PairingResponse(p),
                None => SmpPdu::Malformed,
            },
            opcode::PairingConfirm => match read_array::<16>(&mut r) {
                Some(confirm_value) => SmpPdu::PairingConfirm { confirm_value },
                None => SmpPdu::Malformed,
            },
            opcode::PairingRandom => match read_array::<16>(&mut r) {
                Some(random_value) => SmpPdu::PairingRandom { random_value },
                None => SmpPdu::Malformed,
            },
            opcode::PairingFailed => match r.get_u8() {
                Ok(reason) => SmpPdu::PairingFailed {
                    reason: SmpReason::from(reason),
                },
                Err(_) => SmpPdu::Malformed,
            },
            opcode::EncryptionInformation => match read_array::<16>(&mut r) {
                Some(long_term_key) => SmpPdu::EncryptionInformation { long_term_key },
                None => SmpPdu::Malformed,
            },
            opcode::MasterIdentification => match (r.get_u16(ByteOrder::Little), r.get_u64(ByteOrder::Little)) {
                (Ok(ediv), Ok(rand)) => SmpPdu::MasterIdentification { ediv, rand },
                _ => SmpPdu::Malformed,
            },
            opcode::IdentityInformation => match read_array::<16>(&mut r) {
                Some(identity_resolving_key) => SmpPdu::IdentityInformation { identity_resolving_key },
                None => SmpPdu::Malformed,
            },
            opcode::IdentityAddressInformation => {
                let address_type = r.get_u8();
                let address: Option<[u8; 6]> = read_array(&mut r);
                match (address_type, address) {
                    (Ok(address_type), Some(mut address)) => {
                        address.reverse();
                        SmpPdu::IdentityAddressInformation { address_type, address }
                    }
                    _ => SmpPdu::Malformed,
                }
            }
            opcode::SigningInformation => match read_array::<16>(&mut r) {
                Some(signature_key) => SmpPdu::SigningInformation { signature_key },
                None => SmpPdu::Malformed,
            },
            opcode::SecurityRequest => match r.get_u8() {
                Ok(auth_req) => SmpPdu::SecurityRequest { auth_req },
                Err(_) => SmpPdu::Malformed,
            },
            opcode::PairingPublicKey => {
                let x: Option<[u8; 32]> = read_array(&mut r);
                let y: Option<[u8; 32]> = read_array(&mut r);
                match (x, y) {
                    (Some(x), Some(y)) => SmpPdu::PairingPublicKey { x, y },
                    _ => SmpPdu::Malformed,
                }
            }
            opcode::PairingDhKeyCheck => match read_array::<16>(&mut r) {
                Some(dhkey_check) => SmpPdu::PairingDhKeyCheck { dhkey_check },
                None => SmpPdu::Malformed,
            },
            opcode::PairingKeypressNotification => match r.get_u8() {
                Ok(notification_type) => SmpPdu::PairingKeypressNotification { notification_type },
                Err(_) => SmpPdu::Malformed,
            },
            _ => SmpPdu::Malformed,
        }
    }
}

pub fn pairing_request(io: IoCapability, auth_req: u8, max_key_size: u8, ikd: u8, rkd: u8) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u8(opcode::PairingRequest);
    PairingParams {
        io_capability: io.to_wire(),
        oob_data_present: false,
        auth_req,
        max_encryption_key_size: max_key_size,
        initiator_key_distribution: ikd,
        responder_key_distribution: rkd,
    }
    .write(&mut w);
    w.into_bytes()
}

pub fn pairing_response(io: IoCapability, auth_req: u8, max_key_size: u8, ikd: u8, rkd: u8) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u8(opcode::PairingResponse);
    PairingParams {
        io_capability: io.to_wire(),
        oob_data_present: false,
        auth_req,
        max_encryption_key_size: max_key_size,
        initiator_key_distribution: ikd,
        responder_key_distribution: rkd,
    }
    .write(&mut w);
    w.into_bytes()
}

pub fn pairing_confirm(confirm_value: &[u8; 16]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u8(opcode::PairingConfirm);
    w.put_slice(confirm_value);
    w.into_bytes()
}

pub fn pairing_random(random_value: &[u8; 16]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u8(opcode::PairingRandom);
    w.put_slice(random_value);
    w.into_bytes()
}

pub fn pairing_failed(reason: u8) -> Vec<u8> {
    vec![opcode::PairingFailed, reason]
}

pub fn security_request(auth_req: u8) -> Vec<u8> {
    vec![opcode::SecurityRequest, auth_req]
}

pub fn pairing_public_key(x: &[u8; 32], y: &[u8; 32]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u8(opcode::PairingPublicKey);
    w.put_slice(x);
    w.put_slice(y);
    w.into_bytes()
}

pub fn pairing_dhkey_check(dhkey_check: &[u8; 16]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u8(opcode::PairingDhKeyCheck);
    w.put_slice(dhkey_check);
    w.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_pairing_request() {
        let pkt = pairing_request(IoCapability::NoInputNoOutput, auth_req::BONDING, 16, 0x07, 0x07);
        match SmpPdu::parse(&pkt) {
            SmpPdu::PairingRequest(p) => {
                assert_eq!(p.io_capability, IoCapability::NoInputNoOutput.to_wire());
                assert!(!p.requires_mitm());
                assert_eq!(p.max_encryption_key_size, 16);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pairing_failed_carries_typed_reason() {
        let pkt = pairing_failed(0x04);
        match SmpPdu::parse(&pkt) {
            SmpPdu::PairingFailed { reason } => assert_eq!(reason, SmpReason::ConfirmValueFailed),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_pdu_is_malformed_not_a_panic() {
        assert_eq!(SmpPdu::parse(&[opcode::PairingConfirm, 0, 0]), SmpPdu::Malformed);
        assert_eq!(SmpPdu::parse(&[]), SmpPdu::Malformed);
    }

    #[test]
    fn public_key_round_trips() {
        let x = [1u8; 32];
        let y = [2u8; 32];
        let pkt = pairing_public_key(&x, &y);
        match SmpPdu::parse(&pkt) {
            SmpPdu::PairingPublicKey { x: gx, y: gy } => {
                assert_eq!(gx, x);
                assert_eq!(gy, y);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
