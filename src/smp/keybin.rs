//! `SMPKeyBin` persistent key storage (spec §6 "Persisted state"): one
//! binary file per paired remote device, named deterministically from its
//! address-and-type, holding a versioned length-prefixed record of the
//! bonded keys so a reconnect can skip SMP feature exchange entirely
//! (spec §8 P5).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::address::{Address, AddressAndType, AddressType};
use crate::codec::{ByteOrder, ByteReader, ByteWriter};

pub const FORMAT_VERSION: u8 = 1;

/// The local role held during the pairing that produced this bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Peripheral,
}

/// The pairing mode recorded for a bonded device, mirroring the SMP engine's
/// own `PairingMode` (spec §4.6.2) but frozen at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingMode {
    JustWorks,
    PasskeyEntry,
    NumericComparison,
    OutOfBand,
    /// Reused keys from a previous session; no SMP exchange took place.
    PrePaired,
}

impl PairingMode {
    fn to_wire(self) -> u8 {
        match self {
            PairingMode::JustWorks => 0,
            PairingMode::PasskeyEntry => 1,
            PairingMode::NumericComparison => 2,
            PairingMode::OutOfBand => 3,
            PairingMode::PrePaired => 4,
        }
    }

    fn from_wire(v: u8) -> Option<Self> {
        Some(match v {
            0 => PairingMode::JustWorks,
            1 => PairingMode::PasskeyEntry,
            2 => PairingMode::NumericComparison,
            3 => PairingMode::OutOfBand,
            4 => PairingMode::PrePaired,
            _ => return None,
        })
    }
}

/// A bonded device's persisted key material (spec §6 "Persisted state").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmpKeyBin {
    pub local_address: AddressAndType,
    pub remote_address: AddressAndType,
    pub role: Role,
    pub mode: PairingMode,
    pub security_level: u8,
    pub ltk: Option<[u8; 16]>,
    pub ediv: u16,
    pub rand: u64,
    pub irk: Option<[u8; 16]>,
    pub csrk: Option<[u8; 16]>,
    pub created_at_unix: u64,
}

impl SmpKeyBin {
    /// The deterministic filename for a peer (spec §6: "Filename is derived
    /// deterministically from the remote address-and-type").
    pub fn file_name(remote: AddressAndType) -> String {
        let kind = match remote.address_type {
            AddressType::BrEdr => "bredr",
            AddressType::LePublic => "le_public",
            AddressType::LeRandom => "le_random",
            AddressType::Undefined => "undefined",
        };
        format!("{}-{kind}.bin", remote.address)
    }

    pub fn path_for(dir: &Path, remote: AddressAndType) -> PathBuf {
        dir.join(Self::file_name(remote))
    }

    pub fn write_to_dir(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)?;
        let path = Self::path_for(dir, self.remote_address);
        fs::write(path, self.encode())
    }

    pub fn delete_from_dir(dir: &Path, remote: AddressAndType) -> io::Result<()> {
        let path = Self::path_for(dir, remote);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Scans `dir` for well-formed bins whose local-adapter field matches
    /// `local`, for preload into the kernel on adapter open (spec §6).
    pub fn scan_dir(dir: &Path, local: Address) -> Vec<SmpKeyBin> {
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut bins = Vec::new();
        for entry in entries.flatten() {
            let Ok(bytes) = fs::read(entry.path()) else { continue };
            let Some(bin) = Self::decode(&bytes) else { continue };
            if bin.local_address.address == local {
                bins.push(bin);
            }
        }
        bins
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_u8(FORMAT_VERSION);
        put_address(&mut w, self.local_address);
        put_address(&mut w, self.remote_address);
        w.put_u8(match self.role {
            Role::Master => 0,
            Role::Peripheral => 1,
        });
        w.put_u8(self.mode.to_wire());
        w.put_u8(self.security_level);
        put_optional_key(&mut w, self.ltk);
        w.put_u16(self.ediv, ByteOrder::Little);
        w.put_u64(self.rand, ByteOrder::Little);
        put_optional_key(&mut w, self.irk);
        put_optional_key(&mut w, self.csrk);
        w.put_u64(self.created_at_unix, ByteOrder::Little);
        w.into_bytes()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = ByteReader::new(bytes);
        let version = r.get_u8().ok()?;
        if version != FORMAT_VERSION {
            return None;
        }
        let local_address = get_address(&mut r)?;
        let remote_address = get_address(&mut r)?;
        let role = match r.get_u8().ok()? {
            0 => Role::Master,
            1 => Role::Peripheral,
            _ => return None,
        };
        let mode = PairingMode::from_wire(r.get_u8().ok()?)?;
        let security_level = r.get_u8().ok()?;
        let ltk = get_optional_key(&mut r)?;
        let ediv = r.get_u16(ByteOrder::Little).ok()?;
        let rand = r.get_u64(ByteOrder::Little).ok()?;
        let irk = get_optional_key(&mut r)?;
        let csrk = get_optional_key(&mut r)?;
        let created_at_unix = r.get_u64(ByteOrder::Little).ok()?;
        Some(SmpKeyBin {
            local_address,
            remote_address,
            role,
            mode,
            security_level,
            ltk,
            ediv,
            rand,
            irk,
            csrk,
            created_at_unix,
        })
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn address_type_wire(t: AddressType) -> u8 {
    match t {
        AddressType::BrEdr => 0,
        AddressType::LePublic => 1,
        AddressType::LeRandom => 2,
        AddressType::Undefined => 0xff,
    }
}

fn address_type_from_wire(v: u8) -> AddressType {
    match v {
        0 => AddressType::BrEdr,
        1 => AddressType::LePublic,
        2 => AddressType::LeRandom,
        _ => AddressType::Undefined,
    }
}

fn put_address(w: &mut ByteWriter, a: AddressAndType) {
    w.put_slice(&a.address.octets());
    w.put_u8(address_type_wire(a.address_type));
}

fn get_address(r: &mut ByteReader) -> Option<AddressAndType> {
    let octets: [u8; 6] = r.get_slice(6).ok()?.try_into().ok()?;
    let address_type = address_type_from_wire(r.get_u8().ok()?);
    Some(AddressAndType {
        address: Address::new(octets),
        address_type,
    })
}

fn put_optional_key(w: &mut ByteWriter, key: Option<[u8; 16]>) {
    match key {
        Some(bytes) => {
            w.put_u8(1);
            w.put_slice(&bytes);
        }
        None => w.put_u8(0),
    };
}

fn get_optional_key(r: &mut ByteReader) -> Option<Option<[u8; 16]>> {
    match r.get_u8().ok()? {
        0 => Some(None),
        1 => {
            let bytes: [u8; 16] = r.get_slice(16).ok()?.try_into().ok()?;
            Some(Some(bytes))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SmpKeyBin {
        SmpKeyBin {
            local_address: AddressAndType {
                address: "00:11:22:33:44:55".parse().unwrap(),
                address_type: AddressType::LePublic,
            },
            remote_address: AddressAndType {
                address: "AA:BB:CC:DD:EE:02".parse().unwrap(),
                address_type: AddressType::LeRandom,
            },
            role: Role::Master,
            mode: PairingMode::NumericComparison,
            security_level: 2,
            ltk: Some([7u8; 16]),
            ediv: 42,
            rand: 0x1122_3344_5566_7788,
            irk: Some([9u8; 16]),
            csrk: None,
            created_at_unix: 1_700_000_000,
        }
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let bin = sample();
        let bytes = bin.encode();
        let decoded = SmpKeyBin::decode(&bytes).unwrap();
        assert_eq!(decoded, bin);
    }

    #[test]
    fn write_read_delete_round_trip_on_disk() {
        let dir = std::env::temp_dir().join(format!("btstack-keybin-test-{:?}", std::thread::current().id()));
        let bin = sample();
        bin.write_to_dir(&dir).unwrap();

        let found = SmpKeyBin::scan_dir(&dir, bin.local_address.address);
        assert_eq!(found, vec![bin.clone()]);

        SmpKeyBin::delete_from_dir(&dir, bin.remote_address).unwrap();
        assert!(SmpKeyBin::scan_dir(&dir, bin.local_address.address).is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut bytes = sample().encode();
        bytes[0] = 0xFF;
        assert!(SmpKeyBin::decode(&bytes).is_none());
    }
}
