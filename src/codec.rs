//! Bounds-checked byte codec (spec §4.1).
//!
//! `ByteReader` is a read-only, borrowed view; `ByteWriter` owns a growable
//! buffer. Both refuse to read or write past the underlying length rather
//! than panicking, so a malformed/truncated frame becomes a
//! [`CodecError`](crate::codec::CodecError) the caller can turn into
//! [`crate::error::ErrorKind::MalformedPdu`] instead of crashing the reader
//! thread. Shaped after `rubble`'s `ByteReader`/`ByteWriter`
//! (`examples/jonas-schievink-rubble/rubble/src/bytes.rs`), reworked for a
//! heap-allocated `std` buffer instead of a zero-copy `no_std` one, and for
//! the little-endian-by-default wire of HCI/ATT/SMP (spec §4.1).

use uuid::Uuid;

use crate::btuuid::BluetoothUuidExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecError;

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("buffer bounds exceeded while decoding")
    }
}

impl std::error::Error for CodecError {}

pub type CodecResult<T> = Result<T, CodecError>;

/// Byte order of a multi-byte field. HCI/ATT/SMP are little-endian
/// throughout; `Big` exists because the codec is a general-purpose tool and
/// some higher layers (16/32-bit Bluetooth UUID shorthand, spec §4.1) are
/// conventionally big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// A read-only, bounds-checked cursor over a borrowed byte slice.
#[derive(Debug, Clone, Copy)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CodecError);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self, order: ByteOrder) -> CodecResult<u16> {
        let b = self.take(2)?;
        Ok(match order {
            ByteOrder::Little => u16::from_le_bytes([b[0], b[1]]),
            ByteOrder::Big => u16::from_be_bytes([b[0], b[1]]),
        })
    }

    pub fn get_u24(&mut self, order: ByteOrder) -> CodecResult<u32> {
        let b = self.take(3)?;
        Ok(match order {
            ByteOrder::Little => u32::from_le_bytes([b[0], b[1], b[2], 0]),
            ByteOrder::Big => u32::from_be_bytes([0, b[0], b[1], b[2]]),
        })
    }

    pub fn get_u32(&mut self, order: ByteOrder) -> CodecResult<u32> {
        let b = self.take(4)?;
        let arr = [b[0], b[1], b[2], b[3]];
        Ok(match order {
            ByteOrder::Little => u32::from_le_bytes(arr),
            ByteOrder::Big => u32::from_be_bytes(arr),
        })
    }

    pub fn get_u64(&mut self, order: ByteOrder) -> CodecResult<u64> {
        let b = self.take(8)?;
        let arr: [u8; 8] = b.try_into().map_err(|_| CodecError)?;
        Ok(match order {
            ByteOrder::Little => u64::from_le_bytes(arr),
            ByteOrder::Big => u64::from_be_bytes(arr),
        })
    }

    pub fn get_i8(&mut self) -> CodecResult<i8> {
        Ok(self.get_u8()? as i8)
    }

    pub fn get_i16(&mut self, order: ByteOrder) -> CodecResult<i16> {
        Ok(self.get_u16(order)? as i16)
    }

    pub fn get_slice(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        self.take(n)
    }

    pub fn get_remaining(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Reads a Bluetooth UUID of the given wire width (2, 4, or 16 bytes).
    /// Any other width is a malformed PDU, reported as [`CodecError`] rather
    /// than panicking — `width` is frequently derived from a peer-controlled
    /// length byte (e.g. ATT `entry_len`).
    pub fn get_uuid(&mut self, width: usize) -> CodecResult<Uuid> {
        if !matches!(width, 2 | 4 | 16) {
            return Err(CodecError);
        }
        let bytes = self.take(width)?;
        if width == 16 {
            let arr: [u8; 16] = bytes.try_into().map_err(|_| CodecError)?;
            // Bluetooth 128-bit UUIDs are transmitted little-endian on the wire.
            let mut be = arr;
            be.reverse();
            Ok(Uuid::from_bytes(be))
        } else {
            let mut le = bytes.to_vec();
            le.reverse();
            Uuid::try_from_bluetooth_bytes(&le).ok_or(CodecError)
        }
    }
}

/// A growable, owned byte buffer writer.
#[derive(Debug, Clone, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        ByteWriter { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        ByteWriter {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u16(&mut self, v: u16, order: ByteOrder) -> &mut Self {
        self.buf.extend_from_slice(&match order {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        });
        self
    }

    pub fn put_u24(&mut self, v: u32, order: ByteOrder) -> &mut Self {
        let b = match order {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        };
        match order {
            ByteOrder::Little => self.buf.extend_from_slice(&b[0..3]),
            ByteOrder::Big => self.buf.extend_from_slice(&b[1..4]),
        }
        self
    }

    pub fn put_u32(&mut self, v: u32, order: ByteOrder) -> &mut Self {
        self.buf.extend_from_slice(&match order {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        });
        self
    }

    pub fn put_u64(&mut self, v: u64, order: ByteOrder) -> &mut Self {
        self.buf.extend_from_slice(&match order {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        });
        self
    }

    pub fn put_i8(&mut self, v: i8) -> &mut Self {
        self.put_u8(v as u8)
    }

    pub fn put_slice(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Writes a UUID in the given wire width (2, 4, or 16 bytes), truncating
    /// a 128-bit UUID down to its Bluetooth-base-relative short form when
    /// `width` is 2 or 4.
    pub fn put_uuid(&mut self, uuid: &Uuid, width: usize) -> &mut Self {
        let bytes = uuid.as_bluetooth_bytes();
        let mut le: Vec<u8> = bytes.to_vec();
        le.reverse();
        debug_assert_eq!(le.len(), width);
        self.put_slice(&le)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_integers() {
        let mut w = ByteWriter::new();
        w.put_u8(0xAB).put_u16(0x1234, ByteOrder::Little).put_u32(0xdead_beef, ByteOrder::Little);
        let bytes = w.into_bytes();
        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), 0xAB);
        assert_eq!(r.get_u16(ByteOrder::Little).unwrap(), 0x1234);
        assert_eq!(r.get_u32(ByteOrder::Little).unwrap(), 0xdead_beef);
        assert!(r.is_empty());
    }

    #[test]
    fn truncated_read_is_an_error_not_a_panic() {
        let bytes = [0x01u8];
        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.get_u16(ByteOrder::Little), Err(CodecError));
    }

    #[test]
    fn uuid_round_trips_at_each_width() {
        let uuid16 = crate::btuuid::services::GENERIC_ACCESS;
        let mut w = ByteWriter::new();
        w.put_uuid(&uuid16, 2);
        let bytes = w.into_bytes();
        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.get_uuid(2).unwrap(), uuid16);

        let uuid128 = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        let mut w = ByteWriter::new();
        w.put_uuid(&uuid128, 16);
        let bytes = w.into_bytes();
        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.get_uuid(16).unwrap(), uuid128);
    }
}
