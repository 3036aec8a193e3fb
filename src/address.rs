//! 48-bit device addresses and their LE sub-kinds (spec §3 "Address").

use std::fmt;
use std::str::FromStr;

/// The coarse address-type tag carried alongside every [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressType {
    /// Public BR/EDR address.
    BrEdr,
    /// Public LE address.
    LePublic,
    /// Random LE address; see [`RandomAddressKind`] for the sub-kind.
    LeRandom,
    /// Address type could not be determined.
    Undefined,
}

/// The sub-kind of a random LE address, derived from its two most
/// significant bits (spec §3, GLOSSARY "Random/Resolvable/Static address").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RandomAddressKind {
    /// `11` — static random address, stable across power cycles in well-behaved stacks.
    Static,
    /// `01` — resolvable private address, resolved against an IRK.
    ResolvablePrivate,
    /// `00` — non-resolvable private address.
    NonResolvablePrivate,
    /// Reserved top-bit pattern (`10`); not a valid random address.
    Unresolved,
}

/// A 48-bit Bluetooth device address, most-significant octet first in its
/// string form (`AA:BB:CC:DD:EE:FF`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Address([u8; 6]);

/// `(address, address type)` is the equality key for a remote device (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressAndType {
    pub address: Address,
    pub address_type: AddressType,
}

impl Address {
    /// Builds an address from six octets, most-significant first.
    pub const fn new(octets: [u8; 6]) -> Self {
        Address(octets)
    }

    pub const fn any() -> Self {
        Address([0; 6])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// The random-address sub-kind, derived from the two MSBs of the first octet.
    pub fn random_kind(&self) -> RandomAddressKind {
        match self.0[0] >> 6 {
            0b11 => RandomAddressKind::Static,
            0b01 => RandomAddressKind::ResolvablePrivate,
            0b00 => RandomAddressKind::NonResolvablePrivate,
            _ => RandomAddressKind::Unresolved,
        }
    }

    /// Index of the first byte-subsequence match of `needle` against this
    /// address, or `-1` if absent (spec §8 scenario 1).
    ///
    /// `needle` is a colon-separated partial address such as `"C0:10"` or a
    /// bare hex pair such as `"10"`; a single leading or trailing `:` is
    /// stripped before splitting. The match is performed against the address
    /// ordered least-significant-octet first, and the returned index is in
    /// that same order (the index of the octet printed rightmost in the
    /// address's string form is `0`).
    pub fn index_of(&self, needle: &str) -> i32 {
        let sub = parse_address_sub(needle);
        if sub.is_empty() {
            return 0;
        }
        let mut haystack = self.0;
        haystack.reverse();
        let mut needle_bytes = sub;
        needle_bytes.reverse();
        if needle_bytes.len() > haystack.len() {
            return -1;
        }
        for start in 0..=(haystack.len() - needle_bytes.len()) {
            if haystack[start..start + needle_bytes.len()] == needle_bytes[..] {
                return start as i32;
            }
        }
        -1
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.index_of(needle) >= 0
    }
}

/// Parses a (possibly partial) colon-separated hex address fragment into its
/// constituent octets, in the order they appear in the string. A single
/// leading or trailing `:` is stripped first so callers can pass fragments
/// like `":10:22"` or `"10:22:"` without special-casing the boundary.
fn parse_address_sub(s: &str) -> Vec<u8> {
    let s = s.strip_prefix(':').unwrap_or(s);
    let s = s.strip_suffix(':').unwrap_or(s);
    s.split(':')
        .filter(|part| !part.is_empty())
        .filter_map(|part| u8::from_str_radix(part, 16).ok())
        .collect()
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressParseError;

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid Bluetooth address string")
    }
}

impl std::error::Error for AddressParseError {}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or(AddressParseError)?;
            *octet = u8::from_str_radix(part, 16).map_err(|_| AddressParseError)?;
        }
        if parts.next().is_some() {
            return Err(AddressParseError);
        }
        Ok(Address(octets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> Address {
        "C0:10:22:A0:10:00".parse().unwrap()
    }

    #[test]
    fn substring_lookup_matches_scenario() {
        let a = mac();
        assert_eq!(a.index_of("C0"), 5);
        assert_eq!(a.index_of("C0:10"), 4);
        assert_eq!(a.index_of(":10:22"), 3);
        assert_eq!(a.index_of("10:22:"), 3);
        assert_eq!(a.index_of("00:10"), -1);
        assert_eq!(a.index_of(":"), 0);
        assert!(a.contains(":"));
    }

    #[test]
    fn parse_display_round_trip_is_idempotent() {
        for s in [
            "00:00:00:00:00:00",
            "FF:FF:FF:FF:FF:FF",
            "AA:BB:CC:DD:EE:01",
            "C0:10:22:A0:10:00",
        ] {
            let parsed: Address = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn random_kind_from_top_bits() {
        assert_eq!(Address::new([0xC0, 0, 0, 0, 0, 0]).random_kind(), RandomAddressKind::Static);
        assert_eq!(
            Address::new([0x40, 0, 0, 0, 0, 0]).random_kind(),
            RandomAddressKind::ResolvablePrivate
        );
        assert_eq!(
            Address::new([0x00, 0, 0, 0, 0, 0]).random_kind(),
            RandomAddressKind::NonResolvablePrivate
        );
        assert_eq!(Address::new([0x80, 0, 0, 0, 0, 0]).random_kind(), RandomAddressKind::Unresolved);
    }

    #[test]
    fn malformed_strings_are_rejected() {
        assert!("not-an-address".parse::<Address>().is_err());
        assert!("AA:BB:CC:DD:EE".parse::<Address>().is_err());
        assert!("AA:BB:CC:DD:EE:FF:00".parse::<Address>().is_err());
    }
}
