//! Raw Linux Bluetooth socket primitives: `AF_BLUETOOTH` address families,
//! `sockaddr_hci`/`sockaddr_l2` layouts, and the handful of `setsockopt`
//! constants the transport and L2CAP layers need (spec §6 "socket
//! boundary").
//!
//! These mirror the kernel's `<bluetooth/{bluetooth,hci,l2cap}.h>` headers.
//! Grounded in the excerpted `bluer::sys`/`bluer::l2cap` constants kept in
//! the example pack (`examples/other_examples/*nxzr-legacy*sock-sys.rs.rs`);
//! reproduced directly here rather than depending on `bluer` itself, since
//! this crate owns the socket instead of delegating to a daemon.

use std::io;
use std::os::unix::io::RawFd;

use libc::{sa_family_t, c_ushort};

use crate::address::{Address, AddressType};

pub const AF_BLUETOOTH: i32 = 31;
pub const BTPROTO_HCI: i32 = 1;
pub const BTPROTO_L2CAP: i32 = 0;

pub const SOL_HCI: i32 = 0;
pub const HCI_FILTER: i32 = 2;
pub const HCI_DEV_NONE: u16 = 0xffff;

pub const SOL_BLUETOOTH: i32 = 274;
pub const BT_SECURITY: i32 = 4;
pub const BT_SECURITY_SDP: u8 = 0;
pub const BT_SECURITY_LOW: u8 = 1;
pub const BT_SECURITY_MEDIUM: u8 = 2;
pub const BT_SECURITY_HIGH: u8 = 3;
pub const BT_SECURITY_FIPS: u8 = 4;

/// Well-known L2CAP fixed channel IDs (spec GLOSSARY "CID").
pub const CID_ATT: u16 = 0x0004;
pub const CID_SMP: u16 = 0x0006;

/// Dynamic PSM ranges, Bluetooth Core Spec Vol 3, Part A, §4.2.
pub const PSM_BR_EDR_DYN_START: u16 = 0x1001;
pub const PSM_LE_DYN_START: u16 = 0x0080;
pub const PSM_LE_MAX: u16 = 0x00ff;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct sockaddr_hci {
    pub hci_family: sa_family_t,
    pub hci_dev: u16,
    pub hci_channel: u16,
}

/// Channel used by the MGMT control socket rather than a raw per-device HCI channel.
pub const HCI_CHANNEL_CONTROL: u16 = 3;
pub const HCI_CHANNEL_RAW: u16 = 0;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct hci_filter {
    pub type_mask: u32,
    pub event_mask: [u32; 2],
    pub opcode: u16,
}

#[repr(packed)]
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct bdaddr_t {
    pub b: [u8; 6],
}

impl From<Address> for bdaddr_t {
    fn from(a: Address) -> Self {
        let mut b = a.octets();
        b.reverse();
        bdaddr_t { b }
    }
}

impl From<bdaddr_t> for Address {
    fn from(b: bdaddr_t) -> Self {
        let mut octets = b.b;
        octets.reverse();
        Address::new(octets)
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct sockaddr_l2 {
    pub l2_family: sa_family_t,
    pub l2_psm: c_ushort,
    pub l2_bdaddr: bdaddr_t,
    pub l2_cid: c_ushort,
    pub l2_bdaddr_type: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct bt_security {
    pub level: u8,
    pub key_size: u8,
}

pub fn address_type_wire(t: AddressType) -> u8 {
    match t {
        AddressType::BrEdr => 0,
        AddressType::LePublic => 1,
        AddressType::LeRandom => 2,
        AddressType::Undefined => 0,
    }
}

/// Security level requested on an L2CAP socket post-connect (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecurityLevel {
    Sdp,
    Low,
    Medium,
    High,
    Fips,
}

impl SecurityLevel {
    fn wire(self) -> u8 {
        match self {
            SecurityLevel::Sdp => BT_SECURITY_SDP,
            SecurityLevel::Low => BT_SECURITY_LOW,
            SecurityLevel::Medium => BT_SECURITY_MEDIUM,
            SecurityLevel::High => BT_SECURITY_HIGH,
            SecurityLevel::Fips => BT_SECURITY_FIPS,
        }
    }
}

/// Sets the `BT_SECURITY` socket option on `fd`. Must be called strictly
/// after `connect`/`accept` completes (spec §4.4 "set post-connect").
pub fn set_security_level(fd: RawFd, level: SecurityLevel) -> io::Result<()> {
    let opt = bt_security { level: level.wire(), key_size: 0 };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            SOL_BLUETOOTH,
            BT_SECURITY,
            &opt as *const bt_security as *const libc::c_void,
            std::mem::size_of::<bt_security>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Wraps a raw file descriptor, closing it on drop.
#[derive(Debug)]
pub struct OwnedFd(RawFd);

impl OwnedFd {
    pub fn raw(&self) -> RawFd {
        self.0
    }

    /// Takes ownership of an already-open descriptor.
    ///
    /// # Safety
    /// `fd` must be a valid, open, and otherwise-unowned file descriptor.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        OwnedFd(fd)
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Opens a raw `AF_BLUETOOTH`/`BTPROTO_HCI` socket bound to the MGMT control
/// channel (spec §4.3 "socket boundary").
pub fn open_mgmt_socket() -> io::Result<OwnedFd> {
    let fd = check(unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_RAW, BTPROTO_HCI) })?;
    let owned = unsafe { OwnedFd::from_raw(fd) };
    let addr = sockaddr_hci {
        hci_family: AF_BLUETOOTH as sa_family_t,
        hci_dev: HCI_DEV_NONE,
        hci_channel: HCI_CHANNEL_CONTROL,
    };
    let ret = unsafe {
        libc::bind(
            owned.raw(),
            &addr as *const sockaddr_hci as *const libc::sockaddr,
            std::mem::size_of::<sockaddr_hci>() as libc::socklen_t,
        )
    };
    check(ret)?;
    Ok(owned)
}

/// Opens a raw `AF_BLUETOOTH`/`BTPROTO_HCI` socket bound to a specific
/// controller's raw HCI channel.
pub fn open_hci_raw_socket(dev: u16) -> io::Result<OwnedFd> {
    let fd = check(unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_RAW, BTPROTO_HCI) })?;
    let owned = unsafe { OwnedFd::from_raw(fd) };
    let addr = sockaddr_hci {
        hci_family: AF_BLUETOOTH as sa_family_t,
        hci_dev: dev,
        hci_channel: HCI_CHANNEL_RAW,
    };
    let ret = unsafe {
        libc::bind(
            owned.raw(),
            &addr as *const sockaddr_hci as *const libc::sockaddr,
            std::mem::size_of::<sockaddr_hci>() as libc::socklen_t,
        )
    };
    check(ret)?;
    Ok(owned)
}

/// Opens a connection-oriented `SOCK_SEQPACKET` L2CAP socket, not yet bound
/// or connected (spec §4.4).
pub fn open_l2cap_socket() -> io::Result<OwnedFd> {
    let fd = check(unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_SEQPACKET, BTPROTO_L2CAP) })?;
    Ok(unsafe { OwnedFd::from_raw(fd) })
}

pub fn l2cap_bind_any(fd: RawFd, addr_type: AddressType) -> io::Result<()> {
    let saddr = sockaddr_l2 {
        l2_family: AF_BLUETOOTH as sa_family_t,
        l2_psm: 0,
        l2_bdaddr: bdaddr_t::default(),
        l2_cid: 0,
        l2_bdaddr_type: address_type_wire(addr_type),
    };
    check(unsafe {
        libc::bind(
            fd,
            &saddr as *const sockaddr_l2 as *const libc::sockaddr,
            std::mem::size_of::<sockaddr_l2>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub fn l2cap_connect(fd: RawFd, address: Address, address_type: AddressType, psm: u16) -> io::Result<()> {
    let saddr = sockaddr_l2 {
        l2_family: AF_BLUETOOTH as sa_family_t,
        l2_psm: psm.to_le(),
        l2_bdaddr: address.into(),
        l2_cid: 0,
        l2_bdaddr_type: address_type_wire(address_type),
    };
    check(unsafe {
        libc::connect(
            fd,
            &saddr as *const sockaddr_l2 as *const libc::sockaddr,
            std::mem::size_of::<sockaddr_l2>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub fn l2cap_listen(fd: RawFd, addr_type: AddressType, psm: u16, backlog: i32) -> io::Result<()> {
    let saddr = sockaddr_l2 {
        l2_family: AF_BLUETOOTH as sa_family_t,
        l2_psm: psm.to_le(),
        l2_bdaddr: bdaddr_t::default(),
        l2_cid: 0,
        l2_bdaddr_type: address_type_wire(addr_type),
    };
    check(unsafe {
        libc::bind(
            fd,
            &saddr as *const sockaddr_l2 as *const libc::sockaddr,
            std::mem::size_of::<sockaddr_l2>() as libc::socklen_t,
        )
    })?;
    check(unsafe { libc::listen(fd, backlog) })?;
    Ok(())
}

/// Accepts one pending connection on a listening L2CAP socket, blocking.
pub fn l2cap_accept(fd: RawFd) -> io::Result<(OwnedFd, Address, AddressType)> {
    let mut saddr: sockaddr_l2 = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<sockaddr_l2>() as libc::socklen_t;
    let client = check(unsafe {
        libc::accept(
            fd,
            &mut saddr as *mut sockaddr_l2 as *mut libc::sockaddr,
            &mut len,
        )
    })?;
    let address_type = match saddr.l2_bdaddr_type {
        0 => AddressType::BrEdr,
        1 => AddressType::LePublic,
        2 => AddressType::LeRandom,
        _ => AddressType::Undefined,
    };
    Ok((unsafe { OwnedFd::from_raw(client) }, saddr.l2_bdaddr.into(), address_type))
}

/// Polls `fd` for readability with a timeout, returning `Ok(false)` on
/// timeout and `Ok(true)` if data (or HUP/error, surfaced on the next read)
/// is ready. Used by the interruptible-read pattern shared by the HCI
/// transport and L2CAP channel reader threads (spec §5).
pub fn poll_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ret = check(unsafe { libc::poll(&mut pfd as *mut libc::pollfd, 1, timeout_ms) })?;
    Ok(ret > 0)
}

pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = check(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    check(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) })?;
    Ok(())
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bdaddr_round_trips_through_wire_order() {
        let addr: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let wire: bdaddr_t = addr.into();
        assert_eq!(wire.b, [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
        let back: Address = wire.into();
        assert_eq!(back, addr);
    }
}
