//! The L2CAP connection-oriented transport (spec §4.4): a reliable,
//! security-level-aware socket wrapper with interruptible blocking I/O,
//! generalized from the synchronous-facade-over-socket pattern used by
//! `hci/transport.rs` to a channel that owns no reader thread of its
//! own — the GATT/SMP engine above it supplies that thread and calls
//! [`L2capChannel::recv`] in a loop.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::address::{Address, AddressType};
use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::sock::{self, SecurityLevel};

/// The OS socket boundary an `L2capChannel` is built against, abstracted so
/// the interrupt/timeout plumbing is testable without a real controller.
pub trait L2capSocket: Send + Sync {
    fn send(&self, buf: &[u8]) -> io::Result<usize>;
    /// Blocks up to `poll_timeout` for a frame; `Ok(None)` means the poll
    /// timed out with nothing to read (benign, not an error).
    fn recv(&self, buf: &mut [u8], poll_timeout: Duration) -> io::Result<Option<usize>>;
    /// Unblocks a thread currently parked inside `recv`, called from `close()`.
    fn interrupt(&self);
}

extern "C" fn noop_signal_handler(_: libc::c_int) {}

fn install_interrupt_handler() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = noop_signal_handler as usize;
        sa.sa_flags = 0; // no SA_RESTART: a pending poll/read returns EINTR.
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGUSR1, &sa, std::ptr::null_mut());
    });
}

/// An `L2capSocket` backed by a real `AF_BLUETOOTH`/`BTPROTO_L2CAP` socket.
pub struct RawL2capSocket {
    fd: sock::OwnedFd,
    reader_tid: Mutex<Option<libc::pthread_t>>,
}

impl RawL2capSocket {
    pub fn raw(&self) -> RawFd {
        self.fd.raw()
    }
}

impl L2capSocket for RawL2capSocket {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        sock::write(self.fd.raw(), buf)
    }

    fn recv(&self, buf: &mut [u8], poll_timeout: Duration) -> io::Result<Option<usize>> {
        install_interrupt_handler();
        *self.reader_tid.lock().unwrap() = Some(unsafe { libc::pthread_self() });
        let ready = sock::poll_readable(self.fd.raw(), poll_timeout.as_millis() as i32);
        *self.reader_tid.lock().unwrap() = None;
        match ready {
            Ok(false) => Ok(None),
            Ok(true) => Ok(Some(sock::read(self.fd.raw(), buf)?)),
            Err(e) => Err(e),
        }
    }

    fn interrupt(&self) {
        if let Some(tid) = *self.reader_tid.lock().unwrap() {
            unsafe {
                libc::pthread_kill(tid, libc::SIGUSR1);
            }
        }
    }
}

/// A connection-oriented L2CAP client channel (spec §4.4 "Client channel").
pub struct L2capChannel {
    socket: std::sync::Arc<dyn L2capSocket>,
    is_open: AtomicBool,
    io_error: AtomicBool,
    poll_timeout: Duration,
}

impl L2capChannel {
    /// Opens, binds, and connects a real L2CAP socket to `peer:psm`,
    /// retrying on timeout up to `config.l2cap_connect_retries` extra
    /// attempts, then applies `security` strictly post-connect (spec §4.4:
    /// pre-connect security can deadlock the kernel SMP thread).
    pub fn connect(peer: Address, peer_type: AddressType, psm: u16, security: SecurityLevel, config: &Config) -> Result<Self, Error> {
        let attempts = config.l2cap_connect_retries + 1;
        let mut last_err = None;
        for attempt in 0..attempts {
            match Self::try_connect_once(peer, peer_type, psm, security) {
                Ok(channel) => return Ok(channel),
                Err(e) if e.kind == ErrorKind::Timeout && attempt + 1 < attempts => {
                    tracing::debug!(target: "btstack::l2cap", attempt, %peer, "connect timed out, retrying");
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| ErrorKind::Timeout.into()))
    }

    fn try_connect_once(peer: Address, peer_type: AddressType, psm: u16, security: SecurityLevel) -> Result<Self, Error> {
        let fd = sock::open_l2cap_socket().map_err(|e| Error::new(ErrorKind::Io(e.to_string()), "opening L2CAP socket"))?;
        sock::l2cap_bind_any(fd.raw(), AddressType::LePublic).map_err(|e| Error::new(ErrorKind::Io(e.to_string()), "binding L2CAP socket"))?;
        sock::l2cap_connect(fd.raw(), peer, peer_type, psm).map_err(|e| {
            if e.kind() == io::ErrorKind::TimedOut {
                Error::from(ErrorKind::Timeout)
            } else {
                Error::new(ErrorKind::Io(e.to_string()), "connecting L2CAP socket")
            }
        })?;
        sock::set_security_level(fd.raw(), security).map_err(|e| Error::new(ErrorKind::Io(e.to_string()), "setting BT_SECURITY"))?;
        Ok(Self::from_raw_fd(fd, Duration::from_secs(10)))
    }

    fn from_raw_fd(fd: sock::OwnedFd, poll_timeout: Duration) -> Self {
        let socket = RawL2capSocket {
            fd,
            reader_tid: Mutex::new(None),
        };
        Self::with_socket(std::sync::Arc::new(socket), poll_timeout)
    }

    /// Builds a channel over an arbitrary `L2capSocket`, for tests and for
    /// the server's `accept()`.
    pub fn with_socket(socket: std::sync::Arc<dyn L2capSocket>, poll_timeout: Duration) -> Self {
        L2capChannel {
            socket,
            is_open: AtomicBool::new(true),
            io_error: AtomicBool::new(false),
            poll_timeout,
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    pub fn io_error(&self) -> bool {
        self.io_error.load(Ordering::Acquire)
    }

    pub fn send(&self, buf: &[u8]) -> Result<(), Error> {
        if !self.is_open() {
            return Err(ErrorKind::NotConnected.into());
        }
        match self.socket.send(buf) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.mark_io_error();
                Err(Error::new(ErrorKind::Io(e.to_string()), "L2CAP write"))
            }
        }
    }

    /// Blocks up to the poll timeout for one frame (spec §4.4 "Interruptible
    /// I/O"). Returns a distinguished [`ErrorKind`] for not-open, a poll
    /// timeout, or an interrupted close — only a genuine I/O error sets
    /// [`Self::io_error`].
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if !self.is_open() {
            return Err(ErrorKind::NotConnected.into());
        }
        match self.socket.recv(buf, self.poll_timeout) {
            Ok(None) => Err(ErrorKind::Timeout.into()),
            Ok(Some(n)) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                if self.is_open() {
                    Err(ErrorKind::Timeout.into())
                } else {
                    Err(ErrorKind::OperationCancelled.into())
                }
            }
            Err(e) => {
                self.mark_io_error();
                Err(Error::new(ErrorKind::Io(e.to_string()), "L2CAP read"))
            }
        }
    }

    fn mark_io_error(&self) {
        self.io_error.store(true, Ordering::Release);
        self.is_open.store(false, Ordering::Release);
    }

    /// Idempotent. Unblocks any thread currently parked in `recv`.
    pub fn close(&self) {
        if self.is_open.swap(false, Ordering::AcqRel) {
            self.socket.interrupt();
        }
    }
}

impl Drop for L2capChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// A listening L2CAP socket (spec §4.4 "Server channel"): bind, listen,
/// accept in a loop across benign timeouts.
pub struct L2capServer {
    fd: sock::OwnedFd,
    poll_timeout: Duration,
}

impl L2capServer {
    pub fn bind(addr_type: AddressType, psm: u16, backlog: i32, poll_timeout: Duration) -> Result<Self, Error> {
        let fd = sock::open_l2cap_socket().map_err(|e| Error::new(ErrorKind::Io(e.to_string()), "opening L2CAP listen socket"))?;
        sock::l2cap_listen(fd.raw(), addr_type, psm, backlog).map_err(|e| Error::new(ErrorKind::Io(e.to_string()), "listening on L2CAP socket"))?;
        Ok(L2capServer { fd, poll_timeout })
    }

    /// Blocks until a peer connects, looping across benign interruptions,
    /// and returns an owned client channel wrapping the accepted socket.
    pub fn accept(&self) -> Result<(L2capChannel, Address, AddressType), Error> {
        loop {
            match sock::l2cap_accept(self.fd.raw()) {
                Ok((client_fd, address, address_type)) => {
                    let channel = L2capChannel::from_raw_fd(client_fd, self.poll_timeout);
                    return Ok((channel, address, address_type));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::new(ErrorKind::Io(e.to_string()), "accepting L2CAP connection")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    struct FakeSocket {
        inbox: Mutex<VecDeque<Vec<u8>>>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl L2capSocket for FakeSocket {
        fn send(&self, buf: &[u8]) -> io::Result<usize> {
            self.sent.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }

        fn recv(&self, buf: &mut [u8], _poll_timeout: Duration) -> io::Result<Option<usize>> {
            match self.inbox.lock().unwrap().pop_front() {
                Some(frame) => {
                    buf[..frame.len()].copy_from_slice(&frame);
                    Ok(Some(frame.len()))
                }
                None => Ok(None),
            }
        }

        fn interrupt(&self) {}
    }

    #[test]
    fn recv_times_out_when_inbox_empty() {
        let socket = Arc::new(FakeSocket {
            inbox: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        });
        let channel = L2capChannel::with_socket(socket, Duration::from_millis(5));
        let mut buf = [0u8; 32];
        assert_eq!(channel.recv(&mut buf).unwrap_err().kind, ErrorKind::Timeout);
    }

    #[test]
    fn recv_returns_queued_frame() {
        let socket = Arc::new(FakeSocket {
            inbox: Mutex::new(VecDeque::from([vec![1, 2, 3]])),
            sent: Mutex::new(Vec::new()),
        });
        let channel = L2capChannel::with_socket(socket, Duration::from_millis(5));
        let mut buf = [0u8; 32];
        let n = channel.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
    }

    #[test]
    fn closed_channel_refuses_send_and_recv() {
        let socket = Arc::new(FakeSocket {
            inbox: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        });
        let channel = L2capChannel::with_socket(socket, Duration::from_millis(5));
        channel.close();
        channel.close(); // idempotent
        assert!(!channel.is_open());
        assert_eq!(channel.send(&[1]).unwrap_err().kind, ErrorKind::NotConnected);
        let mut buf = [0u8; 8];
        assert_eq!(channel.recv(&mut buf).unwrap_err().kind, ErrorKind::NotConnected);
    }
}
