//! Raw HCI event channel (spec §4.3 "connection-handle backfill"): a
//! per-controller `AF_BLUETOOTH`/`BTPROTO_HCI` raw socket, read only for the
//! `(Enhanced)ConnectionComplete` LE Meta subevents. The MGMT channel's own
//! `DeviceConnected` event carries no HCI connection handle at all (it's an
//! address-only notification in the real kernel API), so this is the only
//! source for the value [`crate::device::Device::connection_handle`] needs
//! (spec §8 P1: "connected iff non-zero handle").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Error, ErrorKind};
use crate::pdu::hci::HciEvent;
use crate::sock;
use crate::util::ListenerList;

/// The H4 packet-type prefix a raw HCI socket delivers ahead of the event
/// itself (Core Spec Vol 4, Part A, §2).
const HCI_EVENT_PKT: u8 = 0x04;

pub struct RawHciChannel {
    fd: sock::OwnedFd,
    is_open: AtomicBool,
    listeners: ListenerList<Arc<dyn Fn(&HciEvent) + Send + Sync>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RawHciChannel {
    /// Opens `index`'s raw HCI channel and starts its reader thread.
    /// Fails (most commonly `EPERM`, since this requires `CAP_NET_RAW`) if
    /// the raw channel can't be opened; the caller degrades to a
    /// synthesized connection handle in that case rather than treating it
    /// as fatal.
    pub fn open(index: u16, poll_timeout: Duration) -> Result<Arc<Self>, Error> {
        let fd = sock::open_hci_raw_socket(index).map_err(|e| Error::new(ErrorKind::Io(e.to_string()), "opening raw HCI socket"))?;
        Ok(Self::with_fd(fd, poll_timeout))
    }

    fn with_fd(fd: sock::OwnedFd, poll_timeout: Duration) -> Arc<Self> {
        let channel = Arc::new(RawHciChannel {
            fd,
            is_open: AtomicBool::new(true),
            listeners: ListenerList::new(),
            reader: Mutex::new(None),
        });
        let reader_channel = channel.clone();
        let handle = std::thread::Builder::new()
            .name("btstack-hci-raw-reader".into())
            .spawn(move || reader_channel.reader_loop(poll_timeout))
            .expect("spawning raw HCI reader thread");
        *channel.reader.lock().unwrap() = Some(handle);
        channel
    }

    pub fn add_listener(&self, callback: impl Fn(&HciEvent) + Send + Sync + 'static) {
        self.listeners.push(Arc::new(callback));
    }

    fn reader_loop(self: Arc<Self>, poll_timeout: Duration) {
        let mut buf = vec![0u8; 260];
        loop {
            if !self.is_open.load(Ordering::Acquire) {
                break;
            }
            match sock::poll_readable(self.fd.raw(), poll_timeout.as_millis() as i32) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(_) => break,
            }
            match sock::read(self.fd.raw(), &mut buf) {
                Ok(n) if n > 0 => {
                    let body = if buf[0] == HCI_EVENT_PKT { &buf[1..n] } else { &buf[..n] };
                    let event = HciEvent::parse(body);
                    for listener in self.listeners.snapshot().iter() {
                        listener(&event);
                    }
                }
                _ => break,
            }
        }
    }

    pub fn close(&self) {
        self.is_open.store(false, Ordering::Release);
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RawHciChannel {
    fn drop(&mut self) {
        self.close();
    }
}
