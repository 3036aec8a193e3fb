//! HCI/MGMT transport (spec §4.3): the controller control socket, its
//! reader thread, bounded reply ring, and listener fan-out.

pub mod raw;
pub mod reply_ring;
pub mod transport;

pub use raw::RawHciChannel;
pub use reply_ring::ReplyRing;
pub use transport::{HciSocket, MgmtSocket, Transport};
