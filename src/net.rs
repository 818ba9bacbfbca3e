/// Probe packet construction.
pub(crate) mod packet;

/// Platform specific network code.
mod platform;

/// A per-probe network socket.
pub(crate) mod socket;

/// The platform specific socket and poller types.
pub(crate) use platform::{Poller, SocketImpl};
