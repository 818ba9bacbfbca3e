use std::time::Duration;

/// The size of an ICMP echo header.
pub(crate) const ICMP_HEADER_SIZE: usize = 8;

/// The size of the buffer replies are received into.
pub(crate) const INCOMING_BUFFER_SIZE: usize = 2048;

/// The number of bytes of an IPv4 header.
pub(crate) const IPV4_OVERHEAD: usize = 20;

/// The number of bytes of an IPv6 header.
pub(crate) const IPV6_OVERHEAD: usize = 40;

/// The number of bytes of a UDP header.
pub(crate) const UDP_OVERHEAD: usize = 8;

/// The send timeout applied to every probe socket.
pub(crate) const SEND_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long `start` waits for the worker to signal readiness.
pub(crate) const START_TIMEOUT: Duration = Duration::from_secs(10);

/// The maximum number of readiness events processed per wake.
pub(crate) const EVENT_CAPACITY: usize = 32;

/// The traffic class applied to every probe socket.
pub(crate) const LOWDELAY_TOS: u32 = nix::libc::IPTOS_LOWDELAY as u32;
