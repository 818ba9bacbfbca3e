use crate::types::{PacketSize, Port, ProbeId, Sequence, TimeToLive};
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Default values for configuration.
pub mod defaults {
    use std::time::Duration;

    /// The default value for `timeout`.
    pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1000);

    /// The default value for `size`.
    pub const DEFAULT_PACKET_SIZE: u16 = 56;
}

/// The probing protocol.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProbeType {
    /// Internet Control Message Protocol
    Icmp,
    /// User Datagram Protocol
    Udp,
}

impl Display for ProbeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Icmp => write!(f, "icmp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// A single probe to be dispatched by [`crate::Prober::send_probe`].
///
/// The engine does not schedule or retry probes; every request maps to
/// exactly one outbound datagram and exactly one report.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    /// Opaque correlator echoed back with the report.
    pub id: ProbeId,
    /// The probing protocol.
    pub probe_type: ProbeType,
    /// The destination port (UDP only, ignored for ICMP).
    pub port: Port,
    /// The sequence number carried in the ICMP echo header.
    pub sequence: Sequence,
    /// The outbound hop limit (zero leaves the kernel default).
    pub ttl: TimeToLive,
    /// How long to wait for the fate of the probe.
    pub timeout: Duration,
    /// The size of the probe packet, excluding layers the engine does not
    /// author. For ICMP this includes the 8 byte echo header.
    pub size: PacketSize,
    /// Configure the socket for path-MTU probing, making oversized sends
    /// fail softly via the error queue.
    pub detect_mtu: bool,
    /// Pattern repeated over the probe payload.
    pub pattern: Vec<u8>,
}

impl Default for ProbeRequest {
    fn default() -> Self {
        Self {
            id: ProbeId::default(),
            probe_type: ProbeType::Icmp,
            port: Port::default(),
            sequence: Sequence::default(),
            ttl: TimeToLive::default(),
            timeout: defaults::DEFAULT_PROBE_TIMEOUT,
            size: PacketSize(defaults::DEFAULT_PACKET_SIZE),
            detect_mtu: false,
            pattern: Vec::new(),
        }
    }
}
