use crate::config::ProbeType;
use crate::constants::ICMP_HEADER_SIZE;
use crate::types::{PacketSize, Sequence};

/// The ICMP `Echo Request` type.
const ECHO_REQUEST_V4: u8 = 8;

/// The ICMPv6 `Echo Request` type.
const ECHO_REQUEST_V6: u8 = 128;

/// Build the bytes of a probe packet.
///
/// For ICMP probes the packet starts with an 8 byte echo header carrying the
/// engine identifier and the probe sequence in network order. The checksum is
/// left at zero as the kernel fills it in for datagram ICMP sockets. For UDP
/// probes the packet is all payload.
///
/// The payload is filled by repeating `pattern`, truncating the final chunk;
/// an empty pattern leaves the payload zeroed.
pub(crate) fn build_probe_packet(
    probe_type: ProbeType,
    is_ipv4: bool,
    ident: u16,
    sequence: Sequence,
    size: PacketSize,
    pattern: &[u8],
) -> Vec<u8> {
    let size = usize::from(size.0);
    match probe_type {
        ProbeType::Icmp => {
            let mut packet = vec![0_u8; size.max(ICMP_HEADER_SIZE)];
            packet[0] = if is_ipv4 {
                ECHO_REQUEST_V4
            } else {
                ECHO_REQUEST_V6
            };
            packet[4..6].copy_from_slice(&ident.to_be_bytes());
            packet[6..8].copy_from_slice(&sequence.0.to_be_bytes());
            fill_pattern(&mut packet[ICMP_HEADER_SIZE..], pattern);
            packet
        }
        ProbeType::Udp => {
            let mut packet = vec![0_u8; size];
            fill_pattern(&mut packet, pattern);
            packet
        }
    }
}

fn fill_pattern(payload: &mut [u8], pattern: &[u8]) {
    if pattern.is_empty() {
        return;
    }
    for chunk in payload.chunks_mut(pattern.len()) {
        chunk.copy_from_slice(&pattern[..chunk.len()]);
    }
}
