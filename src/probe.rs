use crate::config::{ProbeRequest, ProbeType};
use crate::constants::{IPV4_OVERHEAD, IPV6_OVERHEAD, UDP_OVERHEAD};
use crate::net::socket::ErrQueueEvent;
use crate::types::{ProbeId, Sequence, TimeToLive};
use nix::errno::Errno;
use std::fmt::{Display, Formatter};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// The state of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// The probe has been sent and no outcome has been observed yet.
    Waiting,
    /// A reply datagram was received.
    Success,
    /// No outcome was observed within the probe timeout.
    Timeout,
    /// An ICMP error was delivered via the socket error queue.
    Error,
    /// The probe failed locally before an outcome could be observed.
    FatalError,
}

impl Display for ProbeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Success => write!(f, "success"),
            Self::Timeout => write!(f, "timeout"),
            Self::Error => write!(f, "error"),
            Self::FatalError => write!(f, "fatal error"),
        }
    }
}

/// An in-flight probe.
///
/// Owned by the probe table for the lifetime of the probe and consumed into
/// a [`ProbeReport`] when the outcome is delivered.
#[derive(Debug, Clone)]
pub(crate) struct ProbeRecord {
    pub id: ProbeId,
    pub sequence: Sequence,
    pub remote: IpAddr,
    pub offender: Option<IpAddr>,
    pub probe_type: ProbeType,
    pub ttl: TimeToLive,
    pub timeout: Duration,
    pub overhead: usize,
    pub packet: Vec<u8>,
    pub reply: Vec<u8>,
    pub reply_ttl: Option<u8>,
    pub sent_at: Instant,
    pub received_at: Option<Instant>,
    pub err_no: u32,
    pub err_code: u8,
    pub err_origin: u8,
    pub err_info: u32,
    pub status: ProbeStatus,
    pub error_msg: Option<String>,
}

impl ProbeRecord {
    pub fn new(request: &ProbeRequest, remote: IpAddr) -> Self {
        Self {
            id: request.id,
            sequence: request.sequence,
            remote,
            offender: None,
            probe_type: request.probe_type,
            ttl: request.ttl,
            timeout: request.timeout,
            overhead: overhead(request.probe_type, remote),
            packet: Vec::new(),
            reply: Vec::new(),
            reply_ttl: None,
            sent_at: Instant::now(),
            received_at: None,
            err_no: 0,
            err_code: 0,
            err_origin: 0,
            err_info: 0,
            status: ProbeStatus::Waiting,
            error_msg: None,
        }
    }

    /// Stamp the send timestamp, from which the deadline is measured.
    pub fn stamp_sent(&mut self) {
        self.sent_at = Instant::now();
    }

    /// Record an extended error delivered via the socket error queue.
    pub fn record_error(&mut self, event: &ErrQueueEvent) {
        self.err_no = event.errno;
        self.err_code = event.code;
        self.err_origin = event.origin;
        self.err_info = event.info;
        self.offender = event.offender;
        if event.hop_limit.is_some() {
            self.reply_ttl = event.hop_limit;
        }
        self.received_at = Some(Instant::now());
        self.status = ProbeStatus::Error;
    }

    /// Record a received reply datagram.
    pub fn record_reply(&mut self, reply: &[u8], hop_limit: Option<u8>) {
        self.reply = reply.to_vec();
        if hop_limit.is_some() {
            self.reply_ttl = hop_limit;
        }
        self.received_at = Some(Instant::now());
        self.status = ProbeStatus::Success;
    }

    /// Mark the probe as failed locally.
    pub fn fail(&mut self, message: String) {
        self.error_msg = Some(message);
        self.status = ProbeStatus::FatalError;
    }

    fn rtt(&self) -> Duration {
        self.received_at
            .map(|received| received.saturating_duration_since(self.sent_at))
            .unwrap_or_default()
    }

    /// Consume the record into the report delivered to the caller.
    pub fn into_report(self) -> (ProbeId, ProbeReport) {
        let rtt = self.rtt();
        let sent_size = self.packet.len();
        let report = match self.status {
            ProbeStatus::Success => ProbeReport::Success {
                sequence: self.sequence,
                remote: self.remote,
                sent_size,
                overhead: self.overhead,
                rtt,
                reply_ttl: self.reply_ttl,
                reply: self.reply,
            },
            ProbeStatus::Timeout => ProbeReport::Timeout {
                sequence: self.sequence,
                remote: self.remote,
                sent_size,
                overhead: self.overhead,
            },
            ProbeStatus::Error => match Errno::from_raw(self.err_no as i32) {
                Errno::ECONNREFUSED => ProbeReport::ConnectionRefused {
                    sequence: self.sequence,
                    remote: self.remote,
                    sent_size,
                    overhead: self.overhead,
                    offender: self.offender,
                    rtt,
                },
                Errno::EHOSTUNREACH => ProbeReport::HostUnreachable {
                    sequence: self.sequence,
                    remote: self.remote,
                    sent_size,
                    overhead: self.overhead,
                    offender: self.offender,
                    rtt,
                },
                Errno::ENETUNREACH => ProbeReport::NetUnreachable {
                    sequence: self.sequence,
                    remote: self.remote,
                    sent_size,
                    overhead: self.overhead,
                    offender: self.offender,
                    rtt,
                },
                _ => ProbeReport::NetError {
                    sequence: self.sequence,
                    remote: self.remote,
                    sent_size,
                    overhead: self.overhead,
                    offender: self.offender,
                    errno: self.err_no,
                    code: self.err_code,
                    origin: self.err_origin,
                    info: self.err_info,
                },
            },
            ProbeStatus::FatalError => ProbeReport::Fatal {
                sequence: self.sequence,
                remote: self.remote,
                sent_size,
                overhead: self.overhead,
                message: self.error_msg.unwrap_or_default(),
            },
            ProbeStatus::Waiting => unreachable!("waiting probe cannot be reported"),
        };
        (self.id, report)
    }
}

/// The fate of a probe, delivered once per dispatched probe.
///
/// `sent_size` is the number of bytes the engine wrote; `overhead` is the
/// fixed byte count of the layers the engine did not author (the IP header,
/// plus the UDP header for UDP probes), so `sent_size + overhead` is the
/// on-wire packet size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeReport {
    /// A reply datagram was received.
    Success {
        sequence: Sequence,
        remote: IpAddr,
        sent_size: usize,
        overhead: usize,
        rtt: Duration,
        reply_ttl: Option<u8>,
        reply: Vec<u8>,
    },
    /// No outcome was observed within the probe timeout.
    Timeout {
        sequence: Sequence,
        remote: IpAddr,
        sent_size: usize,
        overhead: usize,
    },
    /// The destination refused the probe (`ECONNREFUSED`).
    ConnectionRefused {
        sequence: Sequence,
        remote: IpAddr,
        sent_size: usize,
        overhead: usize,
        offender: Option<IpAddr>,
        rtt: Duration,
    },
    /// The host was unreachable (`EHOSTUNREACH`).
    HostUnreachable {
        sequence: Sequence,
        remote: IpAddr,
        sent_size: usize,
        overhead: usize,
        offender: Option<IpAddr>,
        rtt: Duration,
    },
    /// The network was unreachable (`ENETUNREACH`).
    NetUnreachable {
        sequence: Sequence,
        remote: IpAddr,
        sent_size: usize,
        overhead: usize,
        offender: Option<IpAddr>,
        rtt: Duration,
    },
    /// Some other ICMP error was delivered via the error queue.
    NetError {
        sequence: Sequence,
        remote: IpAddr,
        sent_size: usize,
        overhead: usize,
        offender: Option<IpAddr>,
        errno: u32,
        code: u8,
        origin: u8,
        info: u32,
    },
    /// The probe failed locally before any outcome could be observed.
    Fatal {
        sequence: Sequence,
        remote: IpAddr,
        sent_size: usize,
        overhead: usize,
        message: String,
    },
}

/// The byte count of the layers the engine does not author.
pub(crate) fn overhead(probe_type: ProbeType, remote: IpAddr) -> usize {
    let ip = if remote.is_ipv4() {
        IPV4_OVERHEAD
    } else {
        IPV6_OVERHEAD
    };
    let transport = match probe_type {
        ProbeType::Icmp => 0,
        ProbeType::Udp => UDP_OVERHEAD,
    };
    ip + transport
}
