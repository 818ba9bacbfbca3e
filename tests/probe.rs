//! Loopback integration tests for the probe engine.
//!
//! The UDP paths run unprivileged: a datagram sent to a closed loopback port
//! produces an ICMP port unreachable via the socket error queue, and a
//! datagram sent to a bound-but-silent port produces nothing and times out.
//!
//! The ICMP paths require `net.ipv4.ping_group_range` to cover the test user
//! and are ignored by default.

use anyhow::Result;
use sonda::{
    Builder, PacketSize, Port, ProbeId, ProbeReport, ProbeRequest, ProbeType, Prober, Sequence,
};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

fn start_prober(target: &str) -> Result<(Prober, Receiver<(ProbeId, ProbeReport)>)> {
    let (mut prober, reports) = build_prober(target)?;
    prober.start()?;
    Ok((prober, reports))
}

fn build_prober(target: &str) -> Result<(Prober, Receiver<(ProbeId, ProbeReport)>)> {
    let (tx, rx) = mpsc::channel();
    let prober = Builder::new(target)
        .on_report(move |id, report| {
            let _ = tx.send((id, report));
        })
        .build()?;
    Ok((prober, rx))
}

/// A loopback UDP socket which receives probes and never replies.
fn silent_port() -> Result<(UdpSocket, u16)> {
    let socket = UdpSocket::bind("127.0.0.1:0")?;
    let port = socket.local_addr()?.port();
    Ok((socket, port))
}

/// A loopback port with nothing bound to it.
fn closed_port() -> Result<u16> {
    let socket = UdpSocket::bind("127.0.0.1:0")?;
    let port = socket.local_addr()?.port();
    drop(socket);
    Ok(port)
}

#[test]
fn test_udp_probe_times_out() -> Result<()> {
    let (_sink, port) = silent_port()?;
    let (mut prober, reports) = start_prober("127.0.0.1")?;
    let started = Instant::now();
    prober.send_probe(ProbeRequest {
        id: ProbeId(7),
        probe_type: ProbeType::Udp,
        port: Port(port),
        sequence: Sequence(3),
        timeout: Duration::from_millis(500),
        size: PacketSize(32),
        ..Default::default()
    })?;
    let (id, report) = reports.recv_timeout(Duration::from_secs(5))?;
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(id, ProbeId(7));
    match report {
        ProbeReport::Timeout {
            sequence,
            remote,
            sent_size,
            overhead,
        } => {
            assert_eq!(sequence, Sequence(3));
            assert_eq!(remote, IpAddr::V4(Ipv4Addr::LOCALHOST));
            assert_eq!(sent_size, 32);
            assert_eq!(overhead, 28);
        }
        other => panic!("unexpected report: {other:?}"),
    }
    prober.stop()?;
    assert_eq!(prober.queue_size(), 0);
    Ok(())
}

#[test]
fn test_udp_probe_to_closed_port_is_refused() -> Result<()> {
    let port = closed_port()?;
    let (mut prober, reports) = start_prober("127.0.0.1")?;
    prober.send_probe(ProbeRequest {
        id: ProbeId(11),
        probe_type: ProbeType::Udp,
        port: Port(port),
        sequence: Sequence(1),
        timeout: Duration::from_millis(2000),
        size: PacketSize(32),
        ..Default::default()
    })?;
    let (id, report) = reports.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(id, ProbeId(11));
    match report {
        ProbeReport::ConnectionRefused {
            sequence,
            remote,
            sent_size,
            overhead,
            offender,
            rtt,
        } => {
            assert_eq!(sequence, Sequence(1));
            assert_eq!(remote, IpAddr::V4(Ipv4Addr::LOCALHOST));
            assert_eq!(sent_size, 32);
            assert_eq!(overhead, 28);
            assert_eq!(offender, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
            assert!(rtt < Duration::from_secs(2));
        }
        other => panic!("unexpected report: {other:?}"),
    }
    prober.stop()?;
    Ok(())
}

#[test]
fn test_send_probe_before_start_fails_synchronously() -> Result<()> {
    let (prober, reports) = build_prober("127.0.0.1")?;
    let result = prober.send_probe(ProbeRequest {
        id: ProbeId(23),
        ..Default::default()
    });
    assert!(result.is_err());
    let (id, report) = reports.try_recv()?;
    assert_eq!(id, ProbeId(23));
    assert!(matches!(report, ProbeReport::Fatal { .. }));
    Ok(())
}

#[test]
fn test_stop_drains_in_flight_probes() -> Result<()> {
    let (_sink, port) = silent_port()?;
    let (mut prober, reports) = start_prober("127.0.0.1")?;
    let started = Instant::now();
    prober.send_probe(ProbeRequest {
        id: ProbeId(5),
        probe_type: ProbeType::Udp,
        port: Port(port),
        timeout: Duration::from_secs(30),
        size: PacketSize(16),
        ..Default::default()
    })?;
    assert_eq!(prober.queue_size(), 1);
    prober.stop()?;
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(prober.queue_size(), 0);
    let (id, report) = reports.try_recv()?;
    assert_eq!(id, ProbeId(5));
    assert!(matches!(report, ProbeReport::Timeout { .. }));
    Ok(())
}

#[test]
fn test_every_probe_is_reported_exactly_once() -> Result<()> {
    let (_sink, port) = silent_port()?;
    let (mut prober, reports) = start_prober("127.0.0.1")?;
    for id in 0..3_u64 {
        prober.send_probe(ProbeRequest {
            id: ProbeId(id),
            probe_type: ProbeType::Udp,
            port: Port(port),
            sequence: Sequence(id as u16),
            timeout: Duration::from_millis(200 + 100 * id),
            size: PacketSize(16),
            ..Default::default()
        })?;
    }
    let mut seen = Vec::new();
    for _ in 0..3 {
        let (id, report) = reports.recv_timeout(Duration::from_secs(5))?;
        assert!(matches!(report, ProbeReport::Timeout { .. }));
        seen.push(id.0);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);
    prober.stop()?;
    assert_eq!(prober.queue_size(), 0);
    assert!(reports.try_recv().is_err());
    Ok(())
}

#[test]
fn test_stopped_engine_rejects_probes() -> Result<()> {
    let (mut prober, reports) = start_prober("127.0.0.1")?;
    prober.stop()?;
    let result = prober.send_probe(ProbeRequest {
        id: ProbeId(99),
        ..Default::default()
    });
    assert!(result.is_err());
    let (id, report) = reports.try_recv()?;
    assert_eq!(id, ProbeId(99));
    assert!(matches!(report, ProbeReport::Fatal { .. }));
    Ok(())
}

#[test]
fn test_ident_is_stable() -> Result<()> {
    let (prober, _reports) = build_prober("127.0.0.1")?;
    let ident = prober.ident();
    assert_eq!(prober.ident(), ident);
    Ok(())
}

// Requires net.ipv4.ping_group_range to cover the test user.
#[test]
#[ignore]
fn test_icmp_echo_loopback() -> Result<()> {
    let (mut prober, reports) = start_prober("127.0.0.1")?;
    prober.send_probe(ProbeRequest {
        id: ProbeId(1),
        sequence: Sequence(1),
        timeout: Duration::from_millis(1000),
        size: PacketSize(56),
        pattern: vec![0xaa],
        ..Default::default()
    })?;
    let (id, report) = reports.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(id, ProbeId(1));
    match report {
        ProbeReport::Success {
            sent_size,
            overhead,
            rtt,
            reply,
            ..
        } => {
            assert_eq!(sent_size, 56);
            assert_eq!(overhead, 20);
            assert!(rtt < Duration::from_millis(100));
            assert!(reply[8..].iter().all(|&b| b == 0xaa));
        }
        other => panic!("unexpected report: {other:?}"),
    }
    prober.stop()?;
    Ok(())
}

// Requires net.ipv6 loopback and ping_group_range to cover the test user.
#[test]
#[ignore]
fn test_icmp_echo_loopback_v6() -> Result<()> {
    let (mut prober, reports) = start_prober("::1")?;
    prober.send_probe(ProbeRequest {
        id: ProbeId(2),
        sequence: Sequence(1),
        timeout: Duration::from_millis(1000),
        size: PacketSize(8),
        ..Default::default()
    })?;
    let (id, report) = reports.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(id, ProbeId(2));
    match report {
        ProbeReport::Success {
            sent_size,
            overhead,
            reply_ttl,
            ..
        } => {
            assert_eq!(sent_size, 8);
            assert_eq!(overhead, 40);
            assert!(reply_ttl.is_some());
        }
        other => panic!("unexpected report: {other:?}"),
    }
    prober.stop()?;
    Ok(())
}
