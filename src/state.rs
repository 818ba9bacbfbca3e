use crate::net::socket::ProbeSocket;
use crate::net::Poller;
use crate::probe::{ProbeRecord, ProbeStatus};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An in-flight probe and the socket it was sent on.
///
/// The socket is kept open until the probe outcome has been delivered so the
/// kernel error queue remains readable; dropping the entry closes it.
pub(crate) struct ProbeEntry<S> {
    pub socket: S,
    pub probe: ProbeRecord,
}

/// The table of in-flight probes, keyed by socket descriptor.
///
/// The descriptor is the identity of an in-flight probe: readiness events
/// carry it as their token and the error queue of that same socket is the
/// only place the kernel reports asynchronous ICMP errors for the probe.
///
/// The table also holds the worker's poller while the engine runs, so that
/// insertions performed on caller threads can register descriptors and wake
/// the worker under the same lock.
pub(crate) struct ProbeTable<S> {
    probes: HashMap<RawFd, ProbeEntry<S>>,
    poller: Option<Arc<Poller>>,
}

impl<S: ProbeSocket> ProbeTable<S> {
    pub fn new() -> Self {
        Self {
            probes: HashMap::new(),
            poller: None,
        }
    }

    pub fn set_poller(&mut self, poller: Arc<Poller>) {
        self.poller = Some(poller);
    }

    pub fn clear_poller(&mut self) {
        self.poller = None;
    }

    pub fn poller(&self) -> Option<&Arc<Poller>> {
        self.poller.as_ref()
    }

    /// Store an in-flight probe, register its descriptor for readiness and
    /// wake the worker so it recomputes its deadline.
    pub fn insert(&mut self, socket: S, probe: ProbeRecord) {
        let fd = socket.raw_fd();
        if let Some(poller) = &self.poller {
            if let Err(err) = poller.register(fd) {
                tracing::warn!(fd, %err, "failed to register probe socket");
            }
            if let Err(err) = poller.wake() {
                tracing::warn!(%err, "failed to wake worker");
            }
        }
        self.probes.insert(fd, ProbeEntry { socket, probe });
    }

    pub fn entry_mut(&mut self, fd: RawFd) -> Option<&mut ProbeEntry<S>> {
        self.probes.get_mut(&fd)
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    /// Transition every waiting probe whose deadline has passed to timeout.
    pub fn check_timeouts(&mut self, now: Instant) {
        for entry in self.probes.values_mut() {
            if entry.probe.status == ProbeStatus::Waiting
                && now.saturating_duration_since(entry.probe.sent_at) > entry.probe.timeout
            {
                entry.probe.status = ProbeStatus::Timeout;
            }
        }
    }

    /// Transition every waiting probe to timeout, regardless of deadline.
    pub fn force_timeouts(&mut self) {
        for entry in self.probes.values_mut() {
            if entry.probe.status == ProbeStatus::Waiting {
                entry.probe.status = ProbeStatus::Timeout;
            }
        }
    }

    /// The smallest remaining time across waiting probes, `None` if there are
    /// no waiting probes.
    pub fn min_wait(&self, now: Instant) -> Option<Duration> {
        self.probes
            .values()
            .filter(|entry| entry.probe.status == ProbeStatus::Waiting)
            .map(|entry| {
                entry
                    .probe
                    .timeout
                    .saturating_sub(now.saturating_duration_since(entry.probe.sent_at))
            })
            .min()
    }

    /// Remove every probe with an outcome, unregistering and closing its
    /// socket, and return the records for delivery.
    pub fn take_finished(&mut self) -> Vec<ProbeRecord> {
        let finished = self
            .probes
            .iter()
            .filter(|(_, entry)| entry.probe.status != ProbeStatus::Waiting)
            .map(|(fd, _)| *fd)
            .collect::<Vec<_>>();
        finished
            .into_iter()
            .filter_map(|fd| {
                let entry = self.probes.remove(&fd)?;
                if let Some(poller) = &self.poller {
                    if let Err(err) = poller.unregister(fd) {
                        tracing::warn!(fd, %err, "failed to unregister probe socket");
                    }
                }
                Some(entry.probe)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeRequest;
    use crate::net::socket::MockProbeSocket;
    use crate::types::ProbeId;
    use std::net::{IpAddr, Ipv4Addr};

    const REMOTE: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn probe(id: u64, timeout: Duration) -> ProbeRecord {
        ProbeRecord::new(
            &ProbeRequest {
                id: ProbeId(id),
                timeout,
                ..Default::default()
            },
            REMOTE,
        )
    }

    fn socket(fd: RawFd) -> MockProbeSocket {
        let mut socket = MockProbeSocket::new();
        socket.expect_raw_fd().return_const(fd);
        socket
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut table = ProbeTable::new();
        table.insert(socket(3), probe(1, Duration::from_secs(1)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.entry_mut(3).unwrap().probe.id, ProbeId(1));
        assert!(table.entry_mut(4).is_none());
    }

    #[test]
    fn test_check_timeouts_honours_deadline() {
        let mut table = ProbeTable::new();
        table.insert(socket(3), probe(1, Duration::from_millis(100)));
        table.insert(socket(4), probe(2, Duration::from_millis(300)));
        let now = table.entry_mut(3).unwrap().probe.sent_at + Duration::from_millis(200);
        table.check_timeouts(now);
        assert_eq!(
            table.entry_mut(3).unwrap().probe.status,
            ProbeStatus::Timeout
        );
        assert_eq!(
            table.entry_mut(4).unwrap().probe.status,
            ProbeStatus::Waiting
        );
    }

    #[test]
    fn test_check_timeouts_is_strict() {
        let mut table = ProbeTable::new();
        table.insert(socket(3), probe(1, Duration::from_millis(100)));
        let now = table.entry_mut(3).unwrap().probe.sent_at + Duration::from_millis(100);
        table.check_timeouts(now);
        assert_eq!(
            table.entry_mut(3).unwrap().probe.status,
            ProbeStatus::Waiting
        );
    }

    #[test]
    fn test_min_wait_empty_table() {
        let table = ProbeTable::<MockProbeSocket>::new();
        assert_eq!(table.min_wait(Instant::now()), None);
    }

    #[test]
    fn test_min_wait_picks_earliest_deadline() {
        let mut table = ProbeTable::new();
        table.insert(socket(3), probe(1, Duration::from_millis(500)));
        table.insert(socket(4), probe(2, Duration::from_millis(200)));
        let now = table.entry_mut(3).unwrap().probe.sent_at;
        assert_eq!(table.min_wait(now), Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_min_wait_clamps_overdue_to_zero() {
        let mut table = ProbeTable::new();
        table.insert(socket(3), probe(1, Duration::from_millis(100)));
        let now = table.entry_mut(3).unwrap().probe.sent_at + Duration::from_secs(1);
        assert_eq!(table.min_wait(now), Some(Duration::ZERO));
    }

    #[test]
    fn test_min_wait_ignores_finished_probes() {
        let mut table = ProbeTable::new();
        table.insert(socket(3), probe(1, Duration::from_millis(100)));
        table.entry_mut(3).unwrap().probe.status = ProbeStatus::Success;
        assert_eq!(table.min_wait(Instant::now()), None);
    }

    #[test]
    fn test_take_finished_removes_only_finished() {
        let mut table = ProbeTable::new();
        table.insert(socket(3), probe(1, Duration::from_secs(1)));
        table.insert(socket(4), probe(2, Duration::from_secs(1)));
        table.entry_mut(3).unwrap().probe.status = ProbeStatus::Success;
        let finished = table.take_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].id, ProbeId(1));
        assert_eq!(table.len(), 1);
        assert!(table.entry_mut(4).is_some());
    }

    #[test]
    fn test_force_timeouts_then_drain() {
        let mut table = ProbeTable::new();
        table.insert(socket(3), probe(1, Duration::from_secs(60)));
        table.insert(socket(4), probe(2, Duration::from_secs(60)));
        table.force_timeouts();
        let finished = table.take_finished();
        assert_eq!(finished.len(), 2);
        assert_eq!(table.len(), 0);
        assert!(finished
            .iter()
            .all(|probe| probe.status == ProbeStatus::Timeout));
    }
}
