use crate::config::{ProbeRequest, ProbeType};
use crate::constants::{
    EVENT_CAPACITY, INCOMING_BUFFER_SIZE, LOWDELAY_TOS, SEND_TIMEOUT, START_TIMEOUT,
};
use crate::error::{Error, IoResult, Result};
use crate::net::packet::build_probe_packet;
use crate::net::socket::ProbeSocket;
use crate::net::{Poller, SocketImpl};
use crate::probe::{ProbeRecord, ProbeReport};
use crate::state::ProbeTable;
use crate::types::ProbeId;
use nix::libc;
use nix::sys::epoll::EpollEvent;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Instant;

/// The callback outcomes are delivered through.
///
/// Invoked on the worker thread for asynchronous outcomes and on the calling
/// thread for probes which fail locally in [`Prober::send_probe`], so it must
/// be thread-safe.
pub(crate) type ReportHandler = Arc<dyn Fn(ProbeId, ProbeReport) + Send + Sync + 'static>;

/// A reachability probe engine.
///
/// A `Prober` is bound to a single destination and an optional source
/// address. Once started it runs a single worker thread which waits for
/// probe replies, kernel error queue entries and deadlines, and reports the
/// fate of every dispatched probe through the callback injected at build
/// time.
///
/// Use the [`crate::Builder`] type to create a `Prober`.
///
/// # See Also
///
/// - [`Prober::start`] - Start the probe worker.
/// - [`Prober::send_probe`] - Dispatch a single probe.
/// - [`Prober::stop`] - Drain in-flight probes and stop the worker.
pub struct Prober {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober").finish_non_exhaustive()
    }
}

impl Prober {
    pub(crate) fn new(target: IpAddr, source: Option<IpAddr>, on_report: ReportHandler) -> Self {
        Self {
            shared: Arc::new(Shared {
                target,
                source,
                ident: rand::random::<u16>(),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                table: Mutex::new(ProbeTable::new()),
                on_report,
            }),
            worker: None,
        }
    }

    /// Start the probe worker.
    ///
    /// Spawns the worker thread and blocks until it has set up its readiness
    /// poller, for at most ten seconds. On failure the engine stays inert:
    /// [`Prober::send_probe`] will fail cleanly and deliver a
    /// [`ProbeReport::Fatal`] report.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::AlreadyStarted);
        }
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(Error::Other(
                "probe engine cannot be restarted".to_string(),
            ));
        }
        let (ready_tx, ready_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("prober".to_string())
            .spawn(move || shared.run_worker(&ready_tx))
            .map_err(|err| Error::Other(err.to_string()))?;
        self.worker = Some(handle);
        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                tracing::error!("timed out waiting for the probe worker to start");
                Err(Error::StartTimeout)
            }
        }
    }

    /// Dispatch a single probe.
    ///
    /// Runs on the calling thread up to and including the send. The outcome
    /// is reported through the callback: asynchronously from the worker for
    /// probes that were sent, or synchronously from this call for probes
    /// which fail locally, in which case an error is also returned.
    ///
    /// An `EMSGSIZE` send failure is not a local failure: for MTU probing the
    /// kernel reports the path MTU through the error queue, so the probe is
    /// registered and completes asynchronously like any other.
    pub fn send_probe(&self, request: ProbeRequest) -> Result<()> {
        self.shared.send_probe(request)
    }

    /// The number of probes which have not yet been reaped.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.shared.table.lock().len()
    }

    /// Stop the engine.
    ///
    /// Blocks until the worker has exited; every probe still in flight is
    /// forced to a timeout outcome and delivered before this returns.
    pub fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        tracing::debug!("stopping probe engine");
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(poller) = self.shared.table.lock().poller().cloned() {
            if let Err(err) = poller.wake() {
                tracing::warn!(%err, "failed to wake the worker for shutdown");
            }
        }
        worker
            .join()
            .map_err(|_| Error::Other("probe worker panicked".to_string()))
    }

    /// Whether the worker is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// The destination address of the prober.
    #[must_use]
    pub fn target_addr(&self) -> IpAddr {
        self.shared.target
    }

    /// The source address of the prober.
    #[must_use]
    pub fn source_addr(&self) -> Option<IpAddr> {
        self.shared.source
    }

    /// The identifier carried by every ICMP Echo this prober sends.
    ///
    /// Note that the kernel may rewrite the identifier of datagram ICMP
    /// sockets, so it is advisory and replies need not carry it.
    #[must_use]
    pub fn ident(&self) -> u16 {
        self.shared.ident
    }
}

impl Drop for Prober {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(%err, "failed to stop probe engine");
        }
    }
}

/// Engine state shared between the worker and caller threads.
///
/// The probe table and the poller registrations are guarded by a single
/// mutex; the worker never holds it while waiting for readiness.
struct Shared {
    target: IpAddr,
    source: Option<IpAddr>,
    ident: u16,
    running: AtomicBool,
    stopped: AtomicBool,
    table: Mutex<ProbeTable<SocketImpl>>,
    on_report: ReportHandler,
}

impl Shared {
    /// The worker: waits for readiness or the earliest probe deadline, then
    /// sweeps for completed probes and delivers their reports.
    fn run_worker(&self, ready: &Sender<Result<()>>) {
        let poller = match Poller::new() {
            Ok(poller) => Arc::new(poller),
            Err(err) => {
                tracing::error!(%err, "failed to set up the readiness poller");
                let _ = ready.send(Err(err.into()));
                return;
            }
        };
        self.table.lock().set_poller(Arc::clone(&poller));
        self.running.store(true, Ordering::SeqCst);
        let _ = ready.send(Ok(()));
        tracing::debug!(target = %self.target, ident = self.ident, "probe worker started");
        let mut events = [EpollEvent::empty(); EVENT_CAPACITY];
        while !self.stopped.load(Ordering::SeqCst) {
            let wait = self.table.lock().min_wait(Instant::now());
            let count = match poller.wait(&mut events, wait) {
                Ok(count) => count,
                Err(err) => {
                    tracing::warn!(%err, "readiness wait failed");
                    0
                }
            };
            for event in &events[..count] {
                let token = event.data();
                if token == poller.waker_token() {
                    poller.drain();
                    continue;
                }
                self.drain_socket(token as RawFd);
            }
            self.sweep(Instant::now());
        }
        {
            // Clearing the poller first makes concurrent send_probe calls
            // fail cleanly rather than enqueue behind the final drain.
            let mut table = self.table.lock();
            table.clear_poller();
            table.force_timeouts();
        }
        self.sweep(Instant::now());
        self.running.store(false, Ordering::SeqCst);
        tracing::debug!("probe worker stopped");
    }

    /// Transition probes which have passed their deadline, then deliver and
    /// reap everything with an outcome.
    ///
    /// Records are extracted under the lock and reported after it has been
    /// released, so the callback may call back into the engine.
    fn sweep(&self, now: Instant) {
        let finished = {
            let mut table = self.table.lock();
            table.check_timeouts(now);
            table.take_finished()
        };
        for record in finished {
            let (id, report) = record.into_report();
            (self.on_report)(id, report);
        }
    }

    /// Drain a readable probe socket.
    fn drain_socket(&self, fd: RawFd) {
        let mut table = self.table.lock();
        let Some(entry) = table.entry_mut(fd) else {
            tracing::trace!(fd, "readiness event for an unknown descriptor");
            return;
        };
        let mut buffer = [0_u8; INCOMING_BUFFER_SIZE];
        drain_probe(&mut entry.socket, &mut entry.probe, &mut buffer);
    }

    fn send_probe(&self, request: ProbeRequest) -> Result<()> {
        let mut probe = ProbeRecord::new(&request, self.target);
        tracing::debug!(
            id = ?probe.id,
            probe_type = %probe.probe_type,
            sequence = probe.sequence.0,
            ttl = probe.ttl.0,
            "sending probe"
        );
        if !self.running.load(Ordering::SeqCst) {
            return Err(self.fail_probe(probe, "probe engine is not running".to_string()));
        }
        let mut socket = match self.open_socket(request.probe_type) {
            Ok(socket) => socket,
            Err(err) => {
                return Err(self.fail_probe(probe, format!("failed to create socket: {err}")))
            }
        };
        if let Some(source) = self.source {
            if let Err(err) = socket.bind(SocketAddr::new(source, 0)) {
                return Err(
                    self.fail_probe(probe, format!("failed to bind source address: {err}"))
                );
            }
        }
        configure_socket(&mut socket, self.target.is_ipv4(), &request);
        probe.packet = build_probe_packet(
            request.probe_type,
            self.target.is_ipv4(),
            self.ident,
            request.sequence,
            request.size,
            &request.pattern,
        );
        let port = match request.probe_type {
            ProbeType::Udp if request.port.0 > 0 => request.port.0,
            _ => 0,
        };
        let dest = SocketAddr::new(self.target, port);
        probe.stamp_sent();
        match socket.send_to(&probe.packet, dest) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EMSGSIZE) => {
                tracing::debug!(%err, "oversized send, awaiting error queue");
            }
            Err(err) => {
                return Err(self.fail_probe(probe, format!("failed to send probe: {err}")));
            }
        }
        let mut table = self.table.lock();
        if table.poller().is_none() {
            drop(table);
            return Err(self.fail_probe(probe, "probe engine is not running".to_string()));
        }
        table.insert(socket, probe);
        Ok(())
    }

    fn open_socket(&self, probe_type: ProbeType) -> IoResult<SocketImpl> {
        match (probe_type, self.target.is_ipv4()) {
            (ProbeType::Icmp, true) => SocketImpl::new_icmp_v4(),
            (ProbeType::Icmp, false) => SocketImpl::new_icmp_v6(),
            (ProbeType::Udp, true) => SocketImpl::new_udp_v4(),
            (ProbeType::Udp, false) => SocketImpl::new_udp_v6(),
        }
    }

    /// Deliver a fatal outcome synchronously on the calling thread.
    fn fail_probe(&self, mut probe: ProbeRecord, message: String) -> Error {
        tracing::error!(%message, "probe failed");
        probe.fail(message.clone());
        let (id, report) = probe.into_report();
        (self.on_report)(id, report);
        Error::ProbeFailed(message)
    }
}

/// Configure a probe socket before sending.
///
/// Failures are logged and otherwise ignored: a best-effort configured
/// socket still probes.
pub(crate) fn configure_socket<S: ProbeSocket>(
    socket: &mut S,
    is_ipv4: bool,
    request: &ProbeRequest,
) {
    if request.ttl.0 > 0 {
        let res = if is_ipv4 {
            socket.set_ttl_v4(request.ttl.0)
        } else {
            socket.set_unicast_hops_v6(request.ttl.0)
        };
        if let Err(err) = res {
            tracing::warn!(%err, "failed to set hop limit");
        }
    }
    if !request.timeout.is_zero() {
        if let Err(err) = socket.set_read_timeout(request.timeout) {
            tracing::warn!(%err, "failed to set receive timeout");
        }
    }
    if let Err(err) = socket.set_write_timeout(SEND_TIMEOUT) {
        tracing::warn!(%err, "failed to set send timeout");
    }
    let res = if is_ipv4 {
        socket.set_recv_err_v4()
    } else {
        socket.set_recv_err_v6()
    };
    if let Err(err) = res {
        tracing::warn!(%err, "failed to enable the error queue");
    }
    let res = if is_ipv4 {
        socket.set_recv_ttl_v4()
    } else {
        socket.set_recv_hop_limit_v6()
    };
    if let Err(err) = res {
        tracing::warn!(%err, "failed to enable hop limit control data");
    }
    if request.detect_mtu {
        let res = if is_ipv4 {
            socket.set_mtu_discover_probe_v4()
        } else {
            socket.set_mtu_discover_probe_v6()
        };
        if let Err(err) = res {
            tracing::warn!(%err, "failed to enable MTU discovery");
        }
    }
    let res = if is_ipv4 {
        socket.set_tos_v4(LOWDELAY_TOS)
    } else {
        socket.set_tclass_v6(LOWDELAY_TOS)
    };
    if let Err(err) = res {
        tracing::warn!(%err, "failed to set traffic class");
    }
}

/// Drain a readable probe socket in two passes: the error queue first, then
/// reply data, recording the resulting outcome on the probe.
///
/// A drain that yields nothing leaves the probe waiting: the readiness event
/// was spurious or raced with a concurrent sweep.
pub(crate) fn drain_probe<S: ProbeSocket>(
    socket: &mut S,
    probe: &mut ProbeRecord,
    buffer: &mut [u8],
) {
    match socket.recv_err(buffer) {
        Ok(Some(event)) => {
            probe.record_error(&event);
            return;
        }
        Ok(None) => {}
        Err(err) => tracing::warn!(%err, "error queue receive failed"),
    }
    match socket.recv_reply(buffer) {
        Ok(Some(reply)) => probe.record_reply(&buffer[..reply.len], reply.hop_limit),
        Ok(None) => tracing::trace!("spurious readiness event"),
        Err(err) => tracing::warn!(%err, "receive failed"),
    }
}
