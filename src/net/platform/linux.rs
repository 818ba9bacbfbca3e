use crate::error::{IoError, IoOperation, IoResult};
use crate::net::socket::{ErrQueueEvent, ProbeSocket, ReplyEvent};
use itertools::Itertools;
use nix::errno::Errno;
use nix::libc;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, SockaddrStorage};
use socket2::{Domain, Protocol, SockAddr, Type};
use std::io;
use std::io::IoSliceMut;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;
use tracing::instrument;

/// A network socket.
pub(crate) struct SocketImpl {
    inner: socket2::Socket,
}

impl SocketImpl {
    fn new(domain: Domain, protocol: Protocol) -> IoResult<Self> {
        Ok(Self {
            inner: socket2::Socket::new(domain, Type::DGRAM, Some(protocol))
                .map_err(|err| IoError::Other(err, IoOperation::NewSocket))?,
        })
    }

    /// Set a socket option with a `c_int` payload.
    ///
    /// Covers the Linux-only options `socket2` has no wrapper for.
    #[allow(unsafe_code)]
    fn set_opt(
        &self,
        level: libc::c_int,
        name: libc::c_int,
        value: libc::c_int,
        op: IoOperation,
    ) -> IoResult<()> {
        // Safety: a plain setsockopt with a c_int payload on an open
        // descriptor.
        let res = unsafe {
            libc::setsockopt(
                self.inner.as_raw_fd(),
                level,
                name,
                std::ptr::addr_of!(value).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if res == 0 {
            Ok(())
        } else {
            Err(IoError::Other(io::Error::last_os_error(), op))
        }
    }
}

impl ProbeSocket for SocketImpl {
    #[instrument(level = "trace")]
    fn new_icmp_v4() -> IoResult<Self> {
        Self::new(Domain::IPV4, Protocol::ICMPV4)
    }
    #[instrument(level = "trace")]
    fn new_icmp_v6() -> IoResult<Self> {
        Self::new(Domain::IPV6, Protocol::ICMPV6)
    }
    #[instrument(level = "trace")]
    fn new_udp_v4() -> IoResult<Self> {
        Self::new(Domain::IPV4, Protocol::UDP)
    }
    #[instrument(level = "trace")]
    fn new_udp_v6() -> IoResult<Self> {
        Self::new(Domain::IPV6, Protocol::UDP)
    }
    fn raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
    #[instrument(skip(self), level = "trace")]
    fn bind(&mut self, address: SocketAddr) -> IoResult<()> {
        self.inner
            .bind(&SockAddr::from(address))
            .map_err(|err| IoError::Bind(err, address))
    }
    #[instrument(skip(self), level = "trace")]
    fn set_ttl_v4(&mut self, ttl: u8) -> IoResult<()> {
        self.inner
            .set_ttl_v4(u32::from(ttl))
            .map_err(|err| IoError::Other(err, IoOperation::SetTtl))
    }
    #[instrument(skip(self), level = "trace")]
    fn set_unicast_hops_v6(&mut self, hops: u8) -> IoResult<()> {
        self.inner
            .set_unicast_hops_v6(u32::from(hops))
            .map_err(|err| IoError::Other(err, IoOperation::SetUnicastHopsV6))
    }
    #[instrument(skip(self), level = "trace")]
    fn set_read_timeout(&mut self, timeout: Duration) -> IoResult<()> {
        self.inner
            .set_read_timeout(Some(timeout))
            .map_err(|err| IoError::Other(err, IoOperation::SetReceiveTimeout))
    }
    #[instrument(skip(self), level = "trace")]
    fn set_write_timeout(&mut self, timeout: Duration) -> IoResult<()> {
        self.inner
            .set_write_timeout(Some(timeout))
            .map_err(|err| IoError::Other(err, IoOperation::SetSendTimeout))
    }
    #[instrument(skip(self), level = "trace")]
    fn set_recv_err_v4(&mut self) -> IoResult<()> {
        self.set_opt(libc::SOL_IP, libc::IP_RECVERR, 1, IoOperation::SetRecvErr)
    }
    #[instrument(skip(self), level = "trace")]
    fn set_recv_err_v6(&mut self) -> IoResult<()> {
        self.set_opt(
            libc::SOL_IPV6,
            libc::IPV6_RECVERR,
            1,
            IoOperation::SetRecvErr,
        )
    }
    #[instrument(skip(self), level = "trace")]
    fn set_recv_ttl_v4(&mut self) -> IoResult<()> {
        self.set_opt(libc::SOL_IP, libc::IP_RECVTTL, 1, IoOperation::SetRecvTtl)
    }
    #[instrument(skip(self), level = "trace")]
    fn set_recv_hop_limit_v6(&mut self) -> IoResult<()> {
        self.set_opt(
            libc::SOL_IPV6,
            libc::IPV6_RECVHOPLIMIT,
            1,
            IoOperation::SetRecvHopLimit,
        )
    }
    #[instrument(skip(self), level = "trace")]
    fn set_mtu_discover_probe_v4(&mut self) -> IoResult<()> {
        self.set_opt(
            libc::SOL_IP,
            libc::IP_MTU_DISCOVER,
            libc::IP_PMTUDISC_PROBE,
            IoOperation::SetMtuDiscover,
        )
    }
    #[instrument(skip(self), level = "trace")]
    fn set_mtu_discover_probe_v6(&mut self) -> IoResult<()> {
        self.set_opt(
            libc::SOL_IPV6,
            libc::IPV6_MTU_DISCOVER,
            libc::IPV6_PMTUDISC_PROBE,
            IoOperation::SetMtuDiscover,
        )
    }
    #[instrument(skip(self), level = "trace")]
    fn set_tos_v4(&mut self, tos: u32) -> IoResult<()> {
        self.inner
            .set_tos_v4(tos)
            .map_err(|err| IoError::Other(err, IoOperation::SetTos))
    }
    #[instrument(skip(self), level = "trace")]
    fn set_tclass_v6(&mut self, tclass: u32) -> IoResult<()> {
        self.inner
            .set_tclass_v6(tclass)
            .map_err(|err| IoError::Other(err, IoOperation::SetTclassV6))
    }
    #[instrument(skip(self, buf), level = "trace")]
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> IoResult<()> {
        tracing::trace!(buf = format!("{:02x?}", buf.iter().format(" ")), ?addr);
        self.inner
            .send_to(buf, &SockAddr::from(addr))
            .map_err(|err| IoError::SendTo(err, addr))?;
        Ok(())
    }
    #[instrument(skip(self, buf), level = "trace")]
    fn recv_err(&mut self, buf: &mut [u8]) -> IoResult<Option<ErrQueueEvent>> {
        let Some((_, cmsgs)) = recv_with_control(self.raw_fd(), buf, MsgFlags::MSG_ERRQUEUE)?
        else {
            return Ok(None);
        };
        let mut event = None;
        let mut hop_limit = None;
        for cmsg in cmsgs {
            match cmsg {
                ControlMessageOwned::Ipv4RecvErr(err, offender) => {
                    event = Some(ErrQueueEvent {
                        errno: err.ee_errno,
                        code: err.ee_code,
                        origin: err.ee_origin,
                        info: err.ee_info,
                        offender: offender.map(ipv4_addr),
                        hop_limit: None,
                    });
                }
                ControlMessageOwned::Ipv6RecvErr(err, offender) => {
                    event = Some(ErrQueueEvent {
                        errno: err.ee_errno,
                        code: err.ee_code,
                        origin: err.ee_origin,
                        info: err.ee_info,
                        offender: offender.map(ipv6_addr),
                        hop_limit: None,
                    });
                }
                ControlMessageOwned::Ipv4Ttl(ttl) => hop_limit = u8::try_from(ttl).ok(),
                ControlMessageOwned::Ipv6HopLimit(limit) => hop_limit = u8::try_from(limit).ok(),
                _ => {}
            }
        }
        if let Some(event) = &mut event {
            event.hop_limit = hop_limit;
        }
        tracing::trace!(?event);
        Ok(event)
    }
    #[instrument(skip(self, buf), level = "trace")]
    fn recv_reply(&mut self, buf: &mut [u8]) -> IoResult<Option<ReplyEvent>> {
        let Some((len, cmsgs)) = recv_with_control(self.raw_fd(), buf, MsgFlags::empty())? else {
            return Ok(None);
        };
        let mut hop_limit = None;
        for cmsg in cmsgs {
            match cmsg {
                ControlMessageOwned::Ipv4Ttl(ttl) => hop_limit = u8::try_from(ttl).ok(),
                ControlMessageOwned::Ipv6HopLimit(limit) => hop_limit = u8::try_from(limit).ok(),
                _ => {}
            }
        }
        tracing::trace!(
            buf = format!("{:02x?}", buf[..len].iter().format(" ")),
            len,
            hop_limit
        );
        Ok(Some(ReplyEvent { len, hop_limit }))
    }
}

/// Receive one datagram and its control messages, without blocking.
fn recv_with_control(
    fd: RawFd,
    buf: &mut [u8],
    flags: MsgFlags,
) -> IoResult<Option<(usize, Vec<ControlMessageOwned>)>> {
    let mut control = nix::cmsg_space!(
        libc::sock_extended_err,
        libc::sockaddr_storage,
        libc::c_int
    );
    let mut iov = [IoSliceMut::new(buf)];
    match recvmsg::<SockaddrStorage>(
        fd,
        &mut iov,
        Some(&mut control),
        flags | MsgFlags::MSG_DONTWAIT,
    ) {
        Ok(msg) => {
            let cmsgs = msg
                .cmsgs()
                .map_err(|err| IoError::Other(io::Error::from(err), IoOperation::RecvMsg))?
                .collect();
            Ok(Some((msg.bytes, cmsgs)))
        }
        Err(Errno::EAGAIN | Errno::EINTR) => Ok(None),
        Err(err) => Err(IoError::Other(io::Error::from(err), IoOperation::RecvMsg)),
    }
}

fn ipv4_addr(addr: libc::sockaddr_in) -> IpAddr {
    IpAddr::V4(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)))
}

fn ipv6_addr(addr: libc::sockaddr_in6) -> IpAddr {
    IpAddr::V6(Ipv6Addr::from(addr.sin6_addr.s6_addr))
}

/// The readiness multiplexor and wake notifier owned by the worker.
///
/// Registrations happen on caller threads under the probe table lock; only
/// the worker invokes [`Poller::wait`].
pub(crate) struct Poller {
    epoll: Epoll,
    waker: EventFd,
    waker_token: u64,
}

impl Poller {
    pub(crate) fn new() -> IoResult<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|err| IoError::Other(io::Error::from(err), IoOperation::EpollCreate))?;
        let waker = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            .map_err(|err| IoError::Other(io::Error::from(err), IoOperation::EventFdCreate))?;
        let waker_token = waker.as_fd().as_raw_fd() as u64;
        epoll
            .add(&waker, EpollEvent::new(EpollFlags::EPOLLIN, waker_token))
            .map_err(|err| IoError::Other(io::Error::from(err), IoOperation::EpollAdd))?;
        Ok(Self {
            epoll,
            waker,
            waker_token,
        })
    }

    /// The token readiness events on the wake notifier carry.
    pub(crate) fn waker_token(&self) -> u64 {
        self.waker_token
    }

    /// Register a probe socket for readable events, with its descriptor as
    /// the event token.
    #[allow(unsafe_code)]
    pub(crate) fn register(&self, fd: RawFd) -> IoResult<()> {
        // Safety: the descriptor belongs to a live probe table entry for the
        // duration of this call.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(borrowed, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64))
            .map_err(|err| IoError::Other(io::Error::from(err), IoOperation::EpollAdd))
    }

    /// Unregister a probe socket.
    #[allow(unsafe_code)]
    pub(crate) fn unregister(&self, fd: RawFd) -> IoResult<()> {
        // Safety: the descriptor belongs to a live probe table entry for the
        // duration of this call.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .delete(borrowed)
            .map_err(|err| IoError::Other(io::Error::from(err), IoOperation::EpollDelete))
    }

    /// Unblock the worker from another thread.
    pub(crate) fn wake(&self) -> IoResult<()> {
        self.waker
            .write(1)
            .map(|_| ())
            .map_err(|err| IoError::Other(io::Error::from(err), IoOperation::EventFdWrite))
    }

    /// Drain the wake notifier so it does not accumulate.
    pub(crate) fn drain(&self) {
        match self.waker.read() {
            Ok(_) | Err(Errno::EAGAIN) => {}
            Err(err) => {
                let err = IoError::Other(io::Error::from(err), IoOperation::EventFdRead);
                tracing::warn!(%err, "failed to drain wake notifier");
            }
        }
    }

    /// Wait for readiness events for up to `timeout`, indefinitely if `None`.
    ///
    /// Timeouts beyond the epoll range fall back to an indefinite wait; the
    /// next table mutation or deadline recomputation wakes the worker.
    pub(crate) fn wait(
        &self,
        events: &mut [EpollEvent],
        timeout: Option<Duration>,
    ) -> IoResult<usize> {
        let timeout = timeout.map_or(EpollTimeout::NONE, |duration| {
            EpollTimeout::try_from(duration).unwrap_or(EpollTimeout::NONE)
        });
        match self.epoll.wait(events, timeout) {
            Ok(count) => Ok(count),
            Err(Errno::EINTR) => Ok(0),
            Err(err) => Err(IoError::Other(io::Error::from(err), IoOperation::EpollWait)),
        }
    }
}
