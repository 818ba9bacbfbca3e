use std::fmt::{Display, Formatter};
use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use thiserror::Error;

/// A prober result.
pub type Result<T> = std::result::Result<T, Error>;

/// A prober error.
#[derive(Error, Debug)]
pub enum Error {
    /// The target address could not be parsed as IPv4 or IPv6.
    #[error("invalid target address: {0}")]
    InvalidTargetAddr(String),
    /// The engine configuration is invalid.
    #[error("invalid config: {0}")]
    BadConfig(String),
    /// The engine has already been started.
    #[error("probe engine is already started")]
    AlreadyStarted,
    /// The worker did not signal readiness in time.
    #[error("timed out waiting for the probe worker to start")]
    StartTimeout,
    /// A probe failed locally; a `Fatal` report carries the detail.
    #[error("probe failed: {0}")]
    ProbeFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] IoError),
    #[error("probe engine error: {0}")]
    Other(String),
}

/// Custom IO error result.
pub type IoResult<T> = std::result::Result<T, IoError>;

/// Custom IO error.
#[derive(Error, Debug)]
pub enum IoError {
    #[error("Bind error for {1}: {0}")]
    Bind(io::Error, SocketAddr),
    #[error("Sendto error for {1}: {0}")]
    SendTo(io::Error, SocketAddr),
    #[error("Failed to {0}: {1}")]
    Other(io::Error, IoOperation),
}

impl IoError {
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Bind(e, _) | Self::SendTo(e, _) | Self::Other(e, _) => e.raw_os_error(),
        }
    }
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Bind(e, _) | Self::SendTo(e, _) | Self::Other(e, _) => e.kind(),
        }
    }
}

/// Io operation.
#[derive(Debug, Clone, Copy)]
pub enum IoOperation {
    NewSocket,
    SetTtl,
    SetUnicastHopsV6,
    SetReceiveTimeout,
    SetSendTimeout,
    SetRecvErr,
    SetRecvTtl,
    SetRecvHopLimit,
    SetMtuDiscover,
    SetTos,
    SetTclassV6,
    RecvMsg,
    EpollCreate,
    EpollAdd,
    EpollDelete,
    EpollWait,
    EventFdCreate,
    EventFdRead,
    EventFdWrite,
}

impl Display for IoOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSocket => write!(f, "create new socket"),
            Self::SetTtl => write!(f, "set TTL"),
            Self::SetUnicastHopsV6 => write!(f, "set unicast hops v6"),
            Self::SetReceiveTimeout => write!(f, "set receive timeout"),
            Self::SetSendTimeout => write!(f, "set send timeout"),
            Self::SetRecvErr => write!(f, "set recv err"),
            Self::SetRecvTtl => write!(f, "set recv TTL"),
            Self::SetRecvHopLimit => write!(f, "set recv hop limit"),
            Self::SetMtuDiscover => write!(f, "set MTU discover"),
            Self::SetTos => write!(f, "set TOS"),
            Self::SetTclassV6 => write!(f, "set tclass v6"),
            Self::RecvMsg => write!(f, "recv msg"),
            Self::EpollCreate => write!(f, "create epoll"),
            Self::EpollAdd => write!(f, "add epoll event"),
            Self::EpollDelete => write!(f, "delete epoll event"),
            Self::EpollWait => write!(f, "wait for epoll events"),
            Self::EventFdCreate => write!(f, "create eventfd"),
            Self::EventFdRead => write!(f, "read eventfd"),
            Self::EventFdWrite => write!(f, "write eventfd"),
        }
    }
}
