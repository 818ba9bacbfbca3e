//! Sonda - A network reachability probing library.
//!
//! This crate provides the probe engine used by tools such as `ping`,
//! `traceroute` and path-MTU discovery utilities. The embedding application
//! drives the policy (which sequences, sizes, TTLs and timeouts to probe
//! with); the engine owns the mechanics: it sends ICMP Echo or UDP datagrams,
//! multiplexes any number of outstanding probes over a single worker thread
//! and reports the fate of each probe back through a callback.
//!
//! Each probe is sent on its own kernel-assembled datagram socket which is
//! kept open until the probe completes. This allows asynchronous ICMP errors
//! to be read from the socket error queue of the socket that triggered them,
//! so no reply parsing or sequence correlation is needed to attribute an
//! error to a probe.
//!
//! # Example
//!
//! The following example probes localhost once with an ICMP Echo request and
//! prints the outcome:
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use sonda::{Builder, ProbeRequest};
//!
//! let mut prober = Builder::new("127.0.0.1")
//!     .on_report(|id, report| println!("{id:?}: {report:?}"))
//!     .build()?;
//! prober.start()?;
//! prober.send_probe(ProbeRequest::default())?;
//! prober.stop()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Platform support
//!
//! The engine relies on Linux kernel interfaces: datagram ICMP sockets,
//! `epoll`, `eventfd` and the `IP_RECVERR` / `IPV6_RECVERR` socket error
//! queue.
//!
//! # See Also
//!
//! - [`Builder`] - Build a [`Prober`].
//! - [`Prober::start`] - Start the probe worker.
//! - [`Prober::send_probe`] - Dispatch a single probe.
#![warn(clippy::all, clippy::pedantic, clippy::nursery, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::use_self,
    clippy::option_if_let_else,
    clippy::missing_const_for_fn,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::missing_errors_doc
)]
#![deny(unsafe_code)]

mod builder;
mod config;
mod constants;
mod engine;
mod error;
mod net;
mod probe;
mod state;
mod types;

pub use builder::Builder;
pub use config::{defaults, ProbeRequest, ProbeType};
pub use engine::Prober;
pub use error::{Error, IoError, Result};
pub use probe::{ProbeReport, ProbeStatus};
pub use types::{PacketSize, Port, ProbeId, Sequence, TimeToLive};
