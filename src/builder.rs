use crate::engine::{Prober, ReportHandler};
use crate::error::{Error, Result};
use crate::probe::ProbeReport;
use crate::types::ProbeId;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

/// A builder for creating instances of `Prober`.
///
/// Addresses are resolved lexically when [`Builder::build`] is called: the
/// string is parsed as IPv4 first and IPv6 second, and the first parse that
/// succeeds fixes the address family used by the engine throughout. No name
/// resolution is performed.
///
/// # Examples
///
/// ```no_run
/// # fn main() -> anyhow::Result<()> {
/// use sonda::Builder;
///
/// let prober = Builder::new("1.1.1.1")
///     .source_addr("192.168.1.12")
///     .on_report(|id, report| println!("{id:?}: {report:?}"))
///     .build()?;
/// # Ok(())
/// # }
/// ```
///
/// # See Also
///
/// - [`Prober`] - A reachability probe engine.
pub struct Builder {
    target: String,
    source: Option<String>,
    on_report: Option<ReportHandler>,
}

impl Builder {
    /// Initializes a new `Builder` for a given target address.
    #[must_use]
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            source: None,
            on_report: None,
        }
    }

    /// Sets the source address probes are sent from.
    ///
    /// A source which does not parse, or whose family does not match the
    /// target, is discarded with a warning and probes are sent unbound.
    #[must_use]
    pub fn source_addr(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    /// Sets the callback probe outcomes are delivered through.
    ///
    /// The callback runs on the worker thread for asynchronous outcomes and
    /// on the calling thread for probes which fail locally in
    /// [`Prober::send_probe`], so it must be thread-safe.
    #[must_use]
    pub fn on_report<F>(mut self, on_report: F) -> Self
    where
        F: Fn(ProbeId, ProbeReport) + Send + Sync + 'static,
    {
        self.on_report = Some(Arc::new(on_report));
        self
    }

    /// Build the `Prober`.
    ///
    /// Resolves the addresses; no sockets are allocated until probes are
    /// sent.
    pub fn build(self) -> Result<Prober> {
        let target = IpAddr::from_str(&self.target)
            .map_err(|_| Error::InvalidTargetAddr(self.target.clone()))?;
        let source = self.source.as_deref().and_then(|source| {
            match IpAddr::from_str(source) {
                Ok(addr) if addr.is_ipv4() == target.is_ipv4() => Some(addr),
                Ok(addr) => {
                    tracing::warn!(%addr, %target, "source address family does not match target, sending unbound");
                    None
                }
                Err(_) => {
                    tracing::warn!(source, "invalid source address, sending unbound");
                    None
                }
            }
        });
        let on_report = self
            .on_report
            .ok_or_else(|| Error::BadConfig("a report handler is required".to_string()))?;
        Ok(Prober::new(target, source, on_report))
    }
}
