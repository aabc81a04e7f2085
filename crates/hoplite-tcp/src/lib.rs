//! TCP traceroute engine.
//!
//! A probe is a TTL-bounded TCP dial. A completed handshake means the
//! destination itself answered, so the trace is done at that TTL. A dial
//! that fails with `EHOSTUNREACH` means a router dropped the probe; the
//! raw ICMP listener is then consulted for that router's reply, which
//! requires `CAP_NET_RAW`. Without the capability intermediate hops cannot
//! be observed and the probe fails explicitly.

mod dial;

pub use dial::{DialOutcome, Dialer, SystemDialer};

use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use hoplite_core::{dns, Hop, HopAddress, Options, Probe, TraceError, Tracer};
use hoplite_icmp::{IcmpListener, RawListener};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Opens an ICMP listener scoped to one probe's source port.
pub trait ListenerFactory: Send + Sync {
    fn open(&self, source_port: u16) -> Result<Box<dyn IcmpListener>, TraceError>;
}

struct RawListenerFactory;

impl ListenerFactory for RawListenerFactory {
    fn open(&self, source_port: u16) -> Result<Box<dyn IcmpListener>, TraceError> {
        Ok(Box::new(RawListener::open(source_port)?))
    }
}

/// The TCP probe engine.
pub struct TcpTracer {
    resolver: Arc<TokioResolver>,
    dialer: Box<dyn Dialer>,
    listeners: Box<dyn ListenerFactory>,
}

impl TcpTracer {
    pub fn new(resolver: Arc<TokioResolver>) -> Self {
        Self::with_parts(resolver, Box::new(SystemDialer), Box::new(RawListenerFactory))
    }

    fn with_parts(
        resolver: Arc<TokioResolver>,
        dialer: Box<dyn Dialer>,
        listeners: Box<dyn ListenerFactory>,
    ) -> Self {
        Self {
            resolver,
            dialer,
            listeners,
        }
    }
}

#[async_trait]
impl Tracer for TcpTracer {
    async fn trace(
        &self,
        cancel: &CancellationToken,
        probe: Probe,
        opts: &Options,
    ) -> Result<(), TraceError> {
        debug!(target = %probe.target, ttl = probe.ttl, "Starting TCP trace");
        let addr = dns::resolve_target(&self.resolver, &probe.target).await?;

        let start = Instant::now();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(TraceError::Cancelled),
            res = self.dialer.dial(addr, probe.ttl, opts.timeout) => res?,
        };

        match outcome {
            DialOutcome::Connected { source_port } => {
                // Happiest path: the destination completed the handshake,
                // so the trace ends at this TTL.
                let latency = start.elapsed();
                debug!(source_port, addr = %addr, "TCP connection established");
                let name = dns::reverse_name(&self.resolver, addr.ip()).await;
                probe
                    .emit(Hop {
                        addr: HopAddress::from_socket(addr),
                        name,
                        ttl: probe.ttl,
                        reached: true,
                        latency,
                    })
                    .await;
                Ok(())
            }
            DialOutcome::Unreachable { source_port } => {
                let mut listener = self.listeners.open(source_port)?;
                let deadline = start + opts.timeout;
                // Order matters: the expected errors first, unexpected
                // ones after.
                match listener.read(cancel, deadline).await {
                    Err(TraceError::IcmpNotAvailable) => Err(TraceError::IcmpNotAvailable),
                    Err(TraceError::DeadlineExceeded) => {
                        debug!("ICMP read timeout exceeded, no response received");
                        probe
                            .emit(Hop {
                                addr: HopAddress::star(),
                                name: String::new(),
                                ttl: probe.ttl,
                                reached: false,
                                latency: start.elapsed(),
                            })
                            .await;
                        Ok(())
                    }
                    Err(err) => Err(err),
                    Ok(packet) => {
                        let latency = start.elapsed();
                        debug!(port = packet.port, router = %packet.from, "Received ICMP message");
                        let name = dns::reverse_name(&self.resolver, packet.from.ip()).await;
                        probe
                            .emit(Hop {
                                addr: HopAddress::from_socket(packet.from),
                                name,
                                ttl: probe.ttl,
                                reached: packet.reached,
                                latency,
                            })
                            .await;
                        Ok(())
                    }
                }
            }
        }
    }
}
