//! UDP traceroute engine.
//!
//! A probe is a single one-byte datagram sent from a TTL-bounded socket
//! with `IP_RECVERR` enabled. The kernel parks the resulting ICMP error on
//! the socket's error queue, where the error-queue listener picks it up.
//! No raw socket is involved, so this engine runs without `CAP_NET_RAW`.

use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use hoplite_core::net::random_probe_port;
use hoplite_core::{dns, Hop, HopAddress, Options, Probe, TraceError, Tracer};
use hoplite_icmp::{ErrQueueListener, IcmpListener};
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The UDP probe engine.
pub struct UdpTracer {
    resolver: Arc<TokioResolver>,
}

impl UdpTracer {
    pub fn new(resolver: Arc<TokioResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Tracer for UdpTracer {
    async fn trace(
        &self,
        cancel: &CancellationToken,
        probe: Probe,
        opts: &Options,
    ) -> Result<(), TraceError> {
        debug!(target = %probe.target, ttl = probe.ttl, "Starting UDP trace");
        let addr = dns::resolve_target(&self.resolver, &probe.target).await?;

        let (socket, source_port) = open_probe_socket(addr, probe.ttl)?;
        let socket = Arc::new(UdpSocket::from_std(socket).map_err(TraceError::SocketCreation)?);
        let mut listener = ErrQueueListener::new(Arc::clone(&socket), source_port);

        let start = Instant::now();
        // A single byte is enough to provoke the ICMP reply.
        socket.send(&[0]).await.map_err(TraceError::ProbeSend)?;

        let deadline = start + opts.timeout;
        // Order matters: the expected errors first, unexpected ones after.
        match listener.read(cancel, deadline).await {
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

/// Opens the probe socket: bound to a random pool port, TTL-bounded, with
/// kernel ICMP errors routed to the error queue, connected to the target.
fn open_probe_socket(addr: SocketAddr, ttl: u8) -> Result<(std::net::UdpSocket, u16), TraceError> {
    let source_port = random_probe_port();
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(socket2::Protocol::UDP))
        .map_err(TraceError::SocketCreation)?;
    socket
        .set_ttl(u32::from(ttl))
        .map_err(TraceError::SocketCreation)?;
    set_recverr(&socket)?;

    let local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, source_port));
    socket
        .bind(&local.into())
        .map_err(TraceError::SocketCreation)?;
    socket
        .set_nonblocking(true)
        .map_err(TraceError::SocketCreation)?;
    socket
        .connect(&addr.into())
        .map_err(|err| TraceError::Dial { addr, source: err })?;

    Ok((socket.into(), source_port))
}

/// Enables `IP_RECVERR` so the kernel queues ICMP errors on the socket
/// instead of discarding them.
fn set_recverr(socket: &Socket) -> Result<(), TraceError> {
    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_IP,
            libc::IP_RECVERR,
            (&enable as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(TraceError::SocketCreation(io::Error::last_os_error()));
    }
    Ok(())
}
