//! TTL-bounded TCP dialing.

use async_trait::async_trait;
use hoplite_core::net::random_probe_port;
use hoplite_core::TraceError;
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpSocket;
use tracing::warn;

/// Outcome of a TTL-bounded dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialOutcome {
    /// The handshake completed: the destination answered at this TTL.
    Connected { source_port: u16 },
    /// A router between us and the destination dropped the probe
    /// (`EHOSTUNREACH`); its ICMP reply is waiting to be read.
    Unreachable { source_port: u16 },
}

/// Performs TTL-bounded TCP dials. The indirection keeps the probe logic
/// testable against a scripted network.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        addr: SocketAddr,
        ttl: u8,
        timeout: Duration,
    ) -> Result<DialOutcome, TraceError>;
}

/// Dialer backed by the operating system's TCP stack.
pub struct SystemDialer;

#[async_trait]
impl Dialer for SystemDialer {
    async fn dial(
        &self,
        addr: SocketAddr,
        ttl: u8,
        timeout: Duration,
    ) -> Result<DialOutcome, TraceError> {
        loop {
            let source_port = random_probe_port();
            let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(socket2::Protocol::TCP))
                .map_err(TraceError::SocketCreation)?;
            socket
                .set_ttl(u32::from(ttl))
                .map_err(TraceError::SocketCreation)?;

            let local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, source_port));
            if let Err(err) = socket.bind(&local.into()) {
                if err.kind() == io::ErrorKind::AddrInUse {
                    warn!(source_port, "Probe source port in use, picking another");
                    continue;
                }
                return Err(TraceError::SocketCreation(err));
            }
            socket
                .set_nonblocking(true)
                .map_err(TraceError::SocketCreation)?;

            let socket = TcpSocket::from_std_stream(socket.into());
            match tokio::time::timeout(timeout, socket.connect(addr)).await {
                Ok(Ok(stream)) => {
                    // The handshake is the probe; the connection itself is
                    // of no further use.
                    drop(stream);
                    return Ok(DialOutcome::Connected { source_port });
                }
                Ok(Err(err)) if err.raw_os_error() == Some(libc::EHOSTUNREACH) => {
                    return Ok(DialOutcome::Unreachable { source_port });
                }
                Ok(Err(err)) if err.kind() == io::ErrorKind::AddrInUse => {
                    warn!(source_port, "Probe source port in use, picking another");
                    continue;
                }
                Ok(Err(err)) => return Err(TraceError::Dial { addr, source: err }),
                Err(_elapsed) => {
                    return Err(TraceError::Dial {
                        addr,
                        source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                    })
                }
            }
        }
    }
}
