//! Raw-socket ICMP listener.

use crate::packet;
use crate::{IcmpListener, IcmpPacket};
use async_trait::async_trait;
use hoplite_core::TraceError;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use tokio::io::unix::AsyncFd;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const MTU: usize = 1500;

/// Listens for ICMP replies on a raw ICMPv4 socket, filtered to the source
/// port of one probe. Requires `CAP_NET_RAW`.
///
/// When the capability is missing, construction still succeeds and every
/// read reports [`TraceError::IcmpNotAvailable`]; the tracer decides how to
/// surface that.
pub struct RawListener {
    socket: Option<AsyncFd<Socket>>,
    probe_port: u16,
    buf: Vec<u8>,
}

impl RawListener {
    /// Opens the raw socket. `EPERM` degrades the listener instead of
    /// failing; any other error is fatal.
    pub fn open(probe_port: u16) -> Result<Self, TraceError> {
        let socket = match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
            Ok(socket) => socket,
            Err(err) if err.raw_os_error() == Some(libc::EPERM) => {
                return Ok(Self {
                    socket: None,
                    probe_port,
                    buf: Vec::new(),
                })
            }
            Err(err) => return Err(TraceError::SocketCreation(err)),
        };
        socket
            .set_nonblocking(true)
            .map_err(TraceError::SocketCreation)?;
        let socket = AsyncFd::new(socket).map_err(TraceError::SocketCreation)?;

        Ok(Self {
            socket: Some(socket),
            probe_port,
            buf: vec![0u8; MTU],
        })
    }
}

#[async_trait]
impl IcmpListener for RawListener {
    async fn read(
        &mut self,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<IcmpPacket, TraceError> {
        let probe_port = self.probe_port;
        let Self { socket, buf, .. } = self;
        let socket = socket.as_ref().ok_or(TraceError::IcmpNotAvailable)?;

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return Err(TraceError::Cancelled),
                res = tokio::time::timeout_at(deadline, recv_from(socket, buf)) => res,
            };
            let (n, from) = match received {
                Err(_elapsed) => return Err(TraceError::DeadlineExceeded),
                Ok(Err(err)) => return Err(TraceError::IcmpRead(err)),
                Ok(Ok(read)) => read,
            };

            let reply = match packet::parse_raw_reply(&buf[..n]) {
                Ok(reply) => reply,
                Err(err) => {
                    error!(error = %err, "Failed to decode ICMP packet");
                    continue;
                }
            };

            if reply.probe_port != probe_port {
                debug!(
                    expected_port = probe_port,
                    received_port = reply.probe_port,
                    "Received ICMP message for another probe, ignoring"
                );
                continue;
            }

            debug!(
                icmp_type = reply.icmp_type,
                router = %from,
                port = reply.probe_port,
                reached = reply.reached(),
                "Received ICMP packet"
            );
            return Ok(IcmpPacket {
                from,
                port: reply.probe_port,
                reached: reply.reached(),
            });
        }
    }
}

/// One packet off the raw socket, suspended on readiness rather than
/// polling.
async fn recv_from(socket: &AsyncFd<Socket>, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    loop {
        let mut guard = socket.readable().await?;
        let res = guard.try_io(|inner| {
            // socket2 reads into uninitialized memory; the buffer is
            // already zeroed so the cast is sound.
            let uninit =
                unsafe { &mut *(&mut *buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
            inner.get_ref().recv_from(uninit)
        });
        match res {
            Ok(Ok((n, addr))) => {
                let addr = addr
                    .as_socket()
                    .ok_or_else(|| io::Error::other("invalid source address"))?;
                return Ok((n, addr));
            }
            Ok(Err(err)) => return Err(err),
            Err(_would_block) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn degraded_listener_reports_icmp_unavailable() {
        let mut listener = RawListener {
            socket: None,
            probe_port: 31000,
            buf: Vec::new(),
        };
        let deadline = Instant::now() + Duration::from_millis(10);
        let err = listener
            .read(&CancellationToken::new(), deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, TraceError::IcmpNotAvailable));
    }

    #[tokio::test]
    async fn open_requires_net_raw() {
        // Succeeds with CAP_NET_RAW; degrades (and still constructs) without.
        match RawListener::open(31000) {
            Ok(_) => {}
            Err(err) => panic!("open must degrade rather than fail on EPERM: {err}"),
        }
    }
}
