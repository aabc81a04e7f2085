//! ICMP listener over a UDP socket's kernel error queue.
//!
//! With `IP_RECVERR` enabled the kernel parks ICMP errors on the socket's
//! error queue instead of discarding them, so no raw socket (and no
//! `CAP_NET_RAW`) is needed to observe them.

use crate::packet;
use crate::{IcmpListener, IcmpPacket};
use async_trait::async_trait;
use hoplite_core::TraceError;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const DATA_BUF_SIZE: usize = 64;
const OOB_BUF_SIZE: usize = 512;
/// The error queue has no readiness integration, so an empty queue is
/// re-checked at this interval until the deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Reads ICMP errors queued on the probe socket.
pub struct ErrQueueListener {
    socket: Arc<UdpSocket>,
    probe_port: u16,
}

/// One message drained from the error queue: the peer address reported by
/// the kernel, the quoted payload, and the raw `IP_RECVERR` control data.
struct ErrQueueMsg {
    from: Option<SocketAddr>,
    data: Vec<u8>,
    ext: Option<Vec<u8>>,
}

impl ErrQueueListener {
    /// Wraps the probe socket. The socket must have `IP_RECVERR` enabled.
    pub fn new(socket: Arc<UdpSocket>, probe_port: u16) -> Self {
        Self { socket, probe_port }
    }

    /// One non-blocking `MSG_ERRQUEUE` read. `Ok(None)` means the queue is
    /// empty.
    fn recv_err(&self) -> io::Result<Option<ErrQueueMsg>> {
        let fd = self.socket.as_raw_fd();
        let mut data = [0u8; DATA_BUF_SIZE];
        let mut oob = [0u8; OOB_BUF_SIZE];
        let mut from: libc::sockaddr_in = unsafe { std::mem::zeroed() };

        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr().cast(),
            iov_len: data.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = (&mut from as *mut libc::sockaddr_in).cast();
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = oob.as_mut_ptr().cast();
        msg.msg_controllen = oob.len() as _;

        let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }

        let mut ext = None;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let hdr = std::ptr::read_unaligned(cmsg);
                if hdr.cmsg_level == libc::SOL_IP && hdr.cmsg_type == libc::IP_RECVERR {
                    let payload = libc::CMSG_DATA(cmsg);
                    let offset = payload as usize - cmsg as usize;
                    let len = (hdr.cmsg_len as usize).saturating_sub(offset);
                    ext = Some(std::slice::from_raw_parts(payload, len).to_vec());
                    break;
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        let from = (msg.msg_namelen as usize >= std::mem::size_of::<libc::sockaddr_in>()
            && from.sin_family == libc::AF_INET as libc::sa_family_t)
            .then(|| {
                SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(u32::from_be(from.sin_addr.s_addr)),
                    u16::from_be(from.sin_port),
                ))
            });

        Ok(Some(ErrQueueMsg {
            from,
            data: data[..n as usize].to_vec(),
            ext,
        }))
    }
}

#[async_trait]
impl IcmpListener for ErrQueueListener {
    async fn read(
        &mut self,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<IcmpPacket, TraceError> {
        loop {
            match self.recv_err() {
                Ok(Some(msg)) => match classify(&msg) {
                    Ok(packet) => {
                        debug!(
                            probe_port = self.probe_port,
                            port = packet.port,
                            router = %packet.from,
                            reached = packet.reached,
                            "Received ICMP error"
                        );
                        return Ok(packet);
                    }
                    Err(err) => {
                        error!(error = %err, "Failed to decode ICMP error");
                        continue;
                    }
                },
                Ok(None) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TraceError::DeadlineExceeded);
                    }
                    let wait = POLL_INTERVAL.min(deadline - now);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TraceError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(err) => return Err(TraceError::IcmpRead(err)),
            }
        }
    }
}

/// Turns one error-queue message into an ICMP packet, accepting only
/// TimeExceeded and DestinationUnreachable.
fn classify(msg: &ErrQueueMsg) -> Result<IcmpPacket, TraceError> {
    let port = packet::quoted_dst_port(&msg.data)?;

    let ext = msg.ext.as_deref().ok_or_else(|| {
        TraceError::MalformedPacket("no SOL_IP/IP_RECVERR control message found".into())
    })?;
    let ee = packet::parse_sock_extended_err(ext)?;

    let reached = match ee.icmp_type {
        packet::ICMP_TIME_EXCEEDED => false,
        packet::ICMP_DEST_UNREACHABLE => ee.icmp_code == packet::ICMP_CODE_PORT_UNREACHABLE,
        other => {
            return Err(TraceError::MalformedPacket(format!(
                "unexpected ICMP type {} with code {}",
                other, ee.icmp_code
            )))
        }
    };

    let from = msg
        .from
        .ok_or_else(|| TraceError::MalformedPacket("missing peer address".into()))?;

    Ok(IcmpPacket {
        from,
        port,
        reached,
    })
}
