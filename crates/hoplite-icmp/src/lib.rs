//! ICMP reply listeners.
//!
//! Two implementations of [`IcmpListener`] exist, chosen by capability at
//! tracer construction:
//!
//! - [`RawListener`] reads ICMP packets from a raw socket and requires
//!   `CAP_NET_RAW`. Used by the TCP engine to observe intermediate routers.
//! - [`ErrQueueListener`] reads kernel-queued ICMP errors from a UDP
//!   socket's error queue via `MSG_ERRQUEUE` and needs no capability.
//!
//! The two do not share state; they are capability sets, not a hierarchy.

mod errqueue;
mod packet;
mod raw;

pub use errqueue::ErrQueueListener;
pub use raw::RawListener;

use async_trait::async_trait;
use hoplite_core::TraceError;
use std::net::SocketAddr;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// An ICMP reply correlated to one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpPacket {
    /// The device (typically a router) that answered the probe.
    pub from: SocketAddr,
    /// Port parsed from the transport header quoted in the ICMP message.
    pub port: u16,
    /// True iff the message is Destination Unreachable with code
    /// Port Unreachable, meaning the destination itself answered.
    pub reached: bool,
}

/// Reads ICMP replies for a single probe.
#[async_trait]
pub trait IcmpListener: Send {
    /// Waits for the next matching reply.
    ///
    /// Returns [`TraceError::DeadlineExceeded`] once `deadline` passes and
    /// [`TraceError::Cancelled`] when the token fires.
    async fn read(
        &mut self,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<IcmpPacket, TraceError>;
}
