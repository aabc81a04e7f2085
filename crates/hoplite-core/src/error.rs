//! Error types for traceroute operations.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Main error type for traceroute operations.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("invalid target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("failed to resolve {host}: {reason}")]
    Resolution { host: String, reason: String },

    #[error("failed to create socket: {0}")]
    SocketCreation(#[source] io::Error),

    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to send probe: {0}")]
    ProbeSend(#[source] io::Error),

    /// The process lacks `CAP_NET_RAW`, so raw ICMP sockets cannot be opened.
    #[error("no NET_RAW capability, ICMP not available")]
    IcmpNotAvailable,

    #[error("failed to read ICMP message: {0}")]
    IcmpRead(#[source] io::Error),

    #[error("read deadline exceeded")]
    DeadlineExceeded,

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl TraceError {
    /// Returns true for the errors the engine anticipates during a normal
    /// trace: missing raw-socket capability and probes that outlive their
    /// deadline. Everything else indicates a genuine failure.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::IcmpNotAvailable | Self::DeadlineExceeded)
    }
}
