//! Core types for traceroute operations.

use crate::retry::RetryConfig;
use crate::TraceError;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;

/// Protocol used for probing a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(TraceError::UnknownProtocol(s.to_string())),
        }
    }
}

/// A traceroute destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Protocol to probe the target with.
    pub protocol: Protocol,
    /// Hostname or IPv4 literal to trace to.
    pub address: String,
    /// Destination port.
    #[serde(default)]
    pub port: u16,
}

impl Target {
    pub fn new(protocol: Protocol, address: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            address: address.into(),
            port,
        }
    }

    /// Rejects targets the engine cannot probe. The port range and the
    /// protocol set are enforced by their types, so only the address is
    /// left to check.
    pub fn validate(&self) -> Result<(), TraceError> {
        if self.address.is_empty() {
            return Err(TraceError::InvalidTarget {
                target: self.to_string(),
                reason: "address cannot be empty".into(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port != 0 {
            write!(f, "{}:{}", self.address, self.port)
        } else {
            write!(f, "{}", self.address)
        }
    }
}

/// Configuration for a traceroute run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Highest TTL to probe, in `[1, 255]`.
    pub max_ttl: u8,
    /// Deadline for each hop probe.
    pub timeout: Duration,
    /// Retry policy for failed hop probes.
    pub retry: RetryConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_ttl: 30,
            timeout: Duration::from_secs(60),
            retry: RetryConfig {
                count: 3,
                delay: Duration::from_secs(1),
            },
        }
    }
}

/// Address of a device that answered a probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopAddress {
    pub ip: String,
    #[serde(default, skip_serializing_if = "port_is_zero")]
    pub port: u16,
}

fn port_is_zero(port: &u16) -> bool {
    *port == 0
}

impl HopAddress {
    pub fn from_socket(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    /// The conventional rendering of a hop that never answered.
    pub fn star() -> Self {
        Self {
            ip: "*".into(),
            port: 0,
        }
    }
}

impl fmt::Display for HopAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port != 0 {
            write!(f, "{}:{}", self.ip, self.port)
        } else {
            write!(f, "{}", self.ip)
        }
    }
}

/// One router (or the destination) along the path, identified by the TTL
/// that elicited its reply. A hop with TTL 0 is the "no response" sentinel
/// that aggregation drops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub addr: HopAddress,
    /// Reverse-DNS name of the address, empty when the lookup yields nothing.
    #[serde(default)]
    pub name: String,
    pub ttl: u8,
    /// True when the reply came from the destination itself rather than an
    /// intermediate router.
    pub reached: bool,
    #[serde(with = "latency_string")]
    pub latency: Duration,
}

/// Serializes the hop latency as a human-readable duration string.
mod latency_string {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(latency: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*latency))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MAX_NAME_LEN: usize = 45;
        let addr = self.addr.to_string();
        let name = if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            &addr
        } else {
            &self.name
        };
        write!(
            f,
            "{:<2}  {:<45.45}  {}{}",
            self.ttl,
            name,
            humantime::format_duration(self.latency),
            if self.reached { "  (reached)" } else { "" }
        )
    }
}

/// The result of a traceroute run, mapping each target to its hops in
/// ascending TTL order.
///
/// Serializes as an object keyed by the target's string form, with keys in
/// deterministic order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceMap(HashMap<Target, Vec<Hop>>);

impl TraceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, target: Target, hops: Vec<Hop>) {
        self.0.insert(target, hops);
    }

    pub fn get(&self, target: &Target) -> Option<&[Hop]> {
        self.0.get(target).map(Vec::as_slice)
    }

    /// Folds another result fragment into this one, target by target.
    pub fn merge(&mut self, other: TraceMap) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Target, &Vec<Hop>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for TraceMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let ordered: BTreeMap<String, &Vec<Hop>> = self
            .0
            .iter()
            .map(|(target, hops)| (target.to_string(), hops))
            .collect();
        let mut map = serializer.serialize_map(Some(ordered.len()))?;
        for (key, hops) in ordered {
            map.serialize_entry(&key, hops)?;
        }
        map.end()
    }
}

/// A single-TTL view of a target, handed to a tracer for one probe.
///
/// Carries the sending half of the per-target hop channel. A tracer emits
/// at most one hop per probe; the channel is owned by the hop engine and
/// closes only once every TTL worker has finished.
#[derive(Debug, Clone)]
pub struct Probe {
    pub target: Target,
    /// TTL this probe must set, `>= 1`.
    pub ttl: u8,
    tx: mpsc::Sender<Hop>,
}

impl Probe {
    pub fn new(target: Target, ttl: u8, tx: mpsc::Sender<Hop>) -> Self {
        Self { target, ttl, tx }
    }

    /// Records the hop discovered by this probe. Hops emitted after the
    /// collector has gone away are dropped silently.
    pub async fn emit(&self, hop: Hop) {
        let _ = self.tx.send(hop).await;
    }
}
