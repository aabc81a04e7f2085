//! Userland traceroute to one or more `(host, port)` targets.
//!
//! The engine discovers per-hop routers by capping the IP TTL of outgoing
//! probes and correlating the ICMP replies the network sends back. TCP
//! probes dial the target with an incrementing TTL and read router replies
//! from a raw ICMP socket; UDP probes need no raw socket at all, reading
//! the kernel's error queue instead. Every TTL is probed concurrently with
//! bounded retries and deadlines, and each target ends up with a stable,
//! deduplicated, ordered hop list.
//!
//! Key properties:
//!
//! - Works without `CAP_NET_RAW` for UDP targets; TCP targets degrade to
//!   an explicit capability error for intermediate hops
//! - Concurrency via cooperatively cancelled tasks: cancelling the token
//!   passed to [`Client::run`] unwinds every in-flight probe
//! - Configurable retry policy, per-hop timeout, and maximum TTL via
//!   [`Options`]
//! - Results serialize to JSON keyed by target, with human-readable
//!   latencies
//!
//! Typical usage:
//!
//! ```no_run
//! use hoplite::{Client, Protocol, Target};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), hoplite::TraceError> {
//! let client = Client::new();
//! let targets = vec![Target::new(Protocol::Tcp, "8.8.8.8", 53)];
//! let result = client
//!     .run(&CancellationToken::new(), &targets, None)
//!     .await?;
//! for (target, hops) in result.iter() {
//!     println!("{target}: {} hops", hops.len());
//! }
//! # Ok(())
//! # }
//! ```

pub use hoplite_core::{
    collect, dns, retry, Hop, HopAddress, Options, Probe, Protocol, RetryConfig, Target,
    TraceError, TraceMap, Tracer,
};
pub use hoplite_tcp::TcpTracer;
pub use hoplite_udp::UdpTracer;

use hoplite_core::run_targets;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs traceroutes against one or more targets, dispatching each to the
/// engine for its protocol.
pub struct Client {
    tcp: Arc<TcpTracer>,
    udp: Arc<UdpTracer>,
}

impl Client {
    /// Creates a client with the system resolver behind both engines.
    pub fn new() -> Self {
        let resolver = Arc::new(dns::resolver());
        Self {
            tcp: Arc::new(TcpTracer::new(Arc::clone(&resolver))),
            udp: Arc::new(UdpTracer::new(resolver)),
        }
    }

    /// Executes the traceroute for the given targets.
    ///
    /// Every target is validated up front; a validation failure names the
    /// offending target and no probes are sent. Protocol groups run
    /// concurrently on a child of `cancel`: the first failure cancels the
    /// sibling group, discards buffered fragments, and is returned.
    /// Omitted options fall back to [`Options::default`].
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        targets: &[Target],
        opts: Option<Options>,
    ) -> Result<TraceMap, TraceError> {
        let opts = opts.unwrap_or_default();
        let groups = group_targets(targets)?;
        tracing::debug!(
            targets = targets.len(),
            max_ttl = opts.max_ttl,
            timeout = %humantime::format_duration(opts.timeout),
            "Starting traceroute run"
        );

        let child = cancel.child_token();
        let mut tasks: JoinSet<Result<TraceMap, TraceError>> = JoinSet::new();
        for (protocol, group) in groups {
            let cancel = child.clone();
            match protocol {
                Protocol::Tcp => {
                    let tracer = Arc::clone(&self.tcp);
                    tasks.spawn(async move {
                        run_targets(tracer, &cancel, &group, &opts).await
                    });
                }
                Protocol::Udp => {
                    let tracer = Arc::clone(&self.udp);
                    tasks.spawn(async move {
                        run_targets(tracer, &cancel, &group, &opts).await
                    });
                }
            }
        }

        let mut merged = TraceMap::new();
        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(fragment)) => merged.merge(fragment),
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                        child.cancel();
                    }
                }
                Err(err) if err.is_cancelled() => {
                    if first_err.is_none() {
                        first_err = Some(TraceError::Cancelled);
                    }
                }
                Err(err) => std::panic::resume_unwind(err.into_panic()),
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(merged),
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// Validates every target and groups them by protocol.
fn group_targets(targets: &[Target]) -> Result<HashMap<Protocol, Vec<Target>>, TraceError> {
    let mut groups: HashMap<Protocol, Vec<Target>> = HashMap::new();
    for target in targets {
        target.validate()?;
        groups.entry(target.protocol).or_default().push(target.clone());
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_group_by_protocol() {
        let targets = [
            Target::new(Protocol::Tcp, "8.8.8.8", 53),
            Target::new(Protocol::Udp, "1.1.1.1", 33434),
            Target::new(Protocol::Tcp, "9.9.9.9", 443),
        ];
        let groups = group_targets(&targets).unwrap();
        assert_eq!(groups[&Protocol::Tcp].len(), 2);
        assert_eq!(groups[&Protocol::Udp].len(), 1);
    }

    #[test]
    fn one_invalid_target_fails_the_whole_group() {
        let targets = [
            Target::new(Protocol::Tcp, "8.8.8.8", 53),
            Target::new(Protocol::Udp, "", 33434),
        ];
        let err = group_targets(&targets).unwrap_err();
        assert!(err.to_string().contains("address cannot be empty"));
    }

    #[tokio::test]
    async fn run_rejects_invalid_targets_before_probing() {
        let client = Client::new();
        let targets = [
            Target::new(Protocol::Tcp, "8.8.8.8", 53),
            Target::new(Protocol::Tcp, "", 80),
        ];
        let err = client
            .run(&CancellationToken::new(), &targets, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TraceError::InvalidTarget { .. }));
    }

    #[tokio::test]
    async fn empty_target_list_yields_an_empty_result() {
        let client = Client::new();
        let result = client
            .run(&CancellationToken::new(), &[], None)
            .await
            .unwrap();
        assert!(result.is_empty());
    }
}
