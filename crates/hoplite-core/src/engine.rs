//! The per-target hop engine.
//!
//! For every target the engine opens a bounded hop channel, launches one
//! worker per TTL, and aggregates whatever the workers deliver. Ordering is
//! restored by the aggregator, never assumed at production time.

use crate::collect;
use crate::retry;
use crate::types::{Hop, Options, Probe, Target, TraceMap};
use crate::TraceError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument};

/// A protocol-specific probe engine.
///
/// One `trace` call performs a single TTL-bounded probe and emits at most
/// one hop on the probe's channel. A returned error means no hop was
/// produced; the caller decides whether to retry.
#[async_trait]
pub trait Tracer: Send + Sync {
    async fn trace(
        &self,
        cancel: &CancellationToken,
        probe: Probe,
        opts: &Options,
    ) -> Result<(), TraceError>;
}

/// Runs the hop engine for every target against one tracer.
///
/// Targets run concurrently, as do the TTL workers within each target. A
/// worker's terminal failure is recorded on its span and yields no hop;
/// only cancellation fails the run as a whole.
pub async fn run_targets<T>(
    tracer: Arc<T>,
    cancel: &CancellationToken,
    targets: &[Target],
    opts: &Options,
) -> Result<TraceMap, TraceError>
where
    T: Tracer + 'static,
{
    let mut tasks: JoinSet<(Target, Vec<Hop>)> = JoinSet::new();
    for target in targets {
        let tracer = Arc::clone(&tracer);
        let cancel = cancel.clone();
        let target = target.clone();
        let opts = *opts;
        tasks.spawn(async move {
            let hops = trace_target(tracer, cancel, target.clone(), opts).await;
            (target, hops)
        });
    }

    let mut result = TraceMap::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((target, hops)) => {
                for hop in &hops {
                    debug!(target = %target, "{hop}");
                }
                result.insert(target, hops);
            }
            Err(err) if err.is_cancelled() => return Err(TraceError::Cancelled),
            Err(err) => std::panic::resume_unwind(err.into_panic()),
        }
    }

    if cancel.is_cancelled() {
        return Err(TraceError::Cancelled);
    }
    Ok(result)
}

/// Fans one target out into per-TTL workers and aggregates their hops.
async fn trace_target<T>(
    tracer: Arc<T>,
    cancel: CancellationToken,
    target: Target,
    opts: Options,
) -> Vec<Hop>
where
    T: Tracer + 'static,
{
    let capacity = usize::from(opts.max_ttl.max(1));
    let (tx, rx) = mpsc::channel(capacity);

    let mut workers = JoinSet::new();
    for ttl in 1..=opts.max_ttl {
        let tracer = Arc::clone(&tracer);
        let cancel = cancel.clone();
        let probe = Probe::new(target.clone(), ttl, tx.clone());
        let span = tracing::debug_span!("hop_probe", target = %probe.target, ttl);
        workers.spawn(
            async move {
                let outcome = retry::retry(&cancel, opts.retry, || {
                    tracer.trace(&cancel, probe.clone(), &opts)
                })
                .await;
                if let Err(err) = outcome {
                    error!(error = %err, "Failed to execute hop trace");
                }
            }
            .instrument(span),
        );
    }
    // The collector observes the channel closing once the last worker (and
    // its probe handle) is gone.
    drop(tx);

    let hops = collect::collect(rx).await;
    while workers.join_next().await.is_some() {}
    hops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HopAddress, Protocol};
    use crate::RetryConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn options(max_ttl: u8) -> Options {
        Options {
            max_ttl,
            timeout: Duration::from_millis(100),
            retry: RetryConfig {
                count: 0,
                delay: Duration::from_millis(1),
            },
        }
    }

    fn target() -> Target {
        Target::new(Protocol::Tcp, "192.0.2.1", 443)
    }

    /// Answers every TTL, marking `reached_at` as the destination.
    struct FakeTracer {
        reached_at: u8,
    }

    #[async_trait]
    impl Tracer for FakeTracer {
        async fn trace(
            &self,
            _cancel: &CancellationToken,
            probe: Probe,
            _opts: &Options,
        ) -> Result<(), TraceError> {
            probe
                .emit(Hop {
                    addr: HopAddress {
                        ip: format!("10.0.0.{}", probe.ttl),
                        port: 0,
                    },
                    name: String::new(),
                    ttl: probe.ttl,
                    reached: probe.ttl == self.reached_at,
                    latency: Duration::from_millis(u64::from(probe.ttl)),
                })
                .await;
            Ok(())
        }
    }

    /// Fails every probe without emitting anything.
    struct FailingTracer {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Tracer for FailingTracer {
        async fn trace(
            &self,
            _cancel: &CancellationToken,
            _probe: Probe,
            _opts: &Options,
        ) -> Result<(), TraceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TraceError::IcmpNotAvailable)
        }
    }

    /// Blocks until cancelled.
    struct StuckTracer;

    #[async_trait]
    impl Tracer for StuckTracer {
        async fn trace(
            &self,
            cancel: &CancellationToken,
            _probe: Probe,
            _opts: &Options,
        ) -> Result<(), TraceError> {
            cancel.cancelled().await;
            Err(TraceError::Cancelled)
        }
    }

    #[tokio::test]
    async fn hops_come_back_ordered_and_bounded() {
        let tracer = Arc::new(FakeTracer { reached_at: 0 });
        let opts = options(5);
        let result = run_targets(tracer, &CancellationToken::new(), &[target()], &opts)
            .await
            .unwrap();

        let hops = result.get(&target()).unwrap();
        let ttls: Vec<u8> = hops.iter().map(|h| h.ttl).collect();
        assert_eq!(ttls, [1, 2, 3, 4, 5]);
        assert!(hops.iter().all(|h| h.ttl >= 1 && h.ttl <= opts.max_ttl));
    }

    #[tokio::test]
    async fn reached_hop_ends_the_path() {
        let tracer = Arc::new(FakeTracer { reached_at: 3 });
        let result = run_targets(tracer, &CancellationToken::new(), &[target()], &options(10))
            .await
            .unwrap();

        let hops = result.get(&target()).unwrap();
        assert_eq!(hops.len(), 3);
        assert!(hops.last().unwrap().reached);
        assert!(hops.iter().take(2).all(|h| !h.reached));
    }

    #[tokio::test]
    async fn max_ttl_one_yields_at_most_one_hop() {
        let tracer = Arc::new(FakeTracer { reached_at: 0 });
        let result = run_targets(tracer, &CancellationToken::new(), &[target()], &options(1))
            .await
            .unwrap();
        assert_eq!(result.get(&target()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_probes_yield_no_hops_but_the_run_succeeds() {
        let tracer = Arc::new(FailingTracer {
            calls: AtomicU32::new(0),
        });
        let result = run_targets(
            Arc::clone(&tracer),
            &CancellationToken::new(),
            &[target()],
            &options(4),
        )
        .await
        .unwrap();

        assert!(result.get(&target()).unwrap().is_empty());
        // One attempt per TTL: the retry policy above allows no retries.
        assert_eq!(tracer.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn rerunning_is_deterministic() {
        let opts = options(6);
        let mut ttl_sets = Vec::new();
        for _ in 0..2 {
            let tracer = Arc::new(FakeTracer { reached_at: 4 });
            let result = run_targets(tracer, &CancellationToken::new(), &[target()], &opts)
                .await
                .unwrap();
            let ttls: Vec<u8> = result
                .get(&target())
                .unwrap()
                .iter()
                .map(|h| h.ttl)
                .collect();
            ttl_sets.push(ttls);
        }
        assert_eq!(ttl_sets[0], ttl_sets[1]);
    }

    #[tokio::test]
    async fn cancellation_unwinds_the_run() {
        let cancel = CancellationToken::new();
        let tracer = Arc::new(StuckTracer);

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_targets(tracer, &cancel, &[target()], &options(3)).await
            })
        };

        tokio::task::yield_now().await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run did not unwind after cancellation")
            .unwrap();
        assert!(matches!(result, Err(TraceError::Cancelled)));
    }
}
