//! Hop aggregation: ordering, de-duplication, and early termination.

use crate::types::Hop;
use tokio::sync::mpsc;

/// Drains the hop channel until every producer has finished, then
/// normalizes the collected hops.
pub async fn collect(mut rx: mpsc::Receiver<Hop>) -> Vec<Hop> {
    let mut hops = Vec::new();
    while let Some(hop) = rx.recv().await {
        hops.push(hop);
    }
    normalize(hops)
}

/// Drops "no response" sentinels (TTL 0), sorts by TTL ascending, removes
/// duplicate TTLs keeping the first occurrence, and cuts the path after the
/// first reached hop.
///
/// Hops arrive unordered, so a low-TTL worker may deliver after a
/// higher-TTL reached hop; sorting before truncating keeps the result
/// deterministic regardless of arrival order.
pub fn normalize(mut hops: Vec<Hop>) -> Vec<Hop> {
    hops.retain(|hop| hop.ttl != 0);
    hops.sort_by_key(|hop| hop.ttl);

    let mut out: Vec<Hop> = Vec::with_capacity(hops.len());
    for hop in hops {
        if out.last().is_some_and(|last| last.ttl == hop.ttl) {
            continue;
        }
        let reached = hop.reached;
        out.push(hop);
        if reached {
            break;
        }
    }
    out
}
