//! Forward and reverse DNS for targets and hops.

use crate::types::Target;
use crate::TraceError;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use std::net::{IpAddr, SocketAddr};

/// Builds the resolver shared by the protocol engines.
pub fn resolver() -> TokioResolver {
    TokioResolver::builder_with_config(
        ResolverConfig::default(),
        TokioConnectionProvider::default(),
    )
    .build()
}

/// Resolves a target to a socket address.
///
/// IP literals short-circuit the resolver. IPv6 addresses are rejected;
/// the engine only probes over IPv4.
pub async fn resolve_target(
    resolver: &TokioResolver,
    target: &Target,
) -> Result<SocketAddr, TraceError> {
    let ip = resolve_host(resolver, &target.address).await?;
    Ok(SocketAddr::new(ip, target.port))
}

async fn resolve_host(resolver: &TokioResolver, host: &str) -> Result<IpAddr, TraceError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        if ip.is_ipv6() {
            return Err(TraceError::Resolution {
                host: host.to_string(),
                reason: "ipv6 targets are not supported".into(),
            });
        }
        return Ok(ip);
    }

    let lookup = resolver
        .lookup_ip(host)
        .await
        .map_err(|err| TraceError::Resolution {
            host: host.to_string(),
            reason: err.to_string(),
        })?;

    lookup
        .iter()
        .find(IpAddr::is_ipv4)
        .ok_or_else(|| TraceError::Resolution {
            host: host.to_string(),
            reason: "no IPv4 addresses found".into(),
        })
}

/// Reverse-DNS name for a hop address. Returns an empty string when the
/// lookup fails or yields no names.
pub async fn reverse_name(resolver: &TokioResolver, ip: IpAddr) -> String {
    match resolver.reverse_lookup(ip).await {
        Ok(names) => names
            .iter()
            .next()
            .map(|name| name.to_string())
            .unwrap_or_default(),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;

    #[tokio::test]
    async fn ip_literals_bypass_the_resolver() {
        let resolver = resolver();
        let target = Target::new(Protocol::Tcp, "8.8.8.8", 53);
        let addr = resolve_target(&resolver, &target).await.unwrap();
        assert_eq!(addr, "8.8.8.8:53".parse().unwrap());
    }

    #[tokio::test]
    async fn ipv6_literals_are_rejected() {
        let resolver = resolver();
        let target = Target::new(Protocol::Tcp, "::1", 53);
        let err = resolve_target(&resolver, &target).await.unwrap_err();
        assert!(err.to_string().contains("ipv6"));
    }
}
