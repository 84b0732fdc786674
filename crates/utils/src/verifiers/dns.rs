use std::net::IpAddr;

use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    error::{ResolveError, ResolveErrorKind},
    TokioAsyncResolver,
};
use tracing::warn;

use crate::{DnsResolver, VerifyError, VerifyFuture, VerifyResult};

/// [`DnsResolver`] backed by `hickory-resolver`.
pub struct HickoryResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryResolver {
    /// Uses the system resolver configuration, falling back to Cloudflare
    /// when it cannot be read.
    pub fn from_system_conf() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|error| {
            warn!(error = %error, "Failed to load system DNS config, falling back to Cloudflare");
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), ResolverOpts::default())
        });
        Self { resolver }
    }
}

/// Absolute form of `name`, so search domains are never appended.
fn fqdn(name: &str) -> String {
    format!("{}.", name.trim_end_matches('.'))
}

/// Maps an empty answer to an empty list and anything else to a fault.
fn empty_or_fault<T>(error: ResolveError) -> VerifyResult<Vec<T>> {
    match error.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
        _ => Err(VerifyError::Dns(error.to_string())),
    }
}

impl DnsResolver for HickoryResolver {
    fn txt_lookup<'a>(&'a self, name: &'a str) -> VerifyFuture<'a, Vec<String>> {
        Box::pin(async move {
            match self.resolver.txt_lookup(fqdn(name)).await {
                Ok(lookup) => Ok(lookup
                    .iter()
                    .map(|txt| {
                        txt.txt_data()
                            .iter()
                            .map(|data| String::from_utf8_lossy(data))
                            .collect::<String>()
                    })
                    .collect()),
                Err(error) => empty_or_fault(error),
            }
        })
    }

    fn ip_lookup<'a>(&'a self, name: &'a str) -> VerifyFuture<'a, Vec<IpAddr>> {
        Box::pin(async move {
            match self.resolver.lookup_ip(fqdn(name)).await {
                Ok(lookup) => Ok(lookup.iter().collect()),
                Err(error) => empty_or_fault(error),
            }
        })
    }

    fn mx_lookup<'a>(&'a self, name: &'a str) -> VerifyFuture<'a, Vec<String>> {
        Box::pin(async move {
            match self.resolver.mx_lookup(fqdn(name)).await {
                Ok(lookup) => {
                    let mut exchanges: Vec<(u16, String)> = lookup
                        .iter()
                        .map(|mx| {
                            let exchange = mx.exchange().to_utf8();
                            (mx.preference(), exchange.trim_end_matches('.').to_string())
                        })
                        .collect();
                    exchanges.sort_by_key(|(preference, _)| *preference);
                    Ok(exchanges.into_iter().map(|(_, exchange)| exchange).collect())
                }
                Err(error) => empty_or_fault(error),
            }
        })
    }
}
