//! DNS lookups used by the session and the relay.

use crate::{Error, Result};
use hickory_resolver::TokioResolver;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

/// Boxed, sendable future returned by the lookup traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Finds the mail exchangers for a domain.
pub trait MxResolver: Send + Sync {
    /// Returns candidate hosts, most preferred first.
    ///
    /// A domain without MX records yields the domain itself (implicit MX).
    fn mail_exchangers<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;
}

/// Maps a client address back to a host name.
pub trait ReverseDns: Send + Sync {
    /// Returns the first PTR name, or `None` if there is none or the lookup
    /// failed.
    fn hostname(&self, ip: IpAddr) -> BoxFuture<'_, Option<String>>;
}

/// Resolver backed by the system DNS configuration.
#[derive(Clone)]
pub struct SystemResolver {
    inner: TokioResolver,
    timeout: Duration,
}

impl std::fmt::Debug for SystemResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemResolver")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SystemResolver {
    /// Builds a resolver from `/etc/resolv.conf` or the platform equivalent.
    ///
    /// # Errors
    ///
    /// Returns an error if the system configuration cannot be read.
    pub fn from_system_conf() -> Result<Self> {
        let inner = TokioResolver::builder_tokio()?.build();
        Ok(Self {
            inner,
            timeout: Duration::from_secs(30),
        })
    }
}

impl MxResolver for SystemResolver {
    fn mail_exchangers<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let lookup = match tokio::time::timeout(self.timeout, self.inner.mx_lookup(domain)).await {
                Ok(Ok(lookup)) => lookup,
                Ok(Err(e)) if e.is_no_records_found() => {
                    debug!(domain, "no MX records, using implicit MX");
                    return Ok(vec![domain.to_string()]);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(Error::DnsTimeout(format!("MX {domain}")));
                }
            };

            let mut records: Vec<(u16, String)> = lookup
                .iter()
                .map(|mx| {
                    let host = mx.exchange().to_ascii();
                    (mx.preference(), host.trim_end_matches('.').to_string())
                })
                .collect();
            records.sort_by_key(|(preference, _)| *preference);

            let hosts: Vec<String> = records.into_iter().map(|(_, host)| host).collect();
            debug!(domain, ?hosts, "resolved mail exchangers");
            Ok(hosts)
        })
    }
}

impl ReverseDns for SystemResolver {
    fn hostname(&self, ip: IpAddr) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move {
            let lookup = tokio::time::timeout(self.timeout, self.inner.reverse_lookup(ip))
                .await
                .ok()?
                .ok()?;
            lookup
                .iter()
                .next()
                .map(|name| name.to_ascii().trim_end_matches('.').to_string())
        })
    }
}

/// Reverse DNS that never answers, for tests and DNS-less setups.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReverseDns;

impl ReverseDns for NoReverseDns {
    fn hostname(&self, _ip: IpAddr) -> BoxFuture<'_, Option<String>> {
        Box::pin(async { None })
    }
}
