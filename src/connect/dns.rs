//! Name resolution behind a trait, so tests and embedders can substitute
//! their own resolver.

use std::fmt;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};

use crate::error::{Error, Result};

/// Resolves a hostname into an ordered list of IP addresses.
///
/// The returned order matters: the route selector dials addresses in order,
/// optionally interleaved by family for fast fallback.
pub trait Dns: Send + Sync {
    fn lookup(&self, hostname: &str) -> io::Result<Vec<IpAddr>>;
}

impl fmt::Debug for dyn Dns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Dns")
    }
}

/// The operating system's resolver.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemDns;

impl Dns for SystemDns {
    fn lookup(&self, hostname: &str) -> io::Result<Vec<IpAddr>> {
        tracing::debug!("resolve {:?}", hostname);
        let addrs = (hostname, 0u16).to_socket_addrs()?;
        Ok(addrs.map(|sa| sa.ip()).collect())
    }
}

/// Runs a lookup, mapping failures and empty answers to `UnknownHost`.
pub(crate) fn lookup(dns: &dyn Dns, hostname: &str) -> Result<Vec<IpAddr>> {
    match dns.lookup(hostname) {
        Ok(addresses) if addresses.is_empty() => Err(Error::unknown_host(format!(
            "{} returned no addresses",
            hostname
        ))),
        Ok(addresses) => Ok(addresses),
        Err(cause) => Err(Error::unknown_host(hostname).with(cause)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_resolves() {
        let addresses = SystemDns.lookup("localhost").unwrap();
        assert!(!addresses.is_empty());
    }

    #[test]
    fn empty_answer_is_unknown_host() {
        struct EmptyDns;
        impl Dns for EmptyDns {
            fn lookup(&self, _hostname: &str) -> io::Result<Vec<IpAddr>> {
                Ok(Vec::new())
            }
        }
        let err = lookup(&EmptyDns, "example.com").unwrap_err();
        assert!(err.is_unknown_host());
    }
}
