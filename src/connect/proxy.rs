//! Proxy kinds and the selector that orders them.

use std::fmt;

use crate::http::Url;

/// How a connection reaches the origin server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Proxy {
    /// No proxy: connect to the origin directly.
    Direct,
    /// An HTTP proxy. Cleartext requests are forwarded in absolute form;
    /// HTTPS requests open a CONNECT tunnel.
    Http { host: String, port: u16 },
    /// A SOCKS proxy. Enumerable and comparable, but this engine does not
    /// ship a SOCKS transport; dialing one fails with a clear error.
    Socks { host: String, port: u16 },
}

impl Proxy {
    pub fn http(host: impl Into<String>, port: u16) -> Proxy {
        Proxy::Http {
            host: host.into(),
            port,
        }
    }

    pub fn socks(host: impl Into<String>, port: u16) -> Proxy {
        Proxy::Socks {
            host: host.into(),
            port,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Proxy::Direct)
    }

    pub(crate) fn host_and_port(&self) -> Option<(&str, u16)> {
        match self {
            Proxy::Direct => None,
            Proxy::Http { host, port } | Proxy::Socks { host, port } => Some((host, *port)),
        }
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proxy::Direct => f.write_str("DIRECT"),
            Proxy::Http { host, port } => write!(f, "HTTP @ {}:{}", host, port),
            Proxy::Socks { host, port } => write!(f, "SOCKS @ {}:{}", host, port),
        }
    }
}

/// Chooses the proxies to attempt for a URL, in order.
pub trait ProxySelector: Send + Sync {
    fn select(&self, url: &Url) -> Vec<Proxy>;

    /// Notifies that `proxy` failed to serve `url`. Selectors may use this
    /// to deprioritize the proxy for future calls.
    fn connect_failed(&self, url: &Url, proxy: &Proxy) {
        let _ = (url, proxy);
    }
}

impl fmt::Debug for dyn ProxySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("ProxySelector")
    }
}

/// Selects no proxy for any URL.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProxy;

impl ProxySelector for NoProxy {
    fn select(&self, _url: &Url) -> Vec<Proxy> {
        vec![Proxy::Direct]
    }
}
