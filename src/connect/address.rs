//! The specification of a server endpoint, used as the connection-pool key.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::connect::auth::Authenticator;
use crate::connect::tls::{CertificatePinner, HostnameVerifier, TlsConnector};
use crate::connect::{ConnectionSpec, Dns, Protocol, Proxy, ProxySelector};
use crate::http::Url;

/// Everything needed to connect to an origin server: its coordinates plus
/// the protocols, TLS configuration, proxy policy, and resolver to use.
///
/// Two calls may share a connection exactly when their addresses are equal.
#[derive(Clone)]
pub struct Address {
    url: Url,
    protocols: Vec<Protocol>,
    connection_specs: Vec<ConnectionSpec>,
    dns: Arc<dyn Dns>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    proxy_authenticator: Arc<dyn Authenticator>,
    tls: Option<AddressTls>,
}

/// The TLS capabilities of an `https` address.
#[derive(Clone)]
pub(crate) struct AddressTls {
    pub(crate) connector: Arc<dyn TlsConnector>,
    pub(crate) hostname_verifier: Arc<dyn HostnameVerifier>,
    pub(crate) certificate_pinner: Arc<dyn CertificatePinner>,
}

impl Address {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        scheme: &str,
        host: &str,
        port: u16,
        protocols: Vec<Protocol>,
        connection_specs: Vec<ConnectionSpec>,
        dns: Arc<dyn Dns>,
        proxy: Option<Proxy>,
        proxy_selector: Arc<dyn ProxySelector>,
        proxy_authenticator: Arc<dyn Authenticator>,
        tls: Option<AddressTls>,
    ) -> Address {
        let authority = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };
        let url = Url::parse(&format!("{}://{}:{}/", scheme, authority, port))
            .expect("scheme, host, and port were already validated");
        Address {
            url,
            protocols,
            connection_specs,
            dns,
            proxy,
            proxy_selector,
            proxy_authenticator,
            tls,
        }
    }

    /// A URL with the scheme, host, and port of this address and the root
    /// path.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    pub fn connection_specs(&self) -> &[ConnectionSpec] {
        &self.connection_specs
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    pub(crate) fn dns(&self) -> &Arc<dyn Dns> {
        &self.dns
    }

    pub(crate) fn proxy_selector(&self) -> &Arc<dyn ProxySelector> {
        &self.proxy_selector
    }

    pub(crate) fn proxy_authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.proxy_authenticator
    }

    pub(crate) fn tls(&self) -> Option<&AddressTls> {
        self.tls.as_ref()
    }

    pub fn is_https(&self) -> bool {
        self.tls.is_some()
    }

    /// True when every field but the host matches. Such addresses can share
    /// an HTTP/2 connection whose certificate covers both hosts.
    pub(crate) fn equals_non_host(&self, other: &Address) -> bool {
        self.url.port() == other.url.port()
            && self.url.scheme() == other.url.scheme()
            && self.protocols == other.protocols
            && self.connection_specs == other.connection_specs
            && self.proxy == other.proxy
            && Arc::ptr_eq(&self.dns, &other.dns)
            && Arc::ptr_eq(&self.proxy_selector, &other.proxy_selector)
            && Arc::ptr_eq(&self.proxy_authenticator, &other.proxy_authenticator)
            && match (&self.tls, &other.tls) {
                (None, None) => true,
                (Some(a), Some(b)) => {
                    Arc::ptr_eq(&a.connector, &b.connector)
                        && Arc::ptr_eq(&a.hostname_verifier, &b.hostname_verifier)
                        && Arc::ptr_eq(&a.certificate_pinner, &b.certificate_pinner)
                }
                _ => false,
            }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Address) -> bool {
        self.url.host() == other.url.host() && self.equals_non_host(other)
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.host().hash(state);
        self.url.port().hash(state);
        self.url.scheme().hash(state);
        self.proxy.hash(state);
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Address");
        s.field("host", &self.url.host());
        s.field("port", &self.url.port());
        match self.proxy {
            Some(ref proxy) => s.field("proxy", &format_args!("{}", proxy)),
            None => s.field("proxySelector", &self.proxy_selector),
        };
        s.finish()
    }
}
