//! Route planning: from an address and proxy policy to ordered connection
//! attempts.

pub(crate) mod address;
pub(crate) mod auth;
pub(crate) mod dns;
pub(crate) mod proxy;
pub(crate) mod route;
pub(crate) mod route_database;
pub(crate) mod route_selector;
pub(crate) mod tls;

pub use self::address::Address;
pub use self::auth::{basic_credentials, Authenticator, NoAuthentication};
pub use self::dns::{Dns, SystemDns};
pub use self::proxy::{NoProxy, Proxy, ProxySelector};
pub use self::route::Route;
pub use self::tls::{
    CertificatePinner, ConnectionSpec, Handshake, HostnameVerifier, TlsConnector, TlsFailure,
    TlsFailureKind, TlsTransport, TlsVersion,
};

pub(crate) use self::route_database::RouteDatabase;
pub(crate) use self::route_selector::{RouteSelector, Selection};

use std::fmt;

use crate::error::{Error, Result};

/// A wire protocol negotiated for a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http10,
    Http11,
    /// HTTP/2 negotiated via ALPN.
    H2,
    /// HTTP/2 over cleartext, without protocol negotiation. When configured
    /// it must be the only protocol in the list.
    H2PriorKnowledge,
}

impl Protocol {
    /// The identifier used in ALPN and `Alt-Svc`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http10 => "http/1.0",
            Protocol::Http11 => "http/1.1",
            Protocol::H2 => "h2",
            Protocol::H2PriorKnowledge => "h2_prior_knowledge",
        }
    }

    pub fn parse(input: &str) -> Result<Protocol> {
        match input {
            "http/1.0" => Ok(Protocol::Http10),
            "http/1.1" => Ok(Protocol::Http11),
            "h2" => Ok(Protocol::H2),
            "h2_prior_knowledge" => Ok(Protocol::H2PriorKnowledge),
            _ => Err(Error::bad_config(format!("unexpected protocol: {}", input))),
        }
    }

    /// True when a single connection may carry concurrent exchanges.
    pub(crate) fn multiplexed(&self) -> bool {
        matches!(self, Protocol::H2 | Protocol::H2PriorKnowledge)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
