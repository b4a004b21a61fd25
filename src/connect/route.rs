//! A single connection attempt: an address through a proxy to one socket
//! address.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::connect::{Address, Proxy};

/// One concrete way to reach an origin: the address, the proxy to go
/// through (possibly `Direct`), and a resolved IP and port to dial.
#[derive(Clone)]
pub struct Route {
    address: Arc<Address>,
    proxy: Proxy,
    socket_address: SocketAddr,
}

impl Route {
    pub(crate) fn new(address: Arc<Address>, proxy: Proxy, socket_address: SocketAddr) -> Route {
        Route {
            address,
            proxy,
            socket_address,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn address_arc(&self) -> &Arc<Address> {
        &self.address
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn socket_address(&self) -> SocketAddr {
        self.socket_address
    }

    /// True when this route carries HTTPS through an HTTP proxy and must
    /// open a CONNECT tunnel first.
    pub fn requires_tunnel(&self) -> bool {
        self.address.is_https() && matches!(self.proxy, Proxy::Http { .. })
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Route) -> bool {
        self.address == other.address
            && self.proxy == other.proxy
            && self.socket_address == other.socket_address
    }
}

impl Eq for Route {}

impl Hash for Route {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.proxy.hash(state);
        self.socket_address.hash(state);
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Route({} via {})", self.socket_address, self.proxy)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}, {}", self.address.url().host(), self.address.url().port(), self.socket_address)
    }
}
