//! Enumerates the routes to attempt for an address, in order.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::connect::dns;
use crate::connect::{Address, Proxy, Route, RouteDatabase};
use crate::error::{Error, Result};

/// Walks `{proxy} × {resolved IP}` in attempt order.
///
/// Proxies are enumerated first: the address's explicit proxy if set,
/// otherwise whatever the proxy selector returns with `Direct` appended only
/// when the selector offered nothing else. Each proxy's IPs form one
/// [`Selection`]; routes that recently failed sort to the back of their
/// selection.
pub(crate) struct RouteSelector {
    address: Arc<Address>,
    route_database: Arc<RouteDatabase>,
    fast_fallback: bool,
    proxies: Vec<Proxy>,
    next_proxy_index: usize,
    postponed_routes: Vec<Route>,
    deferred_error: Option<Error>,
}

impl RouteSelector {
    pub(crate) fn new(
        address: Arc<Address>,
        route_database: Arc<RouteDatabase>,
        fast_fallback: bool,
    ) -> RouteSelector {
        let proxies = select_proxies(&address);
        tracing::debug!(
            "proxies for {}: {:?}",
            address.url().redact(),
            proxies.iter().map(|p| p.to_string()).collect::<Vec<_>>()
        );
        RouteSelector {
            address,
            route_database,
            fast_fallback,
            proxies,
            next_proxy_index: 0,
            postponed_routes: Vec::new(),
            deferred_error: None,
        }
    }

    pub(crate) fn has_next(&self) -> bool {
        self.next_proxy_index < self.proxies.len() || !self.postponed_routes.is_empty()
    }

    pub(crate) fn next(&mut self) -> Result<Selection> {
        let mut routes = Vec::new();

        while self.next_proxy_index < self.proxies.len() {
            let proxy = self.proxies[self.next_proxy_index].clone();
            self.next_proxy_index += 1;

            let resolved = match self.resolve(&proxy) {
                Ok(resolved) => resolved,
                Err(e) => {
                    self.address.proxy_selector().connect_failed(self.address.url(), &proxy);
                    if self.next_proxy_index < self.proxies.len() {
                        // Try the next proxy; keep the error in case every
                        // proxy fails to resolve.
                        self.deferred_error.get_or_insert(e);
                        continue;
                    }
                    let err = self.deferred_error.take().unwrap_or(e);
                    if !self.postponed_routes.is_empty() {
                        // Failed routes remain; surface them instead.
                        self.deferred_error = Some(err);
                        break;
                    }
                    return Err(err);
                }
            };

            for socket_address in resolved {
                let route = Route::new(self.address.clone(), proxy.clone(), socket_address);
                if self.route_database.should_postpone(&route) {
                    self.postponed_routes.push(route);
                } else {
                    routes.push(route);
                }
            }

            if !routes.is_empty() {
                return Ok(Selection::new(routes));
            }
        }

        if routes.is_empty() {
            // Every remaining route has failed before. Try them anyway.
            routes.append(&mut self.postponed_routes);
        }

        if routes.is_empty() {
            return Err(self
                .deferred_error
                .take()
                .unwrap_or_else(|| Error::unknown_host("exhausted proxy configurations")));
        }

        Ok(Selection::new(routes))
    }

    /// Resolves socket addresses for one proxy: the origin host for direct
    /// connections, the proxy host otherwise. HTTP proxy sockets carry the
    /// proxy's port; the origin's port rides inside the request.
    fn resolve(&self, proxy: &Proxy) -> Result<Vec<SocketAddr>> {
        let (host, port) = match proxy.host_and_port() {
            None => (self.address.url().host(), self.address.url().port()),
            Some((host, port)) => (host, port),
        };

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let mut addresses = dns::lookup(self.address.dns().as_ref(), host)?;
        if self.fast_fallback {
            addresses = interleave_by_family(addresses);
        }
        Ok(addresses.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
    }
}

impl std::fmt::Debug for RouteSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteSelector")
            .field("address", &self.address)
            .field("next_proxy_index", &self.next_proxy_index)
            .finish()
    }
}

/// The routes for a single proxy, yielded one at a time.
#[derive(Debug)]
pub(crate) struct Selection {
    routes: Vec<Route>,
    index: usize,
}

impl Selection {
    fn new(routes: Vec<Route>) -> Selection {
        Selection { routes, index: 0 }
    }

    pub(crate) fn has_next(&self) -> bool {
        self.index < self.routes.len()
    }

    pub(crate) fn next(&mut self) -> Option<Route> {
        let route = self.routes.get(self.index).cloned()?;
        self.index += 1;
        Some(route)
    }

    pub(crate) fn routes(&self) -> &[Route] {
        &self.routes
    }
}

fn select_proxies(address: &Address) -> Vec<Proxy> {
    if let Some(proxy) = address.proxy() {
        if !proxy.is_direct() {
            return vec![proxy.clone()];
        }
        return vec![Proxy::Direct];
    }

    let mut proxies: Vec<Proxy> = address
        .proxy_selector()
        .select(address.url())
        .into_iter()
        .filter(|p| !p.is_direct())
        .collect();
    if proxies.is_empty() {
        proxies.push(Proxy::Direct);
    }
    proxies
}

/// Happy-Eyeballs ordering: interleave `[v6[0], v4[0], v6[1], v4[1], …]`.
/// When either family is absent the original order is preserved.
fn interleave_by_family(addresses: Vec<IpAddr>) -> Vec<IpAddr> {
    let (v6, v4): (Vec<IpAddr>, Vec<IpAddr>) =
        addresses.iter().partition(|ip| ip.is_ipv6());
    if v6.is_empty() || v4.is_empty() {
        return addresses;
    }
    let mut out = Vec::with_capacity(addresses.len());
    for i in 0..v6.len().max(v4.len()) {
        if let Some(ip) = v6.get(i) {
            out.push(*ip);
        }
        if let Some(ip) = v4.get(i) {
            out.push(*ip);
        }
    }
    out
}
