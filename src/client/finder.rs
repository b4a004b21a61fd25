//! Finds a connection for an exchange: pooled if possible, freshly dialed
//! otherwise, coalesced when HTTP/2 allows it.

use std::sync::Arc;

use crate::client::CallInner;
use crate::connect::{Address, Route, RouteDatabase, RouteSelector, Selection};
use crate::connection::establish::{self, ConnectParams};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::event;
use crate::http::Url;
use crate::pool::ConnectionPool;

pub(crate) struct ExchangeFinder {
    address: Arc<Address>,
    pool: ConnectionPool,
    route_database: Arc<RouteDatabase>,
    fast_fallback: bool,
    selector: Option<RouteSelector>,
    selection: Option<Selection>,
    /// A route proven good by a connect raced against a coalesced reuse.
    next_route_to_try: Option<Route>,
}

impl ExchangeFinder {
    pub(crate) fn new(
        address: Arc<Address>,
        pool: ConnectionPool,
        route_database: Arc<RouteDatabase>,
        fast_fallback: bool,
    ) -> ExchangeFinder {
        ExchangeFinder {
            address,
            pool,
            route_database,
            fast_fallback,
            selector: None,
            selection: None,
            next_route_to_try: None,
        }
    }

    /// True when this finder already plans routes for `url`'s address.
    pub(crate) fn serves(&self, url: &Url) -> bool {
        let ours = self.address.url();
        ours.host() == url.host() && ours.port() == url.port() && ours.scheme() == url.scheme()
    }

    pub(crate) fn has_more_routes(&self) -> bool {
        self.next_route_to_try.is_some()
            || self
                .selection
                .as_ref()
                .map(|s| s.has_next())
                .unwrap_or(false)
            || self
                .selector
                .as_ref()
                .map(|s| s.has_next())
                // Planning hasn't started; assume routes exist.
                .unwrap_or(true)
    }

    pub(crate) fn find(
        &mut self,
        call: &Arc<CallInner>,
        params: &ConnectParams,
    ) -> Result<Arc<Connection>> {
        let listener = call.event_listener().clone();
        let mut first_failure: Option<Error> = None;

        loop {
            if call.is_canceled() {
                return Err(attach(Error::canceled(), first_failure));
            }

            // A pooled connection is always preferred.
            if let Some(connection) =
                self.pool
                    .call_acquire_pooled_connection(&self.address, call, None, false)
            {
                return Ok(connection);
            }

            let route = match self.next_route() {
                Ok(route) => route,
                Err(e) => return Err(attach(e, first_failure)),
            };

            let as_call = call.as_call();
            event::emit(&listener, |l| l.connect_start(&as_call, &route));
            match establish::connect(&route, params) {
                Ok(connection) => {
                    self.route_database.connected(&route);
                    event::emit(&listener, |l| {
                        l.connect_end(&as_call, &route, connection.protocol())
                    });

                    // Another call may have raced us to a multiplexed
                    // connection for this address; prefer it and keep our
                    // fresh route for later.
                    if connection.is_multiplexed() {
                        let candidate_routes = [route.clone()];
                        if let Some(pooled) = self.pool.call_acquire_pooled_connection(
                            &self.address,
                            call,
                            Some(&candidate_routes),
                            true,
                        ) {
                            connection.close();
                            self.next_route_to_try = Some(route);
                            return Ok(pooled);
                        }
                    }

                    connection.add_call(call);
                    self.pool.put(connection.clone());
                    return Ok(connection);
                }
                Err(e) => {
                    tracing::debug!("connect to {} failed: {}", route, e);
                    self.route_database.failed(&route);
                    self.address
                        .proxy_selector()
                        .connect_failed(self.address.url(), route.proxy());
                    event::emit(&listener, |l| l.connect_failed(&as_call, &route, &e));
                    match first_failure {
                        None => first_failure = Some(e),
                        Some(ref mut first) => first.push_suppressed(e),
                    }
                    if !self.has_more_routes() {
                        return Err(first_failure.expect("stored above"));
                    }
                }
            }
        }
    }

    fn next_route(&mut self) -> Result<Route> {
        if let Some(route) = self.next_route_to_try.take() {
            return Ok(route);
        }

        if self
            .selection
            .as_ref()
            .map(|s| !s.has_next())
            .unwrap_or(true)
        {
            let selector = match self.selector {
                Some(ref mut selector) => selector,
                None => {
                    self.selector = Some(RouteSelector::new(
                        self.address.clone(),
                        self.route_database.clone(),
                        self.fast_fallback,
                    ));
                    self.selector.as_mut().expect("just set")
                }
            };
            if !selector.has_next() {
                return Err(Error::io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "exhausted all routes",
                )));
            }
            self.selection = Some(selector.next()?);
        }

        self.selection
            .as_mut()
            .expect("selection present")
            .next()
            .ok_or_else(|| {
                Error::io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "exhausted all routes",
                ))
            })
    }
}

impl std::fmt::Debug for ExchangeFinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeFinder")
            .field("address", &self.address)
            .finish()
    }
}

fn attach(mut error: Error, earlier: Option<Error>) -> Error {
    if let Some(earlier) = earlier {
        error.push_suppressed(earlier);
    }
    error
}

/// What pre-warming needs from the client, held without referencing the
/// pool (the pool owns this context, so a client reference would cycle).
pub(crate) struct WarmContext {
    pub(crate) config: Arc<crate::client::ClientConfig>,
    pub(crate) runner: crate::task::TaskRunner,
    pub(crate) h2_queue: crate::task::TaskQueue,
    pub(crate) route_database: Arc<RouteDatabase>,
}

/// Dials one connection for pool pre-warming: first route that connects
/// wins; no call is involved.
pub(crate) fn connect_for_policy(
    context: &WarmContext,
    address: &Address,
) -> Result<Arc<Connection>> {
    let params = ConnectParams {
        connect_timeout: context.config.connect_timeout,
        read_timeout: context.config.read_timeout,
        write_timeout: context.config.write_timeout,
        ping: if context.config.ping_interval.is_zero() {
            None
        } else {
            Some((context.h2_queue.clone(), context.config.ping_interval))
        },
        now_ns: context.runner.nano_time(),
        user_agent: context.config.user_agent.clone(),
    };
    let mut selector = RouteSelector::new(
        Arc::new(address.clone()),
        context.route_database.clone(),
        context.config.fast_fallback,
    );
    let mut first_failure: Option<Error> = None;
    while selector.has_next() {
        let mut selection = selector.next()?;
        while let Some(route) = selection.next() {
            match establish::connect(&route, &params) {
                Ok(connection) => {
                    context.route_database.connected(&route);
                    return Ok(connection);
                }
                Err(e) => {
                    context.route_database.failed(&route);
                    match first_failure {
                        None => first_failure = Some(e),
                        Some(ref mut first) => first.push_suppressed(e),
                    }
                }
            }
        }
    }
    Err(first_failure.unwrap_or_else(|| {
        Error::io(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "exhausted all routes",
        ))
    }))
}
