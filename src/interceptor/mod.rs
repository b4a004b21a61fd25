//! The call execution pipeline: an ordered chain of transforms between the
//! application's request and the network's response.

pub(crate) mod bridge;
pub(crate) mod cache;
pub(crate) mod connect;
pub(crate) mod network;
pub(crate) mod retry;

use std::sync::Arc;
use std::time::Duration;

use crate::client::Call;
use crate::connection::exchange::Exchange;
use crate::error::{Error, Result};
use crate::http::{Request, Response};

/// Observes and transforms one call.
///
/// Application interceptors run before the engine's own work and see each
/// call once; network interceptors run just above the wire and see every
/// network request, including redirects and retries.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response>;
}

impl std::fmt::Debug for dyn Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("Interceptor")
    }
}

/// A step in the interceptor chain. Call [`proceed`](Chain::proceed) to hand
/// the request to the rest of the chain.
pub struct Chain<'a> {
    call: Call,
    interceptors: &'a [Arc<dyn Interceptor>],
    index: usize,
    request: Request,
    pub(crate) exchange: Option<Arc<Exchange>>,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl<'a> Chain<'a> {
    pub(crate) fn new(
        call: Call,
        interceptors: &'a [Arc<dyn Interceptor>],
        request: Request,
        connect_timeout: Duration,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Chain<'a> {
        Chain {
            call,
            interceptors,
            index: 0,
            request,
            exchange: None,
            connect_timeout,
            read_timeout,
            write_timeout,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Overrides the read timeout for the rest of this chain.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
    }

    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    pub(crate) fn exchange(&self) -> Option<&Arc<Exchange>> {
        self.exchange.as_ref()
    }

    /// Runs the remainder of the chain on `request`.
    pub fn proceed(&mut self, request: Request) -> Result<Response> {
        if self.index >= self.interceptors.len() {
            return Err(Error::bad_config("interceptor chain exhausted"));
        }
        let interceptor = self.interceptors[self.index].clone();
        let mut next = Chain {
            call: self.call.clone(),
            interceptors: self.interceptors,
            index: self.index + 1,
            request,
            exchange: self.exchange.clone(),
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        };
        interceptor.intercept(&mut next)
    }
}

impl std::fmt::Debug for Chain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("index", &self.index)
            .field("url", &self.request.url())
            .finish()
    }
}
