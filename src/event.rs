//! Observation hooks for the life of a call.
//!
//! Listeners observe; they must not block or mutate engine state. A panic in
//! a listener is caught, logged, and swallowed.

use std::net::IpAddr;
use std::sync::Arc;

use crate::client::Call;
use crate::connect::{Handshake, Protocol, Proxy, Route};
use crate::error::Error;
use crate::http::{Request, Response, Url};

/// Callbacks for the significant moments of a call. All methods default to
/// no-ops; implement the ones of interest.
#[allow(unused_variables)]
pub trait EventListener: Send + Sync {
    fn call_start(&self, call: &Call) {}

    fn proxy_select_start(&self, call: &Call, url: &Url) {}
    fn proxy_select_end(&self, call: &Call, url: &Url, proxies: &[Proxy]) {}

    fn dns_start(&self, call: &Call, domain: &str) {}
    fn dns_end(&self, call: &Call, domain: &str, addresses: &[IpAddr]) {}

    fn connect_start(&self, call: &Call, route: &Route) {}
    fn secure_connect_start(&self, call: &Call) {}
    fn secure_connect_end(&self, call: &Call, handshake: Option<&Handshake>) {}
    fn connect_end(&self, call: &Call, route: &Route, protocol: Protocol) {}
    fn connect_failed(&self, call: &Call, route: &Route, error: &Error) {}

    /// `connection` is an opaque identifier stable for the connection's
    /// lifetime.
    fn connection_acquired(&self, call: &Call, connection: u64) {}
    fn connection_released(&self, call: &Call, connection: u64) {}

    fn request_headers_start(&self, call: &Call) {}
    fn request_headers_end(&self, call: &Call, request: &Request) {}
    fn request_body_start(&self, call: &Call) {}
    fn request_body_end(&self, call: &Call, byte_count: u64) {}

    fn response_headers_start(&self, call: &Call) {}
    fn response_headers_end(&self, call: &Call, response: &Response) {}
    fn response_body_start(&self, call: &Call) {}
    fn response_body_end(&self, call: &Call, byte_count: u64) {}

    fn canceled(&self, call: &Call) {}

    fn call_end(&self, call: &Call) {}
    fn call_failed(&self, call: &Call, error: &Error) {}
}

/// The listener used when none is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoEvents;

impl EventListener for NoEvents {}

impl std::fmt::Debug for dyn EventListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("EventListener")
    }
}

/// Invokes a listener callback, swallowing panics.
pub(crate) fn emit(listener: &Arc<dyn EventListener>, f: impl FnOnce(&dyn EventListener)) {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        f(listener.as_ref())
    }));
    if outcome.is_err() {
        tracing::warn!("event listener panicked; continuing");
    }
}

/// As [`emit`], for WebSocket listener callbacks.
pub(crate) fn emit_ws(f: impl FnOnce()) {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
    if outcome.is_err() {
        tracing::warn!("websocket listener panicked; continuing");
    }
}
