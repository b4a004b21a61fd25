//! courier: a fast and correct HTTP client engine.
//!
//! courier turns a declarative [`Request`] into a [`Response`] by selecting a
//! network route, acquiring a pooled connection, performing the HTTP/1.1 or
//! HTTP/2 exchange, and streaming the response body back to the caller.
//! Concurrent calls multiplex over a shared connection pool; every call
//! honors cancellation, per-operation timeouts, and the interceptor chain.
//!
//! # Example
//!
//! ```no_run
//! let client = courier::Client::new();
//! let request = courier::Request::builder()
//!     .url("http://example.com/")?
//!     .build()?;
//! let mut response = client.new_call(request).execute()?;
//! println!("{}", response.body_mut().string()?);
//! # Ok::<(), courier::Error>(())
//! ```
//!
//! The engine is thread-blocking by design: `execute()` runs on the caller's
//! thread, `enqueue()` dispatches to a bounded executor, and cancellation is
//! a shared flag plus a socket shutdown observed at every I/O boundary.

#![deny(missing_debug_implementations)]

pub mod cache;
mod client;
mod connect;
mod connection;
mod error;
mod event;
mod http;
mod interceptor;
mod pool;
mod proto;
mod task;
mod transport;
pub mod ws;

pub use crate::client::{Call, Client, ClientBuilder};
pub use crate::connect::{
    basic_credentials, Address, Authenticator, CertificatePinner, ConnectionSpec, Dns, Handshake,
    HostnameVerifier, NoAuthentication, NoProxy, Protocol, Proxy, ProxySelector, Route, SystemDns,
    TlsConnector, TlsFailure, TlsFailureKind, TlsTransport, TlsVersion,
};
pub use crate::error::{Error, Result};
pub use crate::event::{EventListener, NoEvents};
pub use crate::http::{
    bytes_body, text_body, CacheControl, CacheControlBuilder, Cookie, CookieJar, Headers,
    HeadersBuilder, InMemoryCookieJar, IntoUrl, MediaType, NoCookies, PublicSuffix, Request,
    RequestBody, RequestBuilder, Response, ResponseBody, ResponseBuilder, Url,
};
pub use crate::interceptor::{Chain, Interceptor};
pub use crate::pool::AddressPolicy;
pub use crate::transport::Transport;
pub use crate::ws::{WebSocket, WebSocketListener};

pub use crate::cache::Cache;
