//! One socket, its framing codec, and the exchanges that ride it.

pub(crate) mod establish;
pub(crate) mod exchange;

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::BytesMut;

use crate::client::CallInner;
use crate::connect::{Handshake, Protocol, Route};
use crate::error::{Error, Result};
use crate::http::{Headers, Request, Response, ResponseBuilder};
use crate::proto::h2::H2Connection;
use crate::transport::Transport;

/// The maximum length of a status or header line.
pub(crate) const MAX_LINE_LENGTH: usize = 8 * 1024;

/// A buffered reader and unbuffered writer over one transport.
pub(crate) struct IoBuffer {
    transport: Box<dyn Transport>,
    buf: BytesMut,
}

impl IoBuffer {
    pub(crate) fn new(transport: Box<dyn Transport>) -> IoBuffer {
        IoBuffer {
            transport,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Reads one line, stripping the terminator. Lines beyond `max_len` are
    /// a protocol error; EOF before any terminator is an I/O error.
    pub(crate) fn read_line(&mut self, max_len: usize) -> Result<String> {
        loop {
            if let Some(newline) = self.buf.iter().position(|b| *b == b'\n') {
                if newline > max_len {
                    return Err(Error::protocol("header line exceeds limit"));
                }
                let mut line = self.buf.split_to(newline + 1);
                line.truncate(newline);
                if line.last() == Some(&b'\r') {
                    line.truncate(newline - 1);
                }
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if self.buf.len() > max_len {
                return Err(Error::protocol("header line exceeds limit"));
            }
            if self.fill().map_err(Error::read)? == 0 {
                return Err(Error::unexpected_eof());
            }
        }
    }

    /// Buffered read.
    pub(crate) fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.buf.is_empty() {
            if out.len() >= 4 * 1024 {
                return self.transport.read(out);
            }
            if self.fill()? == 0 {
                return Ok(0);
            }
        }
        let n = out.len().min(self.buf.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        let _ = self.buf.split_to(n);
        Ok(n)
    }

    pub(crate) fn read_exact(&mut self, out: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            let n = self.read(&mut out[filled..])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected end of stream",
                ));
            }
            filled += n;
        }
        Ok(())
    }

    pub(crate) fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.transport.write_all(data)
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        self.transport.flush()
    }

    /// An independent write handle over the same socket, so an upgraded
    /// protocol can write while this buffer keeps the read side.
    pub(crate) fn clone_transport(&self) -> io::Result<Box<dyn Transport>> {
        self.transport.try_clone()
    }

    fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 8 * 1024];
        let n = self.transport.read(&mut chunk)?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IoBuffer(buffered={})", self.buf.len())
    }
}

/// Mutable connection state guarded by the connection's lock.
#[derive(Debug)]
pub(crate) struct ConnState {
    pub(crate) no_new_exchanges: bool,
    pub(crate) route_failure_count: u32,
    pub(crate) success_count: u64,
    pub(crate) idle_at_ns: u64,
    /// One weak reference per exchange currently assigned to this
    /// connection. Collected-but-unreleased entries indicate a leak.
    pub(crate) calls: Vec<Weak<CallInner>>,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A live socket to an origin or proxy, plus the codec state to run
/// exchanges over it.
pub(crate) struct Connection {
    id: u64,
    route: Route,
    /// The raw TCP handle, kept for shutdown and timeout control even when a
    /// TLS session is layered above.
    raw: TcpStream,
    io: Arc<Mutex<IoBuffer>>,
    protocol: Protocol,
    handshake: Option<Handshake>,
    h2: Option<Arc<H2Connection>>,
    pub(crate) state: Mutex<ConnState>,
}

impl Connection {
    pub(crate) fn new(
        route: Route,
        raw: TcpStream,
        transport: Box<dyn Transport>,
        protocol: Protocol,
        handshake: Option<Handshake>,
        h2: Option<Arc<H2Connection>>,
        now_ns: u64,
    ) -> Arc<Connection> {
        Arc::new(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            route,
            raw,
            io: Arc::new(Mutex::new(IoBuffer::new(transport))),
            protocol,
            handshake,
            h2,
            state: Mutex::new(ConnState {
                no_new_exchanges: false,
                route_failure_count: 0,
                success_count: 0,
                idle_at_ns: now_ns,
                calls: Vec::new(),
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn route(&self) -> &Route {
        &self.route
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub(crate) fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    pub(crate) fn io(&self) -> &Arc<Mutex<IoBuffer>> {
        &self.io
    }

    pub(crate) fn h2(&self) -> Option<&Arc<H2Connection>> {
        self.h2.as_ref()
    }

    pub(crate) fn is_multiplexed(&self) -> bool {
        self.h2.is_some()
    }

    /// Concurrent exchanges this connection can carry.
    pub(crate) fn allocation_limit(&self) -> usize {
        match self.h2 {
            Some(ref h2) => h2.max_concurrent_streams(),
            None => 1,
        }
    }

    pub(crate) fn no_new_exchanges(&self) -> bool {
        self.state.lock().expect("connection poisoned").no_new_exchanges
    }

    pub(crate) fn set_no_new_exchanges(&self) {
        self.state.lock().expect("connection poisoned").no_new_exchanges = true;
    }

    /// A quick liveness check before reuse.
    pub(crate) fn is_healthy(&self) -> bool {
        if self.no_new_exchanges() {
            return false;
        }
        match self.h2 {
            Some(ref h2) => !h2.is_shutdown(),
            None => true,
        }
    }

    pub(crate) fn add_call(&self, call: &Arc<CallInner>) {
        self.state
            .lock()
            .expect("connection poisoned")
            .calls
            .push(Arc::downgrade(call));
    }

    pub(crate) fn remove_call(&self, call: &Arc<CallInner>) -> usize {
        let mut state = self.state.lock().expect("connection poisoned");
        let target = Arc::downgrade(call);
        if let Some(i) = state.calls.iter().position(|w| w.ptr_eq(&target)) {
            state.calls.swap_remove(i);
        }
        state.calls.len()
    }

    pub(crate) fn set_timeouts(
        &self,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Result<()> {
        self.raw.set_read_timeout(read_timeout).map_err(Error::io)?;
        self.raw.set_write_timeout(write_timeout).map_err(Error::io)?;
        Ok(())
    }

    /// Closes the socket. In-flight operations fail with an I/O error. An
    /// HTTP/2 peer gets a GOAWAY first, best effort.
    pub(crate) fn close(&self) {
        tracing::debug!("closing connection {}", self.id);
        if let Some(ref h2) = self.h2 {
            h2.shutdown_gracefully();
            h2.shutdown_now();
        }
        let _ = self.raw.shutdown(std::net::Shutdown::Both);
    }

    /// True when this pooled connection can carry a call to `address`.
    ///
    /// The fast path is an equal address (including host). An HTTP/2
    /// connection can additionally coalesce onto a different host when the
    /// route's IP matches one of the candidate routes and the certificate
    /// verifies against the new host.
    pub(crate) fn is_eligible(
        &self,
        address: &crate::connect::Address,
        routes: Option<&[Route]>,
    ) -> bool {
        let state = self.state.lock().expect("connection poisoned");
        if state.calls.len() >= self.allocation_limit() || state.no_new_exchanges {
            return false;
        }
        drop(state);

        if !self.route.address().equals_non_host(address) {
            return false;
        }
        if address.url().host() == self.route.address().url().host() {
            return true;
        }

        // Coalesced HTTP/2 connections: require a multiplexed connection, a
        // shared IP, and a certificate covering the new host.
        if self.h2.is_none() {
            return false;
        }
        let routes = match routes {
            Some(routes) => routes,
            None => return false,
        };
        let route_matches = routes.iter().any(|candidate| {
            candidate.proxy().is_direct()
                && self.route.proxy().is_direct()
                && candidate.socket_address() == self.route.socket_address()
        });
        if !route_matches {
            return false;
        }

        let handshake = match self.handshake {
            Some(ref handshake) => handshake,
            None => return false,
        };
        let tls = match address.tls() {
            Some(tls) => tls,
            None => return false,
        };
        tls.hostname_verifier.verify(address.url().host(), handshake)
            && tls
                .certificate_pinner
                .check(address.url().host(), handshake.peer_certificates())
                .is_ok()
    }

    /// Builds the codec for a new exchange. For HTTP/1.1 the socket-level
    /// timeouts govern; HTTP/2 streams time out on their condvar waits
    /// instead, so the socket stays blocking for the shared reader thread.
    pub(crate) fn new_codec(
        self: &Arc<Connection>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Box<dyn ExchangeCodec>> {
        match self.h2 {
            Some(ref h2) => Ok(Box::new(crate::proto::h2::Http2Codec::new(
                self.clone(),
                h2.clone(),
                read_timeout,
                write_timeout,
            ))),
            None => {
                self.set_timeouts(
                    if read_timeout.is_zero() { None } else { Some(read_timeout) },
                    if write_timeout.is_zero() { None } else { Some(write_timeout) },
                )?;
                Ok(Box::new(crate::proto::h1::Http1Codec::new(self.clone())))
            }
        }
    }

    /// Records a completed exchange for route-health bookkeeping.
    pub(crate) fn note_success(&self) {
        let mut state = self.state.lock().expect("connection poisoned");
        state.success_count += 1;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Writes a request body with explicit termination.
pub(crate) trait BodySink: Write + Send {
    /// Writes any framing trailer and flushes. Must be called exactly once
    /// after the body bytes.
    fn finish(&mut self) -> Result<()>;
}

/// The per-exchange protocol operations, implemented by the HTTP/1.1 and
/// HTTP/2 codecs.
pub(crate) trait ExchangeCodec: Send {
    /// Writes the request line (or HEADERS frame) and headers.
    fn write_request_headers(&mut self, request: &Request) -> Result<()>;

    /// Opens the request body sink. `content_length` of -1 means unknown
    /// (chunked on HTTP/1.1, open-ended DATA on HTTP/2).
    fn create_request_body_sink(
        &mut self,
        request: &Request,
        content_length: i64,
    ) -> Result<Box<dyn BodySink>>;

    /// Flushes the request head to the wire.
    fn flush_request(&mut self) -> Result<()>;

    /// Declares the request complete.
    fn finish_request(&mut self) -> Result<()>;

    /// Reads the response head. With `expect_continue`, returns `Ok(None)`
    /// when the interim 100 arrived and the body should now be sent.
    fn read_response_headers(&mut self, expect_continue: bool) -> Result<Option<ResponseBuilder>>;

    /// Opens the response body stream for a fully-read head.
    fn open_response_body(&mut self, response: &Response) -> Result<Box<dyn Read + Send>>;

    /// Trailers received after the body, when the framing carries them.
    fn trailers(&self) -> Headers;

    /// Aborts the exchange: closes the socket (HTTP/1.1) or resets the
    /// stream (HTTP/2).
    fn cancel(&self);

    /// True when this codec's failure poisons the whole connection.
    fn is_connection_wide(&self) -> bool;
}
