//! Turns a route into a connected, protocol-negotiated socket.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{Connection, IoBuffer, MAX_LINE_LENGTH};
use crate::connect::{Protocol, Proxy, Route, TlsFailure};
use crate::error::{Error, Result};
use crate::http::{Headers, HeadersBuilder, Request, Response, StatusLine};
use crate::task::TaskQueue;
use crate::transport::{configure_socket, Transport};

const MAX_TUNNEL_ATTEMPTS: u32 = 21;

/// Everything `connect` needs beyond the route itself.
pub(crate) struct ConnectParams {
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    /// HTTP/2 keepalive, when configured.
    pub(crate) ping: Option<(TaskQueue, Duration)>,
    pub(crate) now_ns: u64,
    pub(crate) user_agent: String,
}

/// Dials `route`, tunneling and negotiating TLS as the route requires, and
/// wraps the result in a pooled [`Connection`].
///
/// TLS fallback: when a handshake fails retryably, the next connection spec
/// that changes the negotiation is attempted on a fresh socket. Earlier
/// failures ride along as suppressed errors.
pub(crate) fn connect(route: &Route, params: &ConnectParams) -> Result<Arc<Connection>> {
    if matches!(route.proxy(), Proxy::Socks { .. }) {
        return Err(Error::unsupported_proxy(
            "SOCKS proxies are routable but this engine has no SOCKS transport",
        ));
    }

    let specs: Vec<usize> = if route.address().is_https() {
        route
            .address()
            .connection_specs()
            .iter()
            .enumerate()
            .filter(|(_, spec)| spec.is_tls())
            .map(|(i, _)| i)
            .collect()
    } else {
        vec![0]
    };
    if specs.is_empty() {
        return Err(Error::bad_config(
            "no TLS connection specs configured for an https address",
        ));
    }

    let mut first_failure: Option<Error> = None;
    for (attempt, spec_index) in specs.iter().enumerate() {
        match connect_once(route, params, *spec_index) {
            Ok(connection) => return Ok(connection),
            Err(e) => {
                let retryable = e.is_handshake()
                    && !e.is_certificate()
                    && next_spec_differs(route, &specs, attempt);
                match first_failure {
                    None => first_failure = Some(e),
                    Some(ref mut first) => first.push_suppressed(e),
                }
                if !retryable {
                    break;
                }
                tracing::debug!(
                    "retrying TLS handshake to {} with the next connection spec",
                    route.address().url().host()
                );
            }
        }
    }
    Err(first_failure.expect("loop ran at least once"))
}

fn next_spec_differs(route: &Route, specs: &[usize], attempt: usize) -> bool {
    let current = &route.address().connection_specs()[specs[attempt]];
    specs
        .get(attempt + 1)
        .map(|next| route.address().connection_specs()[*next].differs_from(current))
        .unwrap_or(false)
}

fn connect_once(route: &Route, params: &ConnectParams, spec_index: usize) -> Result<Arc<Connection>> {
    let address = route.address();

    let tcp = TcpStream::connect_timeout(&route.socket_address(), params.connect_timeout)
        .map_err(Error::connect)?;
    configure_socket(&tcp).map_err(Error::connect)?;
    let timeout = |d: Duration| if d.is_zero() { None } else { Some(d) };
    tcp.set_read_timeout(timeout(params.read_timeout)).map_err(Error::io)?;
    tcp.set_write_timeout(timeout(params.write_timeout)).map_err(Error::io)?;
    let raw = tcp.try_clone().map_err(Error::io)?;

    if route.requires_tunnel() {
        create_tunnel(route, &tcp, params)?;
    }

    let (transport, protocol, handshake): (Box<dyn Transport>, Protocol, _) =
        if let Some(tls) = address.tls() {
            let spec = &address.connection_specs()[spec_index];
            let tls_transport = tls
                .connector
                .connect(
                    tcp,
                    address.url().host(),
                    address.url().port(),
                    spec,
                    address.protocols(),
                )
                .map_err(TlsFailure::into_error)?;

            let handshake = tls_transport.handshake().clone();
            if !tls.hostname_verifier.verify(address.url().host(), &handshake) {
                return Err(Error::handshake(
                    format!("hostname {} not verified", address.url().host()),
                    true,
                ));
            }
            if let Err(reason) = tls
                .certificate_pinner
                .check(address.url().host(), handshake.peer_certificates())
            {
                return Err(Error::handshake(reason, true));
            }

            let protocol = match tls_transport.alpn_protocol() {
                Some("h2") if address.protocols().contains(&Protocol::H2) => Protocol::H2,
                _ => Protocol::Http11,
            };
            (upcast(tls_transport), protocol, Some(handshake))
        } else {
            let protocol = if address.protocols() == [Protocol::H2PriorKnowledge] {
                Protocol::H2PriorKnowledge
            } else {
                Protocol::Http11
            };
            (Box::new(tcp), protocol, None)
        };

    let h2 = if protocol.multiplexed() {
        // The shared reader thread must block indefinitely; per-stream
        // deadlines are enforced on condvar waits instead.
        raw.set_read_timeout(None).map_err(Error::io)?;
        raw.set_write_timeout(None).map_err(Error::io)?;
        Some(crate::proto::h2::H2Connection::start(
            address.url().host().to_string(),
            transport.try_clone().map_err(Error::io)?,
            params.ping.clone(),
        )?)
    } else {
        None
    };

    tracing::debug!(
        "connected to {} via {} ({})",
        address.url().redact(),
        route.socket_address(),
        protocol
    );
    Ok(Connection::new(
        route.clone(),
        raw,
        transport,
        protocol,
        handshake,
        h2,
        params.now_ns,
    ))
}

fn upcast(tls: Box<dyn crate::connect::TlsTransport>) -> Box<dyn Transport> {
    struct Upcast(Box<dyn crate::connect::TlsTransport>);
    impl std::io::Read for Upcast {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.0.read(buf)
        }
    }
    impl std::io::Write for Upcast {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            self.0.flush()
        }
    }
    impl Transport for Upcast {
        fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
            self.0.peer_addr()
        }
        fn try_clone(&self) -> std::io::Result<Box<dyn Transport>> {
            self.0.try_clone()
        }
        fn shutdown(&self) -> std::io::Result<()> {
            self.0.shutdown()
        }
        fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
            self.0.set_read_timeout(timeout)
        }
        fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
            self.0.set_write_timeout(timeout)
        }
    }
    Box::new(Upcast(tls))
}

/// Builds the CONNECT tunnel through an HTTP proxy, renegotiating
/// credentials on 407 up to the attempt cap. Each attempt uses a fresh
/// socket; this function drives only the request/response exchange.
fn create_tunnel(route: &Route, tcp: &TcpStream, params: &ConnectParams) -> Result<()> {
    let address = route.address();
    let target = address.url().host_header();

    let mut tunnel_headers = HeadersBuilder::default();
    tunnel_headers.set("Host", &target);
    tunnel_headers.set("Proxy-Connection", "Keep-Alive");
    tunnel_headers.set("User-Agent", &params.user_agent);

    let mut io = IoBuffer::new(Box::new(tcp.try_clone().map_err(Error::io)?));
    for _ in 0..MAX_TUNNEL_ATTEMPTS {
        let head = render_tunnel_request(&target, &tunnel_headers.build());
        io.write_all(head.as_bytes()).map_err(Error::write)?;
        io.flush().map_err(Error::write)?;

        let status = StatusLine::parse(&io.read_line(MAX_LINE_LENGTH)?)?;
        let headers = read_tunnel_headers(&mut io)?;

        match status.code {
            200 => return Ok(()),
            407 => {
                let request = Request::builder()
                    .url(address.url())?
                    .method("CONNECT", None)
                    .build()?;
                let response = Response::builder()
                    .request(request)
                    .protocol(status.protocol)
                    .code(407)
                    .message(status.message.clone())
                    .headers(headers)
                    .build()?;
                let authorized = address
                    .proxy_authenticator()
                    .authenticate(Some(route), &response)?;
                match authorized.and_then(|r| r.header("Proxy-Authorization").map(str::to_string)) {
                    Some(credentials) => {
                        tunnel_headers.set("Proxy-Authorization", &credentials);
                    }
                    None => return Err(Error::protocol("failed to authenticate with proxy")),
                }
            }
            _ => {
                return Err(Error::protocol(format!(
                    "unexpected response code for CONNECT: {}",
                    status.code
                )))
            }
        }
    }
    Err(Error::protocol("too many tunnel attempts"))
}

fn render_tunnel_request(target: &str, headers: &Headers) -> String {
    let mut head = format!("CONNECT {} HTTP/1.1\r\n", target);
    for (name, value) in headers.iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head
}

fn read_tunnel_headers(io: &mut IoBuffer) -> Result<Headers> {
    let mut builder = HeadersBuilder::default();
    loop {
        let line = io.read_line(MAX_LINE_LENGTH)?;
        if line.is_empty() {
            return Ok(builder.build());
        }
        builder.add_line(&line);
    }
}
