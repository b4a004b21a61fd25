//! A blocking HTTP/1.1 codec.
//!
//! One exchange at a time. The codec walks `IDLE → OPEN_REQUEST_BODY →
//! READ_RESPONSE_HEADERS → OPEN_RESPONSE_BODY → IDLE` for each exchange;
//! framing violations close the connection for good.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use crate::connection::{BodySink, Connection, ExchangeCodec, IoBuffer, MAX_LINE_LENGTH};
use crate::connect::{Protocol, Proxy};
use crate::error::{Error, Result};
use crate::http::{value_for_log, Headers, HeadersBuilder, Request, Response, ResponseBuilder, StatusLine};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    OpenRequestBody,
    ReadResponseHeaders,
    OpenResponseBody,
    Closed,
}

struct Shared {
    connection: Arc<Connection>,
    state: Mutex<CodecState>,
}

struct CodecState {
    state: State,
    trailers: Headers,
}

impl Shared {
    fn transition(&self, from: State, to: State) -> Result<()> {
        let mut guard = self.state.lock().expect("h1 codec poisoned");
        if guard.state != from {
            return Err(Error::protocol(format!(
                "state: expected {:?} but was {:?}",
                from, guard.state
            )));
        }
        guard.state = to;
        Ok(())
    }

    fn set_state(&self, to: State) {
        self.state.lock().expect("h1 codec poisoned").state = to;
    }

    fn state(&self) -> State {
        self.state.lock().expect("h1 codec poisoned").state
    }

    /// A framing failure makes the connection unusable for future exchanges.
    fn poison(&self) {
        self.set_state(State::Closed);
        self.connection.set_no_new_exchanges();
    }
}

/// The HTTP/1.1 exchange codec.
pub(crate) struct Http1Codec {
    shared: Arc<Shared>,
}

impl Http1Codec {
    pub(crate) fn new(connection: Arc<Connection>) -> Http1Codec {
        Http1Codec {
            shared: Arc::new(Shared {
                connection,
                state: Mutex::new(CodecState {
                    state: State::Idle,
                    trailers: Headers::new(),
                }),
            }),
        }
    }

    fn io(&self) -> &Arc<Mutex<IoBuffer>> {
        self.shared.connection.io()
    }

    /// The request target: origin-form normally, absolute-form when talking
    /// cleartext through an HTTP proxy.
    fn request_target(&self, request: &Request) -> String {
        let proxied_cleartext = matches!(
            self.shared.connection.route().proxy(),
            Proxy::Http { .. }
        ) && !request.url().is_https();
        if proxied_cleartext {
            let mut url = request.url().to_string();
            if let Some(fragment) = url.find('#') {
                url.truncate(fragment);
            }
            url
        } else {
            request.url().encoded_path_and_query()
        }
    }
}

impl ExchangeCodec for Http1Codec {
    fn write_request_headers(&mut self, request: &Request) -> Result<()> {
        let request_line = format!(
            "{} {} HTTP/1.1",
            request.method(),
            self.request_target(request)
        );
        write_request(&self.shared, &request_line, request.headers())
    }

    fn create_request_body_sink(
        &mut self,
        request: &Request,
        content_length: i64,
    ) -> Result<Box<dyn BodySink>> {
        if request
            .header("Transfer-Encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
        {
            return Ok(Box::new(ChunkedSink {
                shared: self.shared.clone(),
                closed: false,
            }));
        }
        if content_length < 0 {
            return Err(Error::protocol(
                "cannot stream a request body without chunked encoding or a known length",
            ));
        }
        Ok(Box::new(FixedLengthSink {
            shared: self.shared.clone(),
            remaining: content_length as u64,
        }))
    }

    fn flush_request(&mut self) -> Result<()> {
        let mut io = self.io().lock().expect("connection io poisoned");
        io.flush().map_err(Error::write)
    }

    fn finish_request(&mut self) -> Result<()> {
        let state = self.shared.state();
        if state == State::OpenRequestBody {
            self.shared.set_state(State::ReadResponseHeaders);
        }
        self.flush_request()
    }

    fn read_response_headers(&mut self, expect_continue: bool) -> Result<Option<ResponseBuilder>> {
        let state = self.shared.state();
        if state != State::ReadResponseHeaders && state != State::OpenRequestBody {
            return Err(Error::protocol(format!("state: {:?}", state)));
        }

        let (status_line, headers) = {
            let mut io = self.io().lock().expect("connection io poisoned");
            let status = match read_status_line(&mut io) {
                Ok(status) => status,
                Err(e) => {
                    self.shared.poison();
                    return Err(e);
                }
            };
            let headers = match read_headers(&mut io) {
                Ok(headers) => headers,
                Err(e) => {
                    self.shared.poison();
                    return Err(e);
                }
            };
            (status, headers)
        };

        tracing::trace!(
            "<< {} ({} headers)",
            status_line,
            headers.len()
        );

        if expect_continue && status_line.code == 100 {
            // The interim response consumed; the caller may now send the
            // request body.
            return Ok(None);
        }

        let builder = Response::builder()
            .protocol(status_line.protocol)
            .code(status_line.code)
            .message(status_line.message.clone())
            .headers(headers.clone());

        if (100..200).contains(&status_line.code) {
            // Informational: the caller reads again for the real response.
            return Ok(Some(builder));
        }

        self.shared.set_state(State::OpenResponseBody);

        // Connection reuse bookkeeping.
        let response_requests_close = headers.contains_value("Connection", "close");
        let http10_without_keepalive = status_line.protocol == Protocol::Http10
            && !headers.contains_value("Connection", "keep-alive");
        if response_requests_close || http10_without_keepalive {
            self.shared.connection.set_no_new_exchanges();
        }

        Ok(Some(builder))
    }

    fn open_response_body(&mut self, response: &Response) -> Result<Box<dyn Read + Send>> {
        self.shared.transition(State::OpenResponseBody, State::OpenResponseBody)?;

        if !promises_body(response) {
            return Ok(Box::new(FixedLengthReader {
                shared: self.shared.clone(),
                remaining: 0,
                done: true,
            }));
        }

        if response
            .header("Transfer-Encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
        {
            return Ok(Box::new(ChunkedReader {
                shared: self.shared.clone(),
                remaining_in_chunk: 0,
                has_more_chunks: true,
            }));
        }

        if let Some(length) = content_length(response.headers()) {
            return Ok(Box::new(FixedLengthReader {
                shared: self.shared.clone(),
                remaining: length,
                done: length == 0,
            }));
        }

        // Read until the server closes the stream; the connection cannot be
        // reused afterwards.
        self.shared.connection.set_no_new_exchanges();
        Ok(Box::new(UnknownLengthReader {
            shared: self.shared.clone(),
            done: false,
        }))
    }

    fn trailers(&self) -> Headers {
        self.shared
            .state
            .lock()
            .expect("h1 codec poisoned")
            .trailers
            .clone()
    }

    fn cancel(&self) {
        // HTTP/1.1 has no way to abandon one exchange without the socket.
        self.shared.connection.close();
    }

    fn is_connection_wide(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for Http1Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Http1Codec({:?})", self.shared.state())
    }
}

fn write_request(shared: &Arc<Shared>, request_line: &str, headers: &Headers) -> Result<()> {
    shared.transition(State::Idle, State::OpenRequestBody)?;
    tracing::trace!(">> {}", request_line);

    let mut head = String::with_capacity(256);
    head.push_str(request_line);
    head.push_str("\r\n");
    for (name, value) in headers.iter() {
        tracing::trace!(">> {}: {}", name, value_for_log(name, value));
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    let mut io = shared.connection.io().lock().expect("connection io poisoned");
    io.write_all(head.as_bytes()).map_err(Error::write)
}

fn read_status_line(io: &mut IoBuffer) -> Result<StatusLine> {
    let line = io.read_line(MAX_LINE_LENGTH)?;
    StatusLine::parse(&line)
}

fn read_headers(io: &mut IoBuffer) -> Result<Headers> {
    let mut builder = HeadersBuilder::default();
    loop {
        let line = io.read_line(MAX_LINE_LENGTH)?;
        if line.is_empty() {
            return Ok(builder.build());
        }
        builder.add_line(&line);
    }
}

/// Whether the response status and request method allow a body.
fn promises_body(response: &Response) -> bool {
    if response.request().method() == "HEAD" {
        return false;
    }
    let code = response.code();
    if (100..200).contains(&code) || code == 204 || code == 304 {
        // An explicit length or chunked marker still promises a body for
        // these codes, matching permissive servers.
        return content_length(response.headers()).map(|n| n > 0).unwrap_or(false)
            || response
                .header("Transfer-Encoding")
                .map(|v| v.eq_ignore_ascii_case("chunked"))
                .unwrap_or(false);
    }
    true
}

pub(crate) fn content_length(headers: &Headers) -> Option<u64> {
    headers.get("Content-Length").and_then(|v| v.trim().parse().ok())
}

// ===== request body sinks =====

struct FixedLengthSink {
    shared: Arc<Shared>,
    remaining: u64,
}

impl Write for FixedLengthSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() as u64 > self.remaining {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "expected fewer bytes than Content-Length",
            ));
        }
        let mut io = self.shared.connection.io().lock().expect("connection io poisoned");
        io.write_all(buf)?;
        self.remaining -= buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut io = self.shared.connection.io().lock().expect("connection io poisoned");
        io.flush()
    }
}

impl BodySink for FixedLengthSink {
    fn finish(&mut self) -> Result<()> {
        if self.remaining != 0 {
            return Err(Error::protocol("unexpected end of stream: body was short"));
        }
        self.flush().map_err(Error::write)
    }
}

struct ChunkedSink {
    shared: Arc<Shared>,
    closed: bool,
}

impl Write for ChunkedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::Other, "sink closed"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let mut io = self.shared.connection.io().lock().expect("connection io poisoned");
        io.write_all(format!("{:x}\r\n", buf.len()).as_bytes())?;
        io.write_all(buf)?;
        io.write_all(b"\r\n")?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut io = self.shared.connection.io().lock().expect("connection io poisoned");
        io.flush()
    }
}

impl BodySink for ChunkedSink {
    fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut io = self.shared.connection.io().lock().expect("connection io poisoned");
        io.write_all(b"0\r\n\r\n").map_err(Error::write)?;
        io.flush().map_err(Error::write)
    }
}

// ===== response body readers =====

struct FixedLengthReader {
    shared: Arc<Shared>,
    remaining: u64,
    done: bool,
}

impl Read for FixedLengthReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            if !self.done {
                self.done = true;
                self.shared.set_state(State::Idle);
            }
            return Ok(0);
        }
        let want = buf.len().min(self.remaining as usize);
        let n = {
            let mut io = self.shared.connection.io().lock().expect("connection io poisoned");
            io.read(&mut buf[..want])?
        };
        if n == 0 {
            // The peer promised more bytes than it sent.
            self.shared.poison();
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of stream",
            ));
        }
        self.remaining -= n as u64;
        if self.remaining == 0 {
            self.done = true;
            self.shared.set_state(State::Idle);
        }
        Ok(n)
    }
}

struct ChunkedReader {
    shared: Arc<Shared>,
    remaining_in_chunk: u64,
    has_more_chunks: bool,
}

impl ChunkedReader {
    fn read_chunk_header(&mut self, io: &mut IoBuffer) -> Result<()> {
        if self.remaining_in_chunk == 0 && self.has_more_chunks {
            let line = io.read_line(MAX_LINE_LENGTH)?;
            let size_token = line
                .split(|c: char| c == ';' || c.is_ascii_whitespace())
                .next()
                .unwrap_or("");
            let size = u64::from_str_radix(size_token, 16).map_err(|_| {
                Error::protocol(format!("expected chunk size but was \"{}\"", line))
            })?;
            if size == 0 {
                self.has_more_chunks = false;
                // Trailers, then the terminating blank line.
                let trailers = read_headers(io)?;
                self.shared.state.lock().expect("h1 codec poisoned").trailers = trailers;
                self.shared.set_state(State::Idle);
            } else {
                self.remaining_in_chunk = size;
            }
        }
        Ok(())
    }
}

impl Read for ChunkedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let io_handle = self.shared.connection.io().clone();
        let mut io = io_handle.lock().expect("connection io poisoned");

        if self.remaining_in_chunk == 0 {
            if !self.has_more_chunks {
                return Ok(0);
            }
            if let Err(e) = self.read_chunk_header(&mut io) {
                drop(io);
                self.shared.poison();
                return Err(e.into_io());
            }
            if !self.has_more_chunks {
                return Ok(0);
            }
        }

        let want = buf.len().min(self.remaining_in_chunk as usize);
        let n = io.read(&mut buf[..want])?;
        if n == 0 {
            drop(io);
            self.shared.poison();
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of stream",
            ));
        }
        self.remaining_in_chunk -= n as u64;
        if self.remaining_in_chunk == 0 {
            // Chunk data is followed by CRLF.
            let mut crlf = [0u8; 2];
            if io.read_exact(&mut crlf).is_err() || &crlf != b"\r\n" {
                drop(io);
                self.shared.poison();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "expected CRLF after chunk",
                ));
            }
        }
        Ok(n)
    }
}

struct UnknownLengthReader {
    shared: Arc<Shared>,
    done: bool,
}

impl Read for UnknownLengthReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        let n = {
            let mut io = self.shared.connection.io().lock().expect("connection io poisoned");
            io.read(buf)?
        };
        if n == 0 {
            self.done = true;
            self.shared.set_state(State::Closed);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::auth::NoAuthentication;
    use crate::connect::proxy::NoProxy;
    use crate::connect::{Address, ConnectionSpec, Dns, Route, SystemDns};
    use crate::transport::test::pair;
    use crate::transport::Transport;
    use std::io::Write as _;
    use std::net::TcpListener;
    use std::sync::Arc;

    fn test_connection(transport: Box<dyn Transport>) -> Arc<Connection> {
        // A real TcpStream is needed for the raw handle; it is otherwise
        // unused because I/O goes through the in-memory transport.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let raw = std::net::TcpStream::connect(addr).unwrap();
        let dns: Arc<dyn Dns> = Arc::new(SystemDns);
        let address = Arc::new(Address::new(
            "http",
            "example.com",
            80,
            vec![crate::connect::Protocol::Http11],
            vec![ConnectionSpec::cleartext()],
            dns,
            None,
            Arc::new(NoProxy),
            Arc::new(NoAuthentication),
            None,
        ));
        let route = Route::new(address, Proxy::Direct, "127.0.0.1:80".parse().unwrap());
        Connection::new(route, raw, transport, Protocol::Http11, None, None, 0)
    }

    fn get_request() -> Request {
        Request::get("http://example.com/path?q=1").unwrap()
    }

    #[test]
    fn writes_request_line_and_headers() {
        let (client, mut server) = pair();
        let connection = test_connection(Box::new(client));
        let mut codec = Http1Codec::new(connection);

        let request = Request::builder()
            .url("http://example.com/path?q=1")
            .unwrap()
            .header("Host", "example.com")
            .build()
            .unwrap();
        codec.write_request_headers(&request).unwrap();
        codec.flush_request().unwrap();

        let mut buf = [0u8; 256];
        let n = server.read(&mut buf).unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.starts_with("GET /path?q=1 HTTP/1.1\r\n"), "{}", text);
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn reads_fixed_length_response() {
        let (client, mut server) = pair();
        let connection = test_connection(Box::new(client));
        let mut codec = Http1Codec::new(connection);

        codec.write_request_headers(&get_request()).unwrap();
        codec.finish_request().unwrap();
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .unwrap();

        let builder = codec.read_response_headers(false).unwrap().unwrap();
        let response = builder.request(get_request()).build().unwrap();
        assert_eq!(response.code(), 200);
        assert_eq!(response.header("content-length"), Some("5"));

        let mut reader = codec.open_response_body(&response).unwrap();
        let mut body = String::new();
        reader.read_to_string(&mut body).unwrap();
        assert_eq!(body, "hello");
        // The connection is reusable again.
        assert_eq!(codec.shared.state(), State::Idle);
    }

    #[test]
    fn reads_chunked_response_with_trailers() {
        let (client, mut server) = pair();
        let connection = test_connection(Box::new(client));
        let mut codec = Http1Codec::new(connection);

        codec.write_request_headers(&get_request()).unwrap();
        codec.finish_request().unwrap();
        server
            .write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                  5\r\nhello\r\n6\r\n world\r\n0\r\nX-Checksum: abc\r\n\r\n",
            )
            .unwrap();

        let builder = codec.read_response_headers(false).unwrap().unwrap();
        let response = builder.request(get_request()).build().unwrap();
        let mut reader = codec.open_response_body(&response).unwrap();
        let mut body = String::new();
        reader.read_to_string(&mut body).unwrap();
        assert_eq!(body, "hello world");
        assert_eq!(codec.trailers().get("X-Checksum"), Some("abc"));
    }

    #[test]
    fn non_hex_chunk_size_is_fatal() {
        let (client, mut server) = pair();
        let connection = test_connection(Box::new(client));
        let mut codec = Http1Codec::new(connection.clone());

        codec.write_request_headers(&get_request()).unwrap();
        codec.finish_request().unwrap();
        server
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n")
            .unwrap();

        let builder = codec.read_response_headers(false).unwrap().unwrap();
        let response = builder.request(get_request()).build().unwrap();
        let mut reader = codec.open_response_body(&response).unwrap();
        let mut body = Vec::new();
        let err = reader.read_to_end(&mut body).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(body.is_empty());
        assert!(connection.no_new_exchanges());
    }

    #[test]
    fn short_fixed_body_is_an_error() {
        let (client, mut server) = pair();
        let connection = test_connection(Box::new(client));
        let mut codec = Http1Codec::new(connection.clone());

        codec.write_request_headers(&get_request()).unwrap();
        codec.finish_request().unwrap();
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort")
            .unwrap();
        server.shutdown().unwrap();

        let builder = codec.read_response_headers(false).unwrap().unwrap();
        let response = builder.request(get_request()).build().unwrap();
        let mut reader = codec.open_response_body(&response).unwrap();
        let mut body = Vec::new();
        let err = reader.read_to_end(&mut body).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(connection.no_new_exchanges());
    }

    #[test]
    fn interim_100_and_connection_close() {
        let (client, mut server) = pair();
        let connection = test_connection(Box::new(client));
        let mut codec = Http1Codec::new(connection.clone());

        codec.write_request_headers(&get_request()).unwrap();
        codec.finish_request().unwrap();
        server
            .write_all(
                b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
            )
            .unwrap();

        // Not expecting continue: the interim response surfaces and the
        // caller reads again.
        let interim = codec.read_response_headers(false).unwrap().unwrap();
        assert_eq!(interim.peek_code(), Some(100));
        let builder = codec.read_response_headers(false).unwrap().unwrap();
        let response = builder.request(get_request()).build().unwrap();
        assert_eq!(response.code(), 200);
        assert!(connection.no_new_exchanges());
    }

    #[test]
    fn expect_continue_returns_none_on_100() {
        let (client, mut server) = pair();
        let connection = test_connection(Box::new(client));
        let mut codec = Http1Codec::new(connection);

        let request = Request::builder()
            .url("http://example.com/")
            .unwrap()
            .method("PUT", Some(crate::http::text_body("hello", None)))
            .header("Expect", "100-continue")
            .build()
            .unwrap();
        codec.write_request_headers(&request).unwrap();
        codec.flush_request().unwrap();
        server.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").unwrap();

        assert!(codec.read_response_headers(true).unwrap().is_none());
    }

    #[test]
    fn chunked_sink_frames_writes() {
        let (client, mut server) = pair();
        let connection = test_connection(Box::new(client));
        let mut codec = Http1Codec::new(connection);

        let request = Request::builder()
            .url("http://example.com/")
            .unwrap()
            .method("POST", Some(crate::http::text_body("ignored", None)))
            .header("Transfer-Encoding", "chunked")
            .build()
            .unwrap();
        codec.write_request_headers(&request).unwrap();
        let mut sink = codec.create_request_body_sink(&request, -1).unwrap();
        sink.write_all(b"hello").unwrap();
        sink.finish().unwrap();

        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = server.read(&mut chunk).unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if buf.ends_with(b"0\r\n\r\n") {
                break;
            }
        }
        let text = String::from_utf8(buf).unwrap();
        assert!(text.ends_with("\r\n\r\n5\r\nhello\r\n0\r\n\r\n"), "{}", text);
    }

    #[test]
    fn http10_response_reads_to_eof_and_disables_reuse() {
        let (client, mut server) = pair();
        let connection = test_connection(Box::new(client));
        let mut codec = Http1Codec::new(connection.clone());

        codec.write_request_headers(&get_request()).unwrap();
        codec.finish_request().unwrap();
        server.write_all(b"HTTP/1.0 200 OK\r\n\r\nold school").unwrap();
        server.shutdown().unwrap();

        let builder = codec.read_response_headers(false).unwrap().unwrap();
        let response = builder.request(get_request()).build().unwrap();
        assert!(connection.no_new_exchanges());
        let mut reader = codec.open_response_body(&response).unwrap();
        let mut body = String::new();
        reader.read_to_string(&mut body).unwrap();
        assert_eq!(body, "old school");
    }
}
