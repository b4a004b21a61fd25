//! End-to-end client behavior against a scripted server.

mod support;

use std::io::{Read as _, Write as _};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier::{
    text_body, Authenticator, Client, ConnectionSpec, Error, Handshake, InMemoryCookieJar,
    Protocol, Request, Response, Route, TlsConnector, TlsFailure, TlsTransport, TlsVersion,
    Transport,
};
use support::{MockResponse, MockWebServer, SocketPolicy};

fn get(url: &str) -> Request {
    Request::get(url).unwrap()
}

#[test]
fn simple_get() {
    let server = MockWebServer::start();
    server.enqueue(MockResponse::new().body("hello world"));

    let client = Client::new();
    let mut response = client.new_call(get(&server.url("/"))).execute().unwrap();

    assert_eq!(response.code(), 200);
    assert_eq!(response.body_mut().string().unwrap(), "hello world");

    let recorded = server.take_request();
    assert_eq!(recorded.request_line, "GET / HTTP/1.1");
    assert_eq!(
        recorded.header("Host").unwrap(),
        format!("127.0.0.1:{}", server.port())
    );
    assert!(recorded.header("User-Agent").unwrap().starts_with("courier/"));
}

#[test]
fn redirect_follow() {
    let server = MockWebServer::start();
    server.enqueue(
        MockResponse::new()
            .code(302, "Found")
            .header("Location", "/new"),
    );
    server.enqueue(MockResponse::new().body("new location"));

    let client = Client::new();
    let mut response = client.new_call(get(&server.url("/"))).execute().unwrap();

    assert_eq!(response.code(), 200);
    assert_eq!(response.body_mut().string().unwrap(), "new location");
    assert_eq!(response.prior_response().unwrap().code(), 302);

    let first = server.take_request();
    let second = server.take_request();
    assert_eq!(first.request_line, "GET / HTTP/1.1");
    assert_eq!(second.request_line, "GET /new HTTP/1.1");
}

#[test]
fn redirects_are_capped() {
    let server = MockWebServer::start();
    for _ in 0..25 {
        server.enqueue(
            MockResponse::new()
                .code(302, "Found")
                .header("Location", "/loop"),
        );
    }

    let client = Client::new();
    let err = client.new_call(get(&server.url("/"))).execute().unwrap_err();
    assert!(err.is_protocol());
    assert!(err.to_string().contains("too many follow-up requests"));
}

#[test]
fn expect_continue_put() {
    let server = MockWebServer::start();
    server.enqueue(MockResponse::new());

    let client = Client::new();
    let request = Request::builder()
        .url(server.url("/"))
        .unwrap()
        .method("PUT", Some(text_body("hello", None)))
        .header("Expect", "100-continue")
        .build()
        .unwrap();
    let response = client.new_call(request).execute().unwrap();
    assert_eq!(response.code(), 200);

    let recorded = server.take_request();
    assert_eq!(recorded.request_line, "PUT / HTTP/1.1");
    assert_eq!(recorded.header("Content-Length"), Some("5"));
    assert_eq!(recorded.body, b"hello");
}

#[test]
fn post_body_round_trips() {
    let server = MockWebServer::start();
    server.enqueue(MockResponse::new().body("created"));

    let client = Client::new();
    let request = Request::builder()
        .url(server.url("/submit"))
        .unwrap()
        .post(text_body("name=value", None))
        .build()
        .unwrap();
    let mut response = client.new_call(request).execute().unwrap();
    assert_eq!(response.body_mut().string().unwrap(), "created");

    let recorded = server.take_request();
    assert_eq!(recorded.request_line, "POST /submit HTTP/1.1");
    assert_eq!(recorded.body, b"name=value");
}

#[test]
fn connection_reused_across_sequential_calls() {
    let server = MockWebServer::start();
    server.enqueue(MockResponse::new().body("one"));
    server.enqueue(MockResponse::new().body("two"));

    let client = Client::new();
    let mut first = client.new_call(get(&server.url("/a"))).execute().unwrap();
    assert_eq!(first.body_mut().string().unwrap(), "one");
    let mut second = client.new_call(get(&server.url("/b"))).execute().unwrap();
    assert_eq!(second.body_mut().string().unwrap(), "two");

    let a = server.take_request();
    let b = server.take_request();
    assert_eq!(a.connection_index, b.connection_index);
    assert_eq!(client.connection_count(), 1);
}

#[test]
fn disconnect_at_start_then_retry_succeeds() {
    let server = MockWebServer::start();
    server.enqueue(MockResponse::new().socket_policy(SocketPolicy::DisconnectAtStart));
    server.enqueue(MockResponse::new().body("after retry"));

    // First call fails: a fresh connection that dies before the response
    // has nothing to retry against the same route, and the route is spent.
    let client = Client::new();
    let first = client.new_call(get(&server.url("/"))).execute();
    let second = client.new_call(get(&server.url("/"))).execute();

    let succeeded = match (first, second) {
        (Ok(mut response), _) => {
            // The engine may have recovered internally via another route.
            response.body_mut().string().unwrap()
        }
        (Err(e), Ok(mut response)) => {
            assert!(e.is_io());
            response.body_mut().string().unwrap()
        }
        (Err(first), Err(second)) => {
            panic!("both calls failed: {} / {}", first, second)
        }
    };
    assert_eq!(succeeded, "after retry");
}

#[test]
fn gzip_response_transparently_decoded() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write as _;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"gzipped payload").unwrap();
    let compressed = encoder.finish().unwrap();

    let server = MockWebServer::start();
    server.enqueue(
        MockResponse::new()
            .header("Content-Encoding", "gzip")
            .body(compressed),
    );

    let client = Client::new();
    let mut response = client.new_call(get(&server.url("/"))).execute().unwrap();
    assert_eq!(response.body_mut().string().unwrap(), "gzipped payload");
    assert!(response.header("Content-Encoding").is_none());

    let recorded = server.take_request();
    assert_eq!(recorded.header("Accept-Encoding"), Some("gzip"));
}

#[test]
fn cookies_stored_and_replayed() {
    let server = MockWebServer::start();
    server.enqueue(
        MockResponse::new()
            .header("Set-Cookie", "session=abc123; Path=/")
            .body("login ok"),
    );
    server.enqueue(MockResponse::new().body("authenticated"));

    let client = Client::builder()
        .cookie_jar(Arc::new(InMemoryCookieJar::new()))
        .build()
        .unwrap();

    let mut first = client.new_call(get(&server.url("/login"))).execute().unwrap();
    first.body_mut().string().unwrap();
    let mut second = client.new_call(get(&server.url("/private"))).execute().unwrap();
    second.body_mut().string().unwrap();

    let _ = server.take_request();
    let replay = server.take_request();
    assert_eq!(replay.header("Cookie"), Some("session=abc123"));
}

#[test]
fn authenticator_retries_on_401() {
    struct TestAuth;
    impl Authenticator for TestAuth {
        fn authenticate(
            &self,
            _route: Option<&Route>,
            response: &Response,
        ) -> courier::Result<Option<Request>> {
            if response.request().header("Authorization").is_some() {
                // Credentials already failed once; give up.
                return Ok(None);
            }
            Ok(Some(
                response
                    .request()
                    .new_builder()
                    .header("Authorization", &courier::basic_credentials("user", "pass"))
                    .build()?,
            ))
        }
    }

    let server = MockWebServer::start();
    server.enqueue(
        MockResponse::new()
            .code(401, "Unauthorized")
            .header("WWW-Authenticate", "Basic realm=\"protected\""),
    );
    server.enqueue(MockResponse::new().body("secret"));

    let client = Client::builder()
        .authenticator(Arc::new(TestAuth))
        .build()
        .unwrap();
    let mut response = client.new_call(get(&server.url("/"))).execute().unwrap();
    assert_eq!(response.body_mut().string().unwrap(), "secret");

    let first = server.take_request();
    let second = server.take_request();
    assert!(first.header("Authorization").is_none());
    assert_eq!(
        second.header("Authorization").unwrap(),
        courier::basic_credentials("user", "pass")
    );
}

#[test]
fn call_timeout_fires() {
    let server = MockWebServer::start();
    // No response enqueued: the server holds the request until the timeout.

    let client = Client::builder()
        .call_timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    let err = client.new_call(get(&server.url("/slow"))).execute().unwrap_err();
    assert!(err.is_timeout() || err.is_canceled(), "unexpected: {}", err);
}

#[test]
fn calls_execute_only_once() {
    let server = MockWebServer::start();
    server.enqueue(MockResponse::new().body("only once"));

    let client = Client::new();
    let call = client.new_call(get(&server.url("/")));
    call.execute().unwrap();
    let err = call.execute().unwrap_err();
    assert!(err.to_string().contains("already executed"));
}

#[test]
fn enqueue_delivers_exactly_once() {
    let server = MockWebServer::start();
    server.enqueue(MockResponse::new().body("async hello"));

    let client = Client::new();
    let deliveries = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = std::sync::mpsc::channel();

    let counted = deliveries.clone();
    client.new_call(get(&server.url("/"))).enqueue(move |result| {
        counted.fetch_add(1, Ordering::SeqCst);
        let mut response = result.unwrap();
        tx.send(response.body_mut().string().unwrap()).unwrap();
    });

    let body = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(body, "async hello");
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);
}

#[test]
fn application_interceptor_sees_call_once() {
    struct CountingInterceptor(Arc<AtomicUsize>);
    impl courier::Interceptor for CountingInterceptor {
        fn intercept(
            &self,
            chain: &mut courier::Chain<'_>,
        ) -> courier::Result<Response> {
            self.0.fetch_add(1, Ordering::SeqCst);
            let request = chain.request().clone();
            chain.proceed(request)
        }
    }

    let server = MockWebServer::start();
    server.enqueue(
        MockResponse::new()
            .code(302, "Found")
            .header("Location", "/2"),
    );
    server.enqueue(MockResponse::new().body("done"));

    let count = Arc::new(AtomicUsize::new(0));
    let client = Client::builder()
        .add_interceptor(Arc::new(CountingInterceptor(count.clone())))
        .build()
        .unwrap();
    let mut response = client.new_call(get(&server.url("/"))).execute().unwrap();
    response.body_mut().string().unwrap();

    // One application-interceptor pass despite the redirect underneath.
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

// ===== TLS fallback =====

/// A pass-through "TLS" transport over plain TCP, with a scripted number of
/// handshake failures before success.
struct FakeTls {
    stream: TcpStream,
    handshake: Handshake,
}

impl std::io::Read for FakeTls {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

impl std::io::Write for FakeTls {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for FakeTls {
    fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }
    fn try_clone(&self) -> std::io::Result<Box<dyn Transport>> {
        Ok(Box::new(FakeTls {
            stream: self.stream.try_clone()?,
            handshake: self.handshake.clone(),
        }))
    }
    fn shutdown(&self) -> std::io::Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)
    }
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }
    fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.stream.set_write_timeout(timeout)
    }
}

impl TlsTransport for FakeTls {
    fn handshake(&self) -> &Handshake {
        &self.handshake
    }
    fn alpn_protocol(&self) -> Option<&str> {
        Some("http/1.1")
    }
}

struct FlakyTlsConnector {
    handshakes_to_fail: AtomicUsize,
    specs_seen: Mutex<Vec<Vec<TlsVersion>>>,
}

impl TlsConnector for FlakyTlsConnector {
    fn connect(
        &self,
        tcp: TcpStream,
        _host: &str,
        _port: u16,
        spec: &ConnectionSpec,
        _alpn: &[Protocol],
    ) -> Result<Box<dyn TlsTransport>, TlsFailure> {
        self.specs_seen
            .lock()
            .unwrap()
            .push(spec.tls_versions().to_vec());
        if self
            .handshakes_to_fail
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TlsFailure::handshake("scripted handshake failure"));
        }
        Ok(Box::new(FakeTls {
            stream: tcp,
            handshake: Handshake::new(TlsVersion::Tls12, "TLS_FAKE_SUITE", Vec::new()),
        }))
    }
}

#[test]
fn tls_fallback_retries_with_next_spec() {
    let server = MockWebServer::start();
    server.enqueue(MockResponse::new().body("secure"));

    let connector = Arc::new(FlakyTlsConnector {
        handshakes_to_fail: AtomicUsize::new(1),
        specs_seen: Mutex::new(Vec::new()),
    });
    let client = Client::builder()
        .tls_connector(connector.clone())
        .connection_specs(vec![
            ConnectionSpec::modern_tls(),
            ConnectionSpec::compatible_tls(),
        ])
        .build()
        .unwrap();

    let mut response = client
        .new_call(get(&server.https_url("/")))
        .execute()
        .unwrap();
    assert_eq!(response.code(), 200);
    assert_eq!(response.body_mut().string().unwrap(), "secure");
    assert!(response.handshake().is_some());

    let seen = connector.specs_seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], ConnectionSpec::modern_tls().tls_versions());
    assert_eq!(seen[1], ConnectionSpec::compatible_tls().tls_versions());
}

#[test]
fn certificate_failure_does_not_fall_back() {
    struct CertFailConnector;
    impl TlsConnector for CertFailConnector {
        fn connect(
            &self,
            _tcp: TcpStream,
            _host: &str,
            _port: u16,
            _spec: &ConnectionSpec,
            _alpn: &[Protocol],
        ) -> Result<Box<dyn TlsTransport>, TlsFailure> {
            Err(TlsFailure::certificate("bad certificate"))
        }
    }

    let server = MockWebServer::start();
    let client = Client::builder()
        .tls_connector(Arc::new(CertFailConnector))
        .connection_specs(vec![
            ConnectionSpec::modern_tls(),
            ConnectionSpec::compatible_tls(),
        ])
        .build()
        .unwrap();

    let err = client
        .new_call(get(&server.https_url("/")))
        .execute()
        .unwrap_err();
    assert!(err.is_handshake());
}

#[test]
fn scheme_error_reported_eagerly() {
    let err = Request::get("ftp://example.com/").unwrap_err();
    assert!(err.is_url());
    let err: Error = Request::get("http://bad host/").unwrap_err();
    assert!(err.is_url());
}
