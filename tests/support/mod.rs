//! A scriptable blocking HTTP server for exercising the client end to end.
//!
//! Tests enqueue canned responses and assert on the requests the server
//! recorded, in order.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// What to do with the socket around a scripted response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketPolicy {
    KeepOpen,
    /// Accept, then close immediately without reading a request.
    DisconnectAtStart,
    /// Serve the response, then close the connection.
    DisconnectAfterResponse,
}

/// A scripted response.
#[derive(Clone, Debug)]
pub struct MockResponse {
    pub status: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub socket_policy: SocketPolicy,
}

impl MockResponse {
    pub fn new() -> MockResponse {
        MockResponse {
            status: "HTTP/1.1 200 OK".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
            socket_policy: SocketPolicy::KeepOpen,
        }
    }

    pub fn code(mut self, code: u16, reason: &str) -> MockResponse {
        self.status = format!("HTTP/1.1 {} {}", code, reason);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> MockResponse {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> MockResponse {
        self.body = body.into();
        self
    }

    pub fn socket_policy(mut self, policy: SocketPolicy) -> MockResponse {
        self.socket_policy = policy;
        self
    }
}

impl Default for MockResponse {
    fn default() -> MockResponse {
        MockResponse::new()
    }
}

/// A request the server received.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Index of the connection that carried this request; equal values mean
    /// a reused connection.
    pub connection_index: usize,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

struct ServerState {
    responses: VecDeque<MockResponse>,
}

pub struct MockWebServer {
    addr: SocketAddr,
    state: Arc<(Mutex<ServerState>, Condvar)>,
    requests: Receiver<RecordedRequest>,
}

impl MockWebServer {
    pub fn start() -> MockWebServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("mock server addr");
        let state = Arc::new((
            Mutex::new(ServerState {
                responses: VecDeque::new(),
            }),
            Condvar::new(),
        ));
        let (tx, rx) = std::sync::mpsc::channel();

        let accept_state = state.clone();
        std::thread::spawn(move || {
            let mut connection_index = 0usize;
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let state = accept_state.clone();
                let tx = tx.clone();
                let index = connection_index;
                connection_index += 1;
                std::thread::spawn(move || serve_connection(stream, state, tx, index));
            }
        });

        MockWebServer {
            addr,
            state,
            requests: rx,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.addr.port(), path)
    }

    /// URL with an `https` scheme, for tests that install a fake TLS
    /// connector over the plain socket.
    pub fn https_url(&self, path: &str) -> String {
        format!("https://127.0.0.1:{}{}", self.addr.port(), path)
    }

    pub fn enqueue(&self, response: MockResponse) {
        let (lock, cvar) = &*self.state;
        lock.lock().unwrap().responses.push_back(response);
        cvar.notify_all();
    }

    /// The next recorded request, in arrival order.
    pub fn take_request(&self) -> RecordedRequest {
        self.requests
            .recv_timeout(Duration::from_secs(10))
            .expect("request recorded")
    }

    pub fn try_take_request(&self) -> Option<RecordedRequest> {
        self.requests.recv_timeout(Duration::from_millis(200)).ok()
    }
}

fn serve_connection(
    stream: TcpStream,
    state: Arc<(Mutex<ServerState>, Condvar)>,
    tx: Sender<RecordedRequest>,
    connection_index: usize,
) {
    // Peek the policy before reading anything.
    {
        let (lock, _) = &*state;
        let first_policy = lock
            .lock()
            .unwrap()
            .responses
            .front()
            .map(|r| r.socket_policy);
        if first_policy == Some(SocketPolicy::DisconnectAtStart) {
            lock.lock().unwrap().responses.pop_front();
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    }

    let write_half = stream.try_clone().expect("clone socket");
    let mut reader = BufReader::new(stream);
    let mut writer = write_half;

    loop {
        let request = match read_request(&mut reader, &mut writer, connection_index) {
            Some(request) => request,
            None => return,
        };
        let wants_close = request
            .header("Connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);
        let _ = tx.send(request);

        let response = {
            let (lock, cvar) = &*state;
            let mut guard = lock.lock().unwrap();
            loop {
                if let Some(response) = guard.responses.pop_front() {
                    break response;
                }
                let (next, timeout) = cvar
                    .wait_timeout(guard, Duration::from_secs(30))
                    .unwrap();
                guard = next;
                if timeout.timed_out() {
                    return;
                }
            }
        };

        let mut head = format!("{}\r\n", response.status);
        let has_length = response
            .headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
            || response
                .headers
                .iter()
                .any(|(n, v)| n.eq_ignore_ascii_case("Transfer-Encoding") && v == "chunked");
        for (name, value) in &response.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !has_length {
            head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
        }
        head.push_str("\r\n");
        if writer.write_all(head.as_bytes()).is_err() {
            return;
        }
        if writer.write_all(&response.body).is_err() {
            return;
        }
        let _ = writer.flush();

        if response.socket_policy == SocketPolicy::DisconnectAfterResponse || wants_close {
            let _ = writer.shutdown(Shutdown::Both);
            return;
        }
    }
}

fn read_request(
    reader: &mut BufReader<TcpStream>,
    writer: &mut TcpStream,
    connection_index: usize,
) -> Option<RecordedRequest> {
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).ok()? == 0 {
        return None;
    }
    let request_line = request_line.trim_end().to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some(colon) = line.find(':') {
            headers.push((
                line[..colon].to_string(),
                line[colon + 1..].trim().to_string(),
            ));
        }
    }

    let find = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };

    if find("Expect")
        .map(|v| v.eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false)
    {
        writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").ok()?;
        writer.flush().ok()?;
    }

    let mut body = Vec::new();
    if let Some(length) = find("Content-Length").and_then(|v| v.parse::<usize>().ok()) {
        body.resize(length, 0);
        reader.read_exact(&mut body).ok()?;
    } else if find("Transfer-Encoding")
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
    {
        loop {
            let mut size_line = String::new();
            reader.read_line(&mut size_line).ok()?;
            let size = usize::from_str_radix(size_line.trim(), 16).ok()?;
            if size == 0 {
                let mut blank = String::new();
                reader.read_line(&mut blank).ok()?;
                break;
            }
            let mut chunk = vec![0u8; size + 2];
            reader.read_exact(&mut chunk).ok()?;
            chunk.truncate(size);
            body.extend_from_slice(&chunk);
        }
    }

    Some(RecordedRequest {
        request_line,
        headers,
        body,
        connection_index,
    })
}
