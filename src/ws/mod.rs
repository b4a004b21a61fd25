//! WebSocket support: upgrade over HTTP/1.1, then a framed, full-duplex
//! socket with ping keepalive and an orderly close handshake.

pub(crate) mod deflate;
pub(crate) mod frame;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::client::{Call, Client};
use crate::connection::exchange::WsStreams;
use crate::error::{Error, Result};
use crate::event;
use crate::http::{Request, Response};
use crate::task::TaskQueue;

use self::deflate::{MessageDeflater, MessageInflater, WebSocketExtensions};
use self::frame::{FrameCallback, FrameReader, FrameWriter, OPCODE_BINARY, OPCODE_TEXT};

const ACCEPT_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Outgoing frames queue up to this many bytes before the socket is
/// declared too slow and closed with 1001.
const MAX_QUEUE_SIZE: u64 = 16 * 1024 * 1024;

/// Incoming messages larger than this fail the connection.
const MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;

/// How long after a close handshake begins before the socket is torn down
/// regardless.
const CANCEL_AFTER_CLOSE: Duration = Duration::from_secs(60);

/// Receives WebSocket events. All methods default to no-ops.
#[allow(unused_variables)]
pub trait WebSocketListener: Send + Sync {
    fn on_open(&self, web_socket: &WebSocket, response: &Response) {}

    fn on_text(&self, web_socket: &WebSocket, text: &str) {}

    fn on_binary(&self, web_socket: &WebSocket, data: &[u8]) {}

    /// The peer began the close handshake. No more incoming messages.
    fn on_closing(&self, web_socket: &WebSocket, code: u16, reason: &str) {}

    /// Both peers acknowledged the close; the socket is freed.
    fn on_closed(&self, web_socket: &WebSocket, code: u16, reason: &str) {}

    fn on_failure(&self, web_socket: &WebSocket, error: &Error, response: Option<&Response>) {}
}

impl std::fmt::Debug for dyn WebSocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("WebSocketListener")
    }
}

enum Outgoing {
    Message { opcode: u8, payload: Vec<u8> },
    Pong(Vec<u8>),
}

struct WsState {
    streams: Option<WsStreams>,
    writer: Option<FrameWriter>,
    queue: VecDeque<Outgoing>,
    queue_size: u64,
    /// A close we have promised to send.
    enqueued_close: Option<(u16, Vec<u8>)>,
    sent_close: bool,
    received_close: Option<(u16, String)>,
    awaiting_pong: bool,
    sent_ping_count: u64,
    received_pong_count: u64,
}

/// A live (or connecting) WebSocket.
#[derive(Clone)]
pub struct WebSocket {
    inner: Arc<WsInner>,
}

struct WsInner {
    request: Request,
    listener: Arc<dyn WebSocketListener>,
    key: String,
    tasks: TaskQueue,
    ping_interval: Duration,
    state: Mutex<WsState>,
    failed: AtomicBool,
    call: Mutex<Option<Call>>,
}

impl WebSocket {
    /// The original upgrade request.
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// Bytes of messages accepted by `send_*` but not yet written.
    pub fn queue_size(&self) -> u64 {
        self.inner.state.lock().expect("websocket poisoned").queue_size
    }

    /// Enqueues a text message. Returns false when the socket is closed,
    /// failed, or its outgoing queue is full.
    pub fn send_text(&self, text: &str) -> bool {
        self.send(OPCODE_TEXT, text.as_bytes().to_vec())
    }

    /// Enqueues a binary message.
    pub fn send_binary(&self, data: &[u8]) -> bool {
        self.send(OPCODE_BINARY, data.to_vec())
    }

    /// Begins the close handshake. Messages already enqueued are written
    /// first; no further messages are accepted.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        if frame::validate_close_code(code).is_err() {
            return false;
        }
        if reason.len() > 123 {
            return false;
        }
        {
            let mut state = self.inner.state.lock().expect("websocket poisoned");
            if self.inner.failed.load(Ordering::SeqCst)
                || state.enqueued_close.is_some()
                || state.sent_close
            {
                return false;
            }
            state.enqueued_close = Some((code, reason.as_bytes().to_vec()));
        }
        self.inner.schedule_cancel_after_close(self);
        self.inner.run_writer(self);
        true
    }

    /// Immediately and violently releases the socket, discarding queued
    /// messages.
    pub fn cancel(&self) {
        if let Some(call) = self.inner.call.lock().expect("websocket poisoned").clone() {
            call.cancel();
        }
        self.inner
            .fail(self, Error::canceled(), None);
    }

    fn send(&self, opcode: u8, payload: Vec<u8>) -> bool {
        {
            let mut state = self.inner.state.lock().expect("websocket poisoned");
            if self.inner.failed.load(Ordering::SeqCst)
                || state.sent_close
                || state.enqueued_close.is_some()
            {
                return false;
            }
            if state.queue_size + payload.len() as u64 > MAX_QUEUE_SIZE {
                drop(state);
                self.close(1001, "");
                return false;
            }
            state.queue_size += payload.len() as u64;
            state.queue.push_back(Outgoing::Message { opcode, payload });
        }
        self.inner.run_writer(self);
        true
    }
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WebSocket({})", self.inner.request.url().redact())
    }
}

/// Starts a WebSocket connection. The returned handle is immediately
/// usable: messages enqueue until the handshake completes.
pub(crate) fn connect(
    client: &Client,
    request: Request,
    listener: Arc<dyn WebSocketListener>,
) -> WebSocket {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    let key = base64::engine::general_purpose::STANDARD.encode(nonce);

    let web_socket = WebSocket {
        inner: Arc::new(WsInner {
            request: request.clone(),
            listener,
            key: key.clone(),
            tasks: client.runner.new_queue(format!("ws {}", request.url().redact())),
            ping_interval: client.config.ping_interval,
            state: Mutex::new(WsState {
                streams: None,
                writer: None,
                queue: VecDeque::new(),
                queue_size: 0,
                enqueued_close: None,
                sent_close: false,
                received_close: None,
                awaiting_pong: false,
                sent_ping_count: 0,
                received_pong_count: 0,
            }),
            failed: AtomicBool::new(false),
            call: Mutex::new(None),
        }),
    };

    // WebSockets ride HTTP/1.1 only: HTTP/2 has no Upgrade.
    let upgrade_client = match Client::builder_from(client)
        .protocols(vec![crate::connect::Protocol::Http11])
        .build()
    {
        Ok(upgrade_client) => upgrade_client,
        Err(e) => {
            let ws = web_socket.clone();
            ws.inner.fail(&web_socket, e, None);
            return web_socket;
        }
    };

    let upgrade_request = request
        .new_builder()
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Key", &key)
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Extensions", "permessage-deflate")
        .build()
        .expect("upgrade request from a valid request");

    let call = Call::new(upgrade_client, upgrade_request, true);
    *web_socket.inner.call.lock().expect("websocket poisoned") = Some(call.clone());

    let ws = web_socket.clone();
    let min_to_compress = client.config.min_web_socket_message_to_compress;
    call.enqueue(move |result| match result {
        Ok(response) => ws.inner.clone().on_upgrade_response(&ws, response, min_to_compress),
        Err(e) => ws.inner.fail(&ws, e, None),
    });

    web_socket
}

impl WsInner {
    fn on_upgrade_response(
        self: Arc<WsInner>,
        web_socket: &WebSocket,
        response: Response,
        min_to_compress: u64,
    ) {
        if let Err(e) = self.check_upgrade(&response) {
            self.fail(web_socket, e, Some(&response));
            return;
        }

        let call = self.call.lock().expect("websocket poisoned").clone();
        let exchange = call.and_then(|c| c.inner().current_exchange());
        let Some(exchange) = exchange else {
            self.fail(
                web_socket,
                Error::protocol("upgrade response without a connection"),
                Some(&response),
            );
            return;
        };
        let streams = exchange.websocket_streams();

        let extensions = WebSocketExtensions::parse(response.headers());
        let compression = extensions.compression_enabled();
        let (deflater, inflater) = if compression {
            (
                Some(MessageDeflater::new(!extensions.client_no_context_takeover)),
                Some(MessageInflater::new(!extensions.server_no_context_takeover)),
            )
        } else {
            (None, None)
        };

        let write_transport = {
            let io = streams.io.lock().expect("websocket io poisoned");
            match io.clone_transport() {
                Ok(transport) => transport,
                Err(e) => {
                    drop(io);
                    self.fail(web_socket, Error::io(e), Some(&response));
                    return;
                }
            }
        };

        // No read deadline: frames arrive whenever the server sends them.
        let _ = streams.connection.set_timeouts(None, None);

        let reader_io = streams.io.clone();
        {
            let mut state = self.state.lock().expect("websocket poisoned");
            state.writer = Some(FrameWriter::new(write_transport, deflater, min_to_compress));
            state.streams = Some(streams);
        }

        event::emit_ws(|| self.listener.on_open(web_socket, &response));
        self.schedule_pings(web_socket);
        self.run_writer(web_socket);

        // This thread (the dispatcher's) becomes the reader loop.
        let mut reader = FrameReader::new(reader_io, inflater, MAX_MESSAGE_SIZE);
        let mut callback = ReaderCallback {
            inner: self.clone(),
            web_socket: web_socket.clone(),
        };
        loop {
            if self.failed.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = reader.process_next_frame(&mut callback) {
                // A peer that already sent its close may drop the socket
                // while our echo is in flight; that is a clean end.
                let closing = {
                    let state = self.state.lock().expect("websocket poisoned");
                    state.received_close.is_some()
                };
                if !closing {
                    self.fail(web_socket, e, None);
                }
                break;
            }
            let finished = {
                let state = self.state.lock().expect("websocket poisoned");
                state.received_close.is_some() && state.sent_close
            };
            if finished {
                break;
            }
        }
    }

    fn check_upgrade(&self, response: &Response) -> Result<()> {
        if response.code() != 101 {
            return Err(Error::protocol(format!(
                "expected HTTP 101 response but was '{} {}'",
                response.code(),
                response.message()
            )));
        }
        if !header_equals(response, "Connection", "Upgrade") {
            return Err(Error::protocol(
                "expected 'Connection' header value 'Upgrade'",
            ));
        }
        if !header_equals(response, "Upgrade", "websocket") {
            return Err(Error::protocol(
                "expected 'Upgrade' header value 'websocket'",
            ));
        }
        let accept = base64::engine::general_purpose::STANDARD.encode(
            Sha1::new()
                .chain_update(self.key.as_bytes())
                .chain_update(ACCEPT_MAGIC.as_bytes())
                .finalize(),
        );
        let actual = response.header("Sec-WebSocket-Accept").unwrap_or("");
        if accept != actual {
            return Err(Error::protocol(format!(
                "expected 'Sec-WebSocket-Accept' header value '{}' but was '{}'",
                accept, actual
            )));
        }
        Ok(())
    }

    /// Drains the outgoing queue on the task runner: pongs first, then
    /// messages, then a pending close once the queue is empty.
    fn run_writer(self: &Arc<WsInner>, web_socket: &WebSocket) {
        let inner = self.clone();
        let ws = web_socket.clone();
        self.tasks.schedule("writer", 0, move || {
            if inner.write_one(&ws) {
                0
            } else {
                -1
            }
        });
    }

    /// Writes one frame. Returns true when more work may remain.
    fn write_one(self: &Arc<WsInner>, web_socket: &WebSocket) -> bool {
        enum Job {
            Pong(Vec<u8>),
            Message { opcode: u8, payload: Vec<u8> },
            Close(u16, Vec<u8>),
            Nothing,
        }

        let (job, mut writer) = {
            let mut state = self.state.lock().expect("websocket poisoned");
            if state.writer.is_none() || self.failed.load(Ordering::SeqCst) {
                return false;
            }
            let job = match state.queue.pop_front() {
                Some(Outgoing::Pong(payload)) => Job::Pong(payload),
                Some(Outgoing::Message { opcode, payload }) => {
                    state.queue_size -= payload.len() as u64;
                    Job::Message { opcode, payload }
                }
                None => match state.enqueued_close.take() {
                    Some((code, reason)) if !state.sent_close => {
                        state.sent_close = true;
                        Job::Close(code, reason)
                    }
                    _ => Job::Nothing,
                },
            };
            match job {
                Job::Nothing => return false,
                job => (job, state.writer.take().expect("checked above")),
            }
        };

        let result = match &job {
            Job::Pong(payload) => writer.write_pong(payload),
            Job::Message { opcode, payload } => writer.write_message(*opcode, payload),
            Job::Close(code, reason) => writer.write_close(*code, reason),
            Job::Nothing => unreachable!(),
        };

        {
            let mut state = self.state.lock().expect("websocket poisoned");
            state.writer = Some(writer);
        }

        match result {
            Ok(()) => {
                if matches!(job, Job::Close(..)) {
                    self.finish_close(web_socket);
                    return false;
                }
                true
            }
            Err(e) => {
                self.fail(web_socket, e, None);
                false
            }
        }
    }

    /// The close frame went out; if the peer's close already arrived, the
    /// socket is done.
    fn finish_close(self: &Arc<WsInner>, web_socket: &WebSocket) {
        let received = {
            let state = self.state.lock().expect("websocket poisoned");
            state.received_close.clone()
        };
        if let Some((code, reason)) = received {
            self.teardown();
            event::emit_ws(|| self.listener.on_closed(web_socket, code, &reason));
        }
    }

    fn schedule_pings(self: &Arc<WsInner>, web_socket: &WebSocket) {
        if self.ping_interval.is_zero() {
            return;
        }
        let interval = self.ping_interval;
        let interval_ns = interval.as_nanos() as u64;
        let inner = self.clone();
        let ws = web_socket.clone();
        self.tasks.schedule("ping", interval_ns, move || {
            if inner.write_ping(&ws, interval) {
                interval_ns as i64
            } else {
                -1
            }
        });
    }

    /// Returns false when pinging must stop.
    fn write_ping(self: &Arc<WsInner>, web_socket: &WebSocket, interval: Duration) -> bool {
        let (failed_count, mut writer) = {
            let mut state = self.state.lock().expect("websocket poisoned");
            if self.failed.load(Ordering::SeqCst) || state.writer.is_none() {
                return false;
            }
            if state.awaiting_pong {
                (Some(state.received_pong_count), state.writer.take())
            } else {
                state.awaiting_pong = true;
                state.sent_ping_count += 1;
                (None, state.writer.take())
            }
        };

        if let Some(pongs) = failed_count {
            if let Some(writer) = writer {
                self.state.lock().expect("websocket poisoned").writer = Some(writer);
            }
            self.fail(
                web_socket,
                Error::read_timeout(format!(
                    "sent ping but didn't receive pong within {}ms (after {} successful ping/pongs)",
                    interval.as_millis(),
                    pongs
                )),
                None,
            );
            return false;
        }

        let result = writer
            .as_mut()
            .expect("writer present")
            .write_ping(&[]);
        self.state.lock().expect("websocket poisoned").writer = writer;
        if let Err(e) = result {
            self.fail(web_socket, e, None);
            return false;
        }
        true
    }

    fn schedule_cancel_after_close(self: &Arc<WsInner>, web_socket: &WebSocket) {
        let inner = self.clone();
        let ws = web_socket.clone();
        self.tasks.execute(
            "cancel after close",
            CANCEL_AFTER_CLOSE.as_nanos() as u64,
            move || {
                if !inner.failed.load(Ordering::SeqCst) {
                    let done = {
                        let state = inner.state.lock().expect("websocket poisoned");
                        state.sent_close && state.received_close.is_some()
                    };
                    if !done {
                        inner.fail(&ws, Error::canceled().detail("close timed out"), None);
                    }
                }
            },
        );
    }

    fn teardown(&self) {
        {
            let mut state = self.state.lock().expect("websocket poisoned");
            if let Some(streams) = state.streams.take() {
                streams.connection.close();
            }
            state.writer = None;
        }
        self.tasks.cancel_all();
        // Hand the connection slot back so the pool can retire it.
        if let Some(call) = self.call.lock().expect("websocket poisoned").take() {
            if let Some(exchange) = call.inner().current_exchange() {
                exchange.websocket_done();
            }
        }
    }

    fn fail(self: &Arc<WsInner>, web_socket: &WebSocket, error: Error, response: Option<&Response>) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("websocket failed: {}", error);
        self.teardown();
        event::emit_ws(|| self.listener.on_failure(web_socket, &error, response));
    }
}

impl std::fmt::Debug for WsInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("WsInner")
    }
}

fn header_equals(response: &Response, name: &str, value: &str) -> bool {
    response
        .header(name)
        .map(|v| v.eq_ignore_ascii_case(value))
        .unwrap_or(false)
}

struct ReaderCallback {
    inner: Arc<WsInner>,
    web_socket: WebSocket,
}

impl FrameCallback for ReaderCallback {
    fn on_text(&mut self, text: String) -> Result<()> {
        event::emit_ws(|| self.inner.listener.on_text(&self.web_socket, &text));
        Ok(())
    }

    fn on_binary(&mut self, data: Vec<u8>) -> Result<()> {
        event::emit_ws(|| self.inner.listener.on_binary(&self.web_socket, &data));
        Ok(())
    }

    fn on_ping(&mut self, payload: Vec<u8>) -> Result<()> {
        let mut state = self.inner.state.lock().expect("websocket poisoned");
        state.queue.push_back(Outgoing::Pong(payload));
        drop(state);
        self.inner.run_writer(&self.web_socket);
        Ok(())
    }

    fn on_pong(&mut self, _payload: Vec<u8>) -> Result<()> {
        let mut state = self.inner.state.lock().expect("websocket poisoned");
        state.awaiting_pong = false;
        state.received_pong_count += 1;
        Ok(())
    }

    fn on_close(&mut self, code: u16, reason: String) -> Result<()> {
        let already_sent_close = {
            let mut state = self.inner.state.lock().expect("websocket poisoned");
            if state.received_close.is_some() {
                return Err(Error::protocol("multiple close frames"));
            }
            state.received_close = Some((code, reason.clone()));
            state.sent_close
        };

        event::emit_ws(|| self.inner.listener.on_closing(&self.web_socket, code, &reason));

        if already_sent_close {
            // We initiated; the echo completes the handshake.
            self.inner.teardown();
            event::emit_ws(|| self.inner.listener.on_closed(&self.web_socket, code, &reason));
        } else {
            // Echo the close, then tear down once it is written.
            {
                let mut state = self.inner.state.lock().expect("websocket poisoned");
                if state.enqueued_close.is_none() {
                    state.enqueued_close = Some((code, reason.into_bytes()));
                }
            }
            self.inner.schedule_cancel_after_close(&self.web_socket);
            self.inner.run_writer(&self.web_socket);
        }
        Ok(())
    }
}
