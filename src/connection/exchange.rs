//! One request/response pair bound to one connection.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use crate::client::CallInner;
use crate::connection::{BodySink, Connection, ExchangeCodec, IoBuffer};
use crate::error::{Error, Result};
use crate::event;
use crate::http::{MediaType, Request, Response, ResponseBody, ResponseBuilder};
use crate::pool::ConnectionPool;

#[derive(Debug, Default)]
struct ExchangeState {
    request_done: bool,
    response_done: bool,
    released: bool,
    websocket: bool,
}

/// Owns the request writer and response reader of one call on one
/// connection. When both directions complete (or either fails) the
/// connection slot is released back to the pool.
pub(crate) struct Exchange {
    call: Arc<CallInner>,
    connection: Arc<Connection>,
    pool: ConnectionPool,
    codec: Mutex<Box<dyn ExchangeCodec>>,
    state: Mutex<ExchangeState>,
}

impl Exchange {
    pub(crate) fn new(
        call: Arc<CallInner>,
        connection: Arc<Connection>,
        pool: ConnectionPool,
        codec: Box<dyn ExchangeCodec>,
    ) -> Arc<Exchange> {
        Arc::new(Exchange {
            call,
            connection,
            pool,
            codec: Mutex::new(codec),
            state: Mutex::new(ExchangeState::default()),
        })
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn write_request_headers(&self, request: &Request) -> Result<()> {
        event::emit(self.call.event_listener(), |l| {
            l.request_headers_start(&self.call.as_call())
        });
        let result = self
            .codec
            .lock()
            .expect("codec poisoned")
            .write_request_headers(request);
        if let Err(ref e) = result {
            self.track_failure(e);
        } else {
            event::emit(self.call.event_listener(), |l| {
                l.request_headers_end(&self.call.as_call(), request)
            });
        }
        result
    }

    pub(crate) fn create_request_body(
        self: &Arc<Exchange>,
        request: &Request,
        content_length: i64,
    ) -> Result<CountingSink> {
        event::emit(self.call.event_listener(), |l| {
            l.request_body_start(&self.call.as_call())
        });
        let inner = self
            .codec
            .lock()
            .expect("codec poisoned")
            .create_request_body_sink(request, content_length)
            .map_err(|e| {
                self.track_failure(&e);
                e
            })?;
        Ok(CountingSink {
            inner,
            exchange: self.clone(),
            byte_count: 0,
            finished: false,
        })
    }

    pub(crate) fn flush_request(&self) -> Result<()> {
        let result = self.codec.lock().expect("codec poisoned").flush_request();
        if let Err(ref e) = result {
            self.track_failure(e);
        }
        result
    }

    pub(crate) fn finish_request(&self) -> Result<()> {
        let result = self.codec.lock().expect("codec poisoned").finish_request();
        match result {
            Ok(()) => {
                self.request_complete();
                Ok(())
            }
            Err(e) => {
                self.track_failure(&e);
                Err(e)
            }
        }
    }

    pub(crate) fn read_response_headers(
        &self,
        expect_continue: bool,
    ) -> Result<Option<ResponseBuilder>> {
        event::emit(self.call.event_listener(), |l| {
            l.response_headers_start(&self.call.as_call())
        });
        let result = self
            .codec
            .lock()
            .expect("codec poisoned")
            .read_response_headers(expect_continue);
        if let Err(ref e) = result {
            self.track_failure(e);
        }
        result
    }

    pub(crate) fn open_response_body(self: &Arc<Exchange>, response: &Response) -> Result<ResponseBody> {
        event::emit(self.call.event_listener(), |l| {
            l.response_body_start(&self.call.as_call())
        });
        let media_type = response
            .header("Content-Type")
            .and_then(MediaType::parse);
        let content_length = reported_content_length(response);
        let inner = self
            .codec
            .lock()
            .expect("codec poisoned")
            .open_response_body(response)
            .map_err(|e| {
                self.track_failure(&e);
                e
            })?;
        let reader = ExchangeReader {
            inner,
            exchange: self.clone(),
            byte_count: 0,
            completed: false,
            known_empty: content_length == 0,
        };
        Ok(ResponseBody::new(media_type, content_length, Box::new(reader)))
    }

    pub(crate) fn trailers(&self) -> crate::http::Headers {
        self.codec.lock().expect("codec poisoned").trailers()
    }

    pub(crate) fn cancel(&self) {
        self.codec.lock().expect("codec poisoned").cancel();
    }

    /// Claims the connection for a WebSocket. The exchange stops managing
    /// the socket: the caller owns it until the WebSocket closes it.
    pub(crate) fn websocket_streams(&self) -> WsStreams {
        self.state.lock().expect("exchange poisoned").websocket = true;
        self.connection.set_no_new_exchanges();
        WsStreams {
            io: self.connection.io().clone(),
            connection: self.connection.clone(),
        }
    }

    pub(crate) fn no_new_exchanges_on_connection(&self) {
        self.connection.set_no_new_exchanges();
    }

    /// The WebSocket that took this exchange's socket is finished; give the
    /// connection back so the pool can retire it.
    pub(crate) fn websocket_done(&self) {
        {
            let mut state = self.state.lock().expect("exchange poisoned");
            if state.released {
                return;
            }
            state.websocket = false;
            state.request_done = true;
            state.response_done = true;
        }
        self.release(false);
    }

    // ===== completion =====

    fn request_complete(&self) {
        let release = {
            let mut state = self.state.lock().expect("exchange poisoned");
            state.request_done = true;
            state.response_done && !state.released && !state.websocket
        };
        if release {
            self.release(false);
        }
    }

    fn response_complete(&self, byte_count: u64, failure: Option<&Error>) {
        event::emit(self.call.event_listener(), |l| {
            l.response_body_end(&self.call.as_call(), byte_count)
        });
        if let Some(e) = failure {
            self.track_failure(e);
            return;
        }
        let release = {
            let mut state = self.state.lock().expect("exchange poisoned");
            state.response_done = true;
            state.request_done && !state.released && !state.websocket
        };
        if release {
            self.connection.note_success();
            self.release(false);
        }
    }

    /// A transport failure: the exchange is over and, when the codec is
    /// connection-wide (HTTP/1.1), the connection must not be reused.
    pub(crate) fn track_failure(&self, error: &Error) {
        tracing::debug!("exchange failed: {}", error);
        let connection_wide = self
            .codec
            .lock()
            .expect("codec poisoned")
            .is_connection_wide();
        if connection_wide {
            self.connection.set_no_new_exchanges();
        }
        let release = {
            let state = self.state.lock().expect("exchange poisoned");
            !state.released && !state.websocket
        };
        if release {
            self.release(true);
        }
    }

    /// The response body was dropped before exhaustion.
    fn response_abandoned(&self) {
        // A partially-read HTTP/1.1 body leaves the connection mid-message.
        if self.codec.lock().expect("codec poisoned").is_connection_wide() {
            self.connection.set_no_new_exchanges();
        } else {
            self.codec.lock().expect("codec poisoned").cancel();
        }
        self.release(false);
    }

    fn release(&self, _failed: bool) {
        {
            let mut state = self.state.lock().expect("exchange poisoned");
            if state.released {
                return;
            }
            state.released = true;
        }
        self.call.exchange_released(&self.connection, &self.pool);
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("connection", &self.connection.id())
            .finish()
    }
}

/// The socket handles a WebSocket takes over from its upgrade exchange.
pub(crate) struct WsStreams {
    pub(crate) io: Arc<Mutex<IoBuffer>>,
    pub(crate) connection: Arc<Connection>,
}

impl std::fmt::Debug for WsStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("WsStreams")
    }
}

fn reported_content_length(response: &Response) -> i64 {
    if response
        .header("Transfer-Encoding")
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
    {
        return -1;
    }
    response
        .header("Content-Length")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(-1)
}

/// Counts request body bytes and reports completion to the exchange.
pub(crate) struct CountingSink {
    inner: Box<dyn BodySink>,
    exchange: Arc<Exchange>,
    byte_count: u64,
    finished: bool,
}

impl Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.byte_count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl CountingSink {
    pub(crate) fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        match self.inner.finish() {
            Ok(()) => {
                let call = self.exchange.call.as_call();
                let byte_count = self.byte_count;
                event::emit(self.exchange.call.event_listener(), |l| {
                    l.request_body_end(&call, byte_count)
                });
                Ok(())
            }
            Err(e) => {
                self.exchange.track_failure(&e);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for CountingSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CountingSink({} bytes)", self.byte_count)
    }
}

/// Streams the response body, releasing the connection at EOF or on drop.
struct ExchangeReader {
    inner: Box<dyn Read + Send>,
    exchange: Arc<Exchange>,
    byte_count: u64,
    completed: bool,
    /// A declared zero-length body can complete without ever being read.
    known_empty: bool,
}

impl Read for ExchangeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.completed {
            return Ok(0);
        }
        if self.exchange.call.is_canceled() {
            self.completed = true;
            self.exchange.cancel();
            self.exchange.response_complete(self.byte_count, Some(&Error::canceled()));
            return Err(Error::canceled().into_io());
        }
        match self.inner.read(buf) {
            Ok(0) => {
                self.completed = true;
                self.exchange.response_complete(self.byte_count, None);
                Ok(0)
            }
            Ok(n) => {
                self.byte_count += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.completed = true;
                let error = Error::from_body_io(e);
                self.exchange.response_complete(self.byte_count, Some(&error));
                Err(error.into_io())
            }
        }
    }
}

impl Drop for ExchangeReader {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if self.known_empty {
            // Reading the empty body is free and keeps the connection
            // reusable.
            let mut probe = [0u8; 1];
            if matches!(self.inner.read(&mut probe), Ok(0)) {
                self.completed = true;
                self.exchange.response_complete(self.byte_count, None);
                return;
            }
        }
        self.exchange.response_abandoned();
    }
}
