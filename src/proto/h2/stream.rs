//! One HTTP/2 stream: its receive buffer, windows, and lifecycle.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::proto::h2::connection::H2Connection;
use crate::proto::h2::hpack::Header;
use crate::proto::h2::ErrorCode;

/// Why a stream stopped early.
#[derive(Clone, Debug)]
pub(crate) enum StreamFailure {
    /// The peer (or we) reset the stream.
    Reset(u32),
    /// The connection died beneath the stream.
    Connection(String),
}

impl StreamFailure {
    fn to_error(&self) -> Error {
        match self {
            StreamFailure::Reset(code) => Error::stream_reset(*code),
            StreamFailure::Connection(message) => Error::unexpected_eof().detail(message.clone()),
        }
    }
}

#[derive(Debug)]
pub(crate) struct StreamInner {
    /// Header blocks not yet taken: interim responses, the response, and
    /// possibly trailers.
    headers_queue: VecDeque<Vec<Header>>,
    trailers: Option<Vec<Header>>,
    took_response_headers: bool,
    read_buf: BytesMut,
    /// Bytes consumed locally but not yet granted back to the peer.
    unacknowledged: i64,
    pub(crate) write_window: i64,
    in_finished: bool,
    out_finished: bool,
    failure: Option<StreamFailure>,
}

/// A client-initiated stream on an HTTP/2 connection.
#[derive(Debug)]
pub(crate) struct H2Stream {
    id: u32,
    connection: Weak<H2Connection>,
    initial_receive_window: i64,
    pub(crate) inner: Mutex<StreamInner>,
    pub(crate) cond: Condvar,
}

impl H2Stream {
    pub(crate) fn new(
        id: u32,
        connection: Weak<H2Connection>,
        out_finished: bool,
        write_window: i64,
        receive_window: i64,
    ) -> H2Stream {
        H2Stream {
            id,
            connection,
            initial_receive_window: receive_window,
            inner: Mutex::new(StreamInner {
                headers_queue: VecDeque::new(),
                trailers: None,
                took_response_headers: false,
                read_buf: BytesMut::new(),
                unacknowledged: 0,
                write_window,
                in_finished: false,
                out_finished,
                failure: None,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Blocks until a header block is available. `timeout` of zero waits
    /// forever.
    pub(crate) fn take_headers(&self, timeout: Duration) -> Result<Vec<Header>> {
        let mut inner = self.inner.lock().expect("stream poisoned");
        loop {
            if let Some(headers) = inner.headers_queue.pop_front() {
                inner.took_response_headers = true;
                return Ok(headers);
            }
            if let Some(ref failure) = inner.failure {
                return Err(failure.to_error());
            }
            if inner.in_finished {
                return Err(Error::protocol("stream closed without response headers"));
            }
            inner = self.wait(inner, timeout)?;
        }
    }

    pub(crate) fn trailers(&self) -> Vec<Header> {
        self.inner
            .lock()
            .expect("stream poisoned")
            .trailers
            .clone()
            .unwrap_or_default()
    }

    /// Blocking body read. Returns 0 at end of stream.
    pub(crate) fn read(&self, out: &mut [u8], timeout: Duration) -> Result<usize> {
        let (data, acknowledge) = {
            let mut inner = self.inner.lock().expect("stream poisoned");
            loop {
                if !inner.read_buf.is_empty() {
                    let n = out.len().min(inner.read_buf.len());
                    let data = inner.read_buf.split_to(n);
                    inner.unacknowledged += n as i64;
                    let acknowledge = if inner.unacknowledged >= self.initial_receive_window / 2 {
                        let granted = inner.unacknowledged;
                        inner.unacknowledged = 0;
                        Some(granted)
                    } else {
                        None
                    };
                    break (data, acknowledge);
                }
                if let Some(ref failure) = inner.failure {
                    return Err(failure.to_error());
                }
                if inner.in_finished {
                    return Ok(0);
                }
                inner = self.wait(inner, timeout)?;
            }
        };

        if let Some(granted) = acknowledge {
            if let Some(connection) = self.connection.upgrade() {
                connection.write_stream_window_update(self.id, granted as u32);
            }
        }
        out[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// Blocks until the peer grants write quota, then returns the number of
    /// bytes (at most `want`) this stream may send.
    pub(crate) fn take_write_quota(&self, want: usize, timeout: Duration) -> Result<usize> {
        let mut inner = self.inner.lock().expect("stream poisoned");
        loop {
            if let Some(ref failure) = inner.failure {
                return Err(failure.to_error());
            }
            if inner.write_window > 0 {
                let granted = (want as i64).min(inner.write_window) as usize;
                inner.write_window -= granted as i64;
                return Ok(granted);
            }
            inner = self.wait(inner, timeout)?;
        }
    }

    /// Returns unused quota taken optimistically.
    pub(crate) fn return_write_quota(&self, unused: usize) {
        if unused == 0 {
            return;
        }
        let mut inner = self.inner.lock().expect("stream poisoned");
        inner.write_window += unused as i64;
        self.cond.notify_all();
    }

    // ===== reader-thread entry points =====

    pub(crate) fn receive_headers(&self, headers: Vec<Header>, end_stream: bool) {
        let mut inner = self.inner.lock().expect("stream poisoned");
        if inner.took_response_headers && end_stream {
            inner.trailers = Some(headers);
        } else {
            inner.headers_queue.push_back(headers);
        }
        if end_stream {
            inner.in_finished = true;
        }
        self.cond.notify_all();
    }

    pub(crate) fn receive_data(&self, data: Bytes, end_stream: bool) {
        let mut inner = self.inner.lock().expect("stream poisoned");
        inner.read_buf.extend_from_slice(&data);
        if end_stream {
            inner.in_finished = true;
        }
        self.cond.notify_all();
    }

    pub(crate) fn receive_reset(&self, error_code: u32) {
        let mut inner = self.inner.lock().expect("stream poisoned");
        if inner.failure.is_none() {
            inner.failure = Some(StreamFailure::Reset(error_code));
        }
        self.cond.notify_all();
    }

    pub(crate) fn receive_window_update(&self, increment: u32) {
        let mut inner = self.inner.lock().expect("stream poisoned");
        inner.write_window += increment as i64;
        self.cond.notify_all();
    }

    /// Fails the stream because the connection is done.
    pub(crate) fn connection_failed(&self, message: &str) {
        let mut inner = self.inner.lock().expect("stream poisoned");
        if inner.failure.is_none() {
            inner.failure = Some(StreamFailure::Connection(message.to_string()));
        }
        self.cond.notify_all();
    }

    /// Adjusts the write window after the peer changes
    /// `INITIAL_WINDOW_SIZE`.
    pub(crate) fn adjust_write_window(&self, delta: i64) {
        let mut inner = self.inner.lock().expect("stream poisoned");
        inner.write_window += delta;
        self.cond.notify_all();
    }

    /// Locally abandons this stream and tells the peer.
    pub(crate) fn cancel(&self, error_code: ErrorCode) {
        {
            let mut inner = self.inner.lock().expect("stream poisoned");
            if inner.failure.is_some() {
                return;
            }
            inner.failure = Some(StreamFailure::Reset(error_code.0));
            self.cond.notify_all();
        }
        if let Some(connection) = self.connection.upgrade() {
            connection.write_reset_later(self.id, error_code);
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        let inner = self.inner.lock().expect("stream poisoned");
        inner.failure.is_some() || (inner.in_finished && inner.out_finished)
    }

    pub(crate) fn set_out_finished(&self) {
        let mut inner = self.inner.lock().expect("stream poisoned");
        inner.out_finished = true;
    }

    fn wait<'a>(
        &self,
        guard: std::sync::MutexGuard<'a, StreamInner>,
        timeout: Duration,
    ) -> Result<std::sync::MutexGuard<'a, StreamInner>> {
        if timeout.is_zero() {
            Ok(self.cond.wait(guard).expect("stream poisoned"))
        } else {
            let (guard, result) = self
                .cond
                .wait_timeout(guard, timeout)
                .expect("stream poisoned");
            if result.timed_out() {
                return Err(Error::read_timeout(format!(
                    "stream {} timed out waiting for data",
                    self.id
                )));
            }
            Ok(guard)
        }
    }
}
