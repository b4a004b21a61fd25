//! A socket shared by many HTTP/2 streams.
//!
//! One reader thread dispatches incoming frames. Writers serialize on the
//! frame-writer mutex. Stream creation holds the writer lock so stream ids
//! hit the wire in increasing order.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::proto::h2::frame::{FrameHandler, FrameReader, FrameWriter};
use crate::proto::h2::hpack::Header;
use crate::proto::h2::stream::H2Stream;
use crate::proto::h2::{ErrorCode, Settings, DEFAULT_INITIAL_WINDOW_SIZE};
use crate::task::TaskQueue;
use crate::transport::Transport;

struct ConnInner {
    next_stream_id: u32,
    peer_settings: Settings,
    /// Connection-level write quota granted by the peer.
    write_window: i64,
    /// Connection-level bytes received but not yet granted back.
    unacknowledged: i64,
    /// No new streams: GOAWAY sent or received, or the socket failed.
    shutdown: bool,
    goaway_last_stream_id: u32,
    awaiting_pong: bool,
    successful_pings: u64,
    interval_pings_sent: u32,
    failure: Option<String>,
}

pub(crate) struct H2Connection {
    host: String,
    writer: Mutex<FrameWriter>,
    streams: Mutex<HashMap<u32, Arc<H2Stream>>>,
    state: Mutex<ConnInner>,
    /// Signals connection-window growth to blocked writers.
    window_cond: Condvar,
    ping_queue: Option<TaskQueue>,
    ping_interval: Duration,
}

impl H2Connection {
    /// Sends the client preface and spawns the reader thread.
    pub(crate) fn start(
        host: String,
        transport: Box<dyn Transport>,
        ping: Option<(TaskQueue, Duration)>,
    ) -> Result<Arc<H2Connection>> {
        let reader_transport = transport.try_clone().map_err(Error::io)?;
        let mut writer = FrameWriter::new(transport);
        writer.connection_preface()?;
        writer.settings(&Settings::client_defaults())?;

        let (ping_queue, ping_interval) = match ping {
            Some((queue, interval)) => (Some(queue), interval),
            None => (None, Duration::ZERO),
        };

        let connection = Arc::new(H2Connection {
            host: host.clone(),
            writer: Mutex::new(writer),
            streams: Mutex::new(HashMap::new()),
            state: Mutex::new(ConnInner {
                next_stream_id: 3,
                peer_settings: Settings::new(),
                write_window: DEFAULT_INITIAL_WINDOW_SIZE,
                unacknowledged: 0,
                shutdown: false,
                goaway_last_stream_id: u32::MAX,
                awaiting_pong: false,
                successful_pings: 0,
                interval_pings_sent: 0,
                failure: None,
            }),
            window_cond: Condvar::new(),
            ping_queue,
            ping_interval,
        });

        let reader_conn = connection.clone();
        std::thread::Builder::new()
            .name(format!("courier h2 {}", host))
            .spawn(move || reader_conn.reader_loop(reader_transport))
            .map_err(Error::io)?;

        connection.schedule_interval_ping();
        Ok(connection)
    }

    fn schedule_interval_ping(self: &Arc<H2Connection>) {
        let Some(ref queue) = self.ping_queue else { return };
        if self.ping_interval.is_zero() {
            return;
        }
        let interval_ns = self.ping_interval.as_nanos() as u64;
        let weak = Arc::downgrade(self);
        let interval = self.ping_interval;
        queue.schedule(&format!("ping {}", self.host), interval_ns, move || {
            let Some(connection) = weak.upgrade() else { return -1 };
            if connection.send_interval_ping(interval) {
                interval_ns as i64
            } else {
                -1
            }
        });
    }

    /// Returns false when the connection has failed and pings should stop.
    fn send_interval_ping(self: &Arc<H2Connection>, interval: Duration) -> bool {
        let payload;
        {
            let mut state = self.state.lock().expect("h2 connection poisoned");
            if state.shutdown || state.failure.is_some() {
                return false;
            }
            if state.awaiting_pong {
                let message = format!(
                    "sent ping but didn't receive pong within {}ms (after {} successful ping/pongs)",
                    interval.as_millis(),
                    state.successful_pings
                );
                drop(state);
                self.fail_connection(&message);
                return false;
            }
            state.awaiting_pong = true;
            state.interval_pings_sent += 1;
            payload = state.interval_pings_sent;
        }
        let result = self
            .writer
            .lock()
            .expect("h2 writer poisoned")
            .ping(false, payload, 0x4f4b_6f6b);
        if result.is_err() {
            self.fail_connection("ping write failed");
            return false;
        }
        true
    }

    pub(crate) fn max_concurrent_streams(&self) -> usize {
        self.state
            .lock()
            .expect("h2 connection poisoned")
            .peer_settings
            .max_concurrent_streams()
            .min(128)
    }

    pub(crate) fn open_stream_count(&self) -> usize {
        self.streams.lock().expect("h2 streams poisoned").len()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        let state = self.state.lock().expect("h2 connection poisoned");
        state.shutdown || state.failure.is_some()
    }

    /// Opens a stream, writing its HEADERS. Stream ids must hit the wire in
    /// order, so the writer lock is held across id allocation.
    pub(crate) fn new_stream(
        self: &Arc<H2Connection>,
        headers: &[Header],
        out_finished: bool,
    ) -> Result<Arc<H2Stream>> {
        let mut writer = self.writer.lock().expect("h2 writer poisoned");
        let stream = {
            let mut state = self.state.lock().expect("h2 connection poisoned");
            if let Some(ref failure) = state.failure {
                return Err(Error::unexpected_eof().detail(failure.clone()));
            }
            if state.shutdown {
                return Err(Error::stream_reset(ErrorCode::REFUSED_STREAM.0)
                    .detail("connection is shutting down"));
            }
            let open = self.streams.lock().expect("h2 streams poisoned").len();
            if open >= state.peer_settings.max_concurrent_streams() {
                return Err(Error::stream_reset(ErrorCode::REFUSED_STREAM.0)
                    .detail("too many concurrent streams"));
            }
            let id = state.next_stream_id;
            state.next_stream_id += 2;
            let stream = Arc::new(H2Stream::new(
                id,
                Arc::downgrade(self),
                out_finished,
                state.peer_settings.initial_window_size(),
                DEFAULT_INITIAL_WINDOW_SIZE,
            ));
            self.streams
                .lock()
                .expect("h2 streams poisoned")
                .insert(id, stream.clone());
            stream
        };
        writer.headers(stream.id(), out_finished, headers)?;
        Ok(stream)
    }

    /// Sends body bytes on `stream`, honoring both flow-control windows.
    pub(crate) fn write_data(
        &self,
        stream: &H2Stream,
        mut data: &[u8],
        end_stream: bool,
        timeout: Duration,
    ) -> Result<()> {
        if data.is_empty() {
            if end_stream {
                stream.set_out_finished();
                return self
                    .writer
                    .lock()
                    .expect("h2 writer poisoned")
                    .data(stream.id(), true, &[]);
            }
            return Ok(());
        }

        while !data.is_empty() {
            let max_frame = self.writer.lock().expect("h2 writer poisoned").max_frame_size();
            let want = data.len().min(max_frame);

            let connection_quota = self.take_connection_quota(want, timeout)?;
            let granted = match stream.take_write_quota(connection_quota, timeout) {
                Ok(granted) => granted,
                Err(e) => {
                    self.return_connection_quota(connection_quota);
                    return Err(e);
                }
            };
            if granted < connection_quota {
                self.return_connection_quota(connection_quota - granted);
            }

            let (chunk, rest) = data.split_at(granted);
            let last = rest.is_empty() && end_stream;
            if last {
                stream.set_out_finished();
            }
            self.writer
                .lock()
                .expect("h2 writer poisoned")
                .data(stream.id(), last, chunk)?;
            data = rest;
        }
        Ok(())
    }

    fn take_connection_quota(&self, want: usize, timeout: Duration) -> Result<usize> {
        let mut state = self.state.lock().expect("h2 connection poisoned");
        loop {
            if let Some(ref failure) = state.failure {
                return Err(Error::unexpected_eof().detail(failure.clone()));
            }
            if state.write_window > 0 {
                let granted = (want as i64).min(state.write_window) as usize;
                state.write_window -= granted as i64;
                return Ok(granted);
            }
            state = if timeout.is_zero() {
                self.window_cond.wait(state).expect("h2 connection poisoned")
            } else {
                let (next, result) = self
                    .window_cond
                    .wait_timeout(state, timeout)
                    .expect("h2 connection poisoned");
                if result.timed_out() {
                    return Err(Error::new(crate::error::Kind::Io(crate::error::Io::WriteTimeout))
                        .detail("timed out waiting for connection flow-control window"));
                }
                next
            };
        }
    }

    fn return_connection_quota(&self, unused: usize) {
        if unused == 0 {
            return;
        }
        let mut state = self.state.lock().expect("h2 connection poisoned");
        state.write_window += unused as i64;
        self.window_cond.notify_all();
    }

    /// Sends a WINDOW_UPDATE for consumed stream bytes.
    pub(crate) fn write_stream_window_update(&self, stream_id: u32, increment: u32) {
        let result = self
            .writer
            .lock()
            .expect("h2 writer poisoned")
            .window_update(stream_id, increment);
        if let Err(e) = result {
            tracing::debug!("window update failed: {}", e);
        }
    }

    /// Resets a stream without blocking the caller on socket writes longer
    /// than necessary.
    pub(crate) fn write_reset_later(self: &Arc<H2Connection>, stream_id: u32, error_code: ErrorCode) {
        self.streams.lock().expect("h2 streams poisoned").remove(&stream_id);
        match self.ping_queue {
            Some(ref queue) => {
                let weak = Arc::downgrade(self);
                queue.execute(&format!("rst {}", stream_id), 0, move || {
                    if let Some(connection) = weak.upgrade() {
                        let _ = connection
                            .writer
                            .lock()
                            .expect("h2 writer poisoned")
                            .rst_stream(stream_id, error_code.0);
                    }
                });
            }
            None => {
                let _ = self
                    .writer
                    .lock()
                    .expect("h2 writer poisoned")
                    .rst_stream(stream_id, error_code.0);
            }
        }
    }

    pub(crate) fn finish_stream(&self, stream_id: u32) {
        self.streams.lock().expect("h2 streams poisoned").remove(&stream_id);
    }

    /// Sends GOAWAY and refuses new streams; in-flight streams drain.
    pub(crate) fn shutdown_gracefully(&self) {
        let last = {
            let mut state = self.state.lock().expect("h2 connection poisoned");
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.next_stream_id.saturating_sub(2)
        };
        let _ = self
            .writer
            .lock()
            .expect("h2 writer poisoned")
            .go_away(last, ErrorCode::NO_ERROR.0);
    }

    /// Hard-stops the connection, failing every stream.
    pub(crate) fn shutdown_now(&self) {
        self.fail_connection("connection closed");
    }

    fn fail_connection(&self, message: &str) {
        {
            let mut state = self.state.lock().expect("h2 connection poisoned");
            if state.failure.is_some() {
                return;
            }
            state.failure = Some(message.to_string());
            state.shutdown = true;
            self.window_cond.notify_all();
        }
        self.writer.lock().expect("h2 writer poisoned").close();
        let streams: Vec<Arc<H2Stream>> = self
            .streams
            .lock()
            .expect("h2 streams poisoned")
            .drain()
            .map(|(_, s)| s)
            .collect();
        for stream in streams {
            stream.connection_failed(message);
        }
        tracing::debug!("h2 connection to {} failed: {}", self.host, message);
    }

    fn reader_loop(self: Arc<H2Connection>, transport: Box<dyn Transport>) {
        let header_table = Settings::DEFAULT_HEADER_TABLE_SIZE as usize;
        let mut reader = FrameReader::new(transport, header_table);
        let mut handler = ReaderHandler {
            connection: self.clone(),
            reader_max_frame_size: None,
        };
        let result = loop {
            match reader.next(&mut handler) {
                Ok(true) => {
                    if let Some(size) = handler.reader_max_frame_size.take() {
                        reader.set_max_frame_size(size);
                    }
                }
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        match result {
            Ok(()) => self.fail_connection("peer closed the connection"),
            Err(e) => {
                if e.is_protocol() {
                    // A connection-level violation; tell the peer why.
                    let last = self
                        .state
                        .lock()
                        .expect("h2 connection poisoned")
                        .next_stream_id
                        .saturating_sub(2);
                    let _ = self
                        .writer
                        .lock()
                        .expect("h2 writer poisoned")
                        .go_away(last, ErrorCode::PROTOCOL_ERROR.0);
                }
                self.fail_connection(&e.to_string());
            }
        }
    }

    fn stream(&self, stream_id: u32) -> Option<Arc<H2Stream>> {
        self.streams.lock().expect("h2 streams poisoned").get(&stream_id).cloned()
    }
}

impl std::fmt::Debug for H2Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "H2Connection({})", self.host)
    }
}

struct ReaderHandler {
    connection: Arc<H2Connection>,
    /// New max frame size to apply after the current frame.
    reader_max_frame_size: Option<usize>,
}

impl FrameHandler for ReaderHandler {
    fn data(&mut self, stream_id: u32, end_stream: bool, data: Bytes) -> Result<()> {
        let conn = &self.connection;

        // Connection-level accounting happens on receipt.
        let granted = {
            let mut state = conn.state.lock().expect("h2 connection poisoned");
            state.unacknowledged += data.len() as i64;
            if state.unacknowledged >= DEFAULT_INITIAL_WINDOW_SIZE / 2 {
                let granted = state.unacknowledged;
                state.unacknowledged = 0;
                Some(granted as u32)
            } else {
                None
            }
        };
        if let Some(granted) = granted {
            let _ = conn
                .writer
                .lock()
                .expect("h2 writer poisoned")
                .window_update(0, granted);
        }

        match conn.stream(stream_id) {
            Some(stream) => {
                stream.receive_data(data, end_stream);
                if end_stream {
                    conn.finish_stream(stream_id);
                }
            }
            None => {
                // A late frame for a stream we forgot; tell the peer.
                let _ = conn
                    .writer
                    .lock()
                    .expect("h2 writer poisoned")
                    .rst_stream(stream_id, ErrorCode::STREAM_CLOSED.0);
            }
        }
        Ok(())
    }

    fn headers(&mut self, stream_id: u32, end_stream: bool, headers: Vec<Header>) -> Result<()> {
        let conn = &self.connection;
        match conn.stream(stream_id) {
            Some(stream) => {
                stream.receive_headers(headers, end_stream);
            }
            None => {
                let shutdown = conn.state.lock().expect("h2 connection poisoned").shutdown;
                if !shutdown {
                    let _ = conn
                        .writer
                        .lock()
                        .expect("h2 writer poisoned")
                        .rst_stream(stream_id, ErrorCode::STREAM_CLOSED.0);
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self, stream_id: u32, error_code: u32) -> Result<()> {
        if let Some(stream) = self.connection.stream(stream_id) {
            stream.receive_reset(error_code);
            self.connection.finish_stream(stream_id);
        }
        Ok(())
    }

    fn settings(&mut self, ack: bool, settings: Settings) -> Result<()> {
        if ack {
            return Ok(());
        }
        let conn = &self.connection;
        let delta;
        {
            let mut state = conn.state.lock().expect("h2 connection poisoned");
            let before = state.peer_settings.initial_window_size();
            state.peer_settings.merge(&settings);
            delta = state.peer_settings.initial_window_size() - before;
        }
        if delta != 0 {
            let streams: Vec<Arc<H2Stream>> = conn
                .streams
                .lock()
                .expect("h2 streams poisoned")
                .values()
                .cloned()
                .collect();
            for stream in streams {
                stream.adjust_write_window(delta);
            }
        }
        {
            let mut writer = conn.writer.lock().expect("h2 writer poisoned");
            let state = conn.state.lock().expect("h2 connection poisoned");
            writer.apply_peer_settings(&state.peer_settings);
            self.reader_max_frame_size = Some(state.peer_settings.max_frame_size());
            drop(state);
            writer.settings_ack()?;
        }
        Ok(())
    }

    fn ping(&mut self, ack: bool, payload1: u32, payload2: u32) -> Result<()> {
        let conn = &self.connection;
        if ack {
            let mut state = conn.state.lock().expect("h2 connection poisoned");
            state.awaiting_pong = false;
            state.successful_pings += 1;
            return Ok(());
        }
        conn.writer
            .lock()
            .expect("h2 writer poisoned")
            .ping(true, payload1, payload2)
    }

    fn go_away(&mut self, last_stream_id: u32, error_code: u32, debug_data: Bytes) -> Result<()> {
        tracing::debug!(
            "GOAWAY last_stream={} code={} debug={:?}",
            last_stream_id,
            error_code,
            debug_data
        );
        let conn = &self.connection;
        {
            let mut state = conn.state.lock().expect("h2 connection poisoned");
            state.shutdown = true;
            state.goaway_last_stream_id = last_stream_id;
        }
        // Streams above the cutoff were never processed; they are safe to
        // retry elsewhere.
        let refused: Vec<Arc<H2Stream>> = {
            let mut streams = conn.streams.lock().expect("h2 streams poisoned");
            let ids: Vec<u32> = streams.keys().filter(|id| **id > last_stream_id).copied().collect();
            ids.iter().filter_map(|id| streams.remove(id)).collect()
        };
        for stream in refused {
            stream.receive_reset(ErrorCode::REFUSED_STREAM.0);
        }
        Ok(())
    }

    fn window_update(&mut self, stream_id: u32, increment: u32) -> Result<()> {
        let conn = &self.connection;
        if stream_id == 0 {
            let mut state = conn.state.lock().expect("h2 connection poisoned");
            state.write_window += increment as i64;
            conn.window_cond.notify_all();
        } else if let Some(stream) = conn.stream(stream_id) {
            stream.receive_window_update(increment);
        }
        Ok(())
    }

    fn push_promise(&mut self, _stream_id: u32, promised: u32) -> Result<()> {
        // Push is disabled in our SETTINGS; a pushing peer is broken.
        Err(Error::protocol(format!(
            "PROTOCOL_ERROR: push promise for stream {} but push is disabled",
            promised
        )))
    }
}
