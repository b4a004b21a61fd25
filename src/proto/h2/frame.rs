//! HTTP/2 frame reading and writing (RFC 7540 §4).
//!
//! Frame layout: 24-bit length, 8-bit type, 8-bit flags, 1-bit reserved plus
//! 31-bit stream id, then the payload.

use bytes::Bytes;

use crate::connection::IoBuffer;
use crate::error::{Error, Result};
use crate::proto::h2::{hpack, Settings, CONNECTION_PREFACE};
use crate::transport::Transport;

pub(crate) const HEADER_LEN: usize = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Kind {
    Data,
    Headers,
    Priority,
    Reset,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl Kind {
    fn from_type(byte: u8) -> Kind {
        match byte {
            0x0 => Kind::Data,
            0x1 => Kind::Headers,
            0x2 => Kind::Priority,
            0x3 => Kind::Reset,
            0x4 => Kind::Settings,
            0x5 => Kind::PushPromise,
            0x6 => Kind::Ping,
            0x7 => Kind::GoAway,
            0x8 => Kind::WindowUpdate,
            0x9 => Kind::Continuation,
            other => Kind::Unknown(other),
        }
    }

    fn as_type(self) -> u8 {
        match self {
            Kind::Data => 0x0,
            Kind::Headers => 0x1,
            Kind::Priority => 0x2,
            Kind::Reset => 0x3,
            Kind::Settings => 0x4,
            Kind::PushPromise => 0x5,
            Kind::Ping => 0x6,
            Kind::GoAway => 0x7,
            Kind::WindowUpdate => 0x8,
            Kind::Continuation => 0x9,
            Kind::Unknown(other) => other,
        }
    }
}

pub(crate) const FLAG_END_STREAM: u8 = 0x1;
pub(crate) const FLAG_ACK: u8 = 0x1;
pub(crate) const FLAG_END_HEADERS: u8 = 0x4;
pub(crate) const FLAG_PADDED: u8 = 0x8;
pub(crate) const FLAG_PRIORITY: u8 = 0x20;

/// The fixed 9-byte frame header.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameHead {
    pub(crate) length: u32,
    pub(crate) kind: Kind,
    pub(crate) flags: u8,
    pub(crate) stream_id: u32,
}

impl FrameHead {
    fn parse(buf: &[u8; HEADER_LEN]) -> FrameHead {
        let length = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | buf[2] as u32;
        let kind = Kind::from_type(buf[3]);
        let flags = buf[4];
        let stream_id = ((buf[5] as u32 & 0x7f) << 24)
            | ((buf[6] as u32) << 16)
            | ((buf[7] as u32) << 8)
            | buf[8] as u32;
        FrameHead {
            length,
            kind,
            flags,
            stream_id,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push((self.length >> 16) as u8);
        out.push((self.length >> 8) as u8);
        out.push(self.length as u8);
        out.push(self.kind.as_type());
        out.push(self.flags);
        out.push((self.stream_id >> 24) as u8 & 0x7f);
        out.push((self.stream_id >> 16) as u8);
        out.push((self.stream_id >> 8) as u8);
        out.push(self.stream_id as u8);
    }
}

/// Receives the frames of a connection, one callback per frame.
pub(crate) trait FrameHandler {
    fn data(&mut self, stream_id: u32, end_stream: bool, data: Bytes) -> Result<()>;
    fn headers(&mut self, stream_id: u32, end_stream: bool, headers: Vec<hpack::Header>)
        -> Result<()>;
    fn reset(&mut self, stream_id: u32, error_code: u32) -> Result<()>;
    fn settings(&mut self, ack: bool, settings: Settings) -> Result<()>;
    fn ping(&mut self, ack: bool, payload1: u32, payload2: u32) -> Result<()>;
    fn go_away(&mut self, last_stream_id: u32, error_code: u32, debug_data: Bytes) -> Result<()>;
    fn window_update(&mut self, stream_id: u32, increment: u32) -> Result<()>;
    fn push_promise(&mut self, stream_id: u32, promised_stream_id: u32) -> Result<()>;
}

/// Reads frames off the wire and dispatches them to a handler.
pub(crate) struct FrameReader {
    io: IoBuffer,
    hpack: hpack::Decoder,
    max_frame_size: usize,
}

impl FrameReader {
    pub(crate) fn new(transport: Box<dyn Transport>, header_table_size: usize) -> FrameReader {
        FrameReader {
            io: IoBuffer::new(transport),
            hpack: hpack::Decoder::new(header_table_size),
            max_frame_size: Settings::DEFAULT_MAX_FRAME_SIZE as usize,
        }
    }

    pub(crate) fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    /// Reads one frame (plus any continuations) and dispatches it. Returns
    /// false at a clean EOF before a frame header.
    pub(crate) fn next(&mut self, handler: &mut dyn FrameHandler) -> Result<bool> {
        let mut head_buf = [0u8; HEADER_LEN];
        match self.io.read(&mut head_buf[..1]) {
            Ok(0) => return Ok(false),
            Ok(_) => {}
            Err(e) => return Err(Error::read(e)),
        }
        self.io
            .read_exact(&mut head_buf[1..])
            .map_err(Error::read)?;
        let head = FrameHead::parse(&head_buf);
        tracing::trace!(
            "<< frame {:?} stream={} length={} flags={:#x}",
            head.kind,
            head.stream_id,
            head.length,
            head.flags
        );
        if head.length as usize > self.max_frame_size {
            return Err(Error::protocol(format!(
                "FRAME_SIZE_ERROR: {} exceeds {}",
                head.length, self.max_frame_size
            )));
        }

        let payload = self.read_payload(head.length as usize)?;
        match head.kind {
            Kind::Data => self.on_data(head, payload, handler),
            Kind::Headers => self.on_headers(head, payload, handler),
            Kind::Priority => Ok(()), // Deprecated; ignored.
            Kind::Reset => self.on_reset(head, payload, handler),
            Kind::Settings => self.on_settings(head, payload, handler),
            Kind::PushPromise => self.on_push_promise(head, payload, handler),
            Kind::Ping => self.on_ping(head, payload, handler),
            Kind::GoAway => self.on_go_away(head, payload, handler),
            Kind::WindowUpdate => self.on_window_update(head, payload, handler),
            Kind::Continuation => Err(Error::protocol("CONTINUATION without HEADERS")),
            Kind::Unknown(_) => Ok(()), // Extensions must be ignored.
        }?;
        Ok(true)
    }

    fn read_payload(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; length];
        self.io.read_exact(&mut payload).map_err(Error::read)?;
        Ok(payload)
    }

    fn on_data(&mut self, head: FrameHead, payload: Vec<u8>, handler: &mut dyn FrameHandler) -> Result<()> {
        if head.stream_id == 0 {
            return Err(Error::protocol("PROTOCOL_ERROR: DATA on stream 0"));
        }
        let data = strip_padding(head.flags, payload)?;
        handler.data(head.stream_id, head.flags & FLAG_END_STREAM != 0, data)
    }

    fn on_headers(
        &mut self,
        head: FrameHead,
        payload: Vec<u8>,
        handler: &mut dyn FrameHandler,
    ) -> Result<()> {
        if head.stream_id == 0 {
            return Err(Error::protocol("PROTOCOL_ERROR: HEADERS on stream 0"));
        }
        let mut fragment = strip_padding(head.flags, payload)?;
        if head.flags & FLAG_PRIORITY != 0 {
            if fragment.len() < 5 {
                return Err(Error::protocol("HEADERS priority fields truncated"));
            }
            fragment = fragment.slice(5..);
        }
        let block = self.read_header_block(fragment, head.flags)?;
        let headers = self.hpack.decode(&block)?;
        handler.headers(head.stream_id, head.flags & FLAG_END_STREAM != 0, headers)
    }

    /// Collects CONTINUATION frames until END_HEADERS.
    fn read_header_block(&mut self, fragment: Bytes, flags: u8) -> Result<Bytes> {
        if flags & FLAG_END_HEADERS != 0 {
            return Ok(fragment);
        }
        let mut block = fragment.to_vec();
        loop {
            let mut head_buf = [0u8; HEADER_LEN];
            self.io.read_exact(&mut head_buf).map_err(Error::read)?;
            let head = FrameHead::parse(&head_buf);
            if head.kind != Kind::Continuation {
                return Err(Error::protocol(format!(
                    "expected CONTINUATION but was {:?}",
                    head.kind
                )));
            }
            let payload = self.read_payload(head.length as usize)?;
            block.extend_from_slice(&payload);
            if head.flags & FLAG_END_HEADERS != 0 {
                return Ok(Bytes::from(block));
            }
        }
    }

    fn on_reset(&mut self, head: FrameHead, payload: Vec<u8>, handler: &mut dyn FrameHandler) -> Result<()> {
        if payload.len() != 4 {
            return Err(Error::protocol("RST_STREAM length != 4"));
        }
        if head.stream_id == 0 {
            return Err(Error::protocol("PROTOCOL_ERROR: RST_STREAM on stream 0"));
        }
        let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        handler.reset(head.stream_id, code)
    }

    fn on_settings(
        &mut self,
        head: FrameHead,
        payload: Vec<u8>,
        handler: &mut dyn FrameHandler,
    ) -> Result<()> {
        if head.stream_id != 0 {
            return Err(Error::protocol("PROTOCOL_ERROR: SETTINGS on a stream"));
        }
        if head.flags & FLAG_ACK != 0 {
            if !payload.is_empty() {
                return Err(Error::protocol("FRAME_SIZE_ERROR: SETTINGS ack with payload"));
            }
            return handler.settings(true, Settings::new());
        }
        if payload.len() % 6 != 0 {
            return Err(Error::protocol("SETTINGS length not a multiple of 6"));
        }
        let mut settings = Settings::new();
        for entry in payload.chunks_exact(6) {
            let identifier = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            match identifier {
                0x2 if value > 1 => {
                    return Err(Error::protocol("PROTOCOL_ERROR: invalid ENABLE_PUSH"));
                }
                0x4 if value > 0x7fff_ffff => {
                    return Err(Error::protocol("FLOW_CONTROL_ERROR: INITIAL_WINDOW_SIZE"));
                }
                0x5 if !(16_384..=16_777_215).contains(&value) => {
                    return Err(Error::protocol("PROTOCOL_ERROR: invalid MAX_FRAME_SIZE"));
                }
                _ => {}
            }
            settings.set(identifier, value);
        }
        handler.settings(false, settings)
    }

    fn on_push_promise(
        &mut self,
        head: FrameHead,
        payload: Vec<u8>,
        handler: &mut dyn FrameHandler,
    ) -> Result<()> {
        let data = strip_padding(head.flags, payload)?;
        if data.len() < 4 {
            return Err(Error::protocol("PUSH_PROMISE truncated"));
        }
        let promised = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7fff_ffff;
        // The header block is read (to keep HPACK state coherent) and
        // discarded.
        let block = self.read_header_block(data.slice(4..), head.flags)?;
        let _ = self.hpack.decode(&block)?;
        handler.push_promise(head.stream_id, promised)
    }

    fn on_ping(&mut self, head: FrameHead, payload: Vec<u8>, handler: &mut dyn FrameHandler) -> Result<()> {
        if payload.len() != 8 {
            return Err(Error::protocol("PING length != 8"));
        }
        if head.stream_id != 0 {
            return Err(Error::protocol("PROTOCOL_ERROR: PING on a stream"));
        }
        let payload1 = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let payload2 = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        handler.ping(head.flags & FLAG_ACK != 0, payload1, payload2)
    }

    fn on_go_away(&mut self, head: FrameHead, payload: Vec<u8>, handler: &mut dyn FrameHandler) -> Result<()> {
        if payload.len() < 8 {
            return Err(Error::protocol("GOAWAY truncated"));
        }
        if head.stream_id != 0 {
            return Err(Error::protocol("PROTOCOL_ERROR: GOAWAY on a stream"));
        }
        let last_stream_id =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
        let error_code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let debug_data = Bytes::from(payload[8..].to_vec());
        handler.go_away(last_stream_id, error_code, debug_data)
    }

    fn on_window_update(
        &mut self,
        head: FrameHead,
        payload: Vec<u8>,
        handler: &mut dyn FrameHandler,
    ) -> Result<()> {
        if payload.len() != 4 {
            return Err(Error::protocol("WINDOW_UPDATE length != 4"));
        }
        let increment =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
        if increment == 0 {
            return Err(Error::protocol("windowSizeIncrement was 0"));
        }
        handler.window_update(head.stream_id, increment)
    }
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("FrameReader")
    }
}

fn strip_padding(flags: u8, payload: Vec<u8>) -> Result<Bytes> {
    let mut data = Bytes::from(payload);
    if flags & FLAG_PADDED != 0 {
        if data.is_empty() {
            return Err(Error::protocol("PADDED frame too short"));
        }
        let pad_length = data[0] as usize;
        data = data.slice(1..);
        if pad_length > data.len() {
            return Err(Error::protocol("TOO_MUCH_PADDING"));
        }
        data = data.slice(..data.len() - pad_length);
    }
    Ok(data)
}

/// Writes frames. Callers serialize access behind the connection's writer
/// lock.
pub(crate) struct FrameWriter {
    transport: Box<dyn Transport>,
    hpack: hpack::Encoder,
    max_frame_size: usize,
    closed: bool,
}

impl FrameWriter {
    pub(crate) fn new(transport: Box<dyn Transport>) -> FrameWriter {
        FrameWriter {
            transport,
            hpack: hpack::Encoder::new(Settings::DEFAULT_HEADER_TABLE_SIZE as usize),
            max_frame_size: Settings::DEFAULT_MAX_FRAME_SIZE as usize,
            closed: false,
        }
    }

    /// Applies the peer's settings to outgoing frames.
    pub(crate) fn apply_peer_settings(&mut self, settings: &Settings) {
        self.max_frame_size = settings.max_frame_size();
        if let Some(size) = settings.header_table_size {
            self.hpack.set_max_table_size(size as usize);
        }
    }

    pub(crate) fn connection_preface(&mut self) -> Result<()> {
        self.write_all(CONNECTION_PREFACE)
    }

    pub(crate) fn settings(&mut self, settings: &Settings) -> Result<()> {
        let entries = settings.entries();
        let mut out = Vec::with_capacity(HEADER_LEN + entries.len() * 6);
        FrameHead {
            length: (entries.len() * 6) as u32,
            kind: Kind::Settings,
            flags: 0,
            stream_id: 0,
        }
        .encode(&mut out);
        for (identifier, value) in entries {
            out.extend_from_slice(&identifier.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
        }
        self.write_all(&out)
    }

    pub(crate) fn settings_ack(&mut self) -> Result<()> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        FrameHead {
            length: 0,
            kind: Kind::Settings,
            flags: FLAG_ACK,
            stream_id: 0,
        }
        .encode(&mut out);
        self.write_all(&out)
    }

    pub(crate) fn ping(&mut self, ack: bool, payload1: u32, payload2: u32) -> Result<()> {
        let mut out = Vec::with_capacity(HEADER_LEN + 8);
        FrameHead {
            length: 8,
            kind: Kind::Ping,
            flags: if ack { FLAG_ACK } else { 0 },
            stream_id: 0,
        }
        .encode(&mut out);
        out.extend_from_slice(&payload1.to_be_bytes());
        out.extend_from_slice(&payload2.to_be_bytes());
        self.write_all(&out)
    }

    pub(crate) fn go_away(&mut self, last_stream_id: u32, error_code: u32) -> Result<()> {
        let mut out = Vec::with_capacity(HEADER_LEN + 8);
        FrameHead {
            length: 8,
            kind: Kind::GoAway,
            flags: 0,
            stream_id: 0,
        }
        .encode(&mut out);
        out.extend_from_slice(&last_stream_id.to_be_bytes());
        out.extend_from_slice(&error_code.to_be_bytes());
        self.write_all(&out)
    }

    pub(crate) fn rst_stream(&mut self, stream_id: u32, error_code: u32) -> Result<()> {
        let mut out = Vec::with_capacity(HEADER_LEN + 4);
        FrameHead {
            length: 4,
            kind: Kind::Reset,
            flags: 0,
            stream_id,
        }
        .encode(&mut out);
        out.extend_from_slice(&error_code.to_be_bytes());
        self.write_all(&out)
    }

    pub(crate) fn window_update(&mut self, stream_id: u32, increment: u32) -> Result<()> {
        let mut out = Vec::with_capacity(HEADER_LEN + 4);
        FrameHead {
            length: 4,
            kind: Kind::WindowUpdate,
            flags: 0,
            stream_id,
        }
        .encode(&mut out);
        out.extend_from_slice(&increment.to_be_bytes());
        self.write_all(&out)
    }

    pub(crate) fn headers(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        headers: &[hpack::Header],
    ) -> Result<()> {
        let mut block = Vec::new();
        self.hpack.encode(headers, &mut block);

        let mut offset = 0;
        let mut first = true;
        while first || offset < block.len() {
            let fragment_len = (block.len() - offset).min(self.max_frame_size);
            let end = offset + fragment_len;
            let last_fragment = end == block.len();
            let mut flags = 0u8;
            if first && end_stream {
                flags |= FLAG_END_STREAM;
            }
            if last_fragment {
                flags |= FLAG_END_HEADERS;
            }
            let mut out = Vec::with_capacity(HEADER_LEN + fragment_len);
            FrameHead {
                length: fragment_len as u32,
                kind: if first { Kind::Headers } else { Kind::Continuation },
                flags,
                stream_id,
            }
            .encode(&mut out);
            out.extend_from_slice(&block[offset..end]);
            self.write_all(&out)?;
            offset = end;
            first = false;
            if last_fragment {
                break;
            }
        }
        Ok(())
    }

    /// Writes one DATA frame, at most `max_frame_size` long.
    pub(crate) fn data(&mut self, stream_id: u32, end_stream: bool, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= self.max_frame_size);
        let mut out = Vec::with_capacity(HEADER_LEN + data.len());
        FrameHead {
            length: data.len() as u32,
            kind: Kind::Data,
            flags: if end_stream { FLAG_END_STREAM } else { 0 },
            stream_id,
        }
        .encode(&mut out);
        out.extend_from_slice(data);
        self.write_all(&out)
    }

    pub(crate) fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::canceled());
        }
        self.transport.write_all(data).map_err(Error::write)?;
        self.transport.flush().map_err(Error::write)
    }
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("FrameWriter")
    }
}
