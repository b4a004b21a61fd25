//! A blocking HTTP/2 codec: framing, HPACK, streams, and flow control.
//!
//! The blocking mapping: one reader thread per connection dispatches
//! incoming frames; writers share a frame writer behind a mutex; each stream
//! parks readers and writers on its own condvar.

pub(crate) mod codec;
pub(crate) mod connection;
pub(crate) mod frame;
pub(crate) mod hpack;
pub(crate) mod huffman;
pub(crate) mod stream;

pub(crate) use self::codec::Http2Codec;
pub(crate) use self::connection::H2Connection;

/// The client connection preface, sent before any frame.
pub(crate) const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Initial flow-control window for connections and streams.
pub(crate) const DEFAULT_INITIAL_WINDOW_SIZE: i64 = 65_535;

/// HTTP/2 error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ErrorCode(pub(crate) u32);

impl ErrorCode {
    pub(crate) const NO_ERROR: ErrorCode = ErrorCode(0x0);
    pub(crate) const PROTOCOL_ERROR: ErrorCode = ErrorCode(0x1);
    pub(crate) const INTERNAL_ERROR: ErrorCode = ErrorCode(0x2);
    pub(crate) const FLOW_CONTROL_ERROR: ErrorCode = ErrorCode(0x3);
    pub(crate) const STREAM_CLOSED: ErrorCode = ErrorCode(0x5);
    pub(crate) const FRAME_SIZE_ERROR: ErrorCode = ErrorCode(0x6);
    pub(crate) const REFUSED_STREAM: ErrorCode = ErrorCode(0x7);
    pub(crate) const CANCEL: ErrorCode = ErrorCode(0x8);
    pub(crate) const COMPRESSION_ERROR: ErrorCode = ErrorCode(0x9);
}

/// The SETTINGS values relevant to a connection, either ours or the peer's.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Settings {
    pub(crate) header_table_size: Option<u32>,
    pub(crate) enable_push: Option<bool>,
    pub(crate) max_concurrent_streams: Option<u32>,
    pub(crate) initial_window_size: Option<u32>,
    pub(crate) max_frame_size: Option<u32>,
    pub(crate) max_header_list_size: Option<u32>,
}

impl Settings {
    pub(crate) const DEFAULT_HEADER_TABLE_SIZE: u32 = 4_096;
    pub(crate) const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

    pub(crate) fn new() -> Settings {
        Settings {
            header_table_size: None,
            enable_push: None,
            max_concurrent_streams: None,
            initial_window_size: None,
            max_frame_size: None,
            max_header_list_size: None,
        }
    }

    /// The settings this client sends in its preface.
    pub(crate) fn client_defaults() -> Settings {
        let mut settings = Settings::new();
        settings.enable_push = Some(false);
        settings
    }

    /// Applies `other` on top of `self`, as a SETTINGS frame does.
    pub(crate) fn merge(&mut self, other: &Settings) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(header_table_size);
        take!(enable_push);
        take!(max_concurrent_streams);
        take!(initial_window_size);
        take!(max_frame_size);
        take!(max_header_list_size);
    }

    pub(crate) fn initial_window_size(&self) -> i64 {
        self.initial_window_size
            .map(|v| v as i64)
            .unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub(crate) fn max_frame_size(&self) -> usize {
        self.max_frame_size.unwrap_or(Settings::DEFAULT_MAX_FRAME_SIZE) as usize
    }

    pub(crate) fn max_concurrent_streams(&self) -> usize {
        self.max_concurrent_streams
            .map(|v| v as usize)
            .unwrap_or(usize::MAX)
    }

    /// Encodes as `(identifier, value)` pairs.
    pub(crate) fn entries(&self) -> Vec<(u16, u32)> {
        let mut out = Vec::new();
        if let Some(v) = self.header_table_size {
            out.push((0x1, v));
        }
        if let Some(v) = self.enable_push {
            out.push((0x2, v as u32));
        }
        if let Some(v) = self.max_concurrent_streams {
            out.push((0x3, v));
        }
        if let Some(v) = self.initial_window_size {
            out.push((0x4, v));
        }
        if let Some(v) = self.max_frame_size {
            out.push((0x5, v));
        }
        if let Some(v) = self.max_header_list_size {
            out.push((0x6, v));
        }
        out
    }

    pub(crate) fn set(&mut self, identifier: u16, value: u32) {
        match identifier {
            0x1 => self.header_table_size = Some(value),
            0x2 => self.enable_push = Some(value != 0),
            0x3 => self.max_concurrent_streams = Some(value),
            0x4 => self.initial_window_size = Some(value),
            0x5 => self.max_frame_size = Some(value),
            0x6 => self.max_header_list_size = Some(value),
            _ => {} // Unknown settings must be ignored.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_merge_and_defaults() {
        let mut base = Settings::new();
        assert_eq!(base.initial_window_size(), 65_535);
        assert_eq!(base.max_frame_size(), 16_384);

        let mut update = Settings::new();
        update.set(0x4, 32_768);
        update.set(0x3, 100);
        update.set(0x99, 1); // ignored
        base.merge(&update);
        assert_eq!(base.initial_window_size(), 32_768);
        assert_eq!(base.max_concurrent_streams(), 100);
    }

    #[test]
    fn settings_entries_round_trip() {
        let mut settings = Settings::new();
        settings.set(0x1, 8192);
        settings.set(0x2, 0);
        let mut rebuilt = Settings::new();
        for (id, value) in settings.entries() {
            rebuilt.set(id, value);
        }
        assert_eq!(rebuilt.header_table_size, Some(8192));
        assert_eq!(rebuilt.enable_push, Some(false));
    }
}
