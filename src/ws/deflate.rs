//! The permessage-deflate extension (RFC 7692): negotiation and the
//! per-message DEFLATE transform.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};
use crate::http::Headers;

/// The empty-block trailer every Sync-flushed deflate stream ends with. It
/// comes off the wire frame and goes back on before inflating.
const EMPTY_DEFLATE_BLOCK: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// The negotiated `Sec-WebSocket-Extensions` parameters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct WebSocketExtensions {
    pub(crate) per_message_deflate: bool,
    pub(crate) client_no_context_takeover: bool,
    pub(crate) server_no_context_takeover: bool,
    /// The peer sent something we do not implement; compression is off.
    pub(crate) unknown_values: bool,
}

impl WebSocketExtensions {
    pub(crate) fn parse(headers: &Headers) -> WebSocketExtensions {
        let mut extensions = WebSocketExtensions::default();
        for header in headers.values("Sec-WebSocket-Extensions") {
            for extension in header.split(',') {
                let mut parts = extension.split(';');
                let name = parts.next().unwrap_or("").trim();
                if !name.eq_ignore_ascii_case("permessage-deflate") {
                    extensions.unknown_values = true;
                    continue;
                }
                extensions.per_message_deflate = true;
                for parameter in parts {
                    let parameter = parameter.trim();
                    let (key, value) = match parameter.find('=') {
                        Some(i) => (parameter[..i].trim(), Some(parameter[i + 1..].trim())),
                        None => (parameter, None),
                    };
                    match key.to_ascii_lowercase().as_str() {
                        "client_no_context_takeover" => {
                            extensions.client_no_context_takeover = true;
                        }
                        "server_no_context_takeover" => {
                            extensions.server_no_context_takeover = true;
                        }
                        // Window-bits parameters are accepted with their
                        // defaults; anything else disables compression.
                        "client_max_window_bits" | "server_max_window_bits" => {
                            if value.map(|v| v != "15").unwrap_or(false) {
                                extensions.unknown_values = true;
                            }
                        }
                        _ => extensions.unknown_values = true,
                    }
                }
            }
        }
        extensions
    }

    pub(crate) fn compression_enabled(&self) -> bool {
        self.per_message_deflate && !self.unknown_values
    }
}

/// Compresses outgoing message payloads.
pub(crate) struct MessageDeflater {
    compress: Compress,
    context_takeover: bool,
}

impl MessageDeflater {
    pub(crate) fn new(context_takeover: bool) -> MessageDeflater {
        MessageDeflater {
            compress: Compress::new(Compression::default(), false),
            context_takeover,
        }
    }

    /// Deflates `data` and strips the trailing empty block.
    pub(crate) fn deflate(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if !self.context_takeover {
            self.compress.reset();
        }
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let mut consumed = 0usize;
        loop {
            out.reserve(256 + data.len() / 2);
            let before = self.compress.total_in();
            self.compress
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| Error::protocol(format!("deflate failed: {}", e)))?;
            consumed += (self.compress.total_in() - before) as usize;
            if consumed >= data.len() && out.len() < out.capacity() {
                break;
            }
        }
        if out.ends_with(&EMPTY_DEFLATE_BLOCK) {
            out.truncate(out.len() - EMPTY_DEFLATE_BLOCK.len());
        } else {
            // An empty flush without the marker still needs termination.
            out.push(0x00);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for MessageDeflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("MessageDeflater")
    }
}

/// Decompresses incoming message payloads.
pub(crate) struct MessageInflater {
    decompress: Decompress,
    context_takeover: bool,
}

impl MessageInflater {
    pub(crate) fn new(context_takeover: bool) -> MessageInflater {
        MessageInflater {
            decompress: Decompress::new(false),
            context_takeover,
        }
    }

    /// Inflates one message payload. The wire format omits the trailing
    /// empty block, so it is appended first. A self-terminating message may
    /// carry trailing bytes; they are discarded.
    pub(crate) fn inflate(&mut self, data: &[u8], max_size: u64) -> Result<Vec<u8>> {
        let mut input = Vec::with_capacity(data.len() + EMPTY_DEFLATE_BLOCK.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&EMPTY_DEFLATE_BLOCK);

        let mut out = Vec::with_capacity(data.len() * 2 + 64);
        let mut consumed = 0usize;
        let mut stream_ended = false;
        loop {
            out.reserve(1024.max(data.len()));
            let before = self.decompress.total_in();
            let status = self
                .decompress
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::None)
                .map_err(|e| Error::protocol(format!("inflate failed: {}", e)))?;
            consumed += (self.decompress.total_in() - before) as usize;
            if out.len() as u64 > max_size {
                return Err(Error::protocol(format!(
                    "message too large: exceeds {} bytes",
                    max_size
                )));
            }
            match status {
                Status::StreamEnd => {
                    // Self-terminating message; trailing bytes are legal
                    // and discarded.
                    stream_ended = true;
                    break;
                }
                _ if consumed >= input.len() && out.len() < out.capacity() => break,
                _ => {}
            }
        }

        if !self.context_takeover || stream_ended {
            self.decompress.reset(false);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for MessageInflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("MessageInflater")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(context_takeover: bool, messages: &[&[u8]]) {
        let mut deflater = MessageDeflater::new(context_takeover);
        let mut inflater = MessageInflater::new(context_takeover);
        for message in messages {
            let compressed = deflater.deflate(message).unwrap();
            let inflated = inflater.inflate(&compressed, 16 * 1024 * 1024).unwrap();
            assert_eq!(&inflated, message);
        }
    }

    #[test]
    fn deflate_inflate_round_trip() {
        round_trip(true, &[b"hello deflate", b"hello again", b""]);
        round_trip(false, &[b"hello deflate", b"hello again", b""]);
    }

    #[test]
    fn context_takeover_improves_repeats() {
        let message = b"a repetitive message a repetitive message";
        let mut with_takeover = MessageDeflater::new(true);
        let first = with_takeover.deflate(message).unwrap();
        let second = with_takeover.deflate(message).unwrap();
        assert!(second.len() < first.len());
    }

    #[test]
    fn inflate_discards_trailing_garbage_after_final_block() {
        // Deflate with Finish so the block is self-terminating, then append
        // garbage; the inflater must stop at the stream end.
        let mut compress = Compress::new(Compression::default(), false);
        let mut block = Vec::with_capacity(256);
        compress
            .compress_vec(b"terminated", &mut block, FlushCompress::Finish)
            .unwrap();
        block.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        let mut inflater = MessageInflater::new(false);
        let inflated = inflater.inflate(&block, 1 << 20).unwrap();
        assert_eq!(inflated, b"terminated");
    }

    #[test]
    fn size_limit_enforced() {
        let big = vec![b'a'; 64 * 1024];
        let mut deflater = MessageDeflater::new(false);
        let compressed = deflater.deflate(&big).unwrap();
        let mut inflater = MessageInflater::new(false);
        assert!(inflater.inflate(&compressed, 1024).is_err());
    }

    #[test]
    fn parse_extension_header() {
        let headers = Headers::of(&[
            "Sec-WebSocket-Extensions",
            "permessage-deflate; server_no_context_takeover",
        ]);
        let extensions = WebSocketExtensions::parse(&headers);
        assert!(extensions.per_message_deflate);
        assert!(extensions.server_no_context_takeover);
        assert!(!extensions.client_no_context_takeover);
        assert!(extensions.compression_enabled());
    }

    #[test]
    fn unknown_extension_disables_compression() {
        let headers = Headers::of(&[
            "Sec-WebSocket-Extensions",
            "permessage-deflate; weird_param=1",
        ]);
        let extensions = WebSocketExtensions::parse(&headers);
        assert!(!extensions.compression_enabled());
    }
}
