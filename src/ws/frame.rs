//! RFC 6455 frame reading and writing.

use std::sync::{Arc, Mutex};

use rand::RngCore;

use crate::connection::IoBuffer;
use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::ws::deflate::{MessageDeflater, MessageInflater};

pub(crate) const OPCODE_CONTINUATION: u8 = 0x0;
pub(crate) const OPCODE_TEXT: u8 = 0x1;
pub(crate) const OPCODE_BINARY: u8 = 0x2;
pub(crate) const OPCODE_CLOSE: u8 = 0x8;
pub(crate) const OPCODE_PING: u8 = 0x9;
pub(crate) const OPCODE_PONG: u8 = 0xa;

const FLAG_FIN: u8 = 0x80;
const FLAG_RSV1: u8 = 0x40;
const FLAG_RSV2: u8 = 0x20;
const FLAG_RSV3: u8 = 0x10;
const FLAG_MASK: u8 = 0x80;

pub(crate) const MAX_CONTROL_PAYLOAD: usize = 125;
pub(crate) const CLOSE_NO_STATUS: u16 = 1005;

/// Receives the frames of one WebSocket.
pub(crate) trait FrameCallback {
    fn on_text(&mut self, text: String) -> Result<()>;
    fn on_binary(&mut self, data: Vec<u8>) -> Result<()>;
    fn on_ping(&mut self, payload: Vec<u8>) -> Result<()>;
    fn on_pong(&mut self, payload: Vec<u8>) -> Result<()>;
    fn on_close(&mut self, code: u16, reason: String) -> Result<()>;
}

/// Reads server-to-client frames, assembling fragmented messages.
pub(crate) struct FrameReader {
    io: Arc<Mutex<IoBuffer>>,
    inflater: Option<MessageInflater>,
    max_message_size: u64,
}

#[derive(Clone, Copy)]
struct FrameHeader {
    fin: bool,
    rsv1: bool,
    opcode: u8,
    length: u64,
}

impl FrameReader {
    pub(crate) fn new(
        io: Arc<Mutex<IoBuffer>>,
        inflater: Option<MessageInflater>,
        max_message_size: u64,
    ) -> FrameReader {
        FrameReader {
            io,
            inflater,
            max_message_size,
        }
    }

    /// Reads one message (or one control frame), dispatching to `callback`.
    pub(crate) fn process_next_frame(&mut self, callback: &mut dyn FrameCallback) -> Result<()> {
        let header = self.read_header()?;
        if header.opcode >= 0x8 {
            return self.read_control(header, callback);
        }
        self.read_message(header, callback)
    }

    fn read_header(&mut self) -> Result<FrameHeader> {
        let mut io = self.io.lock().expect("websocket io poisoned");
        let mut head = [0u8; 2];
        io.read_exact(&mut head).map_err(Error::read)?;
        drop(io);

        let b0 = head[0];
        let b1 = head[1];
        let opcode = b0 & 0x0f;
        let fin = b0 & FLAG_FIN != 0;
        let rsv1 = b0 & FLAG_RSV1 != 0;

        if b0 & FLAG_RSV2 != 0 || b0 & FLAG_RSV3 != 0 {
            return Err(Error::protocol(format!(
                "unexpected rsv2 or rsv3 flag: 0x{:02x}",
                b0
            )));
        }
        if rsv1 && self.inflater.is_none() {
            return Err(Error::protocol("unexpected rsv1 flag"));
        }
        if b1 & FLAG_MASK != 0 {
            return Err(Error::protocol("Server-sent frames must not be masked."));
        }

        let length = self.read_length(b1 & 0x7f)?;
        if opcode >= 0x8 {
            if !fin {
                return Err(Error::protocol("Control frames must be final."));
            }
            if length > MAX_CONTROL_PAYLOAD as u64 {
                return Err(Error::protocol(format!(
                    "Control frame must be less than {}B.",
                    MAX_CONTROL_PAYLOAD
                )));
            }
        }

        Ok(FrameHeader {
            fin,
            rsv1,
            opcode,
            length,
        })
    }

    fn read_length(&mut self, low_bits: u8) -> Result<u64> {
        match low_bits {
            126 => {
                let mut buf = [0u8; 2];
                let mut io = self.io.lock().expect("websocket io poisoned");
                io.read_exact(&mut buf).map_err(Error::read)?;
                Ok(u16::from_be_bytes(buf) as u64)
            }
            127 => {
                let mut buf = [0u8; 8];
                let mut io = self.io.lock().expect("websocket io poisoned");
                io.read_exact(&mut buf).map_err(Error::read)?;
                Ok(u64::from_be_bytes(buf))
            }
            n => Ok(n as u64),
        }
    }

    fn read_payload(&mut self, length: u64) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; length as usize];
        let mut io = self.io.lock().expect("websocket io poisoned");
        io.read_exact(&mut payload).map_err(Error::read)?;
        Ok(payload)
    }

    fn read_control(&mut self, header: FrameHeader, callback: &mut dyn FrameCallback) -> Result<()> {
        let payload = self.read_payload(header.length)?;
        match header.opcode {
            OPCODE_PING => callback.on_ping(payload),
            OPCODE_PONG => callback.on_pong(payload),
            OPCODE_CLOSE => {
                let (code, reason) = match payload.len() {
                    0 => (CLOSE_NO_STATUS, String::new()),
                    1 => return Err(Error::protocol("Malformed close payload length of 1.")),
                    _ => {
                        let code = u16::from_be_bytes([payload[0], payload[1]]);
                        validate_close_code_received(code)?;
                        (code, String::from_utf8_lossy(&payload[2..]).into_owned())
                    }
                };
                callback.on_close(code, reason)
            }
            other => Err(Error::protocol(format!(
                "unknown control opcode: 0x{:x}",
                other
            ))),
        }
    }

    fn read_message(&mut self, first: FrameHeader, callback: &mut dyn FrameCallback) -> Result<()> {
        if first.opcode != OPCODE_TEXT && first.opcode != OPCODE_BINARY {
            return Err(Error::protocol(format!(
                "unknown opcode: 0x{:x}",
                first.opcode
            )));
        }

        let mut message = Vec::new();
        let mut header = first;
        let compressed = header.rsv1;
        loop {
            if message.len() as u64 + header.length > self.max_message_size && !compressed {
                return Err(Error::protocol(format!(
                    "message too large: exceeds {} bytes",
                    self.max_message_size
                )));
            }
            message.extend_from_slice(&self.read_payload(header.length)?);
            if header.fin {
                break;
            }
            // Interleaved control frames are processed in place.
            loop {
                header = self.read_header()?;
                if header.opcode < 0x8 {
                    break;
                }
                let control = FrameHeader {
                    fin: header.fin,
                    rsv1: header.rsv1,
                    opcode: header.opcode,
                    length: header.length,
                };
                self.read_control(control, callback)?;
            }
            if header.opcode != OPCODE_CONTINUATION {
                return Err(Error::protocol(format!(
                    "expected continuation opcode but was 0x{:x}",
                    header.opcode
                )));
            }
        }

        let message = if compressed {
            self.inflater
                .as_mut()
                .expect("rsv1 was validated against the inflater")
                .inflate(&message, self.max_message_size)?
        } else {
            message
        };

        if first.opcode == OPCODE_TEXT {
            callback.on_text(String::from_utf8_lossy(&message).into_owned())
        } else {
            callback.on_binary(message)
        }
    }
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("FrameReader")
    }
}

/// Writes client-to-server frames. Every frame is masked with a fresh key.
pub(crate) struct FrameWriter {
    transport: Box<dyn Transport>,
    deflater: Option<MessageDeflater>,
    /// Messages below this size are sent uncompressed even when the
    /// deflater is available.
    min_to_compress: u64,
}

impl FrameWriter {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        deflater: Option<MessageDeflater>,
        min_to_compress: u64,
    ) -> FrameWriter {
        FrameWriter {
            transport,
            deflater,
            min_to_compress,
        }
    }

    pub(crate) fn write_message(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        let mut rsv1 = false;
        let compressed;
        let payload: &[u8] = if payload.len() as u64 >= self.min_to_compress {
            match self.deflater {
                Some(ref mut deflater) => {
                    compressed = deflater.deflate(payload)?;
                    rsv1 = true;
                    &compressed
                }
                None => payload,
            }
        } else {
            payload
        };
        self.write_frame(opcode, payload, rsv1)
    }

    pub(crate) fn write_ping(&mut self, payload: &[u8]) -> Result<()> {
        self.write_frame(OPCODE_PING, payload, false)
    }

    pub(crate) fn write_pong(&mut self, payload: &[u8]) -> Result<()> {
        self.write_frame(OPCODE_PONG, payload, false)
    }

    pub(crate) fn write_close(&mut self, code: u16, reason: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(2 + reason.len());
        if code != CLOSE_NO_STATUS {
            validate_close_code(code)?;
            payload.extend_from_slice(&code.to_be_bytes());
            payload.extend_from_slice(reason);
        }
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::protocol("reason.size() > 123"));
        }
        self.write_frame(OPCODE_CLOSE, &payload, false)
    }

    fn write_frame(&mut self, opcode: u8, payload: &[u8], rsv1: bool) -> Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + 14);
        let mut b0 = FLAG_FIN | opcode;
        if rsv1 {
            b0 |= FLAG_RSV1;
        }
        frame.push(b0);

        let length = payload.len();
        if length <= 125 {
            frame.push(FLAG_MASK | length as u8);
        } else if length <= 0xffff {
            frame.push(FLAG_MASK | 126);
            frame.extend_from_slice(&(length as u16).to_be_bytes());
        } else {
            frame.push(FLAG_MASK | 127);
            frame.extend_from_slice(&(length as u64).to_be_bytes());
        }

        let mut mask = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut mask);
        frame.extend_from_slice(&mask);
        frame.extend(
            payload
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ mask[i % 4]),
        );

        self.transport.write_all(&frame).map_err(Error::write)?;
        self.transport.flush().map_err(Error::write)
    }
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("FrameWriter")
    }
}

/// Close codes a caller may send (RFC 6455 §7.4).
pub(crate) fn validate_close_code(code: u16) -> Result<()> {
    if !(1000..5000).contains(&code) {
        return Err(Error::protocol(format!(
            "Code must be in range [1000,5000): {}",
            code
        )));
    }
    if (1004..=1006).contains(&code) || (1015..=2999).contains(&code) {
        return Err(Error::protocol(format!(
            "Code {} is reserved and may not be used.",
            code
        )));
    }
    Ok(())
}

/// Close codes a peer may send; reserved ranges are still rejected.
fn validate_close_code_received(code: u16) -> Result<()> {
    validate_close_code(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test::pair;
    use std::io::Read as _;
    use std::io::Write as _;

    struct Recorder {
        texts: Vec<String>,
        binaries: Vec<Vec<u8>>,
        pings: Vec<Vec<u8>>,
        pongs: Vec<Vec<u8>>,
        closes: Vec<(u16, String)>,
    }

    impl Recorder {
        fn new() -> Recorder {
            Recorder {
                texts: Vec::new(),
                binaries: Vec::new(),
                pings: Vec::new(),
                pongs: Vec::new(),
                closes: Vec::new(),
            }
        }
    }

    impl FrameCallback for Recorder {
        fn on_text(&mut self, text: String) -> Result<()> {
            self.texts.push(text);
            Ok(())
        }
        fn on_binary(&mut self, data: Vec<u8>) -> Result<()> {
            self.binaries.push(data);
            Ok(())
        }
        fn on_ping(&mut self, payload: Vec<u8>) -> Result<()> {
            self.pings.push(payload);
            Ok(())
        }
        fn on_pong(&mut self, payload: Vec<u8>) -> Result<()> {
            self.pongs.push(payload);
            Ok(())
        }
        fn on_close(&mut self, code: u16, reason: String) -> Result<()> {
            self.closes.push((code, reason));
            Ok(())
        }
    }

    fn reader_for(server_bytes: &[u8]) -> FrameReader {
        let (client, mut server) = pair();
        server.write_all(server_bytes).unwrap();
        let io = Arc::new(Mutex::new(IoBuffer::new(Box::new(client))));
        FrameReader::new(io, None, 16 * 1024 * 1024)
    }

    #[test]
    fn reads_unmasked_text_frame() {
        // The RFC's canonical "Hello" example.
        let mut reader = reader_for(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
        let mut recorder = Recorder::new();
        reader.process_next_frame(&mut recorder).unwrap();
        assert_eq!(recorder.texts, vec!["Hello".to_string()]);
    }

    #[test]
    fn rejects_masked_server_frame() {
        let mut reader = reader_for(&[0x81, 0x85, 1, 2, 3, 4, 0, 0, 0, 0, 0]);
        let mut recorder = Recorder::new();
        let err = reader.process_next_frame(&mut recorder).unwrap_err();
        assert_eq!(
            err.to_string(),
            "protocol error: Server-sent frames must not be masked."
        );
    }

    #[test]
    fn rejects_fragmented_control_frame() {
        let mut reader = reader_for(&[0x09, 0x00]);
        let mut recorder = Recorder::new();
        let err = reader.process_next_frame(&mut recorder).unwrap_err();
        assert_eq!(err.to_string(), "protocol error: Control frames must be final.");
    }

    #[test]
    fn assembles_continuation_frames() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x01, 0x03, b'a', b'b', b'c']); // text, not fin
        bytes.extend_from_slice(&[0x89, 0x00]); // interleaved ping
        bytes.extend_from_slice(&[0x80, 0x03, b'd', b'e', b'f']); // continuation, fin
        let mut reader = reader_for(&bytes);
        let mut recorder = Recorder::new();
        reader.process_next_frame(&mut recorder).unwrap();
        assert_eq!(recorder.texts, vec!["abcdef".to_string()]);
        assert_eq!(recorder.pings.len(), 1);
    }

    #[test]
    fn close_frame_with_code_and_reason() {
        let mut reader = reader_for(&[0x88, 0x06, 0x03, 0xe8, b'b', b'y', b'e', b'!']);
        let mut recorder = Recorder::new();
        reader.process_next_frame(&mut recorder).unwrap();
        assert_eq!(recorder.closes, vec![(1000, "bye!".to_string())]);
    }

    #[test]
    fn written_frames_are_masked() {
        let (client, mut server) = pair();
        let mut writer = FrameWriter::new(Box::new(client), None, u64::MAX);
        writer.write_message(OPCODE_TEXT, b"Hello").unwrap();

        let mut frame = [0u8; 11];
        server.read_exact(&mut frame).unwrap();
        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1], 0x80 | 5); // masked, length 5
        let mask = &frame[2..6];
        let unmasked: Vec<u8> = frame[6..]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ mask[i % 4])
            .collect();
        assert_eq!(unmasked, b"Hello");
    }

    #[test]
    fn writer_reader_round_trip_with_compression() {
        let (client, server) = pair();
        let mut writer = FrameWriter::new(
            Box::new(client),
            Some(MessageDeflater::new(true)),
            0,
        );
        // The reader rejects masked frames, so unmask in a relay: write the
        // frame, then rewrite it unmasked for the reader side.
        writer.write_message(OPCODE_BINARY, b"compress this payload").unwrap();

        let io = Arc::new(Mutex::new(IoBuffer::new(Box::new(server))));
        let mut head = [0u8; 2];
        io.lock().unwrap().read_exact(&mut head).unwrap();
        assert_eq!(head[0], 0x80 | 0x40 | OPCODE_BINARY);
        let len = (head[1] & 0x7f) as usize;
        let mut mask = [0u8; 4];
        io.lock().unwrap().read_exact(&mut mask).unwrap();
        let mut masked = vec![0u8; len];
        io.lock().unwrap().read_exact(&mut masked).unwrap();
        let payload: Vec<u8> = masked
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ mask[i % 4])
            .collect();

        let mut inflater = MessageInflater::new(true);
        let inflated = inflater.inflate(&payload, 1 << 20).unwrap();
        assert_eq!(inflated, b"compress this payload");
    }

    #[test]
    fn close_code_validation() {
        assert!(validate_close_code(1000).is_ok());
        assert!(validate_close_code(4999).is_ok());
        assert!(validate_close_code(999).is_err());
        assert!(validate_close_code(1005).is_err());
        assert!(validate_close_code(2999).is_err());
        assert!(validate_close_code(5000).is_err());
    }
}
