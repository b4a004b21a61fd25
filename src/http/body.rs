//! Request and response bodies as capability sets over byte streams.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::http::MediaType;

/// A source of request body bytes.
///
/// Implementations describe their framing (`content_length`) and write
/// themselves to the wire on demand. One-shot bodies may only be written
/// once and inhibit retries; duplex bodies stream concurrently with the
/// response and require HTTP/2.
pub trait RequestBody: Send + Sync {
    fn content_type(&self) -> Option<MediaType>;

    /// The exact byte count, or -1 when unknown (chunked encoding is used).
    fn content_length(&self) -> i64 {
        -1
    }

    fn write_to(&self, sink: &mut dyn Write) -> io::Result<()>;

    /// True if this body's bytes stream concurrently with the response.
    fn is_duplex(&self) -> bool {
        false
    }

    /// True if this body may be transmitted at most once.
    fn is_one_shot(&self) -> bool {
        false
    }
}

impl fmt::Debug for dyn RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody")
            .field("content_length", &self.content_length())
            .finish()
    }
}

struct BytesBody {
    media_type: Option<MediaType>,
    content: Bytes,
}

impl RequestBody for BytesBody {
    fn content_type(&self) -> Option<MediaType> {
        self.media_type.clone()
    }

    fn content_length(&self) -> i64 {
        self.content.len() as i64
    }

    fn write_to(&self, sink: &mut dyn Write) -> io::Result<()> {
        sink.write_all(&self.content)
    }
}

/// A request body from a byte buffer.
pub fn bytes_body(content: impl Into<Bytes>, media_type: Option<MediaType>) -> Arc<dyn RequestBody> {
    Arc::new(BytesBody {
        media_type,
        content: content.into(),
    })
}

/// A UTF-8 text request body.
pub fn text_body(content: impl Into<String>, media_type: Option<MediaType>) -> Arc<dyn RequestBody> {
    bytes_body(Bytes::from(content.into().into_bytes()), media_type)
}

/// A single-consumption stream of response body bytes.
///
/// Dropping (or [`close`](ResponseBody::close)-ing) the body releases the
/// connection slot it holds; a body must not be left open indefinitely.
pub struct ResponseBody {
    media_type: Option<MediaType>,
    content_length: i64,
    source: Option<Box<dyn Read + Send>>,
}

impl ResponseBody {
    pub(crate) fn new(
        media_type: Option<MediaType>,
        content_length: i64,
        source: Box<dyn Read + Send>,
    ) -> ResponseBody {
        ResponseBody {
            media_type,
            content_length,
            source: Some(source),
        }
    }

    /// A zero-length body.
    pub fn empty() -> ResponseBody {
        ResponseBody {
            media_type: None,
            content_length: 0,
            source: None,
        }
    }

    /// A body over an in-memory buffer.
    pub fn from_bytes(media_type: Option<MediaType>, content: impl Into<Bytes>) -> ResponseBody {
        let content = content.into();
        ResponseBody {
            media_type,
            content_length: content.len() as i64,
            source: Some(Box::new(BytesReader(content))),
        }
    }

    pub fn content_type(&self) -> Option<&MediaType> {
        self.media_type.as_ref()
    }

    /// The byte count declared by the response, or -1 when unknown.
    pub fn content_length(&self) -> i64 {
        self.content_length
    }

    /// Reads the remaining bytes and closes the stream.
    pub fn bytes(&mut self) -> Result<Bytes> {
        let mut out = Vec::new();
        if let Some(mut source) = self.source.take() {
            source
                .read_to_end(&mut out)
                .map_err(Error::from_body_io)?;
        }
        Ok(Bytes::from(out))
    }

    /// Reads the remaining bytes as UTF-8, replacing invalid sequences.
    pub fn string(&mut self) -> Result<String> {
        let bytes = self.bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Releases the connection slot held by this body. Idempotent.
    pub fn close(&mut self) {
        self.source = None;
    }

    pub(crate) fn is_open(&self) -> bool {
        self.source.is_some()
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.source {
            Some(ref mut source) => {
                let n = source.read(buf)?;
                if n == 0 {
                    self.source = None;
                }
                Ok(n)
            }
            None => Ok(0),
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("content_length", &self.content_length)
            .field("open", &self.source.is_some())
            .finish()
    }
}

struct BytesReader(Bytes);

impl Read for BytesReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.0.len().min(buf.len());
        buf[..n].copy_from_slice(&self.0[..n]);
        self.0 = self.0.slice(n..);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_body_reports_length() {
        let body = bytes_body(&b"hello"[..], None);
        assert_eq!(body.content_length(), 5);
        let mut out = Vec::new();
        body.write_to(&mut out).unwrap();
        assert_eq!(out, b"hello");
        assert!(!body.is_one_shot());
        assert!(!body.is_duplex());
    }

    #[test]
    fn response_body_single_consumption() {
        let mut body = ResponseBody::from_bytes(None, &b"hi there"[..]);
        assert_eq!(body.content_length(), 8);
        assert_eq!(body.string().unwrap(), "hi there");
        assert_eq!(ResponseBody::bytes(&mut body).unwrap().len(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let mut body = ResponseBody::from_bytes(None, &b"x"[..]);
        body.close();
        body.close();
        assert_eq!(ResponseBody::bytes(&mut body).unwrap().len(), 0);
    }
}
