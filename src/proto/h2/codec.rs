//! Adapts an HTTP/2 stream to the exchange codec interface.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{BodySink, Connection, ExchangeCodec};
use crate::connect::Protocol;
use crate::error::{Error, Result};
use crate::http::{Headers, HeadersBuilder, Request, Response, ResponseBuilder};
use crate::proto::h2::connection::H2Connection;
use crate::proto::h2::hpack::Header;
use crate::proto::h2::stream::H2Stream;
use crate::proto::h2::ErrorCode;

/// Request headers that do not cross to HTTP/2.
const SKIPPED_REQUEST_HEADERS: [&str; 7] = [
    "connection",
    "host",
    "keep-alive",
    "proxy-connection",
    "te",
    "transfer-encoding",
    "upgrade",
];

pub(crate) struct Http2Codec {
    connection: Arc<Connection>,
    h2: Arc<H2Connection>,
    stream: Option<Arc<H2Stream>>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Http2Codec {
    pub(crate) fn new(
        connection: Arc<Connection>,
        h2: Arc<H2Connection>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Http2Codec {
        Http2Codec {
            connection,
            h2,
            stream: None,
            read_timeout,
            write_timeout,
        }
    }

    fn stream(&self) -> Result<&Arc<H2Stream>> {
        self.stream
            .as_ref()
            .ok_or_else(|| Error::protocol("stream not open"))
    }

    fn request_headers(request: &Request) -> Vec<Header> {
        let mut out = Vec::with_capacity(request.headers().len() + 4);
        out.push((":method".to_string(), request.method().to_string()));
        out.push((
            ":path".to_string(),
            request.url().encoded_path_and_query(),
        ));
        out.push((":authority".to_string(), request.url().host_header()));
        out.push((":scheme".to_string(), request.url().scheme().to_string()));
        for (name, value) in request.headers().iter() {
            let lower = name.to_ascii_lowercase();
            if SKIPPED_REQUEST_HEADERS.contains(&lower.as_str()) {
                // TE is allowed for its "trailers" value only.
                if lower == "te" && value.eq_ignore_ascii_case("trailers") {
                    out.push((lower, value.to_string()));
                }
                continue;
            }
            out.push((lower, value.to_string()));
        }
        out
    }

    fn response_builder(headers: Vec<Header>) -> Result<ResponseBuilder> {
        let mut code: Option<u16> = None;
        let mut builder_headers = HeadersBuilder::default();
        for (name, value) in &headers {
            if name == ":status" {
                code = value.parse().ok();
            } else if name.starts_with(':') {
                // Other response pseudo-headers are not surfaced.
            } else {
                builder_headers.add_lenient(name, value);
            }
        }
        let code = code.ok_or_else(|| Error::protocol("Expected ':status' header not present"))?;
        Ok(Response::builder()
            .protocol(Protocol::H2)
            .code(code)
            .message("")
            .headers(builder_headers.build()))
    }
}

impl ExchangeCodec for Http2Codec {
    fn write_request_headers(&mut self, request: &Request) -> Result<()> {
        let has_body = request.body().is_some();
        let headers = Http2Codec::request_headers(request);
        tracing::trace!(
            ">> HEADERS {} {} (end_stream={})",
            request.method(),
            request.url().redact(),
            !has_body
        );
        let stream = self.h2.new_stream(&headers, !has_body)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn create_request_body_sink(
        &mut self,
        _request: &Request,
        _content_length: i64,
    ) -> Result<Box<dyn BodySink>> {
        let stream = self.stream()?.clone();
        Ok(Box::new(H2BodySink {
            h2: self.h2.clone(),
            stream,
            write_timeout: self.write_timeout,
            finished: false,
        }))
    }

    fn flush_request(&mut self) -> Result<()> {
        Ok(())
    }

    fn finish_request(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_response_headers(&mut self, expect_continue: bool) -> Result<Option<ResponseBuilder>> {
        let stream = self.stream()?.clone();
        let headers = stream.take_headers(self.read_timeout)?;
        let builder = Http2Codec::response_builder(headers)?;
        if expect_continue && builder.peek_code() == Some(100) {
            return Ok(None);
        }
        Ok(Some(builder))
    }

    fn open_response_body(&mut self, _response: &Response) -> Result<Box<dyn Read + Send>> {
        let stream = self.stream()?.clone();
        Ok(Box::new(H2BodyReader {
            stream,
            read_timeout: self.read_timeout,
        }))
    }

    fn trailers(&self) -> Headers {
        let mut builder = HeadersBuilder::default();
        if let Some(ref stream) = self.stream {
            for (name, value) in stream.trailers() {
                builder.add_lenient(&name, &value);
            }
        }
        builder.build()
    }

    fn cancel(&self) {
        if let Some(ref stream) = self.stream {
            stream.cancel(ErrorCode::CANCEL);
        }
    }

    fn is_connection_wide(&self) -> bool {
        false
    }
}

impl Drop for Http2Codec {
    fn drop(&mut self) {
        if let Some(ref stream) = self.stream {
            if !stream.is_done() {
                // The exchange was abandoned mid-flight.
                stream.cancel(ErrorCode::CANCEL);
            }
            self.h2.finish_stream(stream.id());
        }
        let _ = &self.connection;
    }
}

impl std::fmt::Debug for Http2Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("Http2Codec")
    }
}

struct H2BodySink {
    h2: Arc<H2Connection>,
    stream: Arc<H2Stream>,
    write_timeout: Duration,
    finished: bool,
}

impl Write for H2BodySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::new(io::ErrorKind::Other, "sink closed"));
        }
        self.h2
            .write_data(&self.stream, buf, false, self.write_timeout)
            .map_err(Error::into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BodySink for H2BodySink {
    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.h2
            .write_data(&self.stream, &[], true, self.write_timeout)
    }
}

struct H2BodyReader {
    stream: Arc<H2Stream>,
    read_timeout: Duration,
}

impl Read for H2BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.stream
            .read(buf, self.read_timeout)
            .map_err(Error::into_io)
    }
}
