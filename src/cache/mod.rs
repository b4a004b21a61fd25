//! An on-disk HTTP response cache.
//!
//! Entries live in a [`DiskLruCache`] keyed by the SHA-256 of the request
//! URL. Stream 0 holds the entry metadata (request and response heads, TLS
//! summary, timestamps); stream 1 holds the body bytes.

pub(crate) mod disk_lru;
pub(crate) mod strategy;

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::connect::{Handshake, Protocol, TlsVersion};
use crate::error::{Error, Result};
use crate::http::{
    Headers, HeadersBuilder, MediaType, Request, Response, ResponseBody, StatusLine, Url,
};

use self::disk_lru::{DiskLruCache, Editor, Snapshot};

pub(crate) use self::strategy::CacheStrategy;

const ENTRY_METADATA: usize = 0;
const ENTRY_BODY: usize = 1;
const CACHE_VERSION: u32 = 201105;

const SENT_MILLIS: &str = "Courier-Sent-Millis";
const RECEIVED_MILLIS: &str = "Courier-Received-Millis";

/// Caches HTTP responses on the filesystem.
///
/// One directory belongs to one `Cache`; opening a second cache on the same
/// directory is an error. All I/O failures degrade: the engine behaves as if
/// the entry were absent, and a warning is logged.
#[derive(Clone, Debug)]
pub struct Cache {
    disk: DiskLruCache,
    stats: Arc<Stats>,
}

#[derive(Debug, Default)]
struct Stats {
    request_count: AtomicU64,
    network_count: AtomicU64,
    hit_count: AtomicU64,
    write_success_count: AtomicU64,
    write_abort_count: AtomicU64,
}

impl Cache {
    /// Opens (creating if needed) a cache in `directory` bounded to
    /// `max_size` bytes.
    pub fn new(directory: impl AsRef<Path>, max_size: u64) -> Result<Cache> {
        let disk = DiskLruCache::open(directory.as_ref(), CACHE_VERSION, max_size)
            .map_err(Error::io)?;
        Ok(Cache {
            disk,
            stats: Arc::new(Stats::default()),
        })
    }

    pub(crate) fn key(url: &Url) -> String {
        let digest = Sha256::digest(url.to_string().as_bytes());
        let mut out = String::with_capacity(64);
        for byte in digest {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    pub(crate) fn get(&self, request: &Request) -> Option<Response> {
        let key = Cache::key(request.url());
        let mut snapshot = self.disk.get(&key)?;
        let entry = match Entry::read(&mut snapshot) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("cache entry for {} is unreadable: {}", request.url().redact(), e);
                self.disk.remove(&key);
                return None;
            }
        };
        if !entry.matches(request) {
            return None;
        }
        Some(entry.response(request, snapshot))
    }

    /// Starts writing `response` to the cache. Returns `None` when the
    /// method is uncacheable or the metadata could not be written; the
    /// response streams on regardless.
    pub(crate) fn put(&self, response: &Response) -> Option<CacheWriter> {
        if response.request().method() != "GET" {
            return None;
        }
        let key = Cache::key(response.request().url());
        let mut editor = self.disk.edit(&key)?;
        let entry = Entry::from_response(response);
        match entry.write(&mut editor) {
            Ok(()) => Some(CacheWriter {
                editor: Some(editor),
                stats: self.stats.clone(),
            }),
            Err(e) => {
                tracing::warn!("unable to write cache metadata: {}", e);
                editor.abort();
                None
            }
        }
    }

    /// Replaces the metadata of a cached response after a 304 validation.
    /// The body stream is untouched.
    pub(crate) fn update(&self, cached: &Response, merged: &Response) {
        let key = Cache::key(merged.request().url());
        let _ = cached;
        let Some(mut editor) = self.disk.edit(&key) else { return };
        let entry = Entry::from_response(merged);
        match entry.write(&mut editor) {
            Ok(()) => {
                if let Err(e) = editor.commit() {
                    tracing::warn!("unable to commit cache update: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!("unable to update cache metadata: {}", e);
                editor.abort();
            }
        }
    }

    pub(crate) fn remove(&self, request: &Request) {
        self.disk.remove(&Cache::key(request.url()));
    }

    /// Deletes every stored entry.
    pub fn evict_all(&self) -> Result<()> {
        self.disk.evict_all().map_err(Error::io)
    }

    /// The URLs of stored responses, least recently used first.
    pub fn urls(&self) -> Vec<String> {
        self.disk
            .keys()
            .iter()
            .filter_map(|key| {
                let mut snapshot = self.disk.get(key)?;
                Entry::read(&mut snapshot).ok().map(|entry| entry.url)
            })
            .collect()
    }

    pub fn size(&self) -> u64 {
        self.disk.size()
    }

    pub fn max_size(&self) -> u64 {
        self.disk.max_size()
    }

    pub fn directory(&self) -> std::path::PathBuf {
        self.disk.directory()
    }

    /// Calls that consulted this cache.
    pub fn request_count(&self) -> u64 {
        self.stats.request_count.load(Ordering::Relaxed)
    }

    /// Calls that went to the network.
    pub fn network_count(&self) -> u64 {
        self.stats.network_count.load(Ordering::Relaxed)
    }

    /// Calls satisfied from the cache.
    pub fn hit_count(&self) -> u64 {
        self.stats.hit_count.load(Ordering::Relaxed)
    }

    pub(crate) fn track_strategy(&self, strategy: &CacheStrategy) {
        self.stats.request_count.fetch_add(1, Ordering::Relaxed);
        if strategy.network_request.is_some() {
            self.stats.network_count.fetch_add(1, Ordering::Relaxed);
        } else if strategy.cache_response.is_some() {
            self.stats.hit_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn track_conditional_hit(&self) {
        self.stats.hit_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// An in-progress cache body write.
pub(crate) struct CacheWriter {
    editor: Option<Editor>,
    stats: Arc<Stats>,
}

impl CacheWriter {
    fn body_sink(&mut self) -> io::Result<File> {
        self.editor
            .as_mut()
            .expect("editor present until finished")
            .new_sink(ENTRY_BODY)
    }

    fn commit(&mut self) {
        if let Some(editor) = self.editor.take() {
            match editor.commit() {
                Ok(()) => {
                    self.stats.write_success_count.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!("cache commit failed: {}", e);
                    self.stats.write_abort_count.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn abort(&mut self) {
        if let Some(editor) = self.editor.take() {
            editor.abort();
            self.stats.write_abort_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for CacheWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("CacheWriter")
    }
}

/// Replaces `response`'s body with one that tees into the cache as the
/// caller reads it. The entry commits when the body reaches EOF; dropping
/// the body earlier aborts the write.
pub(crate) fn cache_writing_response(mut writer: CacheWriter, response: Response) -> Response {
    let sink = match writer.body_sink() {
        Ok(sink) => sink,
        Err(e) => {
            tracing::warn!("unable to open cache body sink: {}", e);
            writer.abort();
            return response;
        }
    };
    let media_type = response.header("Content-Type").and_then(MediaType::parse);
    let content_length = response.body().content_length();

    let mut response = response;
    let body = std::mem::replace(response.body_mut(), ResponseBody::empty());
    let teed = TeeReader {
        body,
        sink: Some(sink),
        writer,
        done: false,
    };
    *response.body_mut() = ResponseBody::new(media_type, content_length, Box::new(teed));
    response
}

struct TeeReader {
    body: ResponseBody,
    sink: Option<File>,
    writer: CacheWriter,
    done: bool,
}

impl Read for TeeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match self.body.read(buf) {
            Ok(n) => n,
            Err(e) => {
                self.done = true;
                self.sink = None;
                self.writer.abort();
                return Err(e);
            }
        };
        if n == 0 {
            if !self.done {
                self.done = true;
                self.sink = None;
                self.writer.commit();
            }
            return Ok(0);
        }
        if let Some(ref mut sink) = self.sink {
            // A failed cache write degrades; the caller still gets bytes.
            if sink.write_all(&buf[..n]).is_err() {
                self.sink = None;
                self.writer.abort();
            }
        }
        Ok(n)
    }
}

impl Drop for TeeReader {
    fn drop(&mut self) {
        if !self.done {
            self.writer.abort();
        }
    }
}

// ===== entry serialization =====

/// The decoded metadata stream of a cache entry.
struct Entry {
    url: String,
    request_method: String,
    vary_headers: Headers,
    status_line: StatusLine,
    response_headers: Headers,
    handshake: Option<Handshake>,
    sent_request_millis: i64,
    received_response_millis: i64,
}

impl Entry {
    fn from_response(response: &Response) -> Entry {
        Entry {
            url: response.request().url().to_string(),
            request_method: response.request().method().to_string(),
            vary_headers: vary_headers(response.request(), response.headers()),
            status_line: StatusLine {
                protocol: match response.protocol() {
                    Protocol::Http10 => Protocol::Http10,
                    _ => Protocol::Http11,
                },
                code: response.code(),
                message: response.message().to_string(),
            },
            response_headers: response.headers().clone(),
            handshake: response.handshake().cloned(),
            sent_request_millis: response.sent_request_at_millis(),
            received_response_millis: response.received_response_at_millis(),
        }
    }

    fn write(&self, editor: &mut Editor) -> io::Result<()> {
        let mut sink = io::BufWriter::new(editor.new_sink(ENTRY_METADATA)?);

        writeln!(sink, "{}", self.url)?;
        writeln!(sink, "{}", self.request_method)?;
        writeln!(sink, "{}", self.vary_headers.len())?;
        for (name, value) in self.vary_headers.iter() {
            writeln!(sink, "{}: {}", name, value)?;
        }
        writeln!(sink, "{}", self.status_line)?;
        writeln!(sink, "{}", self.response_headers.len() + 2)?;
        for (name, value) in self.response_headers.iter() {
            writeln!(sink, "{}: {}", name, value)?;
        }
        writeln!(sink, "{}: {}", SENT_MILLIS, self.sent_request_millis)?;
        writeln!(sink, "{}: {}", RECEIVED_MILLIS, self.received_response_millis)?;

        if let Some(ref handshake) = self.handshake {
            writeln!(sink)?;
            writeln!(sink, "{}", handshake.cipher_suite())?;
            writeln!(sink, "{}", handshake.tls_version())?;
            writeln!(sink, "{}", handshake.peer_certificates().len())?;
            let engine = base64::engine::general_purpose::STANDARD;
            for certificate in handshake.peer_certificates() {
                writeln!(sink, "{}", engine.encode(certificate))?;
            }
        }
        sink.flush()
    }

    fn read(snapshot: &mut Snapshot) -> io::Result<Entry> {
        let source = snapshot
            .take_source(ENTRY_METADATA)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "metadata already taken"))?;
        let mut reader = BufReader::new(source);
        let corrupt = |what: &str| io::Error::new(io::ErrorKind::InvalidData, what.to_string());

        let mut next_line = move |reader: &mut BufReader<File>| -> io::Result<String> {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated entry"));
            }
            Ok(line.trim_end_matches('\n').to_string())
        };

        let url = next_line(&mut reader)?;
        let request_method = next_line(&mut reader)?;

        let vary_count: usize = next_line(&mut reader)?
            .parse()
            .map_err(|_| corrupt("bad vary count"))?;
        let mut vary_builder = HeadersBuilder::default();
        for _ in 0..vary_count {
            vary_builder.add_line(&next_line(&mut reader)?);
        }

        let status_line = StatusLine::parse(&next_line(&mut reader)?)
            .map_err(|_| corrupt("bad status line"))?;

        let header_count: usize = next_line(&mut reader)?
            .parse()
            .map_err(|_| corrupt("bad header count"))?;
        let mut headers_builder = HeadersBuilder::default();
        for _ in 0..header_count {
            headers_builder.add_line(&next_line(&mut reader)?);
        }
        let all_headers = headers_builder.build();
        let sent_request_millis: i64 = all_headers
            .get(SENT_MILLIS)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| corrupt("missing sent timestamp"))?;
        let received_response_millis: i64 = all_headers
            .get(RECEIVED_MILLIS)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| corrupt("missing received timestamp"))?;
        let mut response_builder = HeadersBuilder::default();
        for (name, value) in all_headers.iter() {
            if name != SENT_MILLIS && name != RECEIVED_MILLIS {
                response_builder.add_lenient(name, value);
            }
        }

        let handshake = if url.starts_with("https://") {
            let blank = next_line(&mut reader)?;
            if !blank.is_empty() {
                return Err(corrupt("expected blank line before handshake"));
            }
            let cipher_suite = next_line(&mut reader)?;
            let tls_version = TlsVersion::parse(&next_line(&mut reader)?)
                .ok_or_else(|| corrupt("bad TLS version"))?;
            let certificate_count: usize = next_line(&mut reader)?
                .parse()
                .map_err(|_| corrupt("bad certificate count"))?;
            let engine = base64::engine::general_purpose::STANDARD;
            let mut certificates = Vec::with_capacity(certificate_count);
            for _ in 0..certificate_count {
                let encoded = next_line(&mut reader)?;
                certificates.push(
                    engine
                        .decode(encoded.as_bytes())
                        .map_err(|_| corrupt("bad certificate"))?,
                );
            }
            Some(Handshake::new(tls_version, cipher_suite, certificates))
        } else {
            None
        };

        Ok(Entry {
            url,
            request_method,
            vary_headers: vary_builder.build(),
            status_line,
            response_headers: response_builder.build(),
            handshake,
            sent_request_millis,
            received_response_millis,
        })
    }

    /// True when this entry may serve `request`: same URL and method, and
    /// every varied header matches.
    fn matches(&self, request: &Request) -> bool {
        if self.url != request.url().to_string() || self.request_method != request.method() {
            return false;
        }
        for name in self.vary_headers.names() {
            let stored: Vec<&str> = self.vary_headers.values(&name);
            let current: Vec<&str> = request.headers().values(&name);
            if stored != current {
                return false;
            }
        }
        true
    }

    fn response(self, request: &Request, mut snapshot: Snapshot) -> Response {
        let content_type = self.response_headers.get("Content-Type").and_then(MediaType::parse);
        let content_length = self
            .response_headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(snapshot.length(ENTRY_BODY) as i64);
        let body: Box<dyn Read + Send> = match snapshot.take_source(ENTRY_BODY) {
            Some(file) => Box::new(file),
            None => Box::new(io::empty()),
        };
        Response::builder()
            .request(request.clone())
            .protocol(self.status_line.protocol)
            .code(self.status_line.code)
            .message(self.status_line.message.clone())
            .headers(self.response_headers.clone())
            .handshake(self.handshake.clone())
            .sent_request_at_millis(self.sent_request_millis)
            .received_response_at_millis(self.received_response_millis)
            .body(ResponseBody::new(content_type, content_length, body))
            .build()
            .expect("cached entries are valid responses")
    }
}

/// The request headers named by the response's `Vary` values, with the
/// values the request actually sent.
pub(crate) fn vary_headers(request: &Request, response_headers: &Headers) -> Headers {
    let mut builder = HeadersBuilder::default();
    for field in vary_fields(response_headers) {
        for value in request.headers().values(&field) {
            builder.add_lenient(&field, value);
        }
    }
    builder.build()
}

/// True when the response varies on something we cannot key: `Vary: *`.
pub(crate) fn has_vary_all(response_headers: &Headers) -> bool {
    vary_fields(response_headers).iter().any(|f| f == "*")
}

fn vary_fields(response_headers: &Headers) -> Vec<String> {
    let mut fields = Vec::new();
    for value in response_headers.values("Vary") {
        for field in value.split(',') {
            let field = field.trim().to_string();
            if !field.is_empty() && !fields.contains(&field) {
                fields.push(field);
            }
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_for(url: &str, headers: &[(&str, &str)]) -> Response {
        let request = Request::get(url).unwrap();
        let mut builder = Response::builder()
            .request(request)
            .protocol(Protocol::Http11)
            .code(200)
            .message("OK")
            .sent_request_at_millis(100)
            .received_response_at_millis(200);
        for (name, value) in headers {
            builder = builder.add_header(name, value);
        }
        builder.build().unwrap()
    }

    #[test]
    fn cache_key_is_sha256_hex() {
        let url = Url::parse("http://example.com/").unwrap();
        let key = Cache::key(&url);
        assert_eq!(key.len(), 64);
        assert!(key.bytes().all(|b| b.is_ascii_hexdigit()));
        // Stable across calls.
        assert_eq!(key, Cache::key(&url));
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 1 << 20).unwrap();
        let response = response_for(
            "http://example.com/a",
            &[("Content-Type", "text/plain"), ("ETag", "\"v1\"")],
        );

        let mut writer = cache.put(&response).unwrap();
        writer.body_sink().unwrap().write_all(b"hello cache").unwrap();
        writer.commit();

        let request = Request::get("http://example.com/a").unwrap();
        let mut cached = cache.get(&request).unwrap();
        assert_eq!(cached.code(), 200);
        assert_eq!(cached.header("etag"), Some("\"v1\""));
        assert_eq!(cached.sent_request_at_millis(), 100);
        assert_eq!(cached.received_response_at_millis(), 200);
        assert_eq!(cached.body_mut().string().unwrap(), "hello cache");
    }

    #[test]
    fn vary_mismatch_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 1 << 20).unwrap();

        let request = Request::builder()
            .url("http://example.com/v")
            .unwrap()
            .header("Accept-Language", "en")
            .build()
            .unwrap();
        let response = Response::builder()
            .request(request.clone())
            .protocol(Protocol::Http11)
            .code(200)
            .header("Vary", "Accept-Language")
            .build()
            .unwrap();
        let mut writer = cache.put(&response).unwrap();
        writer.body_sink().unwrap().write_all(b"en body").unwrap();
        writer.commit();

        assert!(cache.get(&request).is_some());
        let other = Request::builder()
            .url("http://example.com/v")
            .unwrap()
            .header("Accept-Language", "fr")
            .build()
            .unwrap();
        assert!(cache.get(&other).is_none());
    }

    #[test]
    fn vary_star_detected() {
        let headers = Headers::of(&["Vary", "Accept-Encoding, *"]);
        assert!(has_vary_all(&headers));
        let plain = Headers::of(&["Vary", "Accept-Encoding"]);
        assert!(!has_vary_all(&plain));
    }

    #[test]
    fn urls_lists_stored_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 1 << 20).unwrap();
        let response = response_for("http://example.com/listed", &[]);
        let mut writer = cache.put(&response).unwrap();
        writer.body_sink().unwrap().write_all(b"x").unwrap();
        writer.commit();

        assert_eq!(cache.urls(), vec!["http://example.com/listed".to_string()]);
    }

    #[test]
    fn update_rewrites_metadata_keeps_body() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 1 << 20).unwrap();
        let response = response_for("http://example.com/u", &[("X-Version", "1")]);
        let mut writer = cache.put(&response).unwrap();
        writer.body_sink().unwrap().write_all(b"stable body").unwrap();
        writer.commit();

        let merged = response_for("http://example.com/u", &[("X-Version", "2")]);
        cache.update(&response, &merged);

        let request = Request::get("http://example.com/u").unwrap();
        let mut cached = cache.get(&request).unwrap();
        assert_eq!(cached.header("X-Version"), Some("2"));
        assert_eq!(cached.body_mut().string().unwrap(), "stable body");
    }
}
