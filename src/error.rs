//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Result type often returned from methods that can have courier `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur executing a call.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    detail: Option<String>,
    cause: Option<Cause>,
    /// Errors from earlier connection attempts of the same call. The primary
    /// error is the first failure; later attempts accumulate here.
    suppressed: Vec<Error>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// A transport-level I/O failure.
    Io(Io),
    /// The peer sent something violating the protocol. Never retried.
    Protocol,
    /// A TLS-level failure. Retryable only when spec fallback applies.
    Handshake { certificate: bool },
    /// DNS resolution failed. Retried only across remaining proxies.
    UnknownHost,
    /// The peer reset an HTTP/2 stream with the given error code.
    StreamReset(u32),
    /// An input could not be parsed as a URL.
    Url,
    /// The caller misused the API.
    User(User),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Io {
    ConnectTimeout,
    ReadTimeout,
    WriteTimeout,
    /// The whole-call deadline elapsed.
    CallTimeout,
    /// A message reached EOF before it was complete.
    UnexpectedEof,
    /// The call was canceled.
    Canceled,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum User {
    AlreadyExecuted,
    InvalidHeader,
    UnsupportedProxy,
    BadConfig,
}

// HTTP/2 REFUSED_STREAM; declared here so retry logic does not depend on the
// codec module.
pub(crate) const REFUSED_STREAM: u32 = 0x7;

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                detail: None,
                cause: None,
                suppressed: Vec::new(),
            }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn detail<S: Into<String>>(mut self, detail: S) -> Error {
        self.inner.detail = Some(detail.into());
        self
    }

    pub(crate) fn kind(&self) -> Kind {
        self.inner.kind
    }

    /// Attaches an error from an earlier failed attempt of the same call.
    pub(crate) fn push_suppressed(&mut self, earlier: Error) {
        self.inner.suppressed.push(earlier);
    }

    /// Errors from attempts that failed before this one succeeded or failed.
    pub fn suppressed(&self) -> &[Error] {
        &self.inner.suppressed
    }

    /// Returns true if this is a transport-level I/O error.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io(_))
    }

    /// Returns true if the call was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Io(Io::Canceled))
    }

    /// Returns true if a connect, read, write, or whole-call deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Io(Io::ConnectTimeout)
                | Kind::Io(Io::ReadTimeout)
                | Kind::Io(Io::WriteTimeout)
                | Kind::Io(Io::CallTimeout)
        )
    }

    /// Returns true if the peer violated the protocol.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if the TLS handshake failed.
    pub fn is_handshake(&self) -> bool {
        matches!(self.inner.kind, Kind::Handshake { .. })
    }

    /// Returns true if DNS resolution failed.
    pub fn is_unknown_host(&self) -> bool {
        matches!(self.inner.kind, Kind::UnknownHost)
    }

    /// Returns true if the input could not be parsed as a URL.
    pub fn is_url(&self) -> bool {
        matches!(self.inner.kind, Kind::Url)
    }

    pub(crate) fn is_certificate(&self) -> bool {
        matches!(self.inner.kind, Kind::Handshake { certificate: true })
    }

    pub(crate) fn is_refused_stream(&self) -> bool {
        matches!(self.inner.kind, Kind::StreamReset(REFUSED_STREAM))
    }

    pub(crate) fn is_stream_reset(&self) -> bool {
        matches!(self.inner.kind, Kind::StreamReset(_))
    }

    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }
        None
    }

    // ===== constructors =====

    pub(crate) fn canceled() -> Error {
        Error::new(Kind::Io(Io::Canceled))
    }

    pub(crate) fn call_timeout() -> Error {
        Error::new(Kind::Io(Io::CallTimeout)).detail("timeout")
    }

    pub(crate) fn unexpected_eof() -> Error {
        Error::new(Kind::Io(Io::UnexpectedEof))
    }

    pub(crate) fn read_timeout<S: Into<String>>(detail: S) -> Error {
        Error::new(Kind::Io(Io::ReadTimeout)).detail(detail)
    }

    pub(crate) fn protocol<S: Into<String>>(detail: S) -> Error {
        Error::new(Kind::Protocol).detail(detail)
    }

    pub(crate) fn stream_reset(code: u32) -> Error {
        Error::new(Kind::StreamReset(code)).detail(format!("stream was reset: {}", code))
    }

    pub(crate) fn unknown_host<S: Into<String>>(host: S) -> Error {
        Error::new(Kind::UnknownHost).detail(host)
    }

    pub(crate) fn handshake<S: Into<String>>(detail: S, certificate: bool) -> Error {
        Error::new(Kind::Handshake { certificate }).detail(detail)
    }

    pub(crate) fn url<S: Into<String>>(detail: S) -> Error {
        Error::new(Kind::Url).detail(detail)
    }

    pub(crate) fn already_executed() -> Error {
        Error::new(Kind::User(User::AlreadyExecuted))
    }

    pub(crate) fn invalid_header<S: Into<String>>(detail: S) -> Error {
        Error::new(Kind::User(User::InvalidHeader)).detail(detail)
    }

    pub(crate) fn unsupported_proxy<S: Into<String>>(detail: S) -> Error {
        Error::new(Kind::User(User::UnsupportedProxy)).detail(detail)
    }

    pub(crate) fn bad_config<S: Into<String>>(detail: S) -> Error {
        Error::new(Kind::User(User::BadConfig)).detail(detail)
    }

    /// Classifies an `io::Error` observed while reading from a socket.
    pub(crate) fn read(cause: io::Error) -> Error {
        let kind = match cause.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Kind::Io(Io::ReadTimeout),
            io::ErrorKind::UnexpectedEof => Kind::Io(Io::UnexpectedEof),
            _ => Kind::Io(Io::Other),
        };
        Error::new(kind).with(cause)
    }

    /// Classifies an `io::Error` observed while writing to a socket.
    pub(crate) fn write(cause: io::Error) -> Error {
        let kind = match cause.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Kind::Io(Io::WriteTimeout),
            _ => Kind::Io(Io::Other),
        };
        Error::new(kind).with(cause)
    }

    /// Classifies an `io::Error` observed while connecting a socket.
    pub(crate) fn connect(cause: io::Error) -> Error {
        let kind = match cause.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Kind::Io(Io::ConnectTimeout),
            _ => Kind::Io(Io::Other),
        };
        Error::new(kind).with(cause)
    }

    /// An `io::Error` whose operation is unknown.
    pub(crate) fn io(cause: io::Error) -> Error {
        Error::new(Kind::Io(Io::Other)).with(cause)
    }

    /// Converts this error into an `io::Error`, used where body streams
    /// surface through `std::io::Read`.
    pub(crate) fn into_io(self) -> io::Error {
        let kind = match self.inner.kind {
            Kind::Io(Io::ReadTimeout) | Kind::Io(Io::WriteTimeout) | Kind::Io(Io::ConnectTimeout) => {
                io::ErrorKind::TimedOut
            }
            Kind::Io(Io::UnexpectedEof) => io::ErrorKind::UnexpectedEof,
            Kind::Io(Io::Canceled) | Kind::Io(Io::CallTimeout) => io::ErrorKind::Interrupted,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// Recovers a courier error smuggled through an `io::Error`, or classifies
    /// the `io::Error` as a read failure.
    pub(crate) fn from_body_io(cause: io::Error) -> Error {
        match Error::recover_smuggled(cause) {
            Ok(err) => err,
            Err(cause) => Error::read(cause),
        }
    }

    /// As `from_body_io`, but for request-body sinks.
    pub(crate) fn from_sink_io(cause: io::Error) -> Error {
        match Error::recover_smuggled(cause) {
            Ok(err) => err,
            Err(cause) => Error::write(cause),
        }
    }

    fn recover_smuggled(cause: io::Error) -> std::result::Result<Error, io::Error> {
        if cause.get_ref().map(|e| e.is::<Error>()).unwrap_or(false) {
            match cause.into_inner().map(|e| e.downcast::<Error>()) {
                Some(Ok(err)) => return Ok(*err),
                Some(Err(other)) => return Ok(Error::new(Kind::Io(Io::Other)).with(other)),
                None => unreachable!(),
            }
        }
        Err(cause)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Io(Io::ConnectTimeout) => "connect timed out",
            Kind::Io(Io::ReadTimeout) => "read timed out",
            Kind::Io(Io::WriteTimeout) => "write timed out",
            Kind::Io(Io::CallTimeout) => "call timed out",
            Kind::Io(Io::UnexpectedEof) => "unexpected end of stream",
            Kind::Io(Io::Canceled) => "canceled",
            Kind::Io(Io::Other) => "connection error",
            Kind::Protocol => "protocol error",
            Kind::Handshake { .. } => "TLS handshake failed",
            Kind::UnknownHost => "unable to resolve host",
            Kind::StreamReset(_) => "http2 stream was reset",
            Kind::Url => "invalid URL",
            Kind::User(User::AlreadyExecuted) => "call already executed",
            Kind::User(User::InvalidHeader) => "invalid header",
            Kind::User(User::UnsupportedProxy) => "unsupported proxy",
            Kind::User(User::BadConfig) => "invalid client configuration",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("courier::Error");
        f.field(&self.inner.kind);
        if let Some(ref detail) = self.inner.detail {
            f.field(detail);
        }
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())?;
        if let Some(ref detail) = self.inner.detail {
            write!(f, ": {}", detail)?;
        }
        if let Some(ref cause) = self.inner.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn io_error_round_trips_through_body_streams() {
        let err = Error::protocol("bad chunk");
        let io_err = err.into_io();
        let back = Error::from_body_io(io_err);
        assert!(back.is_protocol());
    }

    #[test]
    fn timeout_predicates() {
        assert!(Error::call_timeout().is_timeout());
        assert!(Error::read(io::Error::new(io::ErrorKind::TimedOut, "t")).is_timeout());
        assert!(!Error::canceled().is_timeout());
        assert!(Error::canceled().is_io());
    }

    #[test]
    fn suppressed_accumulates() {
        let mut primary = Error::unexpected_eof();
        primary.push_suppressed(Error::canceled());
        primary.push_suppressed(Error::protocol("x"));
        assert_eq!(primary.suppressed().len(), 2);
    }
}
