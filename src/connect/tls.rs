//! TLS configuration and the interfaces a concrete TLS library plugs into.
//!
//! This crate performs no cryptography itself: the connector, hostname
//! verifier, and certificate pinner are capability traits supplied through
//! client configuration. What lives here is the fallback policy between
//! [`ConnectionSpec`]s and the [`Handshake`] summary attached to responses.

use std::fmt;
use std::net::TcpStream;

use crate::connect::Protocol;
use crate::error::Error;
use crate::transport::Transport;

/// A TLS protocol version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }

    pub fn parse(input: &str) -> Option<TlsVersion> {
        match input {
            "TLSv1" | "TLSv1.0" => Some(TlsVersion::Tls10),
            "TLSv1.1" => Some(TlsVersion::Tls11),
            "TLSv1.2" => Some(TlsVersion::Tls12),
            "TLSv1.3" => Some(TlsVersion::Tls13),
            _ => None,
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One TLS configuration a connection may attempt: the enabled protocol
/// versions and, optionally, a cipher-suite restriction.
///
/// An address carries an ordered list of specs; when a handshake fails
/// retryably the next spec that would change the negotiation is attempted on
/// a fresh socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSpec {
    tls_versions: Vec<TlsVersion>,
    cipher_suites: Option<Vec<String>>,
    is_tls: bool,
}

impl ConnectionSpec {
    /// TLS 1.2 and 1.3 only. A secure default.
    pub fn modern_tls() -> ConnectionSpec {
        ConnectionSpec {
            tls_versions: vec![TlsVersion::Tls13, TlsVersion::Tls12],
            cipher_suites: None,
            is_tls: true,
        }
    }

    /// A fallback for obsolete servers, down to TLS 1.0.
    pub fn compatible_tls() -> ConnectionSpec {
        ConnectionSpec {
            tls_versions: vec![
                TlsVersion::Tls13,
                TlsVersion::Tls12,
                TlsVersion::Tls11,
                TlsVersion::Tls10,
            ],
            cipher_suites: None,
            is_tls: true,
        }
    }

    /// TLS 1.3 only.
    pub fn restricted_tls() -> ConnectionSpec {
        ConnectionSpec {
            tls_versions: vec![TlsVersion::Tls13],
            cipher_suites: None,
            is_tls: true,
        }
    }

    /// Unencrypted, unauthenticated connections for `http:` URLs.
    pub fn cleartext() -> ConnectionSpec {
        ConnectionSpec {
            tls_versions: Vec::new(),
            cipher_suites: None,
            is_tls: false,
        }
    }

    pub fn with_cipher_suites(mut self, cipher_suites: Vec<String>) -> ConnectionSpec {
        self.cipher_suites = Some(cipher_suites);
        self
    }

    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    pub fn tls_versions(&self) -> &[TlsVersion] {
        &self.tls_versions
    }

    pub fn cipher_suites(&self) -> Option<&[String]> {
        self.cipher_suites.as_deref()
    }

    /// True when attempting `self` after `earlier` failed could change the
    /// outcome: it must enable a strictly different set of versions or
    /// suites.
    pub(crate) fn differs_from(&self, earlier: &ConnectionSpec) -> bool {
        self.is_tls && (self.tls_versions != earlier.tls_versions || self.cipher_suites != earlier.cipher_suites)
    }
}

/// Why a TLS connection attempt failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsFailureKind {
    /// The handshake itself failed; a different spec may succeed.
    Handshake,
    /// The peer's certificate was rejected. Never retried.
    Certificate,
    /// The socket failed beneath the handshake. Never retried as a TLS
    /// fallback (the route itself may be retried).
    Io,
}

/// A failed TLS connection attempt.
#[derive(Debug)]
pub struct TlsFailure {
    pub kind: TlsFailureKind,
    pub message: String,
}

impl TlsFailure {
    pub fn handshake(message: impl Into<String>) -> TlsFailure {
        TlsFailure {
            kind: TlsFailureKind::Handshake,
            message: message.into(),
        }
    }

    pub fn certificate(message: impl Into<String>) -> TlsFailure {
        TlsFailure {
            kind: TlsFailureKind::Certificate,
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> TlsFailure {
        TlsFailure {
            kind: TlsFailureKind::Io,
            message: message.into(),
        }
    }

    /// A handshake failure may be retried with the next spec; certificate
    /// problems and plain I/O errors may not.
    pub(crate) fn retryable(&self) -> bool {
        self.kind == TlsFailureKind::Handshake
    }

    pub(crate) fn into_error(self) -> Error {
        Error::handshake(self.message, self.kind == TlsFailureKind::Certificate)
    }
}

impl fmt::Display for TlsFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// A record of a completed TLS handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    tls_version: TlsVersion,
    cipher_suite: String,
    /// The peer's certificate chain in DER encoding, leaf first.
    peer_certificates: Vec<Vec<u8>>,
}

impl Handshake {
    pub fn new(
        tls_version: TlsVersion,
        cipher_suite: impl Into<String>,
        peer_certificates: Vec<Vec<u8>>,
    ) -> Handshake {
        Handshake {
            tls_version,
            cipher_suite: cipher_suite.into(),
            peer_certificates,
        }
    }

    pub fn tls_version(&self) -> TlsVersion {
        self.tls_version
    }

    pub fn cipher_suite(&self) -> &str {
        &self.cipher_suite
    }

    pub fn peer_certificates(&self) -> &[Vec<u8>] {
        &self.peer_certificates
    }
}

/// A TLS session layered over a socket.
pub trait TlsTransport: Transport {
    fn handshake(&self) -> &Handshake;

    /// The protocol negotiated via ALPN, if any.
    fn alpn_protocol(&self) -> Option<&str>;
}

impl fmt::Debug for dyn TlsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("TlsTransport")
    }
}

/// Performs TLS handshakes. Implemented outside this crate by a concrete
/// TLS library.
pub trait TlsConnector: Send + Sync {
    /// Wraps `tcp` in a TLS session for `host`, negotiating one of
    /// `alpn_protocols` and honoring the versions and suites of `spec`.
    fn connect(
        &self,
        tcp: TcpStream,
        host: &str,
        port: u16,
        spec: &ConnectionSpec,
        alpn_protocols: &[Protocol],
    ) -> Result<Box<dyn TlsTransport>, TlsFailure>;
}

impl fmt::Debug for dyn TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("TlsConnector")
    }
}

/// Confirms the peer's certificate matches the requested host.
pub trait HostnameVerifier: Send + Sync {
    fn verify(&self, host: &str, handshake: &Handshake) -> bool;
}

impl fmt::Debug for dyn HostnameVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("HostnameVerifier")
    }
}

/// Rejects connections whose certificate chain does not include a pinned
/// certificate.
pub trait CertificatePinner: Send + Sync {
    /// Returns an error description when `certificates` (DER, leaf first)
    /// do not satisfy the pins for `host`.
    fn check(&self, host: &str, certificates: &[Vec<u8>]) -> Result<(), String>;
}

impl fmt::Debug for dyn CertificatePinner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("CertificatePinner")
    }
}

/// Accepts whatever hostname the handshake presented. The default when no
/// verifier is configured; concrete TLS integrations should install a real
/// one.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct TrustingVerifier;

impl HostnameVerifier for TrustingVerifier {
    fn verify(&self, _host: &str, _handshake: &Handshake) -> bool {
        true
    }
}

/// Pins nothing.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct NoPins;

impl CertificatePinner for NoPins {
    fn check(&self, _host: &str, _certificates: &[Vec<u8>]) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_requires_a_different_spec() {
        let modern = ConnectionSpec::modern_tls();
        let compatible = ConnectionSpec::compatible_tls();
        assert!(compatible.differs_from(&modern));
        assert!(!modern.clone().differs_from(&modern));
        assert!(!ConnectionSpec::cleartext().differs_from(&modern));
    }

    #[test]
    fn only_handshake_failures_retry() {
        assert!(TlsFailure::handshake("x").retryable());
        assert!(!TlsFailure::certificate("x").retryable());
        assert!(!TlsFailure::io("x").retryable());
    }

    #[test]
    fn certificate_failures_are_marked() {
        assert!(TlsFailure::certificate("x").into_error().is_certificate());
        assert!(!TlsFailure::handshake("x").into_error().is_certificate());
    }
}
