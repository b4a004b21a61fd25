//! Host canonicalization: IP literals, IDN mapping, punycode.

use std::net::{Ipv4Addr, Ipv6Addr};

/// ASCII codes that may never appear in a hostname.
fn has_invalid_ascii(host: &str) -> bool {
    host.bytes().any(|b| {
        b <= 0x20
            || b == 0x7f
            || matches!(
                b,
                b'#' | b'%' | b'/' | b':' | b'?' | b'@' | b'[' | b'\\' | b']'
            )
    })
}

/// Canonicalizes a percent-decoded host: IPv6 literals to their canonical
/// textual form, IPv4 literals verbatim, and domains through IDNA mapping and
/// punycode. Returns `None` when the host is not valid.
pub(crate) fn canonicalize(host: &str) -> Option<String> {
    if host.is_empty() {
        return None;
    }

    if host.starts_with('[') {
        if !host.ends_with(']') {
            return None;
        }
        let inner = &host[1..host.len() - 1];
        let address: Ipv6Addr = inner.parse().ok()?;
        return Some(address.to_string());
    }

    // A bare colon means an unbracketed IPv6 literal.
    if host.contains(':') {
        let address: Ipv6Addr = host.parse().ok()?;
        return Some(address.to_string());
    }

    if let Ok(v4) = host.parse::<Ipv4Addr>() {
        return Some(v4.to_string());
    }

    let ascii = idna::domain_to_ascii(host).ok()?;
    if ascii.is_empty() || has_invalid_ascii(&ascii) {
        return None;
    }
    let trimmed = ascii.strip_suffix('.').unwrap_or(&ascii);
    if trimmed.len() > 253 {
        return None;
    }
    for label in trimmed.split('.') {
        if label.is_empty() || label.len() > 63 {
            return None;
        }
    }
    Some(trimmed.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_domains_lowercase() {
        assert_eq!(canonicalize("Example.Com"), Some("example.com".to_string()));
    }

    #[test]
    fn idn_to_punycode() {
        assert_eq!(canonicalize("bücher.de"), Some("xn--bcher-kva.de".to_string()));
    }

    #[test]
    fn ipv6_canonical_form() {
        assert_eq!(
            canonicalize("[2001:db8:0:0:0:0:0:1]"),
            Some("2001:db8::1".to_string())
        );
        assert_eq!(canonicalize("[::1]"), Some("::1".to_string()));
    }

    #[test]
    fn rejects_bad_hosts() {
        assert_eq!(canonicalize(""), None);
        assert_eq!(canonicalize("host name"), None);
        assert_eq!(canonicalize("[::1"), None);
        let long_label = "a".repeat(64);
        assert_eq!(canonicalize(&long_label), None);
        let long_host = format!("{}.{}.{}.{}.com", "a".repeat(63), "b".repeat(63), "c".repeat(63), "d".repeat(63));
        assert_eq!(canonicalize(&long_host), None);
    }
}
