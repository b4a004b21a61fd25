//! A uniform resource locator with a scheme of either `http` or `https`.

use std::fmt;

use percent_encoding::percent_decode_str;

use crate::error::{Error, Result};
use crate::http::hostname;

const USERNAME_ENCODE_SET: &str = " \"':;<>@[]^`{}|/\\?#";
const PASSWORD_ENCODE_SET: &str = " \"':;<>@[]^`{}|/\\?#";
const PATH_SEGMENT_ENCODE_SET: &str = " \"<>^`{}|/\\?#";
const QUERY_ENCODE_SET: &str = " \"'<>#";
const FRAGMENT_ENCODE_SET: &str = " \"<>`";

/// A parsed, canonical HTTP URL.
///
/// Parsing is permissive in the WHATWG style: whitespace is trimmed, `\` is
/// treated as `/`, characters that must be encoded are percent-encoded, and
/// `ws`/`wss` schemes are rewritten to `http`/`https`. Canonicalization is
/// idempotent: serializing and re-parsing yields an equal value.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Url {
    scheme: String,
    username: String,
    password: String,
    host: String,
    port: u16,
    path_segments: Vec<String>,
    query_pairs: Option<Vec<(String, Option<String>)>>,
    fragment: Option<String>,
}

impl Url {
    /// Parses an absolute URL.
    pub fn parse(input: &str) -> Result<Url> {
        parse_with_base(None, input)
    }

    /// Resolves a possibly relative link against this URL, returning `None`
    /// when the link is not a well-formed HTTP URL reference.
    pub fn resolve(&self, link: &str) -> Option<Url> {
        parse_with_base(Some(self), link).ok()
    }

    /// `"http"` or `"https"`.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn is_https(&self) -> bool {
        self.scheme == "https"
    }

    /// The canonical host: lowercase ASCII, punycode, or a canonical IP
    /// literal (IPv6 without brackets).
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 80 for `http`, 443 for `https`.
    pub fn default_port(scheme: &str) -> u16 {
        if scheme == "https" {
            443
        } else {
            80
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// The encoded path segments; `[""]` denotes the root path.
    pub fn path_segments(&self) -> &[String] {
        &self.path_segments
    }

    /// The encoded path, always beginning with `/`.
    pub fn encoded_path(&self) -> String {
        let mut out = String::new();
        for segment in &self.path_segments {
            out.push('/');
            out.push_str(segment);
        }
        out
    }

    /// The encoded query, or `None` if this URL has none.
    pub fn encoded_query(&self) -> Option<String> {
        let pairs = self.query_pairs.as_ref()?;
        let mut out = String::new();
        for (i, (name, value)) in pairs.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            out.push_str(name);
            if let Some(value) = value {
                out.push('=');
                out.push_str(value);
            }
        }
        Some(out)
    }

    /// The decoded value of the first query parameter named `name`.
    pub fn query_parameter(&self, name: &str) -> Option<String> {
        let pairs = self.query_pairs.as_ref()?;
        for (n, v) in pairs {
            if percent_decode_str(n).decode_utf8_lossy() == name {
                return Some(match v {
                    Some(v) => percent_decode_str(v).decode_utf8_lossy().into_owned(),
                    None => String::new(),
                });
            }
        }
        None
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// The path and query as sent in an origin-form request line.
    pub(crate) fn encoded_path_and_query(&self) -> String {
        let mut out = self.encoded_path();
        if let Some(query) = self.encoded_query() {
            out.push('?');
            out.push_str(&query);
        }
        out
    }

    /// The value for a `Host` header: the host, plus the port when it is not
    /// the scheme default.
    pub(crate) fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == Url::default_port(&self.scheme) {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// This URL without username, password, query, or fragment; used in logs.
    pub fn redact(&self) -> String {
        let mut out = format!("{}://{}", self.scheme, self.host_header());
        out.push_str(&self.encoded_path());
        out
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if !self.username.is_empty() || !self.password.is_empty() {
            f.write_str(&self.username)?;
            if !self.password.is_empty() {
                write!(f, ":{}", self.password)?;
            }
            f.write_str("@")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if self.port != Url::default_port(&self.scheme) {
            write!(f, ":{}", self.port)?;
        }
        f.write_str(&self.encoded_path())?;
        if let Some(query) = self.encoded_query() {
            write!(f, "?{}", query)?;
        }
        if let Some(ref fragment) = self.fragment {
            write!(f, "#{}", fragment)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl std::str::FromStr for Url {
    type Err = Error;

    fn from_str(s: &str) -> Result<Url> {
        Url::parse(s)
    }
}

// ===== parsing =====

fn parse_with_base(base: Option<&Url>, input: &str) -> Result<Url> {
    let input = trim(input);
    let bytes = input.as_bytes();
    let mut pos = 0;

    // Scheme.
    let scheme;
    match scheme_delimiter(input) {
        Some(colon) => {
            let raw = &input[..colon];
            if raw.eq_ignore_ascii_case("http") || raw.eq_ignore_ascii_case("ws") {
                scheme = "http".to_string();
            } else if raw.eq_ignore_ascii_case("https") || raw.eq_ignore_ascii_case("wss") {
                scheme = "https".to_string();
            } else {
                return Err(Error::url(format!(
                    "expected URL scheme 'http' or 'https' but was '{}'",
                    raw
                )));
            }
            pos = colon + 1;
        }
        None => match base {
            Some(base) => scheme = base.scheme.clone(),
            None => {
                return Err(Error::url(format!(
                    "expected URL scheme 'http' or 'https' but no scheme was found for {}",
                    input
                )))
            }
        },
    }

    // Authority, or inherit from the base.
    let mut slashes = 0;
    while pos + slashes < bytes.len() && matches!(bytes[pos + slashes], b'/' | b'\\') {
        slashes += 1;
    }

    let username;
    let password;
    let host;
    let port;
    let mut path_segments: Vec<String>;

    let has_authority =
        slashes >= 2 || base.is_none() || base.map(|b| b.scheme != scheme).unwrap_or(false);
    if has_authority {
        // Permissive like browsers: "http:host/path" and "http:///host"
        // both treat whatever follows the slashes as the authority.
        pos += slashes;
        let authority_end = input[pos..]
            .find(|c| matches!(c, '/' | '\\' | '?' | '#'))
            .map(|i| pos + i)
            .unwrap_or(bytes.len());
        let authority = &input[pos..authority_end];

        let (userinfo, hostport) = match authority.rfind('@') {
            Some(at) => (Some(&authority[..at]), &authority[at + 1..]),
            None => (None, authority),
        };
        match userinfo {
            Some(userinfo) => match userinfo.find(':') {
                Some(colon) => {
                    username = canonicalize(&userinfo[..colon], USERNAME_ENCODE_SET);
                    password = canonicalize(&userinfo[colon + 1..], PASSWORD_ENCODE_SET);
                }
                None => {
                    username = canonicalize(userinfo, USERNAME_ENCODE_SET);
                    password = String::new();
                }
            },
            None => {
                username = String::new();
                password = String::new();
            }
        }

        let (raw_host, raw_port) = split_host_port(hostport)?;
        let decoded_host = percent_decode_str(raw_host).decode_utf8_lossy();
        host = hostname::canonicalize(&decoded_host)
            .ok_or_else(|| Error::url(format!("invalid URL host: \"{}\"", raw_host)))?;
        port = match raw_port {
            Some(raw) => raw
                .parse::<u16>()
                .ok()
                .filter(|p| *p >= 1)
                .ok_or_else(|| Error::url(format!("invalid URL port: \"{}\"", raw)))?,
            None => Url::default_port(&scheme),
        };

        path_segments = vec![String::new()];
        pos = authority_end;
    } else {
        let base = base.expect("relative URL without base");
        username = base.username.clone();
        password = base.password.clone();
        host = base.host.clone();
        port = base.port;
        path_segments = base.path_segments.clone();
    }

    // Path.
    let path_end = input[pos..]
        .find(|c| matches!(c, '?' | '#'))
        .map(|i| pos + i)
        .unwrap_or(bytes.len());
    resolve_path(&mut path_segments, &input[pos..path_end], has_authority);
    pos = path_end;

    // Query.
    let mut query_pairs = None;
    if pos < bytes.len() && bytes[pos] == b'?' {
        let query_end = input[pos..]
            .find('#')
            .map(|i| pos + i)
            .unwrap_or(bytes.len());
        query_pairs = Some(parse_query(&input[pos + 1..query_end]));
        pos = query_end;
    } else if !has_authority && pos >= bytes.len() {
        // A bare fragment or empty link keeps the base query.
        query_pairs = base.and_then(|b| b.query_pairs.clone());
    } else if !has_authority && pos < bytes.len() && bytes[pos] == b'#' {
        query_pairs = base.and_then(|b| b.query_pairs.clone());
    }

    // Fragment.
    let mut fragment = None;
    if pos < bytes.len() && bytes[pos] == b'#' {
        fragment = Some(canonicalize(&input[pos + 1..], FRAGMENT_ENCODE_SET));
    }

    Ok(Url {
        scheme,
        username,
        password,
        host,
        port,
        path_segments,
        query_pairs,
        fragment,
    })
}

fn trim(input: &str) -> &str {
    input.trim_matches(|c: char| c <= ' ' || c == '\u{7f}')
}

/// Finds the scheme-terminating colon, if the input begins with a scheme.
fn scheme_delimiter(input: &str) -> Option<usize> {
    let bytes = input.as_bytes();
    if bytes.is_empty() || !bytes[0].is_ascii_alphabetic() {
        return None;
    }
    for (i, b) in bytes.iter().enumerate().skip(1) {
        match b {
            b':' => return Some(i),
            b if b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.') => continue,
            _ => return None,
        }
    }
    None
}

fn split_host_port(hostport: &str) -> Result<(&str, Option<&str>)> {
    if hostport.starts_with('[') {
        match hostport.find(']') {
            Some(close) => {
                let rest = &hostport[close + 1..];
                if rest.is_empty() {
                    Ok((&hostport[..close + 1], None))
                } else if let Some(stripped) = rest.strip_prefix(':') {
                    Ok((&hostport[..close + 1], Some(stripped)))
                } else {
                    Err(Error::url(format!("invalid URL host: \"{}\"", hostport)))
                }
            }
            None => Err(Error::url(format!("invalid URL host: \"{}\"", hostport))),
        }
    } else {
        match hostport.find(':') {
            Some(colon) => Ok((&hostport[..colon], Some(&hostport[colon + 1..]))),
            None => Ok((hostport, None)),
        }
    }
}

fn parse_query(raw: &str) -> Vec<(String, Option<String>)> {
    let canonical = canonicalize(raw, QUERY_ENCODE_SET);
    if canonical.is_empty() {
        return Vec::new();
    }
    canonical
        .split('&')
        .map(|pair| match pair.find('=') {
            Some(i) => (pair[..i].to_string(), Some(pair[i + 1..].to_string())),
            None => (pair.to_string(), None),
        })
        .collect()
}

fn is_dot(segment: &str) -> bool {
    segment == "." || segment.eq_ignore_ascii_case("%2e")
}

fn is_dot_dot(segment: &str) -> bool {
    segment == ".."
        || segment.eq_ignore_ascii_case("%2e.")
        || segment.eq_ignore_ascii_case(".%2e")
        || segment.eq_ignore_ascii_case("%2e%2e")
}

/// Applies `path` on top of `segments`, WHATWG style: `\` behaves as `/`,
/// `.` segments are skipped, and `..` pops.
fn resolve_path(segments: &mut Vec<String>, path: &str, after_authority: bool) {
    if path.is_empty() {
        if after_authority && segments.is_empty() {
            segments.push(String::new());
        }
        return;
    }

    let bytes = path.as_bytes();
    let mut pos = 0;
    if matches!(bytes[0], b'/' | b'\\') {
        segments.clear();
        segments.push(String::new());
        pos = 1;
    } else if !after_authority {
        // Relative path: discard everything after the base's last '/'.
        let last = segments.len() - 1;
        segments[last] = String::new();
    }

    while pos <= bytes.len() {
        let end = path[pos..]
            .find(|c| matches!(c, '/' | '\\'))
            .map(|i| pos + i)
            .unwrap_or(bytes.len());
        let segment = canonicalize(&path[pos..end], PATH_SEGMENT_ENCODE_SET);
        let has_trailing_delimiter = end < bytes.len();
        push_segment(segments, segment, has_trailing_delimiter);
        if !has_trailing_delimiter {
            break;
        }
        pos = end + 1;
    }
}

fn push_segment(segments: &mut Vec<String>, segment: String, add_trailing_slash: bool) {
    if is_dot(&segment) {
        return;
    }
    if is_dot_dot(&segment) {
        pop_segment(segments);
        return;
    }
    let last = segments.len() - 1;
    if segments[last].is_empty() {
        segments[last] = segment;
    } else {
        segments.push(segment);
    }
    if add_trailing_slash {
        segments.push(String::new());
    }
}

fn pop_segment(segments: &mut Vec<String>) {
    let removed = segments.pop().unwrap_or_default();
    if removed.is_empty() && !segments.is_empty() {
        let last = segments.len() - 1;
        segments[last] = String::new();
    } else {
        segments.push(String::new());
    }
}

/// Percent-encodes characters of `input` that are in `encode_set`, are
/// controls, or are non-ASCII. Existing valid `%XX` escapes pass unchanged,
/// keeping canonicalization idempotent.
fn canonicalize(input: &str, encode_set: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < input.len() {
        let c = input[i..].chars().next().expect("char boundary");
        if c == '%'
            && i + 2 < input.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            out.push_str(&input[i..i + 3]);
            i += 3;
            continue;
        }
        if c < ' ' || c == '\u{7f}' || !c.is_ascii() || encode_set.contains(c) || c == '%' {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                out.push('%');
                out.push(hex_digit(b >> 4));
                out.push(hex_digit(b & 0xf));
            }
        } else {
            out.push(c);
        }
        i += c.len_utf8();
    }
    out
}

fn hex_digit(value: u8) -> char {
    char::from_digit(value as u32, 16)
        .expect("nibble")
        .to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple() {
        let url = Url::parse("http://example.com/a/b?q=1#frag").unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.host(), "example.com");
        assert_eq!(url.port(), 80);
        assert_eq!(url.encoded_path(), "/a/b");
        assert_eq!(url.encoded_query().as_deref(), Some("q=1"));
        assert_eq!(url.fragment(), Some("frag"));
        assert_eq!(url.to_string(), "http://example.com/a/b?q=1#frag");
    }

    #[test]
    fn root_path_is_single_empty_segment() {
        let url = Url::parse("http://example.com").unwrap();
        assert_eq!(url.path_segments(), &[String::new()]);
        assert_eq!(url.encoded_path(), "/");
        assert_eq!(url.to_string(), "http://example.com/");
    }

    #[test]
    fn reparse_is_identity() {
        for raw in [
            "http://example.com/",
            "https://u:p@example.com:8443/a%20b/c?d=e%26f&g#h",
            "http://example.com/a/b/",
            "http://example.com/?",
            "http://example.com/%2e%2e-literal",
            "http://xn--bcher-kva.de/",
        ] {
            let once = Url::parse(raw).unwrap();
            let twice = Url::parse(&once.to_string()).unwrap();
            assert_eq!(once, twice, "{}", raw);
            assert_eq!(once.to_string(), twice.to_string(), "{}", raw);
        }
    }

    #[test]
    fn websocket_schemes_rewrite() {
        assert_eq!(Url::parse("ws://example.com/chat").unwrap().scheme(), "http");
        assert_eq!(Url::parse("wss://example.com/chat").unwrap().scheme(), "https");
    }

    #[test]
    fn backslashes_and_dots() {
        let url = Url::parse("http://example.com/a\\b/../c/./d").unwrap();
        assert_eq!(url.encoded_path(), "/a/c/d");
    }

    #[test]
    fn dot_dot_does_not_escape_root() {
        let url = Url::parse("http://example.com/../../a").unwrap();
        assert_eq!(url.encoded_path(), "/a");
    }

    #[test]
    fn trailing_slash_preserved() {
        let url = Url::parse("http://example.com/a/b/").unwrap();
        assert_eq!(url.path_segments(), &["a".to_string(), "b".to_string(), String::new()]);
        assert_eq!(url.encoded_path(), "/a/b/");
    }

    #[test]
    fn spaces_encoded_existing_escapes_kept() {
        let url = Url::parse("http://example.com/a b?q=c d").unwrap();
        assert_eq!(url.encoded_path(), "/a%20b");
        assert_eq!(url.encoded_query().as_deref(), Some("q=c%20d"));
        let url2 = Url::parse("http://example.com/a%20b").unwrap();
        assert_eq!(url2.encoded_path(), "/a%20b");
    }

    #[test]
    fn idn_host() {
        let url = Url::parse("http://bücher.de/").unwrap();
        assert_eq!(url.host(), "xn--bcher-kva.de");
    }

    #[test]
    fn ipv6_host_round_trip() {
        let url = Url::parse("http://[2001:DB8:0:0:0:0:0:1]:8080/x").unwrap();
        assert_eq!(url.host(), "2001:db8::1");
        assert_eq!(url.port(), 8080);
        assert_eq!(url.to_string(), "http://[2001:db8::1]:8080/x");
        assert_eq!(Url::parse(&url.to_string()).unwrap(), url);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(Url::parse("ftp://example.com/").is_err());
        assert!(Url::parse("http://host name/").is_err());
        assert!(Url::parse("http://example.com:0/").is_err());
        assert!(Url::parse("http://example.com:65536/").is_err());
        assert!(Url::parse("relative/path").is_err());
    }

    #[test]
    fn resolve_relative() {
        let base = Url::parse("http://example.com/a/b/c?q=1").unwrap();
        assert_eq!(base.resolve("d").unwrap().encoded_path(), "/a/b/d");
        assert_eq!(base.resolve("../d").unwrap().encoded_path(), "/a/d");
        assert_eq!(base.resolve("/d").unwrap().encoded_path(), "/d");
        assert_eq!(
            base.resolve("//other.com/d").unwrap().to_string(),
            "http://other.com/d"
        );
        assert_eq!(
            base.resolve("https://secure.example.com/").unwrap().scheme(),
            "https"
        );
        assert_eq!(base.resolve("?x=2").unwrap().encoded_query().as_deref(), Some("x=2"));
        let frag = base.resolve("#top").unwrap();
        assert_eq!(frag.encoded_query().as_deref(), Some("q=1"));
        assert_eq!(frag.fragment(), Some("top"));
    }

    #[test]
    fn resolve_rejects_other_schemes() {
        let base = Url::parse("http://example.com/").unwrap();
        assert!(base.resolve("ftp://example.com/").is_none());
    }

    #[test]
    fn query_parameter_decoding() {
        let url = Url::parse("http://example.com/?a=b%20c&d&e=").unwrap();
        assert_eq!(url.query_parameter("a").as_deref(), Some("b c"));
        assert_eq!(url.query_parameter("d").as_deref(), Some(""));
        assert_eq!(url.query_parameter("e").as_deref(), Some(""));
        assert_eq!(url.query_parameter("missing"), None);
    }

    #[test]
    fn host_header_includes_non_default_port() {
        assert_eq!(
            Url::parse("http://example.com:8080/").unwrap().host_header(),
            "example.com:8080"
        );
        assert_eq!(
            Url::parse("https://example.com/").unwrap().host_header(),
            "example.com"
        );
    }

    #[test]
    fn userinfo_encoded() {
        let url = Url::parse("http://a b:c@example.com/").unwrap();
        assert_eq!(url.username(), "a%20b");
        assert_eq!(url.password(), "c");
    }
}
