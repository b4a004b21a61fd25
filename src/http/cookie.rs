//! RFC 6265 cookies and the jar that stores them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::http::{date, now_millis, Headers, Url};

const MAX_DATE_MILLIS: i64 = 253_402_300_799_999; // 9999-12-31T23:59:59.999Z

/// An HTTP cookie.
#[derive(Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    expires_at: i64,
    domain: String,
    path: String,
    secure: bool,
    http_only: bool,
    persistent: bool,
    host_only: bool,
}

impl Cookie {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Epoch millis at which this cookie expires.
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn http_only(&self) -> bool {
        self.http_only
    }

    /// True when this cookie does not expire at the end of the session.
    pub fn persistent(&self) -> bool {
        self.persistent
    }

    /// True when this cookie matches only its exact domain, not subdomains.
    pub fn host_only(&self) -> bool {
        self.host_only
    }

    /// True when this cookie should be attached to a request for `url`.
    pub fn matches(&self, url: &Url) -> bool {
        let domain_match = if self.host_only {
            url.host() == self.domain
        } else {
            domain_match(url.host(), &self.domain)
        };
        domain_match && path_match(url, &self.path) && (!self.secure || url.is_https())
    }

    /// Parses one `Set-Cookie` value received from `url`; `None` when the
    /// cookie is malformed or may not be set by this origin.
    pub fn parse(url: &Url, set_cookie: &str) -> Option<Cookie> {
        Cookie::parse_at(now_millis(), url, set_cookie, &RejectNothing)
    }

    pub(crate) fn parse_at(
        now: i64,
        url: &Url,
        set_cookie: &str,
        public_suffix: &dyn PublicSuffix,
    ) -> Option<Cookie> {
        let mut parts = set_cookie.split(';');

        let name_value = parts.next()?;
        let eq = name_value.find('=')?;
        let name = name_value[..eq].trim();
        let value = name_value[eq + 1..].trim();
        if name.is_empty() || name.contains(|c: char| c.is_ascii_whitespace()) {
            return None;
        }

        let mut expires_at: Option<i64> = None;
        let mut max_age: Option<i64> = None;
        let mut domain: Option<String> = None;
        let mut path: Option<String> = None;
        let mut secure = false;
        let mut http_only = false;

        for attribute in parts {
            let attribute = attribute.trim();
            let (attr_name, attr_value) = match attribute.find('=') {
                Some(i) => (&attribute[..i], attribute[i + 1..].trim()),
                None => (attribute, ""),
            };
            match attr_name.trim().to_ascii_lowercase().as_str() {
                "expires" => {
                    expires_at = expires_at.or_else(|| date::parse_millis(attr_value));
                }
                "max-age" => {
                    max_age = max_age.or_else(|| parse_max_age(attr_value));
                }
                "domain" => {
                    let trimmed = attr_value.trim_start_matches('.');
                    let canonical = crate::http::hostname::canonicalize(trimmed)?;
                    domain = Some(canonical);
                }
                "path" => {
                    if attr_value.starts_with('/') {
                        path = Some(attr_value.to_string());
                    }
                }
                "secure" => secure = true,
                "httponly" => http_only = true,
                _ => {}
            }
        }

        // Max-Age wins over Expires.
        let persistent = max_age.is_some() || expires_at.is_some();
        let expires_at = match max_age {
            Some(seconds) => now.saturating_add(seconds.saturating_mul(1000)),
            None => expires_at.unwrap_or(MAX_DATE_MILLIS),
        }
        .min(MAX_DATE_MILLIS);

        let host_only;
        let domain = match domain {
            Some(domain) => {
                if !domain_match(url.host(), &domain) {
                    return None;
                }
                if public_suffix.is_public_suffix(&domain) && url.host() != domain {
                    return None;
                }
                host_only = false;
                domain
            }
            None => {
                host_only = true;
                url.host().to_string()
            }
        };

        let path = path.unwrap_or_else(|| default_path(url));

        Some(Cookie {
            name: name.to_string(),
            value: value.to_string(),
            expires_at,
            domain,
            path,
            secure,
            http_only,
            persistent,
            host_only,
        })
    }

    /// Parses all cookies in the `Set-Cookie` headers of a response from
    /// `url`.
    pub fn parse_all(url: &Url, headers: &Headers) -> Vec<Cookie> {
        Cookie::parse_all_with(url, headers, &RejectNothing)
    }

    pub(crate) fn parse_all_with(
        url: &Url,
        headers: &Headers,
        public_suffix: &dyn PublicSuffix,
    ) -> Vec<Cookie> {
        let now = now_millis();
        headers
            .values("Set-Cookie")
            .iter()
            .filter_map(|v| Cookie::parse_at(now, url, v, public_suffix))
            .collect()
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The value is omitted: cookies are sensitive.
        f.debug_struct("Cookie")
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("path", &self.path)
            .finish()
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

fn parse_max_age(value: &str) -> Option<i64> {
    match value.parse::<i64>() {
        Ok(n) if n <= 0 => Some(i64::MIN / 1000),
        Ok(n) => Some(n),
        Err(_) => None,
    }
}

fn default_path(url: &Url) -> String {
    let path = url.encoded_path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

/// RFC 6265 §5.1.3 domain matching.
fn domain_match(url_host: &str, domain: &str) -> bool {
    if url_host == domain {
        return true;
    }
    url_host.ends_with(domain)
        && url_host.as_bytes()[url_host.len() - domain.len() - 1] == b'.'
        && url_host.parse::<std::net::IpAddr>().is_err()
}

/// RFC 6265 §5.1.4 path matching.
fn path_match(url: &Url, cookie_path: &str) -> bool {
    let url_path = url.encoded_path();
    if url_path == cookie_path {
        return true;
    }
    url_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || url_path.as_bytes()[cookie_path.len()] == b'/')
}

/// Answers whether a domain is a registrable suffix on which domain cookies
/// must not be set. The engine only queries this interface; the database
/// contents are supplied by the caller.
pub trait PublicSuffix: Send + Sync {
    fn is_public_suffix(&self, domain: &str) -> bool;
}

/// A permissive default that knows only the single-label rule.
#[derive(Debug, Default)]
pub(crate) struct RejectNothing;

impl PublicSuffix for RejectNothing {
    fn is_public_suffix(&self, domain: &str) -> bool {
        !domain.contains('.')
    }
}

/// Reads cookies for outbound requests and stores cookies from responses.
pub trait CookieJar: Send + Sync {
    /// Cookies to attach to a request for `url`.
    fn load_for(&self, url: &Url) -> Vec<Cookie>;

    /// Saves cookies received in a response from `url`.
    fn save_from(&self, url: &Url, cookies: Vec<Cookie>);
}

/// A jar that never stores or returns cookies.
#[derive(Debug, Default)]
pub struct NoCookies;

impl CookieJar for NoCookies {
    fn load_for(&self, _url: &Url) -> Vec<Cookie> {
        Vec::new()
    }

    fn save_from(&self, _url: &Url, _cookies: Vec<Cookie>) {}
}

/// An in-memory jar keyed by `(domain, path, name)`. Expired cookies are
/// evicted lazily on read.
#[derive(Debug, Default)]
pub struct InMemoryCookieJar {
    store: Mutex<HashMap<(String, String, String), Cookie>>,
}

impl InMemoryCookieJar {
    pub fn new() -> InMemoryCookieJar {
        InMemoryCookieJar::default()
    }
}

impl CookieJar for InMemoryCookieJar {
    fn load_for(&self, url: &Url) -> Vec<Cookie> {
        let now = now_millis();
        let mut store = self.store.lock().expect("cookie jar poisoned");
        store.retain(|_, cookie| cookie.expires_at() > now);
        store
            .values()
            .filter(|cookie| cookie.matches(url))
            .cloned()
            .collect()
    }

    fn save_from(&self, _url: &Url, cookies: Vec<Cookie>) {
        let mut store = self.store.lock().expect("cookie jar poisoned");
        for cookie in cookies {
            let key = (
                cookie.domain.clone(),
                cookie.path.clone(),
                cookie.name.clone(),
            );
            store.insert(key, cookie);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn simple_cookie() {
        let cookie = Cookie::parse(&url("http://example.com/"), "SID=31d4d96e407aad42").unwrap();
        assert_eq!(cookie.name(), "SID");
        assert_eq!(cookie.value(), "31d4d96e407aad42");
        assert!(cookie.host_only());
        assert!(!cookie.persistent());
        assert_eq!(cookie.path(), "/");
    }

    #[test]
    fn attributes() {
        let cookie = Cookie::parse(
            &url("https://example.com/a/b"),
            "SID=1; Path=/a; Domain=example.com; Secure; HttpOnly",
        )
        .unwrap();
        assert!(!cookie.host_only());
        assert_eq!(cookie.domain(), "example.com");
        assert_eq!(cookie.path(), "/a");
        assert!(cookie.secure());
        assert!(cookie.http_only());
    }

    #[test]
    fn max_age_beats_expires() {
        let u = url("http://example.com/");
        let cookie = Cookie::parse_at(
            1_000_000,
            &u,
            "a=b; Expires=Sun, 06 Nov 1994 08:49:37 GMT; Max-Age=60",
            &RejectNothing,
        )
        .unwrap();
        assert_eq!(cookie.expires_at(), 1_000_000 + 60_000);
        assert!(cookie.persistent());
    }

    #[test]
    fn domain_mismatch_rejected() {
        assert!(Cookie::parse(&url("http://example.com/"), "a=b; Domain=other.com").is_none());
        // A subdomain may not set a cookie for a sibling.
        assert!(Cookie::parse(&url("http://a.example.com/"), "a=b; Domain=b.example.com").is_none());
    }

    #[test]
    fn parent_domain_allowed() {
        let cookie =
            Cookie::parse(&url("http://sub.example.com/"), "a=b; Domain=example.com").unwrap();
        assert!(cookie.matches(&url("http://sub.example.com/")));
        assert!(cookie.matches(&url("http://example.com/")));
        assert!(!cookie.matches(&url("http://example.org/")));
    }

    #[test]
    fn public_suffix_rejected() {
        struct Psl;
        impl PublicSuffix for Psl {
            fn is_public_suffix(&self, domain: &str) -> bool {
                domain == "co.uk"
            }
        }
        assert!(Cookie::parse_at(0, &url("http://foo.co.uk/"), "a=b; Domain=co.uk", &Psl).is_none());
    }

    #[test]
    fn secure_requires_https() {
        let cookie = Cookie::parse(&url("https://example.com/"), "a=b; Secure").unwrap();
        assert!(cookie.matches(&url("https://example.com/")));
        assert!(!cookie.matches(&url("http://example.com/")));
    }

    #[test]
    fn path_matching() {
        let cookie = Cookie::parse(&url("http://example.com/a/b/c"), "a=b").unwrap();
        assert_eq!(cookie.path(), "/a/b");
        assert!(cookie.matches(&url("http://example.com/a/b")));
        assert!(cookie.matches(&url("http://example.com/a/b/x")));
        assert!(!cookie.matches(&url("http://example.com/a")));
    }

    #[test]
    fn jar_round_trip_and_expiry() {
        let jar = InMemoryCookieJar::new();
        let u = url("http://example.com/");
        let live = Cookie::parse(&u, "live=1; Max-Age=9999").unwrap();
        let dead = Cookie::parse_at(0, &u, "dead=1; Max-Age=1", &RejectNothing).unwrap();
        jar.save_from(&u, vec![live, dead]);
        let loaded = jar.load_for(&u);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name(), "live");
    }
}
