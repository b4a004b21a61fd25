//! HTTP-shaped data: URLs, headers, media types, dates, cache directives,
//! cookies, and the request/response values built from them.

pub(crate) mod body;
pub(crate) mod cache_control;
pub(crate) mod challenge;
pub(crate) mod cookie;
pub(crate) mod date;
pub(crate) mod headers;
pub(crate) mod hostname;
pub(crate) mod media_type;
pub(crate) mod request;
pub(crate) mod response;
pub(crate) mod status_line;
pub(crate) mod url;

pub use self::body::{bytes_body, text_body, RequestBody, ResponseBody};
pub use self::cache_control::{CacheControl, CacheControlBuilder};
pub use self::cookie::{Cookie, CookieJar, InMemoryCookieJar, NoCookies, PublicSuffix};
pub use self::headers::{Headers, HeadersBuilder};
pub use self::media_type::MediaType;
pub use self::request::{IntoUrl, Request, RequestBuilder};
pub use self::response::{Response, ResponseBuilder};
pub use self::url::Url;

pub(crate) use self::challenge::Challenge;
pub(crate) use self::status_line::StatusLine;

/// Headers whose values must never appear in logs.
pub(crate) fn is_sensitive_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("authorization")
        || name.eq_ignore_ascii_case("cookie")
        || name.eq_ignore_ascii_case("set-cookie")
        || name.eq_ignore_ascii_case("proxy-authorization")
}

/// Renders a header value for logging, redacting sensitive headers.
pub(crate) fn value_for_log<'a>(name: &str, value: &'a str) -> &'a str {
    if is_sensitive_header(name) {
        "\u{2588}\u{2588}"
    } else {
        value
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}
