//! An HTTP response value and its builder.

use std::fmt;

use crate::connect::{Handshake, Protocol};
use crate::error::{Error, Result};
use crate::http::challenge::{parse_challenges, Challenge};
use crate::http::{CacheControl, Headers, HeadersBuilder, Request, ResponseBody};

/// An HTTP response.
///
/// The body is a single-consumption stream; dropping the response (or
/// closing the body) releases the connection slot it holds.
pub struct Response {
    request: Request,
    protocol: Protocol,
    code: u16,
    message: String,
    handshake: Option<Handshake>,
    headers: Headers,
    body: ResponseBody,
    network_response: Option<Box<Response>>,
    cache_response: Option<Box<Response>>,
    prior_response: Option<Box<Response>>,
    sent_request_at_millis: i64,
    received_response_at_millis: i64,
}

impl Response {
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder::default()
    }

    /// The request that initiated this response. This may differ from the
    /// caller's original request when redirects or rewrites applied.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// The HTTP reason phrase, possibly empty.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// True for codes in `200..300`.
    pub fn is_successful(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.code, 300 | 301 | 302 | 303 | 307 | 308)
    }

    /// The TLS handshake of the connection that carried this response.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(&self.headers)
    }

    /// The raw network response, when this response came via the cache
    /// interceptor.
    pub fn network_response(&self) -> Option<&Response> {
        self.network_response.as_deref()
    }

    /// The cached response this response was validated against, if any.
    pub fn cache_response(&self) -> Option<&Response> {
        self.cache_response.as_deref()
    }

    /// The response that triggered the redirect or auth retry producing this
    /// response.
    pub fn prior_response(&self) -> Option<&Response> {
        self.prior_response.as_deref()
    }

    /// Authentication challenges appropriate for this response's code.
    pub fn challenges(&self) -> Vec<Challenge> {
        let header_name = match self.code {
            401 => "WWW-Authenticate",
            407 => "Proxy-Authenticate",
            _ => return Vec::new(),
        };
        parse_challenges(&self.headers, header_name)
    }

    /// Wall time just before the request headers were sent.
    pub fn sent_request_at_millis(&self) -> i64 {
        self.sent_request_at_millis
    }

    /// Wall time just after the response headers were received.
    pub fn received_response_at_millis(&self) -> i64 {
        self.received_response_at_millis
    }

    pub fn new_builder(&self) -> ResponseBuilder {
        ResponseBuilder {
            request: Some(self.request.clone()),
            protocol: Some(self.protocol),
            code: Some(self.code),
            message: self.message.clone(),
            handshake: self.handshake.clone(),
            headers: self.headers.to_builder(),
            body: None,
            network_response: None,
            cache_response: None,
            prior_response: None,
            sent_request_at_millis: self.sent_request_at_millis,
            received_response_at_millis: self.received_response_at_millis,
        }
    }

    /// Swaps this response's headers in place, leaving the body and nested
    /// responses untouched.
    pub(crate) fn replace_headers(&mut self, headers: Headers) {
        self.headers = headers;
    }

    pub(crate) fn set_network_response(&mut self, response: Option<Response>) {
        self.network_response = response.map(Box::new);
    }

    pub(crate) fn set_cache_response(&mut self, response: Option<Response>) {
        self.cache_response = response.map(Box::new);
    }

    pub(crate) fn set_prior_response(&mut self, response: Option<Response>) {
        self.prior_response = response.map(Box::new);
    }

    /// This response with only its body emptied; nested responses survive,
    /// so a redirect chain keeps its full history.
    pub(crate) fn strip_body_only(mut self) -> Response {
        self.body = ResponseBody::empty();
        self
    }

    /// This response with its body emptied and nested responses dropped,
    /// suitable for attaching as a prior or cache response.
    pub(crate) fn strip_body(mut self) -> Response {
        self.body = ResponseBody::empty();
        self.network_response = None;
        self.cache_response = None;
        self.prior_response = None;
        self
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("protocol", &self.protocol)
            .field("code", &self.code)
            .field("message", &self.message)
            .field("url", &self.request.url())
            .finish()
    }
}

/// Builds a [`Response`].
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    request: Option<Request>,
    protocol: Option<Protocol>,
    code: Option<u16>,
    message: String,
    handshake: Option<Handshake>,
    headers: HeadersBuilder,
    body: Option<ResponseBody>,
    network_response: Option<Box<Response>>,
    cache_response: Option<Box<Response>>,
    prior_response: Option<Box<Response>>,
    sent_request_at_millis: i64,
    received_response_at_millis: i64,
}

impl ResponseBuilder {
    pub fn request(mut self, request: Request) -> Self {
        self.request = Some(request);
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn handshake(mut self, handshake: Option<Handshake>) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn remove_header(mut self, name: &str) -> Self {
        self.headers.remove_all(name);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers.to_builder();
        self
    }

    pub(crate) fn headers_builder(&mut self) -> &mut HeadersBuilder {
        &mut self.headers
    }

    pub fn body(mut self, body: ResponseBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn network_response(mut self, response: Option<Response>) -> Self {
        self.network_response = response.map(Box::new);
        self
    }

    pub fn cache_response(mut self, response: Option<Response>) -> Self {
        self.cache_response = response.map(Box::new);
        self
    }

    pub fn prior_response(mut self, response: Option<Response>) -> Self {
        self.prior_response = response.map(Box::new);
        self
    }

    pub fn sent_request_at_millis(mut self, millis: i64) -> Self {
        self.sent_request_at_millis = millis;
        self
    }

    pub fn received_response_at_millis(mut self, millis: i64) -> Self {
        self.received_response_at_millis = millis;
        self
    }

    pub(crate) fn peek_code(&self) -> Option<u16> {
        self.code
    }

    pub fn build(self) -> Result<Response> {
        let request = self
            .request
            .ok_or_else(|| Error::bad_config("response has no request"))?;
        let protocol = self
            .protocol
            .ok_or_else(|| Error::bad_config("response has no protocol"))?;
        let code = self
            .code
            .ok_or_else(|| Error::bad_config("response has no code"))?;
        if !(100..600).contains(&code) {
            return Err(Error::bad_config(format!("code < 100 or >= 600: {}", code)));
        }
        Ok(Response {
            request,
            protocol,
            code,
            message: self.message,
            handshake: self.handshake,
            headers: self.headers.build(),
            body: self.body.unwrap_or_else(ResponseBody::empty),
            network_response: self.network_response,
            cache_response: self.cache_response,
            prior_response: self.prior_response,
            sent_request_at_millis: self.sent_request_at_millis,
            received_response_at_millis: self.received_response_at_millis,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple(code: u16) -> Response {
        Response::builder()
            .request(Request::get("http://example.com/").unwrap())
            .protocol(Protocol::Http11)
            .code(code)
            .message("OK")
            .build()
            .unwrap()
    }

    #[test]
    fn success_and_redirect_predicates() {
        assert!(simple(200).is_successful());
        assert!(!simple(404).is_successful());
        assert!(simple(302).is_redirect());
        assert!(!simple(304).is_redirect());
    }

    #[test]
    fn code_range_enforced() {
        let result = Response::builder()
            .request(Request::get("http://example.com/").unwrap())
            .protocol(Protocol::Http11)
            .code(99)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn challenges_only_for_auth_codes() {
        let response = Response::builder()
            .request(Request::get("http://example.com/").unwrap())
            .protocol(Protocol::Http11)
            .code(401)
            .header("WWW-Authenticate", "Basic realm=\"x\"")
            .build()
            .unwrap();
        assert_eq!(response.challenges().len(), 1);
        assert!(simple(200).challenges().is_empty());
    }

    #[test]
    fn strip_body_empties() {
        let response = Response::builder()
            .request(Request::get("http://example.com/").unwrap())
            .protocol(Protocol::Http11)
            .code(200)
            .body(ResponseBody::from_bytes(None, &b"data"[..]))
            .build()
            .unwrap()
            .strip_body();
        assert_eq!(response.body().content_length(), 0);
    }
}
