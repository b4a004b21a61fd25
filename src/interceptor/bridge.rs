//! Bridges the application's request to the network's request: default
//! headers out, cookies in both directions, transparent gzip back.

use std::io::Read;
use std::sync::Arc;

use flate2::read::MultiGzDecoder;

use crate::error::Result;
use crate::http::{Cookie, CookieJar, MediaType, Request, Response, ResponseBody};
use crate::interceptor::{Chain, Interceptor};

pub(crate) struct BridgeInterceptor {
    pub(crate) cookie_jar: Arc<dyn CookieJar>,
    pub(crate) public_suffix: Arc<dyn crate::http::PublicSuffix>,
    pub(crate) user_agent: String,
}

impl Interceptor for BridgeInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let user_request = chain.request().clone();
        let mut builder = user_request.new_builder();

        if let Some(body) = user_request.body() {
            if let Some(media_type) = body.content_type() {
                if user_request.header("Content-Type").is_none() {
                    builder = builder.header("Content-Type", &media_type.to_string());
                }
            }
            let content_length = body.content_length();
            if content_length != -1 {
                let mut length = itoa::Buffer::new();
                builder = builder
                    .header("Content-Length", length.format(content_length))
                    .remove_header("Transfer-Encoding");
            } else {
                builder = builder
                    .header("Transfer-Encoding", "chunked")
                    .remove_header("Content-Length");
            }
        }

        if user_request.header("Host").is_none() {
            builder = builder.header("Host", &user_request.url().host_header());
        }
        if user_request.header("Connection").is_none() {
            builder = builder.header("Connection", "Keep-Alive");
        }

        // Adding gzip makes this engine responsible for decompressing.
        let transparent_gzip = user_request.header("Accept-Encoding").is_none()
            && user_request.header("Range").is_none();
        if transparent_gzip {
            builder = builder.header("Accept-Encoding", "gzip");
        }

        let cookies = self.cookie_jar.load_for(user_request.url());
        if !cookies.is_empty() {
            builder = builder.header("Cookie", &cookie_header(&cookies));
        }

        if user_request.header("User-Agent").is_none() {
            builder = builder.header("User-Agent", &self.user_agent);
        }

        let network_request = builder.build()?;
        let network_response = chain.proceed(network_request.clone())?;

        let received_cookies = Cookie::parse_all_with(
            network_request.url(),
            network_response.headers(),
            self.public_suffix.as_ref(),
        );
        if !received_cookies.is_empty() {
            self.cookie_jar
                .save_from(network_request.url(), received_cookies);
        }

        let mut response = network_response;
        if transparent_gzip
            && response
                .header("Content-Encoding")
                .map(|v| v.eq_ignore_ascii_case("gzip"))
                .unwrap_or(false)
            && response.body().content_length() != 0
        {
            response = gunzip(response);
        }

        Ok(response)
    }
}

fn cookie_header(cookies: &[Cookie]) -> String {
    let mut out = String::new();
    for (i, cookie) in cookies.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        out.push_str(&cookie.to_string());
    }
    out
}

/// Rewrites the response with an inflating body. The compression headers
/// come off: the body no longer matches them.
fn gunzip(mut response: Response) -> Response {
    let media_type = response.header("Content-Type").and_then(MediaType::parse);
    let body = std::mem::replace(response.body_mut(), ResponseBody::empty());
    let inflated: Box<dyn Read + Send> = Box::new(MultiGzDecoder::new(body));
    let headers = response
        .headers()
        .to_builder()
        .remove_all("Content-Encoding")
        .remove_all("Content-Length")
        .build();

    let mut response = response;
    *response.body_mut() = ResponseBody::new(media_type, -1, inflated);
    response.replace_headers(headers);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Url;

    #[test]
    fn cookie_header_joins() {
        let url = Url::parse("http://example.com/").unwrap();
        let cookies = vec![
            Cookie::parse(&url, "a=1").unwrap(),
            Cookie::parse(&url, "b=2").unwrap(),
        ];
        assert_eq!(cookie_header(&cookies), "a=1; b=2");
    }

    #[test]
    fn gunzip_strips_content_headers() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write as _;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"inflate me").unwrap();
        let compressed = encoder.finish().unwrap();
        let length = compressed.len();

        let response = Response::builder()
            .request(Request::get("http://example.com/").unwrap())
            .protocol(crate::connect::Protocol::Http11)
            .code(200)
            .header("Content-Encoding", "gzip")
            .header("Content-Length", &length.to_string())
            .body(ResponseBody::from_bytes(None, compressed))
            .build()
            .unwrap();

        let mut inflated = gunzip(response);
        assert!(inflated.header("Content-Encoding").is_none());
        assert!(inflated.header("Content-Length").is_none());
        assert_eq!(inflated.body_mut().string().unwrap(), "inflate me");
    }
}
