//! Serves requests from the cache and keeps the cache current.

use crate::cache::{cache_writing_response, has_vary_all, Cache, CacheStrategy};
use crate::connect::Protocol;
use crate::error::Result;
use crate::http::{now_millis, Headers, HeadersBuilder, Request, Response, ResponseBody};
use crate::interceptor::{Chain, Interceptor};

pub(crate) struct CacheInterceptor {
    pub(crate) cache: Option<Cache>,
}

impl Interceptor for CacheInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let request = chain.request().clone();
        let cache_candidate = self.cache.as_ref().and_then(|c| c.get(&request));

        let now = now_millis();
        let strategy = CacheStrategy::compute(now, &request, cache_candidate);
        if let Some(ref cache) = self.cache {
            cache.track_strategy(&strategy);
        }
        let CacheStrategy {
            network_request,
            cache_response,
        } = strategy;

        // Forbidden from the network, and the cache is insufficient.
        if network_request.is_none() && cache_response.is_none() {
            return Response::builder()
                .request(request)
                .protocol(Protocol::Http11)
                .code(504)
                .message("Unsatisfiable Request (only-if-cached)")
                .sent_request_at_millis(now)
                .received_response_at_millis(now)
                .build();
        }

        // Fresh enough: no network at all.
        let Some(network_request) = network_request else {
            let cached = cache_response.expect("strategy yields at least one source");
            return Ok(attach_cache_response(cached));
        };

        let mut network_response = match chain.proceed(network_request.clone()) {
            Ok(response) => response,
            Err(e) => {
                // The cached candidate, if any, closes with its snapshot.
                return Err(e);
            }
        };

        if let Some(mut cached) = cache_response {
            if network_response.code() == 304 {
                // The 304 has no body; drain it so the connection is
                // immediately reusable.
                let _ = network_response.body_mut().bytes();
                let merged_headers =
                    combine_headers(cached.headers(), network_response.headers());
                let body = std::mem::replace(cached.body_mut(), ResponseBody::empty());
                let merged = cached
                    .new_builder()
                    .headers(merged_headers)
                    .sent_request_at_millis(network_response.sent_request_at_millis())
                    .received_response_at_millis(network_response.received_response_at_millis())
                    .cache_response(Some(clone_head(&cached)))
                    .network_response(Some(network_response.strip_body()))
                    .body(body)
                    .build()?;

                if let Some(ref cache) = self.cache {
                    cache.track_conditional_hit();
                    cache.update(&cached, &merged);
                }
                return Ok(merged);
            }
            // The cached copy lost; its body closes now.
            cached.body_mut().close();
        }

        let mut response = network_response;
        let network_copy = clone_head(&response);
        response.set_network_response(Some(network_copy));

        let Some(ref cache) = self.cache else {
            return Ok(response);
        };

        if invalidates_cache(network_request.method()) {
            cache.remove(&network_request);
        } else if network_request.method() == "GET"
            && CacheStrategy::is_cacheable(&response, &network_request)
            && !has_vary_all(response.headers())
        {
            if let Some(writer) = cache.put(&response) {
                response = cache_writing_response(writer, response);
            }
        }

        Ok(response)
    }
}

fn invalidates_cache(method: &str) -> bool {
    matches!(method, "POST" | "PUT" | "PATCH" | "DELETE" | "MOVE")
}

/// Attaches a stripped copy of the cached response to itself, so callers
/// can see the response was served from cache.
fn attach_cache_response(mut cached: Response) -> Response {
    let head = clone_head(&cached);
    cached.set_cache_response(Some(head));
    cached
}

/// A body-less copy of a response's head for attachment as
/// `cache_response`/`network_response`.
fn clone_head(response: &Response) -> Response {
    response
        .new_builder()
        .build()
        .expect("rebuilding a valid response")
}

/// RFC 7234 §4.3.4 header merging: network values win for end-to-end
/// headers, except the content headers which stay with the cached body;
/// `Warning: 1xx` entries from the cache are dropped.
fn combine_headers(cached: &Headers, network: &Headers) -> Headers {
    let mut result = HeadersBuilder::default();
    for (name, value) in cached.iter() {
        if name.eq_ignore_ascii_case("Warning") && value.starts_with('1') {
            continue;
        }
        if is_content_specific(name) || !is_end_to_end(name) || network.get(name).is_none() {
            result.add_lenient(name, value);
        }
    }
    for (name, value) in network.iter() {
        if is_content_specific(name) {
            continue;
        }
        if is_end_to_end(name) {
            result.add_lenient(name, value);
        }
    }
    result.build()
}

fn is_content_specific(name: &str) -> bool {
    name.eq_ignore_ascii_case("Content-Length")
        || name.eq_ignore_ascii_case("Content-Encoding")
        || name.eq_ignore_ascii_case("Content-Type")
}

fn is_end_to_end(name: &str) -> bool {
    !name.eq_ignore_ascii_case("Connection")
        && !name.eq_ignore_ascii_case("Keep-Alive")
        && !name.eq_ignore_ascii_case("Proxy-Authenticate")
        && !name.eq_ignore_ascii_case("Proxy-Authorization")
        && !name.eq_ignore_ascii_case("TE")
        && !name.eq_ignore_ascii_case("Trailers")
        && !name.eq_ignore_ascii_case("Transfer-Encoding")
        && !name.eq_ignore_ascii_case("Upgrade")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_headers_override_except_content() {
        let cached = Headers::of(&[
            "Content-Type", "text/plain",
            "Content-Length", "5",
            "ETag", "\"v1\"",
            "Warning", "110 - \"stale\"",
            "Server", "old",
        ]);
        let network = Headers::of(&[
            "Content-Type", "application/octet-stream",
            "ETag", "\"v2\"",
            "Server", "new",
        ]);
        let merged = combine_headers(&cached, &network);
        assert_eq!(merged.get("Content-Type"), Some("text/plain"));
        assert_eq!(merged.get("Content-Length"), Some("5"));
        assert_eq!(merged.get("ETag"), Some("\"v2\""));
        assert_eq!(merged.get("Server"), Some("new"));
        assert!(merged.get("Warning").is_none());
    }

    #[test]
    fn hop_by_hop_from_network_dropped() {
        let cached = Headers::of(&["ETag", "\"v1\""]);
        let network = Headers::of(&["Connection", "close", "Transfer-Encoding", "chunked"]);
        let merged = combine_headers(&cached, &network);
        assert!(merged.get("Connection").is_none());
        assert!(merged.get("Transfer-Encoding").is_none());
    }

    #[test]
    fn invalidating_methods() {
        assert!(invalidates_cache("POST"));
        assert!(invalidates_cache("DELETE"));
        assert!(!invalidates_cache("GET"));
    }
}
