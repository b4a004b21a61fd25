//! Given a request and a cached response, decides what to do: serve the
//! cache, hit the network, or revalidate with a conditional request.

use crate::http::{Request, Response};

/// The decision: a network request to send (possibly conditional), a cached
/// response to serve or validate against, or neither (only-if-cached miss).
#[derive(Debug)]
pub(crate) struct CacheStrategy {
    pub(crate) network_request: Option<Request>,
    pub(crate) cache_response: Option<Response>,
}

impl CacheStrategy {
    /// Whether `response` to `request` may be stored at all (RFC 7234 §3).
    pub(crate) fn is_cacheable(response: &Response, request: &Request) -> bool {
        match response.code() {
            200 | 203 | 204 | 300 | 301 | 404 | 405 | 410 | 414 | 501 | 308 => {}
            302 | 307 => {
                // Cacheable only with explicit freshness.
                let cc = response.cache_control();
                if response.header("Expires").is_none()
                    && cc.max_age_seconds().is_none()
                    && !cc.public()
                    && !cc.private()
                {
                    return false;
                }
            }
            _ => return false,
        }

        if request.header("Authorization").is_some() {
            let cc = response.cache_control();
            if !cc.public() && !cc.must_revalidate() && cc.s_max_age_seconds().is_none() {
                return false;
            }
        }

        !response.cache_control().no_store() && !request.cache_control().no_store()
    }

    pub(crate) fn compute(now_millis: i64, request: &Request, cache_response: Option<Response>) -> CacheStrategy {
        let factory = Factory {
            now_millis,
            request,
        };
        let candidate = factory.compute_candidate(cache_response);

        if candidate.network_request.is_some() && request.cache_control().only_if_cached() {
            // Forbidden from the network, and the cache is insufficient.
            return CacheStrategy {
                network_request: None,
                cache_response: None,
            };
        }
        candidate
    }
}

struct Factory<'a> {
    now_millis: i64,
    request: &'a Request,
}

impl Factory<'_> {
    fn network(&self) -> CacheStrategy {
        CacheStrategy {
            network_request: Some(self.request.clone()),
            cache_response: None,
        }
    }

    fn compute_candidate(&self, cache_response: Option<Response>) -> CacheStrategy {
        let Some(cached) = cache_response else {
            return self.network();
        };

        // A secure request needs a cached handshake.
        if self.request.url().is_https() && cached.handshake().is_none() {
            return self.network();
        }

        if !CacheStrategy::is_cacheable(&cached, self.request) {
            return self.network();
        }

        let request_caching = self.request.cache_control();
        if request_caching.no_cache() || has_conditions(self.request) {
            return self.network();
        }

        let response_caching = cached.cache_control();
        let age_millis = self.cache_response_age(&cached);
        let mut fresh_millis = self.compute_freshness_lifetime(&cached);
        if let Some(max_age) = request_caching.max_age_seconds() {
            fresh_millis = fresh_millis.min(max_age.saturating_mul(1000));
        }
        let min_fresh_millis = request_caching
            .min_fresh_seconds()
            .map(|s| s.saturating_mul(1000))
            .unwrap_or(0);
        let max_stale_millis = if !response_caching.must_revalidate() {
            request_caching
                .max_stale_seconds()
                .map(|s| s.saturating_mul(1000))
                .unwrap_or(0)
        } else {
            0
        };

        if !response_caching.no_cache()
            && age_millis.saturating_add(min_fresh_millis)
                < fresh_millis.saturating_add(max_stale_millis)
        {
            let mut builder = cached.new_builder();
            if age_millis.saturating_add(min_fresh_millis) >= fresh_millis {
                builder = builder.add_header("Warning", "110 HttpURLConnection \"Response is stale\"");
            }
            let one_day_millis = 24 * 60 * 60 * 1000;
            if age_millis > one_day_millis && self.is_freshness_lifetime_heuristic(&cached) {
                builder =
                    builder.add_header("Warning", "113 HttpURLConnection \"Heuristic expiration\"");
            }
            let served = builder
                .body(cached.into_body())
                .build()
                .expect("rebuilding a valid response");
            return CacheStrategy {
                network_request: None,
                cache_response: Some(served),
            };
        }

        // Stale: revalidate if the cached response gives us a condition.
        let (name, value) = if let Some(etag) = cached.header("ETag") {
            ("If-None-Match", etag.to_string())
        } else if let Some(last_modified) = cached.header("Last-Modified") {
            ("If-Modified-Since", last_modified.to_string())
        } else if let Some(served_date) = cached.header("Date") {
            ("If-Modified-Since", served_date.to_string())
        } else {
            return self.network();
        };

        let conditional = self
            .request
            .new_builder()
            .header(name, &value)
            .build()
            .expect("conditional request from a valid request");
        CacheStrategy {
            network_request: Some(conditional),
            cache_response: Some(cached),
        }
    }

    /// RFC 7234 §4.2.3 current age.
    fn cache_response_age(&self, cached: &Response) -> i64 {
        let served_date = cached.headers().get_date("Date");
        let sent = cached.sent_request_at_millis();
        let received = cached.received_response_at_millis();

        let apparent_received_age = served_date
            .map(|served| (received - served).max(0))
            .unwrap_or(0);
        let received_age = cached
            .header("Age")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(|age_seconds| apparent_received_age.max(age_seconds.saturating_mul(1000)))
            .unwrap_or(apparent_received_age);
        let response_duration = received - sent;
        let resident_duration = self.now_millis - received;
        received_age + response_duration + resident_duration
    }

    /// RFC 7234 §4.2.1 freshness lifetime.
    fn compute_freshness_lifetime(&self, cached: &Response) -> i64 {
        let response_caching = cached.cache_control();
        if let Some(max_age) = response_caching.max_age_seconds() {
            return max_age.saturating_mul(1000);
        }
        let served_date = cached.headers().get_date("Date");
        let received = cached.received_response_at_millis();
        if let Some(expires) = cached.headers().get_date("Expires") {
            let served = served_date.unwrap_or(received);
            return (expires - served).max(0);
        }
        if let Some(last_modified) = cached.headers().get_date("Last-Modified") {
            if cached.request().url().encoded_query().is_none() {
                // Heuristic freshness: a tenth of the document's age.
                let served = served_date.unwrap_or(cached.sent_request_at_millis());
                let delta = served - last_modified;
                return if delta > 0 { delta / 10 } else { 0 };
            }
        }
        0
    }

    fn is_freshness_lifetime_heuristic(&self, cached: &Response) -> bool {
        cached.cache_control().max_age_seconds().is_none()
            && cached.header("Expires").is_none()
            && cached.header("Last-Modified").is_some()
    }
}

/// True when the request already carries conditions; the cache must not
/// interfere with application-level validation.
fn has_conditions(request: &Request) -> bool {
    request.header("If-Modified-Since").is_some() || request.header("If-None-Match").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::Protocol;
    use crate::http::date::format_millis;

    const NOW: i64 = 1_700_000_000_000;
    const SECOND: i64 = 1_000;
    const MINUTE: i64 = 60 * SECOND;

    fn request() -> Request {
        Request::get("http://example.com/a").unwrap()
    }

    fn cached(headers: &[(&str, &str)], sent: i64, received: i64) -> Response {
        let mut builder = Response::builder()
            .request(request())
            .protocol(Protocol::Http11)
            .code(200)
            .message("OK")
            .sent_request_at_millis(sent)
            .received_response_at_millis(received);
        for (name, value) in headers {
            builder = builder.add_header(name, value);
        }
        builder.build().unwrap()
    }

    #[test]
    fn fresh_response_served_from_cache() {
        let response = cached(
            &[
                ("Date", &format_millis(NOW - MINUTE)),
                ("Cache-Control", "max-age=300"),
            ],
            NOW - MINUTE,
            NOW - MINUTE,
        );
        let strategy = CacheStrategy::compute(NOW, &request(), Some(response));
        assert!(strategy.network_request.is_none());
        assert!(strategy.cache_response.is_some());
    }

    #[test]
    fn expired_with_etag_revalidates() {
        let response = cached(
            &[
                ("Date", &format_millis(NOW - 10 * MINUTE)),
                ("Cache-Control", "max-age=60"),
                ("ETag", "\"v1\""),
            ],
            NOW - 10 * MINUTE,
            NOW - 10 * MINUTE,
        );
        let strategy = CacheStrategy::compute(NOW, &request(), Some(response));
        let conditional = strategy.network_request.unwrap();
        assert_eq!(conditional.header("If-None-Match"), Some("\"v1\""));
        assert!(strategy.cache_response.is_some());
    }

    #[test]
    fn expired_without_validator_goes_to_network() {
        let response = cached(&[("Cache-Control", "max-age=0")], NOW - MINUTE, NOW - MINUTE);
        let strategy = CacheStrategy::compute(NOW, &request(), Some(response));
        let network = strategy.network_request.unwrap();
        assert!(network.header("If-None-Match").is_none());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn max_stale_extends_freshness() {
        let response = cached(
            &[
                ("Date", &format_millis(NOW - 2 * MINUTE)),
                ("Cache-Control", "max-age=60"),
            ],
            NOW - 2 * MINUTE,
            NOW - 2 * MINUTE,
        );
        let stale_request = request()
            .new_builder()
            .header("Cache-Control", "max-stale=300")
            .build()
            .unwrap();
        let strategy = CacheStrategy::compute(NOW, &stale_request, Some(response));
        assert!(strategy.network_request.is_none());
        let served = strategy.cache_response.unwrap();
        assert!(served
            .headers()
            .values("Warning")
            .iter()
            .any(|w| w.contains("Response is stale")));
    }

    #[test]
    fn must_revalidate_ignores_max_stale() {
        let response = cached(
            &[
                ("Date", &format_millis(NOW - 2 * MINUTE)),
                ("Cache-Control", "max-age=60, must-revalidate"),
                ("ETag", "\"x\""),
            ],
            NOW - 2 * MINUTE,
            NOW - 2 * MINUTE,
        );
        let stale_request = request()
            .new_builder()
            .header("Cache-Control", "max-stale=300")
            .build()
            .unwrap();
        let strategy = CacheStrategy::compute(NOW, &stale_request, Some(response));
        assert!(strategy.network_request.is_some());
    }

    #[test]
    fn only_if_cached_miss_yields_neither() {
        let only_if_cached = request()
            .new_builder()
            .header("Cache-Control", "only-if-cached")
            .build()
            .unwrap();
        let strategy = CacheStrategy::compute(NOW, &only_if_cached, None);
        assert!(strategy.network_request.is_none());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn request_no_cache_bypasses_cache() {
        let response = cached(
            &[("Cache-Control", "max-age=600")],
            NOW - SECOND,
            NOW - SECOND,
        );
        let bypass = request()
            .new_builder()
            .header("Cache-Control", "no-cache")
            .build()
            .unwrap();
        let strategy = CacheStrategy::compute(NOW, &bypass, Some(response));
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn authorization_blocks_caching_without_public() {
        let authed = request()
            .new_builder()
            .header("Authorization", "Bearer x")
            .build()
            .unwrap();
        let plain = cached(&[("Cache-Control", "max-age=60")], NOW, NOW);
        assert!(!CacheStrategy::is_cacheable(&plain, &authed));
        let public = cached(&[("Cache-Control", "public, max-age=60")], NOW, NOW);
        assert!(CacheStrategy::is_cacheable(&public, &authed));
    }

    #[test]
    fn uncacheable_codes() {
        let teapot = Response::builder()
            .request(request())
            .protocol(Protocol::Http11)
            .code(418)
            .build()
            .unwrap();
        assert!(!CacheStrategy::is_cacheable(&teapot, &request()));
        let found = Response::builder()
            .request(request())
            .protocol(Protocol::Http11)
            .code(302)
            .build()
            .unwrap();
        assert!(!CacheStrategy::is_cacheable(&found, &request()));
        let found_with_expiry = Response::builder()
            .request(request())
            .protocol(Protocol::Http11)
            .code(302)
            .header("Cache-Control", "max-age=60")
            .build()
            .unwrap();
        assert!(CacheStrategy::is_cacheable(&found_with_expiry, &request()));
    }

    #[test]
    fn no_store_is_never_cacheable() {
        let response = cached(&[("Cache-Control", "no-store, immutable")], NOW, NOW);
        assert!(!CacheStrategy::is_cacheable(&response, &request()));
    }

    #[test]
    fn age_header_extends_age() {
        // Served fresh for 60s, but the proxy already aged it 55s: only 5s
        // of freshness remain, so 10s later it must revalidate.
        let response = cached(
            &[
                ("Date", &format_millis(NOW - 10 * SECOND)),
                ("Cache-Control", "max-age=60"),
                ("Age", "55"),
                ("ETag", "\"a\""),
            ],
            NOW - 10 * SECOND,
            NOW - 10 * SECOND,
        );
        let strategy = CacheStrategy::compute(NOW, &request(), Some(response));
        assert!(strategy.network_request.is_some());
    }
}
