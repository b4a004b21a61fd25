//! Recovers from failures and follows redirects and auth challenges.

use std::sync::Arc;
use std::time::Duration;

use crate::client::ClientConfig;
use crate::error::{Error, Result};
use crate::http::request::redirects_to_get;
use crate::http::{Request, Response};
use crate::interceptor::{Chain, Interceptor};

/// How many follow-ups (redirects plus auth retries) to attempt before
/// giving up. Chrome follows 21; Firefox, curl, and wget follow 20.
const MAX_FOLLOW_UPS: u32 = 20;

pub(crate) struct RetryAndFollowUpInterceptor {
    pub(crate) config: Arc<ClientConfig>,
}

impl Interceptor for RetryAndFollowUpInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let call = chain.call().clone();
        let mut request = chain.request().clone();
        let mut prior_response: Option<Response> = None;
        let mut recovered_failures: Vec<Error> = Vec::new();
        let mut follow_up_count = 0u32;

        loop {
            call.inner().enter_network_phase(&request)?;

            if call.is_canceled() {
                return Err(annotate(Error::canceled(), recovered_failures));
            }

            let result = chain.proceed(request.clone());
            let mut response = match result {
                Ok(response) => response,
                Err(e) => {
                    if !self.recover(&e, &request, &call) {
                        return Err(annotate(e, recovered_failures));
                    }
                    tracing::debug!("recovering from {}; retrying", e);
                    recovered_failures.push(e);
                    call.inner().exit_network_phase();
                    continue;
                }
            };

            // Attach the prior response (bodies stripped) for observability.
            if let Some(prior) = prior_response.take() {
                response = with_prior(response, prior);
            }

            let follow_up = self.follow_up_request(&response, &call)?;
            let Some(follow_up) = follow_up else {
                return Ok(response);
            };

            if let Some(body) = follow_up.body() {
                if body.is_one_shot() {
                    // The one chance to send this body was spent.
                    return Ok(response);
                }
            }

            follow_up_count += 1;
            if follow_up_count > MAX_FOLLOW_UPS {
                return Err(annotate(
                    Error::protocol(format!("too many follow-up requests: {}", follow_up_count)),
                    recovered_failures,
                ));
            }

            // Drain the body so the connection comes back to the pool
            // ready for the follow-up.
            let _ = response.body_mut().bytes();
            prior_response = Some(response.strip_body_only());
            request = follow_up;
            call.inner().exit_network_phase();
        }
    }
}

impl RetryAndFollowUpInterceptor {
    /// Whether the failed request may be sent again, possibly on another
    /// route.
    fn recover(&self, error: &Error, request: &Request, call: &crate::client::Call) -> bool {
        if call.is_canceled() {
            return false;
        }
        if !self.config.retry_on_connection_failure {
            return false;
        }
        // A one-shot body is spent even on failure.
        if let Some(body) = request.body() {
            if body.is_one_shot() {
                return false;
            }
        }
        if !is_recoverable(error) {
            return false;
        }
        if !call.inner().has_more_routes() {
            return false;
        }
        true
    }

    fn follow_up_request(
        &self,
        response: &Response,
        call: &crate::client::Call,
    ) -> Result<Option<Request>> {
        match response.code() {
            307 | 308 | 300 | 301 | 302 | 303 => self.build_redirect_request(response),
            401 => self.config.authenticator.authenticate(None, response),
            407 => self
                .config
                .proxy_authenticator
                .authenticate(call.inner().route().as_ref(), response),
            408 => {
                // The server asked us to try again.
                if !self.config.retry_on_connection_failure {
                    return Ok(None);
                }
                if let Some(prior) = response.prior_response() {
                    if prior.code() == 408 {
                        // Two timeouts in a row: stop.
                        return Ok(None);
                    }
                }
                if retry_after_seconds(response).unwrap_or(0) > 0 {
                    return Ok(None);
                }
                Ok(Some(response.request().clone()))
            }
            503 => {
                if let Some(prior) = response.prior_response() {
                    if prior.code() == 503 {
                        return Ok(None);
                    }
                }
                // Retry only an explicit immediate Retry-After.
                if retry_after_seconds(response) == Some(0) {
                    return Ok(Some(response.request().clone()));
                }
                Ok(None)
            }
            421 => {
                // Our coalesced connection reached the wrong origin; retry
                // on a fresh route.
                if let Some(body) = response.request().body() {
                    if body.is_one_shot() {
                        return Ok(None);
                    }
                }
                call.inner().abandon_coalesced_connection();
                Ok(Some(response.request().clone()))
            }
            _ => Ok(None),
        }
    }

    fn build_redirect_request(&self, response: &Response) -> Result<Option<Request>> {
        if !self.config.follow_redirects {
            return Ok(None);
        }
        let Some(location) = response.header("Location") else {
            return Ok(None);
        };
        let Some(url) = response.request().url().resolve(location) else {
            return Ok(None);
        };

        // Cross-scheme redirects need their own opt-in.
        let same_scheme = url.scheme() == response.request().url().scheme();
        if !same_scheme && !self.config.follow_ssl_redirects {
            return Ok(None);
        }

        let mut builder = response.request().new_builder();
        // 303 rewrites to GET and sheds the body; 301/302/307/308 carry the
        // method and body forward.
        if response.code() == 303 && redirects_to_get(response.request().method()) {
            builder = builder
                .method("GET", None)
                .remove_header("Transfer-Encoding")
                .remove_header("Content-Length")
                .remove_header("Content-Type");
        }

        // Credentials do not cross hosts.
        if !same_host(response.request(), &url) {
            builder = builder
                .remove_header("Authorization")
                .remove_header("Proxy-Authorization");
        }

        Ok(Some(builder.url(url)?.build()?))
    }
}

fn same_host(request: &Request, url: &crate::http::Url) -> bool {
    request.url().host() == url.host()
        && request.url().port() == url.port()
        && request.url().scheme() == url.scheme()
}

/// Only `IO` and eligible handshake failures recover; protocol errors and
/// cancellation never do.
fn is_recoverable(error: &Error) -> bool {
    if error.is_canceled() {
        return false;
    }
    if error.is_protocol() {
        return false;
    }
    if error.is_handshake() {
        // TLS-spec fallback already ran inside the connect attempt; a
        // surviving certificate failure will not improve on another route.
        return !error.is_certificate();
    }
    if error.is_refused_stream() {
        return true;
    }
    if error.is_stream_reset() {
        return false;
    }
    // I/O (including unknown-host, retried across remaining proxies by the
    // route gate).
    true
}

fn retry_after_seconds(response: &Response) -> Option<i64> {
    let value = response.header("Retry-After")?;
    // Delta-seconds only; an HTTP-date means "not now".
    value.trim().parse::<i64>().ok()
}

fn annotate(mut error: Error, recovered: Vec<Error>) -> Error {
    for earlier in recovered {
        error.push_suppressed(earlier);
    }
    error
}

fn with_prior(mut response: Response, prior: Response) -> Response {
    response.set_prior_response(Some(prior));
    response
}

/// Schedules the whole-call deadline; `RetryAndFollowUpInterceptor` is the
/// outermost engine interceptor, so the deadline covers everything below.
pub(crate) struct CallTimeoutInterceptor {
    pub(crate) call_timeout: Duration,
}

impl Interceptor for CallTimeoutInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        if self.call_timeout.is_zero() {
            let request = chain.request().clone();
            return chain.proceed(request);
        }
        let call = chain.call().clone();
        call.inner().schedule_timeout(self.call_timeout);
        let request = chain.request().clone();
        let result = chain.proceed(request);
        call.inner().cancel_timeout();
        match result {
            Err(e) if call.inner().is_timed_out() => {
                let mut timeout = Error::call_timeout();
                timeout.push_suppressed(e);
                Err(timeout)
            }
            other => other,
        }
    }
}
