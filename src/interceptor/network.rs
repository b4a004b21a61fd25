//! The last interceptor: makes the network call on the exchange.

use crate::error::{Error, Result};
use crate::http::{now_millis, Response};
use crate::interceptor::{Chain, Interceptor};

pub(crate) struct CallServerInterceptor;

impl Interceptor for CallServerInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let exchange = chain
            .exchange()
            .cloned()
            .ok_or_else(|| Error::bad_config("network interceptor without an exchange"))?;
        let request = chain.request().clone();
        let sent_request_at = now_millis();

        exchange.write_request_headers(&request)?;

        let mut early_response_builder = None;
        let has_body = request.body().is_some()
            && crate::http::request::method_permits_body(request.method());

        if has_body {
            let body = request.body().expect("checked above").clone();
            // "Expect: 100-continue" defers the body until the server asks
            // for it. An unexpected real response abandons the body.
            let expect_continue = request
                .header("Expect")
                .map(|v| v.eq_ignore_ascii_case("100-continue"))
                .unwrap_or(false);
            if expect_continue {
                exchange.flush_request()?;
                early_response_builder = exchange.read_response_headers(true)?;
            }

            if early_response_builder.is_none() {
                let content_length = body.content_length();
                if body.is_duplex() {
                    if !exchange.connection().protocol().multiplexed() {
                        return Err(Error::protocol(
                            "duplex request bodies require HTTP/2",
                        ));
                    }
                    // Duplex: the body streams concurrently with the
                    // response on its own thread.
                    exchange.flush_request()?;
                    let mut sink = exchange.create_request_body(&request, content_length)?;
                    let duplex_exchange = exchange.clone();
                    std::thread::Builder::new()
                        .name("courier duplex body".to_string())
                        .spawn(move || {
                            let result = body
                                .write_to(&mut sink)
                                .map_err(Error::from_sink_io)
                                .and_then(|()| sink.finish())
                                .and_then(|()| duplex_exchange.finish_request());
                            if let Err(e) = result {
                                tracing::debug!("duplex body failed: {}", e);
                            }
                        })
                        .map_err(Error::io)?;
                } else {
                    let mut sink = exchange.create_request_body(&request, content_length)?;
                    body.write_to(&mut sink).map_err(Error::from_sink_io)?;
                    sink.finish()?;
                    exchange.finish_request()?;
                }
            } else {
                // The server responded before we sent the body; on HTTP/1.1
                // that connection cannot be reused.
                exchange.no_new_exchanges_on_connection();
                exchange.finish_request()?;
            }
        } else {
            exchange.finish_request()?;
        }

        let mut builder = match early_response_builder {
            Some(builder) => builder,
            None => exchange
                .read_response_headers(false)?
                .ok_or_else(|| Error::protocol("expected a response"))?,
        };

        // Interim responses (1xx) are consumed here; the loop exits at the
        // real status. A 101 for a requested upgrade is final.
        let for_web_socket = chain.call().inner().is_web_socket();
        loop {
            let code = builder.peek_code().unwrap_or(0);
            if !(100..200).contains(&code) || (code == 101 && for_web_socket) {
                break;
            }
            builder = exchange
                .read_response_headers(false)?
                .ok_or_else(|| Error::protocol("expected a response"))?;
        }

        let received_response_at = now_millis();
        let response_head = builder
            .request(request.clone())
            .handshake(exchange.connection().handshake().cloned())
            .sent_request_at_millis(sent_request_at)
            .received_response_at_millis(received_response_at)
            .build()?;
        let code = response_head.code();

        crate::event::emit(chain.call().inner().event_listener(), |l| {
            l.response_headers_end(chain.call(), &response_head)
        });

        let response = if chain.call().inner().is_web_socket() && code == 101 {
            // The upgrade succeeded: the socket now belongs to the caller.
            response_head
        } else {
            let body = exchange.open_response_body(&response_head)?;
            let mut response = response_head;
            *response.body_mut() = body;
            response
        };

        if response.headers().contains_value("Connection", "close")
            || response.request().headers().contains_value("Connection", "close")
        {
            exchange.no_new_exchanges_on_connection();
        }

        if (code == 204 || code == 205) && response.body().content_length() > 0 {
            return Err(Error::protocol(format!(
                "HTTP {} had non-zero Content-Length: {}",
                code,
                response.body().content_length()
            )));
        }

        Ok(response)
    }
}
