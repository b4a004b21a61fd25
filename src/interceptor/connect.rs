//! Opens the exchange: route selection, connection acquisition, codec setup.

use crate::error::Result;
use crate::http::Response;
use crate::interceptor::{Chain, Interceptor};

pub(crate) struct ConnectInterceptor;

impl Interceptor for ConnectInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let request = chain.request().clone();
        let exchange = chain.call().inner().init_exchange(chain)?;
        chain.exchange = Some(exchange);
        chain.proceed(request)
    }
}
