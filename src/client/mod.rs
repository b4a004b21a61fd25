//! The HTTP client: configuration and the entry points for calls.

pub(crate) mod call;
pub(crate) mod dispatcher;
pub(crate) mod finder;

pub use self::call::Call;
pub(crate) use self::call::CallInner;

use std::sync::Arc;
use std::time::Duration;

use crate::cache::Cache;
use crate::connect::address::AddressTls;
use crate::connect::auth::NoAuthentication;
use crate::connect::proxy::NoProxy;
use crate::connect::tls::{NoPins, TrustingVerifier};
use crate::connect::{
    Address, Authenticator, CertificatePinner, ConnectionSpec, Dns, HostnameVerifier, Protocol,
    Proxy, ProxySelector, RouteDatabase, SystemDns, TlsConnector,
};
use crate::error::{Error, Result};
use crate::event::{EventListener, NoEvents};
use crate::http::cookie::RejectNothing;
use crate::http::{CookieJar, IntoUrl, NoCookies, PublicSuffix, Request};
use crate::interceptor::Interceptor;
use crate::pool::{AddressPolicy, ConnectionPool};
use crate::task::{TaskQueue, TaskRunner};
use crate::ws::{WebSocket, WebSocketListener};

/// Everything a call needs to know about its client.
#[derive(Clone)]
pub(crate) struct ClientConfig {
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) call_timeout: Duration,
    pub(crate) ping_interval: Duration,
    pub(crate) retry_on_connection_failure: bool,
    pub(crate) follow_redirects: bool,
    pub(crate) follow_ssl_redirects: bool,
    pub(crate) fast_fallback: bool,
    pub(crate) cookie_jar: Arc<dyn CookieJar>,
    pub(crate) cache: Option<Cache>,
    pub(crate) dns: Arc<dyn Dns>,
    pub(crate) proxy: Option<Proxy>,
    pub(crate) proxy_selector: Arc<dyn ProxySelector>,
    pub(crate) proxy_authenticator: Arc<dyn Authenticator>,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) protocols: Vec<Protocol>,
    pub(crate) connection_specs: Vec<ConnectionSpec>,
    pub(crate) tls_connector: Option<Arc<dyn TlsConnector>>,
    pub(crate) hostname_verifier: Arc<dyn HostnameVerifier>,
    pub(crate) certificate_pinner: Arc<dyn CertificatePinner>,
    pub(crate) public_suffix: Arc<dyn PublicSuffix>,
    pub(crate) event_listener: Arc<dyn EventListener>,
    pub(crate) interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) network_interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) min_web_socket_message_to_compress: u64,
    pub(crate) user_agent: String,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("protocols", &self.protocols)
            .finish()
    }
}

/// An HTTP client. Cheap to clone; clones share the connection pool, the
/// dispatcher, and the task runner.
///
/// Build one and reuse it: each client carries its own pool and scheduler
/// threads, so per-request clients waste sockets.
#[derive(Clone, Debug)]
pub struct Client {
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) pool: ConnectionPool,
    pub(crate) dispatcher: dispatcher::Dispatcher,
    pub(crate) runner: TaskRunner,
    pub(crate) h2_queue: TaskQueue,
    pub(crate) route_database: Arc<RouteDatabase>,
}

impl Client {
    /// A client with default configuration.
    pub fn new() -> Client {
        Client::builder().build().expect("default configuration is valid")
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// A builder initialized from an existing client's configuration. The
    /// built client gets its own pool and scheduler.
    pub(crate) fn builder_from(client: &Client) -> ClientBuilder {
        ClientBuilder {
            config: (*client.config).clone(),
            max_idle_connections: 5,
            keep_alive_duration: Duration::from_secs(5 * 60),
        }
    }

    /// Prepares `request` for execution.
    pub fn new_call(&self, request: Request) -> Call {
        Call::new(self.clone(), request, false)
    }

    /// Opens a WebSocket to `request`'s URL, reporting events to
    /// `listener`. Returns immediately; the connection proceeds on a
    /// background thread.
    pub fn new_web_socket(
        &self,
        request: Request,
        listener: Arc<dyn WebSocketListener>,
    ) -> WebSocket {
        crate::ws::connect(self, request, listener)
    }

    /// Sets the pre-warming policy for `url`'s address.
    pub fn set_address_policy(&self, url: impl IntoUrl, policy: AddressPolicy) -> Result<()> {
        let url = url.into_url()?;
        let address = self.address_for(&url)?;
        self.pool.set_policy(address, policy);
        Ok(())
    }

    /// Idle connections currently pooled.
    pub fn idle_connection_count(&self) -> usize {
        self.pool.idle_connection_count()
    }

    pub fn connection_count(&self) -> usize {
        self.pool.connection_count()
    }

    /// Closes idle connections and stops background work. Calls in flight
    /// proceed; new calls may still be made.
    pub fn evict_all(&self) {
        self.pool.evict_all();
    }

    pub(crate) fn address_for(&self, url: &crate::http::Url) -> Result<Address> {
        let tls = if url.is_https() {
            let connector = self.config.tls_connector.clone().ok_or_else(|| {
                Error::bad_config("an https URL requires a TLS connector; none is configured")
            })?;
            Some(AddressTls {
                connector,
                hostname_verifier: self.config.hostname_verifier.clone(),
                certificate_pinner: self.config.certificate_pinner.clone(),
            })
        } else {
            None
        };
        Ok(Address::new(
            url.scheme(),
            url.host(),
            url.port(),
            self.config.protocols.clone(),
            self.config.connection_specs.clone(),
            self.config.dns.clone(),
            self.config.proxy.clone(),
            self.config.proxy_selector.clone(),
            self.config.proxy_authenticator.clone(),
            tls,
        ))
    }

    pub(crate) fn connect_params(
        &self,
        connect_timeout: Duration,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> crate::connection::establish::ConnectParams {
        crate::connection::establish::ConnectParams {
            connect_timeout,
            read_timeout,
            write_timeout,
            ping: if self.config.ping_interval.is_zero() {
                None
            } else {
                Some((self.h2_queue.clone(), self.config.ping_interval))
            },
            now_ns: self.runner.nano_time(),
            user_agent: self.config.user_agent.clone(),
        }
    }
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

/// Configures and builds a [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    max_idle_connections: usize,
    keep_alive_duration: Duration,
}

impl Default for ClientBuilder {
    fn default() -> ClientBuilder {
        ClientBuilder {
            config: ClientConfig {
                connect_timeout: Duration::from_secs(10),
                read_timeout: Duration::from_secs(10),
                write_timeout: Duration::from_secs(10),
                call_timeout: Duration::ZERO,
                ping_interval: Duration::ZERO,
                retry_on_connection_failure: true,
                follow_redirects: true,
                follow_ssl_redirects: true,
                fast_fallback: false,
                cookie_jar: Arc::new(NoCookies),
                cache: None,
                dns: Arc::new(SystemDns),
                proxy: None,
                proxy_selector: Arc::new(NoProxy),
                proxy_authenticator: Arc::new(NoAuthentication),
                authenticator: Arc::new(NoAuthentication),
                protocols: vec![Protocol::H2, Protocol::Http11],
                connection_specs: vec![ConnectionSpec::modern_tls(), ConnectionSpec::cleartext()],
                tls_connector: None,
                hostname_verifier: Arc::new(TrustingVerifier),
                certificate_pinner: Arc::new(NoPins),
                public_suffix: Arc::new(RejectNothing),
                event_listener: Arc::new(NoEvents),
                interceptors: Vec::new(),
                network_interceptors: Vec::new(),
                min_web_socket_message_to_compress: 1024,
                user_agent: concat!("courier/", env!("CARGO_PKG_VERSION")).to_string(),
            },
            max_idle_connections: 5,
            keep_alive_duration: Duration::from_secs(5 * 60),
        }
    }
}

impl ClientBuilder {
    /// Max wall time for a single connect attempt.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Max wall time between progress events on a socket read.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Max wall time for the whole call, dispatch to body close. Zero means
    /// no limit.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// HTTP/2 and WebSocket keepalive period. Zero disables pings.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    pub fn retry_on_connection_failure(mut self, retry: bool) -> Self {
        self.config.retry_on_connection_failure = retry;
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    /// Whether to follow redirects that change between `http` and `https`.
    pub fn follow_ssl_redirects(mut self, follow: bool) -> Self {
        self.config.follow_ssl_redirects = follow;
        self
    }

    /// Happy-Eyeballs ordering of dual-stack DNS answers.
    pub fn fast_fallback(mut self, fast_fallback: bool) -> Self {
        self.config.fast_fallback = fast_fallback;
        self
    }

    pub fn cookie_jar(mut self, jar: Arc<dyn CookieJar>) -> Self {
        self.config.cookie_jar = jar;
        self
    }

    pub fn cache(mut self, cache: Cache) -> Self {
        self.config.cache = Some(cache);
        self
    }

    pub fn dns(mut self, dns: Arc<dyn Dns>) -> Self {
        self.config.dns = dns;
        self
    }

    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    pub fn proxy_selector(mut self, selector: Arc<dyn ProxySelector>) -> Self {
        self.config.proxy_selector = selector;
        self
    }

    pub fn proxy_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.config.proxy_authenticator = authenticator;
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.config.authenticator = authenticator;
        self
    }

    /// The ALPN preference list. Must contain `http/1.1`, unless it is
    /// exactly `[h2_prior_knowledge]`.
    pub fn protocols(mut self, protocols: Vec<Protocol>) -> Self {
        self.config.protocols = protocols;
        self
    }

    /// The ordered TLS configurations to fall back across.
    pub fn connection_specs(mut self, specs: Vec<ConnectionSpec>) -> Self {
        self.config.connection_specs = specs;
        self
    }

    pub fn tls_connector(mut self, connector: Arc<dyn TlsConnector>) -> Self {
        self.config.tls_connector = Some(connector);
        self
    }

    pub fn hostname_verifier(mut self, verifier: Arc<dyn HostnameVerifier>) -> Self {
        self.config.hostname_verifier = verifier;
        self
    }

    pub fn certificate_pinner(mut self, pinner: Arc<dyn CertificatePinner>) -> Self {
        self.config.certificate_pinner = pinner;
        self
    }

    pub fn public_suffix(mut self, public_suffix: Arc<dyn PublicSuffix>) -> Self {
        self.config.public_suffix = public_suffix;
        self
    }

    pub fn event_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.config.event_listener = listener;
        self
    }

    /// Adds an application interceptor: sees each call once, before the
    /// engine's retries and redirects.
    pub fn add_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.config.interceptors.push(interceptor);
        self
    }

    /// Adds a network interceptor: sees every network request, including
    /// redirects and retries.
    pub fn add_network_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.config.network_interceptors.push(interceptor);
        self
    }

    /// Messages smaller than this skip permessage-deflate.
    pub fn min_web_socket_message_to_compress(mut self, bytes: u64) -> Self {
        self.config.min_web_socket_message_to_compress = bytes;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Pool eviction knobs: idle connection cap and keep-alive duration.
    pub fn connection_pool(mut self, max_idle_connections: usize, keep_alive: Duration) -> Self {
        self.max_idle_connections = max_idle_connections;
        self.keep_alive_duration = keep_alive;
        self
    }

    pub fn build(self) -> Result<Client> {
        let protocols = &self.config.protocols;
        let prior_knowledge_only = protocols == &[Protocol::H2PriorKnowledge];
        if !prior_knowledge_only && !protocols.contains(&Protocol::Http11) {
            return Err(Error::bad_config(format!(
                "protocols must contain http/1.1: {:?}",
                protocols
            )));
        }
        if protocols.contains(&Protocol::H2PriorKnowledge) && !prior_knowledge_only {
            return Err(Error::bad_config(
                "protocols containing h2_prior_knowledge cannot use other protocols",
            ));
        }
        if protocols.contains(&Protocol::Http10) {
            return Err(Error::bad_config("protocols must not contain http/1.0"));
        }

        let runner = TaskRunner::new();
        let pool = ConnectionPool::new(
            runner.clone(),
            self.max_idle_connections,
            self.keep_alive_duration.as_nanos() as u64,
        );
        let client = Client {
            config: Arc::new(self.config),
            pool,
            dispatcher: dispatcher::Dispatcher::new(),
            h2_queue: runner.new_queue("h2"),
            runner,
            route_database: Arc::new(RouteDatabase::new()),
        };

        // Policy pre-warming dials through the same route planning calls
        // use. The context captures no pool reference.
        let context = finder::WarmContext {
            config: client.config.clone(),
            runner: client.runner.clone(),
            h2_queue: client.h2_queue.clone(),
            route_database: client.route_database.clone(),
        };
        client.pool.set_warm_connector(Arc::new(move |address: &Address| {
            finder::connect_for_policy(&context, address)
        }));

        Ok(client)
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_client_builds() {
        let client = Client::new();
        assert_eq!(client.config.protocols, vec![Protocol::H2, Protocol::Http11]);
        assert!(client.config.follow_redirects);
    }

    #[test]
    fn protocol_validation() {
        assert!(Client::builder()
            .protocols(vec![Protocol::H2])
            .build()
            .is_err());
        assert!(Client::builder()
            .protocols(vec![Protocol::H2PriorKnowledge])
            .build()
            .is_ok());
        assert!(Client::builder()
            .protocols(vec![Protocol::H2PriorKnowledge, Protocol::Http11])
            .build()
            .is_err());
        assert!(Client::builder()
            .protocols(vec![Protocol::Http11])
            .build()
            .is_ok());
    }

    #[test]
    fn https_requires_tls_connector() {
        let client = Client::new();
        let url = crate::http::Url::parse("https://example.com/").unwrap();
        assert!(client.address_for(&url).is_err());
        let http = crate::http::Url::parse("http://example.com/").unwrap();
        assert!(client.address_for(&http).is_ok());
    }
}
