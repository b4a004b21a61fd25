//! One request ready to execute, and the state it accumulates in flight.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::finder::ExchangeFinder;
use crate::client::Client;
use crate::connect::Route;
use crate::connection::exchange::Exchange;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::event;
use crate::event::EventListener;
use crate::http::{Request, Response};
use crate::interceptor::{Chain, Interceptor};
use crate::pool::ConnectionPool;
use crate::task::TaskQueue;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// A request that is ready to execute. A call may be executed only once.
#[derive(Clone, Debug)]
pub struct Call {
    inner: Arc<CallInner>,
}

impl Call {
    pub(crate) fn new(client: Client, request: Request, for_web_socket: bool) -> Call {
        let id = NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed);
        let timeout_queue = client.runner.new_queue(format!("call {}", id));
        let listener = client.config.event_listener.clone();
        Call {
            inner: Arc::new(CallInner {
                client,
                request,
                listener,
                id,
                for_web_socket,
                executed: AtomicBool::new(false),
                canceled: AtomicBool::new(false),
                timed_out: AtomicBool::new(false),
                canceled_event_sent: AtomicBool::new(false),
                finder: Mutex::new(None),
                exchange: Mutex::new(None),
                timeout_queue,
            }),
        }
    }

    /// The original request this call was created with.
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// Runs the request on the calling thread, returning its response or
    /// the terminal failure.
    pub fn execute(&self) -> Result<Response> {
        self.inner.mark_executed()?;
        self.inner.client.dispatcher.executed_sync();
        let result = self.inner.run_with_events(self);
        self.inner.client.dispatcher.finished_sync();
        result
    }

    /// Schedules the request on the dispatcher; `on_complete` receives the
    /// response or failure exactly once.
    pub fn enqueue(&self, on_complete: impl FnOnce(Result<Response>) + Send + 'static) {
        if let Err(e) = self.inner.mark_executed() {
            on_complete(Err(e));
            return;
        }
        self.inner
            .client
            .dispatcher
            .enqueue(self.clone(), Box::new(on_complete));
    }

    /// Cancels the call, best-effort. Idempotent and thread-safe.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.is_canceled()
    }

    pub fn is_executed(&self) -> bool {
        self.inner.executed.load(Ordering::SeqCst)
    }

    pub(crate) fn inner(&self) -> &Arc<CallInner> {
        &self.inner
    }
}

pub(crate) struct CallInner {
    pub(crate) client: Client,
    request: Request,
    listener: Arc<dyn EventListener>,
    id: u64,
    for_web_socket: bool,
    executed: AtomicBool,
    canceled: AtomicBool,
    timed_out: AtomicBool,
    canceled_event_sent: AtomicBool,
    finder: Mutex<Option<ExchangeFinder>>,
    exchange: Mutex<Option<Arc<Exchange>>>,
    timeout_queue: TaskQueue,
}

impl CallInner {
    pub(crate) fn as_call(self: &Arc<CallInner>) -> Call {
        Call {
            inner: self.clone(),
        }
    }

    pub(crate) fn event_listener(&self) -> &Arc<dyn EventListener> {
        &self.listener
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub(crate) fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub(crate) fn is_web_socket(&self) -> bool {
        self.for_web_socket
    }

    fn mark_executed(&self) -> Result<()> {
        if self.executed.swap(true, Ordering::SeqCst) {
            return Err(Error::already_executed());
        }
        Ok(())
    }

    fn cancel(self: &Arc<CallInner>) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        let exchange = self.exchange.lock().expect("call poisoned").clone();
        if let Some(exchange) = exchange {
            exchange.cancel();
        }
        if !self.canceled_event_sent.swap(true, Ordering::SeqCst) {
            let call = self.as_call();
            event::emit(&self.listener, |l| l.canceled(&call));
        }
    }

    /// Runs the interceptor chain with call-lifecycle events around it.
    pub(crate) fn run_with_events(self: &Arc<CallInner>, call: &Call) -> Result<Response> {
        event::emit(&self.listener, |l| l.call_start(call));
        let result = self.run(call);
        match result {
            Ok(response) => {
                event::emit(&self.listener, |l| l.call_end(call));
                Ok(response)
            }
            Err(mut e) => {
                if self.is_timed_out() && !matches!(e.kind(), crate::error::Kind::Io(crate::error::Io::CallTimeout)) {
                    let mut timeout = Error::call_timeout();
                    timeout.push_suppressed(e);
                    e = timeout;
                }
                event::emit(&self.listener, |l| l.call_failed(call, &e));
                Err(e)
            }
        }
    }

    fn run(self: &Arc<CallInner>, call: &Call) -> Result<Response> {
        let config = &self.client.config;
        let mut interceptors: Vec<Arc<dyn Interceptor>> = Vec::new();
        interceptors.extend(config.interceptors.iter().cloned());
        interceptors.push(Arc::new(crate::interceptor::retry::CallTimeoutInterceptor {
            call_timeout: config.call_timeout,
        }));
        interceptors.push(Arc::new(
            crate::interceptor::retry::RetryAndFollowUpInterceptor {
                config: config.clone(),
            },
        ));
        interceptors.push(Arc::new(crate::interceptor::bridge::BridgeInterceptor {
            cookie_jar: config.cookie_jar.clone(),
            public_suffix: config.public_suffix.clone(),
            user_agent: config.user_agent.clone(),
        }));
        interceptors.push(Arc::new(crate::interceptor::cache::CacheInterceptor {
            cache: config.cache.clone(),
        }));
        interceptors.push(Arc::new(crate::interceptor::connect::ConnectInterceptor));
        interceptors.extend(config.network_interceptors.iter().cloned());
        interceptors.push(Arc::new(crate::interceptor::network::CallServerInterceptor));

        let mut chain = Chain::new(
            call.clone(),
            &interceptors,
            self.request.clone(),
            config.connect_timeout,
            config.read_timeout,
            config.write_timeout,
        );
        let result = chain.proceed(self.request.clone());
        if result.is_err() {
            // A failed call never leaves an exchange behind.
            let exchange = self.exchange.lock().expect("call poisoned").take();
            if let Some(exchange) = exchange {
                exchange.track_failure(&Error::canceled());
            }
        }
        result
    }

    // ===== network phase =====

    /// Prepares route planning for `request`. Reuses the existing finder
    /// when the request still points at the same address, so retries
    /// continue from the next route.
    pub(crate) fn enter_network_phase(self: &Arc<CallInner>, request: &Request) -> Result<()> {
        let mut finder = self.finder.lock().expect("call poisoned");
        let reusable = finder
            .as_ref()
            .map(|f| f.serves(request.url()))
            .unwrap_or(false);
        if !reusable {
            let address = self.client.address_for(request.url())?;
            *finder = Some(ExchangeFinder::new(
                Arc::new(address),
                self.client.pool.clone(),
                self.client.route_database.clone(),
                self.client.config.fast_fallback,
            ));
        }
        Ok(())
    }

    /// Ends one attempt; the finder survives for route continuation.
    pub(crate) fn exit_network_phase(self: &Arc<CallInner>) {
        self.exchange.lock().expect("call poisoned").take();
    }

    pub(crate) fn has_more_routes(self: &Arc<CallInner>) -> bool {
        self.finder
            .lock()
            .expect("call poisoned")
            .as_ref()
            .map(|f| f.has_more_routes())
            .unwrap_or(false)
    }

    /// The exchange currently bound to this call, if any.
    pub(crate) fn current_exchange(self: &Arc<CallInner>) -> Option<Arc<Exchange>> {
        self.exchange.lock().expect("call poisoned").clone()
    }

    /// The route of the connection serving this call, if any.
    pub(crate) fn route(self: &Arc<CallInner>) -> Option<Route> {
        self.exchange
            .lock()
            .expect("call poisoned")
            .as_ref()
            .map(|e| e.connection().route().clone())
    }

    /// After a 421, stop reusing the coalesced connection for this host.
    pub(crate) fn abandon_coalesced_connection(self: &Arc<CallInner>) {
        let exchange = self.exchange.lock().expect("call poisoned").clone();
        if let Some(exchange) = exchange {
            exchange.connection().set_no_new_exchanges();
        }
    }

    /// Builds the exchange for this attempt: find a connection, open a
    /// codec on it.
    pub(crate) fn init_exchange(
        self: &Arc<CallInner>,
        chain: &Chain<'_>,
    ) -> Result<Arc<Exchange>> {
        if self.is_canceled() {
            return Err(Error::canceled());
        }
        let params = self.client.connect_params(
            chain.connect_timeout(),
            chain.read_timeout(),
            chain.write_timeout(),
        );
        let connection = {
            let mut finder = self.finder.lock().expect("call poisoned");
            let finder = finder
                .as_mut()
                .ok_or_else(|| Error::bad_config("exchange requested outside a network phase"))?;
            finder.find(self, &params)?
        };
        let call = self.as_call();
        event::emit(&self.listener, |l| {
            l.connection_acquired(&call, connection.id())
        });
        let codec = connection.new_codec(chain.read_timeout(), chain.write_timeout())?;
        let exchange = Exchange::new(
            self.clone(),
            connection,
            self.client.pool.clone(),
            codec,
        );
        *self.exchange.lock().expect("call poisoned") = Some(exchange.clone());
        Ok(exchange)
    }

    /// Called by the exchange when it no longer needs the connection.
    pub(crate) fn exchange_released(
        self: &Arc<CallInner>,
        connection: &Arc<Connection>,
        pool: &ConnectionPool,
    ) {
        let remaining = connection.remove_call(self);
        if remaining == 0 {
            {
                let mut state = connection.state.lock().expect("connection poisoned");
                state.idle_at_ns = self.client.runner.nano_time();
            }
            if pool.connection_became_idle(connection) {
                connection.close();
            }
        }
        let call = self.as_call();
        event::emit(&self.listener, |l| {
            l.connection_released(&call, connection.id())
        });
        self.exchange.lock().expect("call poisoned").take();
    }

    // ===== call timeout =====

    pub(crate) fn schedule_timeout(self: &Arc<CallInner>, timeout: Duration) {
        let weak = Arc::downgrade(self);
        self.timeout_queue
            .execute("timeout", timeout.as_nanos() as u64, move || {
                if let Some(call) = weak.upgrade() {
                    tracing::debug!("call {} hit its call timeout", call.id);
                    call.timed_out.store(true, Ordering::SeqCst);
                    call.cancel();
                }
            });
    }

    pub(crate) fn cancel_timeout(self: &Arc<CallInner>) {
        self.timeout_queue.cancel_all();
    }

    /// A detached call for pool unit tests.
    #[cfg(test)]
    pub(crate) fn test_stub() -> Arc<CallInner> {
        let client = Client::new();
        let request = Request::get("http://stub.invalid/").unwrap();
        Call::new(client, request, false).inner.clone()
    }
}

impl std::fmt::Debug for CallInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("url", &self.request.url())
            .finish()
    }
}
